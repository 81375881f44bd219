//! Byte streams, text adapter and the async stream view.
//!
//! Drivers and codecs exchange [`EnumByteStream`] values. A write side is a
//! [`StreamSink`]: composite sinks (archive over file, gzip over memory)
//! finalize their own layer in `finish` and then finish the layer they wrap,
//! so one `close` releases the whole stack inner-then-outer.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use encoding_rs::{DecoderResult, EncoderResult, Encoding, REPLACEMENT, UTF_16BE, UTF_16LE};

use crate::spec::{EnumTextErrors, FsError, SpecOpenMode, SpecTextOptions};

////////////////////////////////////////////////////////////////////////////////
// #region ByteStreams

/// Write half of a byte stream with an explicit, fallible release.
pub trait StreamSink: Write + Send {
    /// Finalize this layer and every layer beneath it.
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// Raw stream returned by drivers and codec factories.
pub enum EnumByteStream {
    Reader(Box<dyn Read + Send>),
    Writer(Box<dyn StreamSink>),
}

impl EnumByteStream {
    pub fn into_reader(self) -> Option<Box<dyn Read + Send>> {
        match self {
            Self::Reader(reader) => Some(reader),
            Self::Writer(_) => None,
        }
    }

    pub fn into_writer(self) -> Option<Box<dyn StreamSink>> {
        match self {
            Self::Writer(writer) => Some(writer),
            Self::Reader(_) => None,
        }
    }
}

impl fmt::Debug for EnumByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reader(_) => write!(f, "EnumByteStream::Reader(..)"),
            Self::Writer(_) => write!(f, "EnumByteStream::Writer(..)"),
        }
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region TextAdapter

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnumEncoding {
    Ascii,
    /// A WHATWG codec; `if_bom` sniffs and writes a byte order mark.
    Codec {
        encoding: &'static Encoding,
        if_bom: bool,
    },
}

fn _parse_encoding(label: &str) -> Result<EnumEncoding, FsError> {
    let label_norm = label.trim().to_ascii_lowercase().replace('_', "-");
    let label_norm = match label_norm.as_str() {
        "ascii" | "us-ascii" | "646" => return Ok(EnumEncoding::Ascii),
        "latin-1" | "iso-8859-1" | "l1" => "latin1",
        "utf8" => "utf-8",
        other => other,
    };
    match Encoding::for_label(label_norm.as_bytes()) {
        Some(encoding) if encoding != REPLACEMENT => Ok(EnumEncoding::Codec {
            encoding,
            if_bom: label_norm == "utf-16",
        }),
        _ => Err(FsError::UnsupportedEncoding(label.to_string())),
    }
}

fn _decode_codec(
    raw: &[u8],
    encoding: &'static Encoding,
    if_bom: bool,
    errors: EnumTextErrors,
) -> Result<String, String> {
    let mut decoder = if if_bom {
        encoding.new_decoder()
    } else {
        encoding.new_decoder_without_bom_handling()
    };
    let mut txt = String::new();
    let mut raw_rest = raw;
    loop {
        let (result, n_read) =
            decoder.decode_to_string_without_replacement(raw_rest, &mut txt, true);
        raw_rest = &raw_rest[n_read..];
        match result {
            DecoderResult::InputEmpty => return Ok(txt),
            DecoderResult::OutputFull => {
                let n_need = decoder
                    .max_utf8_buffer_length_without_replacement(raw_rest.len())
                    .unwrap_or(raw_rest.len() * 3);
                txt.reserve(n_need + 4);
            }
            DecoderResult::Malformed(n_bad, _) => match errors {
                EnumTextErrors::Strict => {
                    let n_pos = raw.len() - raw_rest.len();
                    return Err(format!(
                        "{n_bad} malformed byte(s) before position {n_pos} for {}",
                        encoding.name()
                    ));
                }
                EnumTextErrors::Replace => txt.push(char::REPLACEMENT_CHARACTER),
                EnumTextErrors::Ignore => {}
            },
        }
    }
}

fn _encode_codec(
    txt: &str,
    encoding: &'static Encoding,
    if_bom: bool,
    errors: EnumTextErrors,
) -> Result<Vec<u8>, String> {
    // encoding_rs only decodes UTF-16; its encoder would emit UTF-8.
    if encoding == UTF_16LE || encoding == UTF_16BE {
        let mut raw = Vec::with_capacity(txt.len() * 2 + 2);
        if if_bom {
            raw.extend_from_slice(&_utf16_unit_bytes(0xFEFF, encoding));
        }
        for unit in txt.encode_utf16() {
            raw.extend_from_slice(&_utf16_unit_bytes(unit, encoding));
        }
        return Ok(raw);
    }
    if encoding.output_encoding() != encoding {
        return Err(format!("{} cannot be encoded", encoding.name()));
    }

    let mut encoder = encoding.new_encoder();
    let mut raw = Vec::new();
    let mut txt_rest = txt;
    loop {
        let (result, n_read) =
            encoder.encode_from_utf8_to_vec_without_replacement(txt_rest, &mut raw, true);
        txt_rest = &txt_rest[n_read..];
        match result {
            EncoderResult::InputEmpty => return Ok(raw),
            EncoderResult::OutputFull => {
                let n_need = encoder
                    .max_buffer_length_from_utf8_without_replacement(txt_rest.len())
                    .unwrap_or(txt_rest.len() * 4);
                raw.reserve(n_need + 4);
            }
            EncoderResult::Unmappable(c) => match errors {
                EnumTextErrors::Strict => {
                    return Err(format!("character {c:?} cannot be encoded"));
                }
                EnumTextErrors::Replace => raw.push(b'?'),
                EnumTextErrors::Ignore => {}
            },
        }
    }
}

fn _utf16_unit_bytes(unit: u16, encoding: &'static Encoding) -> [u8; 2] {
    if encoding == UTF_16BE {
        unit.to_be_bytes()
    } else {
        unit.to_le_bytes()
    }
}

/// Decode bytes and apply read-side newline translation.
pub(crate) fn decode_text(
    raw: &[u8],
    spec_text: &SpecTextOptions,
    path: &str,
) -> Result<String, FsError> {
    let decode_error = |message: String| FsError::Decode {
        path: path.to_string(),
        encoding: spec_text.encoding.clone(),
        message,
    };

    let txt = match _parse_encoding(&spec_text.encoding)? {
        EnumEncoding::Codec { encoding, if_bom } => {
            _decode_codec(raw, encoding, if_bom, spec_text.errors).map_err(decode_error)?
        }
        EnumEncoding::Ascii => {
            let mut txt = String::with_capacity(raw.len());
            for (idx, byte) in raw.iter().enumerate() {
                if byte.is_ascii() {
                    txt.push(char::from(*byte));
                    continue;
                }
                match spec_text.errors {
                    EnumTextErrors::Strict => {
                        return Err(decode_error(format!(
                            "byte 0x{byte:02x} at position {idx} is not ascii"
                        )));
                    }
                    EnumTextErrors::Replace => txt.push(char::REPLACEMENT_CHARACTER),
                    EnumTextErrors::Ignore => {}
                }
            }
            txt
        }
    };

    match spec_text.newline {
        None => Ok(txt.replace("\r\n", "\n").replace('\r', "\n")),
        Some(_) => Ok(txt),
    }
}

/// Apply write-side newline translation and encode.
pub(crate) fn encode_text(
    txt: &str,
    spec_text: &SpecTextOptions,
    path: &str,
) -> Result<Vec<u8>, FsError> {
    let encode_error = |message: String| FsError::Decode {
        path: path.to_string(),
        encoding: spec_text.encoding.clone(),
        message,
    };
    let txt = match spec_text.newline.as_deref() {
        Some(newline) if !newline.is_empty() && newline != "\n" => txt.replace('\n', newline),
        _ => txt.to_string(),
    };

    match _parse_encoding(&spec_text.encoding)? {
        EnumEncoding::Codec { encoding, if_bom } => {
            _encode_codec(&txt, encoding, if_bom, spec_text.errors).map_err(encode_error)
        }
        EnumEncoding::Ascii => {
            let mut raw = Vec::with_capacity(txt.len());
            for c in txt.chars() {
                if c.is_ascii() {
                    raw.push(c as u8);
                    continue;
                }
                match spec_text.errors {
                    EnumTextErrors::Strict => {
                        return Err(encode_error(format!("character {c:?} cannot be encoded")));
                    }
                    EnumTextErrors::Replace => raw.push(b'?'),
                    EnumTextErrors::Ignore => {}
                }
            }
            Ok(raw)
        }
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region FsStream

/// A stream opened through a filesystem handle.
///
/// Binary streams use `read`/`write`; text streams use `read_text` and
/// `write_text`. Dropping the stream releases it without surfacing errors,
/// `close` releases it and reports finalization failures.
pub struct FsStream {
    path: String,
    spec_mode: SpecOpenMode,
    spec_text: Option<SpecTextOptions>,
    inner: Option<EnumByteStream>,
    // Dropped after `inner`.
    guard: Option<Arc<dyn Send + Sync>>,
}

impl FsStream {
    pub(crate) fn new(
        path: String,
        spec_mode: SpecOpenMode,
        inner: EnumByteStream,
        spec_text: Option<SpecTextOptions>,
    ) -> Self {
        Self {
            path,
            spec_mode,
            spec_text: if spec_mode.if_text { spec_text } else { None },
            inner: Some(inner),
            guard: None,
        }
    }

    /// Keep `guard` alive until the stream itself is dropped.
    pub(crate) fn with_guard(mut self, guard: Option<Arc<dyn Send + Sync>>) -> Self {
        self.guard = guard;
        self
    }

    /// Full backend path this stream was opened at.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn mode(&self) -> SpecOpenMode {
        self.spec_mode
    }

    fn _mode_error(&self, message: &str) -> FsError {
        FsError::UnsupportedMode {
            mode: self.spec_mode.to_string(),
            message: message.to_string(),
        }
    }

    fn _closed_error(&self) -> FsError {
        FsError::Io {
            path: self.path.clone(),
            source: io::Error::other("stream is closed"),
        }
    }

    fn _reader(&mut self) -> Result<&mut Box<dyn Read + Send>, FsError> {
        match self.inner {
            Some(EnumByteStream::Reader(ref mut reader)) => Ok(reader),
            Some(EnumByteStream::Writer(_)) => Err(self._mode_error("stream is not readable")),
            None => Err(self._closed_error()),
        }
    }

    fn _writer(&mut self) -> Result<&mut Box<dyn StreamSink>, FsError> {
        match self.inner {
            Some(EnumByteStream::Writer(ref mut writer)) => Ok(writer),
            Some(EnumByteStream::Reader(_)) => Err(self._mode_error("stream is not writable")),
            None => Err(self._closed_error()),
        }
    }

    /// Read up to `n` bytes. An empty result signals end of stream.
    pub fn read(&mut self, n: usize) -> Result<Vec<u8>, FsError> {
        if self.spec_text.is_some() {
            return Err(self._mode_error("binary read on a text stream"));
        }
        let path = self.path.clone();
        let reader = self._reader()?;
        let mut buf = Vec::with_capacity(n.min(64 * 1024));
        Read::take(reader, n as u64)
            .read_to_end(&mut buf)
            .map_err(|e| FsError::from_io(&path, e))?;
        Ok(buf)
    }

    /// Read all remaining bytes.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>, FsError> {
        if self.spec_text.is_some() {
            return Err(self._mode_error("binary read on a text stream"));
        }
        self._read_raw_to_end()
    }

    fn _read_raw_to_end(&mut self) -> Result<Vec<u8>, FsError> {
        let path = self.path.clone();
        let reader = self._reader()?;
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .map_err(|e| FsError::from_io(&path, e))?;
        Ok(buf)
    }

    /// Read and decode all remaining text.
    pub fn read_text(&mut self) -> Result<String, FsError> {
        let Some(spec_text) = self.spec_text.clone() else {
            return Err(self._mode_error("text read on a binary stream"));
        };
        let raw = self._read_raw_to_end()?;
        decode_text(&raw, &spec_text, &self.path)
    }

    /// Write every byte of `buf`.
    pub fn write(&mut self, buf: &[u8]) -> Result<(), FsError> {
        if self.spec_text.is_some() {
            return Err(self._mode_error("binary write on a text stream"));
        }
        self._write_raw(buf)
    }

    fn _write_raw(&mut self, buf: &[u8]) -> Result<(), FsError> {
        let path = self.path.clone();
        let writer = self._writer()?;
        writer
            .write_all(buf)
            .map_err(|e| FsError::from_io(&path, e))
    }

    /// Encode and write `txt`.
    pub fn write_text(&mut self, txt: &str) -> Result<(), FsError> {
        let Some(spec_text) = self.spec_text.clone() else {
            return Err(self._mode_error("text write on a binary stream"));
        };
        let raw = encode_text(txt, &spec_text, &self.path)?;
        self._write_raw(&raw)
    }

    /// Release the stream, finalizing every wrapped layer.
    pub fn close(mut self) -> Result<(), FsError> {
        match self.inner.take() {
            Some(EnumByteStream::Writer(writer)) => {
                writer.finish().map_err(|e| FsError::from_io(&self.path, e))
            }
            Some(EnumByteStream::Reader(_)) | None => Ok(()),
        }
    }
}

impl fmt::Debug for FsStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsStream")
            .field("path", &self.path)
            .field("mode", &self.spec_mode.to_string())
            .field("if_open", &self.inner.is_some())
            .field("if_guarded", &self.guard.is_some())
            .finish()
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region AsyncFsStream

/// Async view over an [`FsStream`].
///
/// Every operation moves the stream onto the blocking worker pool and back,
/// so the calling task only suspends. If the future is dropped mid-operation
/// the worker still owns the stream and releases it when the call returns.
#[derive(Debug)]
pub struct AsyncFsStream {
    path: String,
    inner: Option<FsStream>,
}

impl AsyncFsStream {
    pub fn new(stream: FsStream) -> Self {
        Self {
            path: stream.path().to_string(),
            inner: Some(stream),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Underlying synchronous stream, when not in use by a worker.
    pub fn wrapped(&mut self) -> Option<&mut FsStream> {
        self.inner.as_mut()
    }

    async fn _run<T, F>(&mut self, op: F) -> Result<T, FsError>
    where
        T: Send + 'static,
        F: FnOnce(&mut FsStream) -> Result<T, FsError> + Send + 'static,
    {
        let Some(mut stream) = self.inner.take() else {
            return Err(FsError::Io {
                path: self.path.clone(),
                source: io::Error::other("stream is closed"),
            });
        };
        let (stream, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut stream);
            (stream, result)
        })
        .await
        .map_err(|e| FsError::Worker(e.to_string()))?;
        self.inner = Some(stream);
        result
    }

    pub async fn read(&mut self, n: usize) -> Result<Vec<u8>, FsError> {
        self._run(move |stream| stream.read(n)).await
    }

    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, FsError> {
        self._run(|stream| stream.read_to_end()).await
    }

    pub async fn read_text(&mut self) -> Result<String, FsError> {
        self._run(|stream| stream.read_text()).await
    }

    pub async fn write(&mut self, buf: Vec<u8>) -> Result<(), FsError> {
        self._run(move |stream| stream.write(&buf)).await
    }

    pub async fn write_text(&mut self, txt: String) -> Result<(), FsError> {
        self._run(move |stream| stream.write_text(&txt)).await
    }

    /// Release the stream on the worker pool.
    pub async fn close(mut self) -> Result<(), FsError> {
        let Some(stream) = self.inner.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || stream.close())
            .await
            .map_err(|e| FsError::Worker(e.to_string()))?
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
