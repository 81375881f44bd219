//! Compression registry and stream-wrapping codecs.
//!
//! A registry maps a compression identifier to a factory that wraps a raw
//! driver stream. Identifiers without a factory are not an error: they are
//! handed to the backend driver, which may support them natively.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde_json::Value;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::spec::{FsError, SpecCodecOptions, SpecOpenMode};
use crate::stream::{EnumByteStream, StreamSink};

/// Registry key of the single-entry archive codec.
pub const C_KIND_ZIP_EX: &str = "zip_ex";
/// Entry name used when writing an archive without `filename`.
pub const C_ZIP_ENTRY_DEFAULT: &str = "file";

/// Wraps `(raw stream, caller mode, codec options)` into a codec stream.
pub type CompressionFactory = Arc<
    dyn Fn(EnumByteStream, SpecOpenMode, &SpecCodecOptions) -> Result<EnumByteStream, FsError>
        + Send
        + Sync,
>;

static REGISTRY_BUILTIN: Lazy<Arc<CompressionRegistry>> =
    Lazy::new(|| Arc::new(CompressionRegistry::with_builtins()));

////////////////////////////////////////////////////////////////////////////////
// #region Registry

/// Identifier -> factory map.
///
/// Populate with [`register`](Self::register) during setup, then share it
/// behind an `Arc`; handles only ever read from it.
#[derive(Clone, Default)]
pub struct CompressionRegistry {
    dict_factories: BTreeMap<String, CompressionFactory>,
}

impl CompressionRegistry {
    /// Registry without any codec.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry holding the built-in `zip_ex` codec.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(C_KIND_ZIP_EX, named_unzip);
        registry
    }

    /// Shared read-only built-in registry used by handles by default.
    pub fn builtin() -> Arc<Self> {
        Arc::clone(&REGISTRY_BUILTIN)
    }

    /// Add or replace the factory for `kind`.
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(EnumByteStream, SpecOpenMode, &SpecCodecOptions) -> Result<EnumByteStream, FsError>
            + Send
            + Sync
            + 'static,
    {
        self.dict_factories.insert(kind.into(), Arc::new(factory));
    }

    /// Factory for `kind`, or `None` when the driver should handle it.
    pub fn resolve(&self, kind: &str) -> Option<&CompressionFactory> {
        self.dict_factories.get(kind)
    }

    /// Registered identifiers in sorted order.
    pub fn kinds(&self) -> Vec<&str> {
        self.dict_factories.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for CompressionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressionRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region NamedUnzip

fn _archive_error(e: impl fmt::Display) -> FsError {
    FsError::Archive(e.to_string())
}

fn _parse_zip_options(spec_codec: &SpecCodecOptions) -> Result<SimpleFileOptions, FsError> {
    let method = match spec_codec.options.get("compression_type") {
        None | Some(Value::Null) => CompressionMethod::Deflated,
        Some(Value::String(s)) if s == "deflated" => CompressionMethod::Deflated,
        Some(Value::String(s)) if s == "stored" => CompressionMethod::Stored,
        Some(other) => {
            return Err(FsError::InvalidCompression(format!(
                "Invalid `compression_type`: {other}. Expected one of: ['deflated', 'stored']"
            )));
        }
    };
    let if_zip64 = match spec_codec.options.get("force_zip64") {
        None | Some(Value::Null) => true,
        Some(Value::Bool(b)) => *b,
        Some(other) => {
            return Err(FsError::InvalidCompression(format!(
                "`force_zip64` must be a boolean, got {other}"
            )));
        }
    };

    Ok(SimpleFileOptions::default()
        .compression_method(method)
        .large_file(if_zip64))
}

/// One archive entry being written; closing it finalizes the container.
///
/// The container is assembled in memory; the driver stream need not seek.
struct ZipEntrySink {
    zip_writer: ZipWriter<Cursor<Vec<u8>>>,
    inner: Box<dyn StreamSink>,
}

impl Write for ZipEntrySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.zip_writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.zip_writer.flush()
    }
}

impl StreamSink for ZipEntrySink {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let Self {
            zip_writer,
            mut inner,
        } = *self;
        let cursor = zip_writer.finish().map_err(io::Error::other)?;
        inner.write_all(cursor.get_ref())?;
        inner.finish()
    }
}

/// Single-entry archive codec (`zip_ex`).
///
/// Write mode creates one entry named `filename` (default `"file"`). Read
/// mode returns the named entry, or the first one when no name is given.
pub fn named_unzip(
    stream: EnumByteStream,
    spec_mode: SpecOpenMode,
    spec_codec: &SpecCodecOptions,
) -> Result<EnumByteStream, FsError> {
    if !spec_mode.if_read {
        let inner = stream.into_writer().ok_or_else(|| FsError::UnsupportedMode {
            mode: spec_mode.to_string(),
            message: "archive writer needs a writable stream".to_string(),
        })?;
        let name_entry = spec_codec
            .filename
            .clone()
            .unwrap_or_else(|| C_ZIP_ENTRY_DEFAULT.to_string());
        let zip_options = _parse_zip_options(spec_codec)?;

        let mut zip_writer = ZipWriter::new(Cursor::new(Vec::new()));
        zip_writer
            .start_file(name_entry, zip_options)
            .map_err(_archive_error)?;
        return Ok(EnumByteStream::Writer(Box::new(ZipEntrySink {
            zip_writer,
            inner,
        })));
    }

    let mut reader = stream.into_reader().ok_or_else(|| FsError::UnsupportedMode {
        mode: spec_mode.to_string(),
        message: "archive reader needs a readable stream".to_string(),
    })?;
    let mut raw = Vec::new();
    reader.read_to_end(&mut raw).map_err(_archive_error)?;
    drop(reader);

    let mut archive = ZipArchive::new(Cursor::new(raw)).map_err(_archive_error)?;
    let mut buf = Vec::new();
    match spec_codec.filename.as_deref() {
        Some(name_entry) => {
            let mut entry = archive.by_name(name_entry).map_err(|e| match e {
                ZipError::FileNotFound => FsError::EntryNotFound {
                    name: name_entry.to_string(),
                },
                other => _archive_error(other),
            })?;
            entry.read_to_end(&mut buf).map_err(_archive_error)?;
        }
        None => {
            if archive.len() == 0 {
                return Err(FsError::NoEntries);
            }
            let mut entry = archive.by_index(0).map_err(_archive_error)?;
            entry.read_to_end(&mut buf).map_err(_archive_error)?;
        }
    }

    Ok(EnumByteStream::Reader(Box::new(Cursor::new(buf))))
}

// #endregion
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::io::{self, Cursor, Read, Write};
    use std::sync::Arc;

    use parking_lot::Mutex;
    use serde_json::json;
    use zip::ZipWriter;

    use super::{C_KIND_ZIP_EX, CompressionRegistry, named_unzip};
    use crate::spec::{FsError, SpecCodecOptions, SpecOpenMode};
    use crate::stream::{EnumByteStream, StreamSink};

    #[derive(Clone, Default)]
    struct SharedSink {
        buf: Arc<Mutex<Vec<u8>>>,
        finished: Arc<Mutex<bool>>,
    }

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.buf.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl StreamSink for SharedSink {
        fn finish(self: Box<Self>) -> io::Result<()> {
            *self.finished.lock() = true;
            Ok(())
        }
    }

    fn write_archive(spec_codec: &SpecCodecOptions, payload: &[u8]) -> (Vec<u8>, bool) {
        let sink = SharedSink::default();
        let stream = EnumByteStream::Writer(Box::new(sink.clone()));
        let mut writer = named_unzip(stream, SpecOpenMode::WRITE_BINARY, spec_codec)
            .expect("open writer")
            .into_writer()
            .expect("writer");
        writer.write_all(payload).expect("write");
        writer.finish().expect("finish");
        let raw = sink.buf.lock().clone();
        let if_finished = *sink.finished.lock();
        (raw, if_finished)
    }

    fn read_archive(raw: Vec<u8>, spec_codec: &SpecCodecOptions) -> Result<Vec<u8>, FsError> {
        let stream = EnumByteStream::Reader(Box::new(Cursor::new(raw)));
        let mut reader = named_unzip(stream, SpecOpenMode::READ_BINARY, spec_codec)?
            .into_reader()
            .expect("reader");
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).expect("read");
        Ok(buf)
    }

    #[test]
    fn named_unzip_round_trips_named_entry() {
        let spec_codec = SpecCodecOptions {
            filename: Some("data.json".to_string()),
            ..SpecCodecOptions::default()
        };
        let (raw, if_finished) = write_archive(&spec_codec, b"{\"a\":1}");
        assert!(if_finished, "closing the entry must close the container");

        assert_eq!(read_archive(raw.clone(), &spec_codec).expect("named"), b"{\"a\":1}");
        assert_eq!(
            read_archive(raw, &SpecCodecOptions::default()).expect("first"),
            b"{\"a\":1}"
        );
    }

    #[test]
    fn named_unzip_defaults_entry_name() {
        let (raw, _) = write_archive(&SpecCodecOptions::default(), b"payload");
        let spec_codec_named = SpecCodecOptions {
            filename: Some("file".to_string()),
            ..SpecCodecOptions::default()
        };
        assert_eq!(read_archive(raw, &spec_codec_named).expect("read"), b"payload");
    }

    #[test]
    fn named_unzip_reports_missing_entries() {
        let (raw, _) = write_archive(&SpecCodecOptions::default(), b"payload");
        let spec_codec_other = SpecCodecOptions {
            filename: Some("other".to_string()),
            ..SpecCodecOptions::default()
        };
        let err = read_archive(raw, &spec_codec_other).expect_err("missing");
        assert!(matches!(err, FsError::EntryNotFound { ref name } if name == "other"));

        let empty = ZipWriter::new(Cursor::new(Vec::new()))
            .finish()
            .expect("empty archive")
            .into_inner();
        let err = read_archive(empty, &SpecCodecOptions::default()).expect_err("empty");
        assert!(matches!(err, FsError::NoEntries));
    }

    #[test]
    fn named_unzip_stored_method_and_bad_option() {
        let mut spec_codec = SpecCodecOptions::default();
        spec_codec
            .options
            .insert("compression_type".to_string(), json!("stored"));
        let (raw, _) = write_archive(&spec_codec, b"plain");
        assert_eq!(read_archive(raw, &spec_codec).expect("read"), b"plain");

        spec_codec
            .options
            .insert("compression_type".to_string(), json!("lzma9"));
        let stream = EnumByteStream::Writer(Box::new(SharedSink::default()));
        let err = named_unzip(stream, SpecOpenMode::WRITE_BINARY, &spec_codec).expect_err("bad");
        assert!(matches!(err, FsError::InvalidCompression(_)));
    }

    #[test]
    fn registry_resolves_builtins_and_custom_kinds() {
        let mut registry = CompressionRegistry::with_builtins();
        assert!(registry.resolve(C_KIND_ZIP_EX).is_some());
        assert!(registry.resolve("gzip").is_none());

        registry.register("identity", |stream, _, _| Ok(stream));
        assert_eq!(registry.kinds(), vec!["identity", C_KIND_ZIP_EX]);
        assert!(CompressionRegistry::builtin().resolve(C_KIND_ZIP_EX).is_some());
    }
}
