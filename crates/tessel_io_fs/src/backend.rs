//! Backend driver capability and resolution.
//!
//! A handle is configured with an [`EnumBackend`]; [`resolve_backend`] turns it
//! into a concrete [`BackendDriver`] in one dispatch, unwrapping configuration
//! layers until a driver is reached.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Cursor, Read, Write};
use std::path::Path;
use std::sync::Arc;

use flate2::Compression as GzLevel;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::compression::named_unzip;
use crate::spec::{FsError, SpecCodecOptions, SpecOpenMode};
use crate::stream::{EnumByteStream, StreamSink};
use crate::util::strip_file_scheme;

/// Maximum number of configuration layers unwrapped before giving up.
const N_WRAP_DEPTH_MAX: usize = 16;

pub const C_NATIVE_GZIP: &str = "gzip";
pub const C_NATIVE_INFER: &str = "infer";
pub const C_NATIVE_ZIP: &str = "zip";

////////////////////////////////////////////////////////////////////////////////
// #region Capabilities

/// Protocol-specific byte I/O.
///
/// `spec_mode` is always binary. `compression` is an identifier the caller
/// could not resolve in its registry; drivers either handle it natively or
/// fail with [`FsError::UnsupportedCompression`].
pub trait BackendDriver: fmt::Debug + Send + Sync {
    fn open(
        &self,
        path: &str,
        spec_mode: SpecOpenMode,
        compression: Option<&str>,
        driver_options: &Map<String, Value>,
    ) -> Result<EnumByteStream, FsError>;
}

/// External configuration object exposing `{basepath, filesystem}`.
pub trait BackendConfig: fmt::Debug + Send + Sync {
    fn basepath(&self) -> String;

    /// The next backend layer, or `None` when nothing is configured.
    fn filesystem(&self) -> Option<EnumBackend>;
}

/// Configured backend, resolved lazily into a driver.
#[derive(Debug, Clone)]
pub enum EnumBackend {
    /// Well-known local-disk marker.
    Local { auto_mkdir: bool },
    /// A concrete driver.
    Remote(Arc<dyn BackendDriver>),
    /// A configuration object wrapping another backend.
    Wrapped(Arc<dyn BackendConfig>),
}

impl EnumBackend {
    pub fn local() -> Self {
        Self::Local { auto_mkdir: false }
    }

    pub fn remote<D: BackendDriver + 'static>(driver: D) -> Self {
        Self::Remote(Arc::new(driver))
    }
}

/// Plain configuration record, for callers without their own config type.
#[derive(Debug, Clone)]
pub struct SpecBackendConfig {
    pub basepath: String,
    pub filesystem: Option<EnumBackend>,
}

impl BackendConfig for SpecBackendConfig {
    fn basepath(&self) -> String {
        self.basepath.clone()
    }

    fn filesystem(&self) -> Option<EnumBackend> {
        self.filesystem.clone()
    }
}

/// Resolve a configured backend into a concrete driver.
pub fn resolve_backend(backend: &EnumBackend) -> Result<Arc<dyn BackendDriver>, FsError> {
    let mut backend_cursor = backend.clone();
    for _ in 0..=N_WRAP_DEPTH_MAX {
        match backend_cursor {
            EnumBackend::Local { auto_mkdir } => {
                return Ok(Arc::new(LocalDriver::new(auto_mkdir)));
            }
            EnumBackend::Remote(driver) => return Ok(driver),
            EnumBackend::Wrapped(config) => match config.filesystem() {
                Some(backend_next) => backend_cursor = backend_next,
                None => {
                    return Err(FsError::UnsupportedBackend(format!(
                        "{config:?} exposes no filesystem"
                    )));
                }
            },
        }
    }
    Err(FsError::UnsupportedBackend(format!(
        "more than {N_WRAP_DEPTH_MAX} nested filesystem layers"
    )))
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region NativeCompression

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnumNativeCodec {
    Raw,
    Gzip,
    Zip,
}

fn _native_codec(path: &str, compression: Option<&str>) -> Result<EnumNativeCodec, FsError> {
    match compression {
        None => Ok(EnumNativeCodec::Raw),
        Some(C_NATIVE_GZIP) => Ok(EnumNativeCodec::Gzip),
        Some(C_NATIVE_ZIP) => Ok(EnumNativeCodec::Zip),
        Some(C_NATIVE_INFER) => {
            if path.ends_with(".gz") {
                Ok(EnumNativeCodec::Gzip)
            } else if path.ends_with(".zip") {
                Ok(EnumNativeCodec::Zip)
            } else {
                Ok(EnumNativeCodec::Raw)
            }
        }
        Some(kind) => Err(FsError::UnsupportedCompression {
            kind: kind.to_string(),
        }),
    }
}

struct GzipSink {
    encoder: GzEncoder<Box<dyn StreamSink>>,
}

impl Write for GzipSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.encoder.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }
}

impl StreamSink for GzipSink {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let inner = self.encoder.finish()?;
        inner.finish()
    }
}

/// Layer the native codec over a raw driver stream.
///
/// `zip` writes one entry named `file` and reads the first entry.
fn _wrap_native(
    stream: EnumByteStream,
    spec_mode: SpecOpenMode,
    codec: EnumNativeCodec,
) -> Result<EnumByteStream, FsError> {
    match (codec, stream) {
        (EnumNativeCodec::Raw, stream) => Ok(stream),
        (EnumNativeCodec::Gzip, EnumByteStream::Reader(reader)) => {
            Ok(EnumByteStream::Reader(Box::new(MultiGzDecoder::new(reader))))
        }
        (EnumNativeCodec::Gzip, EnumByteStream::Writer(sink)) => {
            Ok(EnumByteStream::Writer(Box::new(GzipSink {
                encoder: GzEncoder::new(sink, GzLevel::default()),
            })))
        }
        (EnumNativeCodec::Zip, stream) => {
            named_unzip(stream, spec_mode, &SpecCodecOptions::default())
        }
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region LocalDriver

struct FileSink {
    writer: BufWriter<File>,
}

impl Write for FileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl StreamSink for FileSink {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let file = self.writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
    }
}

/// Local-disk driver. Accepts plain paths and `file://` URIs.
///
/// Driver option `auto_mkdir` (bool) overrides the configured value per call.
#[derive(Debug, Clone, Default)]
pub struct LocalDriver {
    pub auto_mkdir: bool,
}

impl LocalDriver {
    pub fn new(auto_mkdir: bool) -> Self {
        Self { auto_mkdir }
    }
}

impl BackendDriver for LocalDriver {
    fn open(
        &self,
        path: &str,
        spec_mode: SpecOpenMode,
        compression: Option<&str>,
        driver_options: &Map<String, Value>,
    ) -> Result<EnumByteStream, FsError> {
        let codec = _native_codec(path, compression)?;
        let path_local = Path::new(strip_file_scheme(path));

        if spec_mode.if_read {
            let file = File::open(path_local).map_err(|e| FsError::from_io(path, e))?;
            let reader: Box<dyn Read + Send> = Box::new(BufReader::new(file));
            return _wrap_native(EnumByteStream::Reader(reader), spec_mode, codec);
        }

        let if_auto_mkdir = driver_options
            .get("auto_mkdir")
            .and_then(Value::as_bool)
            .unwrap_or(self.auto_mkdir);
        if if_auto_mkdir {
            if let Some(path_parent) = path_local.parent() {
                fs::create_dir_all(path_parent).map_err(|e| FsError::from_io(path, e))?;
            }
        }
        let file = File::create(path_local).map_err(|e| FsError::from_io(path, e))?;
        let sink: Box<dyn StreamSink> = Box::new(FileSink {
            writer: BufWriter::new(file),
        });
        _wrap_native(EnumByteStream::Writer(sink), spec_mode, codec)
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region MemoryDriver

type DictFiles = Arc<Mutex<BTreeMap<String, Vec<u8>>>>;

/// In-process driver keyed by full path. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    dict_files: DictFiles,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored bytes at `path`, exactly as written.
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.dict_files.lock().get(path).cloned()
    }

    pub fn insert(&self, path: impl Into<String>, data: Vec<u8>) {
        self.dict_files.lock().insert(path.into(), data);
    }

    pub fn paths(&self) -> Vec<String> {
        self.dict_files.lock().keys().cloned().collect()
    }
}

/// Buffers writes; the file becomes visible on finish (or drop, like a
/// partially written local file).
struct MemorySink {
    path: String,
    buf: Option<Vec<u8>>,
    dict_files: DictFiles,
}

impl MemorySink {
    fn _commit(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.dict_files.lock().insert(self.path.clone(), buf);
        }
    }
}

impl Write for MemorySink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self.buf.as_mut() {
            Some(buf) => {
                buf.extend_from_slice(data);
                Ok(data.len())
            }
            None => Err(io::Error::other("memory file already committed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl StreamSink for MemorySink {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self._commit();
        Ok(())
    }
}

impl Drop for MemorySink {
    fn drop(&mut self) {
        self._commit();
    }
}

impl BackendDriver for MemoryDriver {
    fn open(
        &self,
        path: &str,
        spec_mode: SpecOpenMode,
        compression: Option<&str>,
        _driver_options: &Map<String, Value>,
    ) -> Result<EnumByteStream, FsError> {
        let codec = _native_codec(path, compression)?;

        if spec_mode.if_read {
            let data = self.get(path).ok_or_else(|| FsError::NotFound {
                path: path.to_string(),
            })?;
            let reader: Box<dyn Read + Send> = Box::new(Cursor::new(data));
            return _wrap_native(EnumByteStream::Reader(reader), spec_mode, codec);
        }

        let sink: Box<dyn StreamSink> = Box::new(MemorySink {
            path: path.to_string(),
            buf: Some(Vec::new()),
            dict_files: Arc::clone(&self.dict_files),
        });
        _wrap_native(EnumByteStream::Writer(sink), spec_mode, codec)
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
