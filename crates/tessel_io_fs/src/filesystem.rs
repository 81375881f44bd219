//! Filesystem handle contract and the built-in handles.
//!
//! [`AbstractFilesystem`] supplies `build_path`, `open` and `open_async` on
//! top of two required capabilities: a base path and driver resolution.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use once_cell::sync::OnceCell;
use tempfile::TempDir;

use crate::backend::{BackendDriver, EnumBackend, resolve_backend};
use crate::compression::CompressionRegistry;
use crate::spec::{FsError, SpecOpenMode, SpecOpenOptions};
use crate::stream::{AsyncFsStream, FsStream};
use crate::util::{C_FILE_SCHEME, join_base_path, normalize_base_path};

/// Shared, type-erased filesystem handle.
pub type FsRef = Arc<dyn AbstractFilesystem>;

/// Name prefix of temporary directories created by `make_temp`.
pub const C_STAGE_PREFIX: &str = "tessel-stage-";

////////////////////////////////////////////////////////////////////////////////
// #region Contract

pub trait AbstractFilesystem: fmt::Debug + Send + Sync + 'static {
    /// Backend root without a trailing separator.
    fn base_path(&self) -> String;

    /// Concrete driver for this handle; may be cached.
    fn resolve_driver(&self) -> Result<Arc<dyn BackendDriver>, FsError>;

    /// Codecs consulted by `open`.
    fn registry(&self) -> &CompressionRegistry;

    /// State every stream opened through this handle keeps alive.
    fn stream_guard(&self) -> Option<Arc<dyn Send + Sync>> {
        None
    }

    /// Join `path` (leading separators trimmed) onto the base path.
    fn build_path(&self, path: &str) -> String {
        join_base_path(&self.base_path(), path)
    }

    /// Open a stream at `path`.
    ///
    /// A compression kind with a registered factory is applied on top of a
    /// binary driver stream. Any other kind is passed to the driver as-is.
    /// Text modes decode/encode through the text adapter either way.
    fn open(
        &self,
        path: &str,
        mode: &str,
        spec_open: &SpecOpenOptions,
    ) -> Result<FsStream, FsError> {
        let spec_mode = SpecOpenMode::parse(mode)?;
        let path_full = self.build_path(path);
        let driver = self.resolve_driver()?;

        let spec_compression = spec_open.compression.as_ref();
        let kind = spec_compression.and_then(|c| c.kind.as_deref());
        let factory = kind.and_then(|k| self.registry().resolve(k));

        let stream = match (factory, spec_compression) {
            (Some(factory), Some(spec_compression)) => {
                let raw = driver.open(
                    &path_full,
                    spec_mode.as_binary(),
                    None,
                    &spec_open.driver_options,
                )?;
                (**factory)(raw, spec_mode, &spec_compression.codec_options())?
            }
            _ => driver.open(
                &path_full,
                spec_mode.as_binary(),
                kind,
                &spec_open.driver_options,
            )?,
        };

        Ok(FsStream::new(
            path_full,
            spec_mode,
            stream,
            Some(spec_open.spec_text.clone()),
        )
        .with_guard(self.stream_guard()))
    }

    /// `open` on the blocking worker pool, returning an async stream view.
    ///
    /// The worker owns `self` until the open returns, even when the returned
    /// future is dropped first.
    fn open_async(
        self: Arc<Self>,
        path: String,
        mode: String,
        spec_open: SpecOpenOptions,
    ) -> BoxFuture<'static, Result<AsyncFsStream, FsError>> {
        Box::pin(async move {
            let stream = tokio::task::spawn_blocking(move || self.open(&path, &mode, &spec_open))
                .await
                .map_err(|e| FsError::Worker(e.to_string()))??;
            Ok(AsyncFsStream::new(stream))
        })
    }

    /// Read the whole file at `path` as bytes.
    fn read_path(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let mut stream = self.open(path, "rb", &SpecOpenOptions::default())?;
        let data = stream.read_to_end()?;
        stream.close()?;
        Ok(data)
    }

    /// Write `content` to `path`, returning the full path.
    fn write_path(&self, path: &str, content: &[u8]) -> Result<String, FsError> {
        let mut stream = self.open(path, "wb", &SpecOpenOptions::default())?;
        stream.write(content)?;
        stream.close()?;
        Ok(self.build_path(path))
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region FilesystemHandle

/// Handle over a configured backend with a fixed base path.
#[derive(Debug)]
pub struct FilesystemHandle {
    base_path: String,
    backend: EnumBackend,
    registry: Arc<CompressionRegistry>,
    driver_cache: OnceCell<Arc<dyn BackendDriver>>,
}

impl FilesystemHandle {
    pub fn new(base_path: &str, backend: EnumBackend) -> Self {
        Self {
            base_path: normalize_base_path(base_path),
            backend,
            registry: CompressionRegistry::builtin(),
            driver_cache: OnceCell::new(),
        }
    }

    /// Builder: use `registry` instead of the built-in one.
    pub fn with_registry(mut self, registry: Arc<CompressionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn backend(&self) -> &EnumBackend {
        &self.backend
    }
}

impl AbstractFilesystem for FilesystemHandle {
    fn base_path(&self) -> String {
        self.base_path.clone()
    }

    fn resolve_driver(&self) -> Result<Arc<dyn BackendDriver>, FsError> {
        self.driver_cache
            .get_or_try_init(|| resolve_backend(&self.backend))
            .map(Arc::clone)
    }

    fn registry(&self) -> &CompressionRegistry {
        &self.registry
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region LocalFilesystem

/// Local-disk handle rooted at `root_path`, base path `file://<root_path>`.
#[derive(Debug)]
pub struct LocalFilesystem {
    root_path: PathBuf,
    handle: FilesystemHandle,
    dir_tmp: Option<Arc<TempDir>>,
}

impl LocalFilesystem {
    pub fn new(root_path: impl AsRef<Path>, auto_mkdir: bool) -> Self {
        let root_path = root_path.as_ref().to_path_buf();
        let base_path = format!("{C_FILE_SCHEME}{}", root_path.display());
        Self {
            handle: FilesystemHandle::new(&base_path, EnumBackend::Local { auto_mkdir }),
            root_path,
            dir_tmp: None,
        }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Handle over a fresh temporary directory in the system temp dir.
    pub fn make_temp(auto_mkdir: bool) -> Result<TempLocalFilesystem, FsError> {
        Self::make_temp_in(None, auto_mkdir)
    }

    /// Handle over a fresh temporary directory under `dir_parent`.
    ///
    /// The directory is removed once the guard, every clone of its handle and
    /// every stream opened through it are gone.
    pub fn make_temp_in(
        dir_parent: Option<&Path>,
        auto_mkdir: bool,
    ) -> Result<TempLocalFilesystem, FsError> {
        let dir_parent = dir_parent
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        let dir_tmp = tempfile::Builder::new()
            .prefix(C_STAGE_PREFIX)
            .tempdir_in(&dir_parent)
            .map_err(|e| FsError::Io {
                path: dir_parent.display().to_string(),
                source: e,
            })?;
        let path_dir = dir_tmp.path().to_path_buf();

        let mut fs_local = Self::new(&path_dir, auto_mkdir);
        fs_local.dir_tmp = Some(Arc::new(dir_tmp));
        Ok(TempLocalFilesystem {
            fs_local: Arc::new(fs_local),
            path_dir,
        })
    }
}

impl AbstractFilesystem for LocalFilesystem {
    fn base_path(&self) -> String {
        self.handle.base_path()
    }

    fn resolve_driver(&self) -> Result<Arc<dyn BackendDriver>, FsError> {
        self.handle.resolve_driver()
    }

    fn registry(&self) -> &CompressionRegistry {
        self.handle.registry()
    }

    fn stream_guard(&self) -> Option<Arc<dyn Send + Sync>> {
        self.dir_tmp
            .as_ref()
            .map(|dir_tmp| Arc::clone(dir_tmp) as Arc<dyn Send + Sync>)
    }
}

/// Scoped temporary [`LocalFilesystem`].
#[derive(Debug)]
pub struct TempLocalFilesystem {
    fs_local: Arc<LocalFilesystem>,
    path_dir: PathBuf,
}

impl TempLocalFilesystem {
    pub fn filesystem(&self) -> &Arc<LocalFilesystem> {
        &self.fs_local
    }

    /// Type-erased handle for the copy and task layers.
    pub fn fs_ref(&self) -> FsRef {
        Arc::clone(&self.fs_local) as FsRef
    }

    pub fn path(&self) -> &Path {
        &self.path_dir
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::{AbstractFilesystem, FilesystemHandle, FsRef, LocalFilesystem};
    use crate::backend::{EnumBackend, MemoryDriver, SpecBackendConfig};
    use crate::compression::CompressionRegistry;
    use crate::spec::{FsError, SpecCompression, SpecOpenOptions, SpecTextOptions};

    fn memory_handle(base_path: &str) -> (MemoryDriver, FilesystemHandle) {
        let driver = MemoryDriver::new();
        let handle = FilesystemHandle::new(base_path, EnumBackend::remote(driver.clone()));
        (driver, handle)
    }

    #[test]
    fn build_path_normalizes_separators() {
        let (_, handle) = memory_handle("sftp://host/data/");
        assert_eq!(handle.base_path(), "sftp://host/data");
        assert_eq!(handle.build_path("/a/b.txt"), "sftp://host/data/a/b.txt");
        assert_eq!(handle.build_path("a/b.txt"), "sftp://host/data/a/b.txt");

        let fs_local = LocalFilesystem::new("/tmp/root", false);
        assert_eq!(fs_local.build_path("/x"), "file:///tmp/root/x");
    }

    #[test]
    fn open_round_trips_text_through_zip_ex() {
        let (driver, handle) = memory_handle("memory://root");
        let spec_open = SpecOpenOptions::compressed(Some(
            SpecCompression::new("zip_ex").with_filename("inner.txt"),
        ));

        let mut stream = handle.open("/doc", "wt", &spec_open).expect("open write");
        stream.write_text("héllo\n").expect("write");
        stream.close().expect("close");

        let raw = driver.get("memory://root/doc").expect("stored");
        assert_eq!(&raw[..2], b"PK");

        let mut stream = handle.open("doc", "r", &spec_open).expect("open read");
        assert_eq!(stream.read_text().expect("read"), "héllo\n");

        let spec_open_wrong = SpecOpenOptions::compressed(Some(
            SpecCompression::new("zip_ex").with_filename("other.txt"),
        ));
        let err = handle
            .open("doc", "rb", &spec_open_wrong)
            .expect_err("missing entry");
        assert!(matches!(err, FsError::EntryNotFound { .. }));
    }

    #[test]
    fn open_passes_unknown_kinds_to_the_driver() {
        let (driver, handle) = memory_handle("memory://");
        let spec_open = SpecOpenOptions::compressed(Some(SpecCompression::new("gzip")));

        let mut stream = handle.open("a", "wb", &spec_open).expect("open");
        stream.write(b"zzz").expect("write");
        stream.close().expect("close");
        assert_eq!(&driver.get("memory://a").expect("stored")[..2], &[0x1f, 0x8b]);

        let mut stream = handle.open("a", "rb", &spec_open).expect("open");
        assert_eq!(stream.read_to_end().expect("read"), b"zzz");

        let err = handle
            .open("a", "rb", &SpecOpenOptions::compressed(Some(SpecCompression::new("zipp"))))
            .expect_err("typo");
        assert!(matches!(err, FsError::UnsupportedCompression { .. }));
    }

    #[test]
    fn local_open_supports_native_zip() {
        let fs_temp = LocalFilesystem::make_temp(false).expect("make_temp");
        let fs_local = fs_temp.filesystem();
        let spec_open_zip = SpecOpenOptions::compressed(Some(SpecCompression::new("zip")));

        let mut stream = fs_local.open("a.bin", "wt", &spec_open_zip).expect("open write");
        stream.write_text("native").expect("write");
        stream.close().expect("close");
        assert_eq!(&fs_local.read_path("a.bin").expect("raw")[..2], b"PK");

        let mut stream = fs_local.open("a.bin", "rt", &spec_open_zip).expect("open read");
        assert_eq!(stream.read_text().expect("read"), "native");

        // The native archive holds one entry named `file`.
        let spec_open_named = SpecOpenOptions::compressed(Some(
            SpecCompression::new("zip_ex").with_filename("file"),
        ));
        let mut stream = fs_local.open("a.bin", "rb", &spec_open_named).expect("open entry");
        assert_eq!(stream.read_to_end().expect("read"), b"native");
    }

    #[test]
    fn open_applies_text_policy_and_rejects_bad_modes() {
        let (driver, handle) = memory_handle("memory://");
        let spec_open = SpecOpenOptions {
            spec_text: SpecTextOptions {
                newline: Some("\r\n".to_string()),
                ..SpecTextOptions::default()
            },
            ..SpecOpenOptions::default()
        };
        let mut stream = handle.open("t.txt", "w", &spec_open).expect("open");
        stream.write_text("a\nb").expect("write");
        stream.close().expect("close");
        assert_eq!(driver.get("memory://t.txt"), Some(b"a\r\nb".to_vec()));

        let err = handle
            .open("t.txt", "rw", &SpecOpenOptions::default())
            .expect_err("mode");
        assert!(matches!(err, FsError::UnsupportedMode { .. }));

        let err = handle
            .open("missing", "rb", &SpecOpenOptions::default())
            .expect_err("missing");
        assert!(err.is_not_found());
    }

    #[test]
    fn open_uses_custom_registry() {
        let mut registry = CompressionRegistry::empty();
        registry.register("identity", |stream, _, _| Ok(stream));
        let (_, handle) = memory_handle("memory://");
        let handle = handle.with_registry(Arc::new(registry));

        // zip_ex is not registered here, so it reaches the driver.
        let err = handle
            .open("a", "wb", &SpecOpenOptions::compressed(Some(SpecCompression::new("zip_ex"))))
            .expect_err("unregistered");
        assert!(matches!(err, FsError::UnsupportedCompression { .. }));

        let spec_open = SpecOpenOptions::compressed(Some(SpecCompression::new("identity")));
        handle.write_path("a", b"x").expect("write");
        let mut stream = handle.open("a", "rb", &spec_open).expect("open");
        assert_eq!(stream.read_to_end().expect("read"), b"x");
    }

    #[test]
    fn unresolvable_backend_fails_on_open() {
        let config = SpecBackendConfig {
            basepath: "x://".to_string(),
            filesystem: None,
        };
        let handle = FilesystemHandle::new("x://", EnumBackend::Wrapped(Arc::new(config)));
        let err = handle
            .open("a", "rb", &SpecOpenOptions::default())
            .expect_err("unsupported");
        assert!(matches!(err, FsError::UnsupportedBackend(_)));
        assert_eq!(handle.build_path("a"), "x://a");
    }

    #[test]
    fn make_temp_removes_directory_on_drop() {
        let fs_temp = LocalFilesystem::make_temp(true).expect("make_temp");
        let path_dir = fs_temp.path().to_path_buf();
        let path_full = fs_temp
            .filesystem()
            .write_path("/nested/a.json", json!({"k": 1}).to_string().as_bytes())
            .expect("write");

        assert_eq!(path_full, format!("file://{}/nested/a.json", path_dir.display()));
        assert!(path_dir.join("nested/a.json").is_file());
        drop(fs_temp);
        assert!(!path_dir.exists());
    }

    #[test]
    fn make_temp_directory_outlives_open_streams() {
        let fs_temp = LocalFilesystem::make_temp(true).expect("make_temp");
        let path_dir = fs_temp.path().to_path_buf();
        let mut stream = fs_temp
            .filesystem()
            .open("deep/a.bin", "wb", &SpecOpenOptions::default())
            .expect("open");

        drop(fs_temp);
        assert!(path_dir.join("deep").is_dir());
        stream.write(b"x").expect("write");
        stream.close().expect("close");
        assert!(!path_dir.exists());
    }

    #[tokio::test]
    async fn open_async_streams_blocks() {
        let (_, handle) = memory_handle("memory://");
        let fs: FsRef = Arc::new(handle);

        let mut stream = Arc::clone(&fs)
            .open_async("a.bin".to_string(), "wb".to_string(), SpecOpenOptions::default())
            .await
            .expect("open");
        stream.write(b"abcdef".to_vec()).await.expect("write");
        stream.close().await.expect("close");

        let mut stream = Arc::clone(&fs)
            .open_async("a.bin".to_string(), "rb".to_string(), SpecOpenOptions::default())
            .await
            .expect("open");
        assert_eq!(stream.read(4).await.expect("read"), b"abcd");
        assert_eq!(stream.read(4).await.expect("read"), b"ef");
        assert!(stream.read(4).await.expect("eof").is_empty());
        stream.close().await.expect("close");
        assert_eq!(fs.read_path("a.bin").expect("read_path"), b"abcdef");
    }
}
