//! Filesystem handle over an external configuration object.

use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::backend::{BackendConfig, BackendDriver, EnumBackend, resolve_backend};
use crate::compression::CompressionRegistry;
use crate::filesystem::AbstractFilesystem;
use crate::spec::FsError;
use crate::util::normalize_base_path;

/// Adapts a `{basepath, filesystem}` config into a full handle.
///
/// The driver is resolved on first use and kept for the wrapper's lifetime;
/// build a new wrapper to pick up a changed configuration.
pub struct FilesystemWrapper {
    config: Arc<dyn BackendConfig>,
    registry: Arc<CompressionRegistry>,
    driver_cache: OnceCell<Arc<dyn BackendDriver>>,
}

impl FilesystemWrapper {
    pub fn new(config: Arc<dyn BackendConfig>) -> Self {
        Self {
            config,
            registry: CompressionRegistry::builtin(),
            driver_cache: OnceCell::new(),
        }
    }

    pub fn with_registry(mut self, registry: Arc<CompressionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &Arc<dyn BackendConfig> {
        &self.config
    }

    pub fn if_driver_cached(&self) -> bool {
        self.driver_cache.get().is_some()
    }
}

impl fmt::Debug for FilesystemWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilesystemWrapper")
            .field("config", &self.config)
            .field("if_driver_cached", &self.if_driver_cached())
            .finish()
    }
}

impl AbstractFilesystem for FilesystemWrapper {
    fn base_path(&self) -> String {
        normalize_base_path(&self.config.basepath())
    }

    fn resolve_driver(&self) -> Result<Arc<dyn BackendDriver>, FsError> {
        self.driver_cache
            .get_or_try_init(|| resolve_backend(&EnumBackend::Wrapped(Arc::clone(&self.config))))
            .map(Arc::clone)
    }

    fn registry(&self) -> &CompressionRegistry {
        &self.registry
    }
}
