//! `tessel_io_fs` v1:
//! Backend-agnostic filesystem handles with pluggable stream compression and
//! a staged multi-record copy engine.
//!
//! Modules:
//! - `spec`        : enums/options/descriptors/errors
//! - `compression` : compression registry and the `zip_ex` archive codec
//! - `backend`     : driver capability, backend variants, built-in drivers
//! - `stream`      : byte streams, text adapter, async stream view
//! - `filesystem`  : handle contract (`build_path`/`open`/`open_async`)
//! - `wrapper`     : handle over an external `{basepath, filesystem}` config
//! - `template`    : `{field}` path templating per record
//! - `copy`        : expand/stage/commit copy orchestration
//! - `report`      : copy run report model
//! - `tasks`       : `filesystem_put`/`filesystem_get`/`filesystem_copy`
//! - `util`        : shared helper functions

pub mod backend;
pub mod compression;
pub mod copy;
pub mod filesystem;
pub mod report;
pub mod spec;
pub mod stream;
pub mod tasks;
pub mod template;
mod util;
pub mod wrapper;

pub use backend::{
    BackendConfig, BackendDriver, EnumBackend, LocalDriver, MemoryDriver, SpecBackendConfig,
    resolve_backend,
};
pub use compression::{C_KIND_ZIP_EX, CompressionFactory, CompressionRegistry, named_unzip};
pub use copy::{copy_filesystem, copy_stream};
pub use filesystem::{
    AbstractFilesystem, FilesystemHandle, FsRef, LocalFilesystem, TempLocalFilesystem,
};
pub use report::{ReportCopy, ReportCopyBuilder};
pub use spec::{
    CopyError, EnumContent, EnumCopyStage, EnumTextErrors, EnumTransform, FsError,
    SpecCodecOptions, SpecCompression, SpecCopyOptions, SpecGetOptions, SpecOpenMode,
    SpecOpenOptions, SpecResolvedPath, SpecTextOptions,
};
pub use stream::{AsyncFsStream, EnumByteStream, FsStream, StreamSink};
pub use tasks::{filesystem_copy, filesystem_get, filesystem_put};
pub use template::{records_from_value, render_path_format, render_template};
pub use wrapper::FilesystemWrapper;
