//! Staged copy between two filesystem handles.
//!
//! One run is `expand -> stage -> commit`:
//! 1. Expand renders every record into a `(source, target)` resolved pair.
//! 2. Stage reads each source (with source compression) into a fresh local
//!    temporary directory as raw bytes.
//! 3. Commit writes each staged file to the target (with target compression).
//!
//! The first failing pair aborts the run. Pairs committed before the failure
//! stay on the target.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::filesystem::{FsRef, LocalFilesystem};
use crate::report::{ReportCopy, ReportCopyBuilder};
use crate::spec::{
    CopyError, EnumCopyStage, FsError, SpecCompression, SpecCopyOptions, SpecOpenOptions,
    SpecResolvedPath,
};
use crate::stream::AsyncFsStream;
use crate::template::render_path_format;
use crate::util::validate_staging_path_safety;

#[derive(Debug, Clone)]
struct SpecCopyTaskItem {
    resolved_source: SpecResolvedPath,
    resolved_target: SpecResolvedPath,
}

#[derive(Debug)]
struct SpecCopyContext<'a> {
    fs_source: &'a FsRef,
    fs_target: &'a FsRef,
    n_block: usize,
}

impl SpecCopyContext<'_> {
    fn error(&self, stage: EnumCopyStage, item: &SpecCopyTaskItem, error: FsError) -> CopyError {
        CopyError {
            stage,
            source_path: self.fs_source.build_path(&item.resolved_source.path),
            target_path: self.fs_target.build_path(&item.resolved_target.path),
            error,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// #region StreamCopy

async fn _open(
    fs: &FsRef,
    path: &str,
    mode: &str,
    compression: Option<SpecCompression>,
) -> Result<AsyncFsStream, FsError> {
    Arc::clone(fs)
        .open_async(
            path.to_string(),
            mode.to_string(),
            SpecOpenOptions::compressed(compression),
        )
        .await
}

async fn _pump(
    stream_src: &mut AsyncFsStream,
    stream_dst: &mut AsyncFsStream,
    n_block: usize,
) -> Result<u64, FsError> {
    let mut n_bytes = 0u64;
    loop {
        let buf = stream_src.read(n_block).await?;
        if buf.is_empty() {
            return Ok(n_bytes);
        }
        n_bytes += buf.len() as u64;
        stream_dst.write(buf).await?;
    }
}

/// Move bytes from `stream_src` to `stream_dst` in `block_size` reads.
///
/// Both streams are closed on every path. When the transfer itself failed,
/// close failures are logged and the transfer error is returned.
pub async fn copy_stream(
    mut stream_src: AsyncFsStream,
    mut stream_dst: AsyncFsStream,
    block_size: usize,
) -> Result<u64, FsError> {
    let result_pump = _pump(&mut stream_src, &mut stream_dst, block_size.max(1)).await;

    let path_src = stream_src.path().to_string();
    let path_dst = stream_dst.path().to_string();
    let result_close_src = stream_src.close().await;
    let result_close_dst = stream_dst.close().await;

    match result_pump {
        Ok(n_bytes) => {
            result_close_src?;
            result_close_dst?;
            Ok(n_bytes)
        }
        Err(e) => {
            if let Err(e_close) = result_close_src {
                tracing::warn!("Suppressed close failure on {}: {}", path_src, e_close);
            }
            if let Err(e_close) = result_close_dst {
                tracing::warn!("Suppressed close failure on {}: {}", path_dst, e_close);
            }
            Err(e)
        }
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region StagedCopy

fn _expand(
    source_path: &str,
    spec_cp_options: &SpecCopyOptions,
) -> Result<Vec<SpecCopyTaskItem>, CopyError> {
    let target_path = spec_cp_options.target_path.as_deref().unwrap_or(source_path);
    let l_records = match &spec_cp_options.records {
        Some(l_records) => l_records.clone(),
        None => vec![Value::Object(Map::new())],
    };

    let mut l_items = Vec::with_capacity(l_records.len());
    for record in &l_records {
        let expand_error = |error: FsError| CopyError {
            stage: EnumCopyStage::Expand,
            source_path: source_path.to_string(),
            target_path: target_path.to_string(),
            error,
        };
        let resolved_source = render_path_format(
            record,
            source_path,
            spec_cp_options.source_compression.as_ref(),
        )
        .map_err(expand_error)?;
        let resolved_target = render_path_format(
            record,
            target_path,
            spec_cp_options.target_compression.as_ref(),
        )
        .map_err(expand_error)?;
        l_items.push(SpecCopyTaskItem {
            resolved_source,
            resolved_target,
        });
    }
    Ok(l_items)
}

async fn _stage_item(
    spec_cp_ctx: &SpecCopyContext<'_>,
    fs_stage: &FsRef,
    item: &SpecCopyTaskItem,
) -> Result<u64, FsError> {
    let stream_src = _open(
        spec_cp_ctx.fs_source,
        &item.resolved_source.path,
        "rb",
        item.resolved_source.compression.clone(),
    )
    .await?;
    let stream_dst = _open(fs_stage, &item.resolved_target.path, "wb", None).await?;
    copy_stream(stream_src, stream_dst, spec_cp_ctx.n_block).await
}

async fn _commit_item(
    spec_cp_ctx: &SpecCopyContext<'_>,
    fs_stage: &FsRef,
    item: &SpecCopyTaskItem,
) -> Result<u64, FsError> {
    let stream_src = _open(fs_stage, &item.resolved_target.path, "rb", None).await?;
    let stream_dst = _open(
        spec_cp_ctx.fs_target,
        &item.resolved_target.path,
        "wb",
        item.resolved_target.compression.clone(),
    )
    .await?;
    copy_stream(stream_src, stream_dst, spec_cp_ctx.n_block).await
}

/// Copy `source_path` from `fs_source` to `fs_target` through local staging.
///
/// `source_path`, `target_path` and the compression filenames are templates
/// rendered once per record. With `records = Some(vec![])` nothing is read or
/// written and an empty report is returned. The staging directory is removed
/// when this call returns or is dropped, after any worker still opening or
/// writing a staged file has let go of it.
///
/// Failures carry the step and the full source/target paths of the pair.
/// Pairs committed before a failure are not rolled back.
pub async fn copy_filesystem(
    source_path: &str,
    fs_source: &FsRef,
    fs_target: &FsRef,
    spec_cp_options: SpecCopyOptions,
) -> Result<ReportCopy, CopyError> {
    let l_items = _expand(source_path, &spec_cp_options)?;
    if l_items.is_empty() {
        return Ok(ReportCopy::default());
    }

    let spec_cp_ctx = SpecCopyContext {
        fs_source,
        fs_target,
        n_block: spec_cp_options.block_size,
    };
    let mut builder_cp_report = ReportCopyBuilder::default();

    let fs_temp = LocalFilesystem::make_temp_in(spec_cp_options.staging_root.as_deref(), true)
        .map_err(|error| CopyError {
            stage: EnumCopyStage::Stage,
            source_path: source_path.to_string(),
            target_path: spec_cp_options
                .target_path
                .clone()
                .unwrap_or_else(|| source_path.to_string()),
            error,
        })?;
    let fs_stage = fs_temp.fs_ref();

    for item in &l_items {
        validate_staging_path_safety(&item.resolved_target.path, fs_temp.path())
            .map_err(|e| spec_cp_ctx.error(EnumCopyStage::Stage, item, e))?;
        let n_bytes = _stage_item(&spec_cp_ctx, &fs_stage, item)
            .await
            .map_err(|e| spec_cp_ctx.error(EnumCopyStage::Stage, item, e))?;
        tracing::info!(
            "Staged {} -> {} ({} bytes)",
            fs_source.build_path(&item.resolved_source.path),
            fs_stage.build_path(&item.resolved_target.path),
            n_bytes
        );
        builder_cp_report.add_staged(n_bytes);
    }

    for item in &l_items {
        let n_bytes = _commit_item(&spec_cp_ctx, &fs_stage, item)
            .await
            .map_err(|e| spec_cp_ctx.error(EnumCopyStage::Commit, item, e))?;
        tracing::info!(
            "Committed {} -> {} ({} bytes)",
            fs_stage.build_path(&item.resolved_target.path),
            fs_target.build_path(&item.resolved_target.path),
            n_bytes
        );
        builder_cp_report.add_committed(
            item.resolved_source.path.clone(),
            item.resolved_target.path.clone(),
            n_bytes,
        );
    }

    drop(fs_stage);
    drop(fs_temp);
    Ok(builder_cp_report.build())
}

// #endregion
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::io::{self, Read, Write};
    use std::sync::Arc;

    use parking_lot::Mutex;
    use serde_json::{Map, Value, json};

    use super::{copy_filesystem, copy_stream};
    use crate::backend::{BackendDriver, EnumBackend, MemoryDriver};
    use crate::filesystem::{AbstractFilesystem, FilesystemHandle, FsRef};
    use crate::spec::{
        EnumCopyStage, FsError, SpecCompression, SpecCopyOptions, SpecOpenMode, SpecOpenOptions,
    };
    use crate::stream::{EnumByteStream, StreamSink};

    type LogEvents = Arc<Mutex<Vec<&'static str>>>;

    /// Reads serve one block and then fail; every sink fails to finish.
    #[derive(Debug, Clone, Default)]
    struct BrokenDriver {
        l_events: LogEvents,
    }

    struct BrokenReader {
        if_served: bool,
        l_events: LogEvents,
    }

    impl Read for BrokenReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.if_served {
                return Err(io::Error::other("read broke"));
            }
            self.if_served = true;
            buf.fill(b'a');
            Ok(buf.len())
        }
    }

    impl Drop for BrokenReader {
        fn drop(&mut self) {
            self.l_events.lock().push("reader released");
        }
    }

    struct BrokenSink {
        l_events: LogEvents,
    }

    impl Write for BrokenSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl StreamSink for BrokenSink {
        fn finish(self: Box<Self>) -> io::Result<()> {
            self.l_events.lock().push("sink finished");
            Err(io::Error::other("finish broke"))
        }
    }

    impl BackendDriver for BrokenDriver {
        fn open(
            &self,
            _path: &str,
            spec_mode: SpecOpenMode,
            _compression: Option<&str>,
            _driver_options: &Map<String, Value>,
        ) -> Result<EnumByteStream, FsError> {
            let l_events = Arc::clone(&self.l_events);
            if spec_mode.if_read {
                return Ok(EnumByteStream::Reader(Box::new(BrokenReader {
                    if_served: false,
                    l_events,
                })));
            }
            Ok(EnumByteStream::Writer(Box::new(BrokenSink { l_events })))
        }
    }

    fn memory_fs(base_path: &str) -> (MemoryDriver, FsRef) {
        let driver = MemoryDriver::new();
        let fs: FsRef = Arc::new(FilesystemHandle::new(
            base_path,
            EnumBackend::remote(driver.clone()),
        ));
        (driver, fs)
    }

    #[tokio::test]
    async fn copy_stream_moves_every_block() {
        let (driver, fs) = memory_fs("memory://");
        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        fs.write_path("src.bin", &payload).expect("write");

        let stream_src = Arc::clone(&fs)
            .open_async("src.bin".to_string(), "rb".to_string(), SpecOpenOptions::default())
            .await
            .expect("open src");
        let stream_dst = Arc::clone(&fs)
            .open_async("dst.bin".to_string(), "wb".to_string(), SpecOpenOptions::default())
            .await
            .expect("open dst");

        let n_bytes = copy_stream(stream_src, stream_dst, 333).await.expect("copy");
        assert_eq!(n_bytes, 10_000);
        assert_eq!(driver.get("memory://dst.bin"), Some(payload));
    }

    #[tokio::test]
    async fn copy_stream_reports_read_failure_over_close_failure() {
        let driver = BrokenDriver::default();
        let fs: FsRef = Arc::new(FilesystemHandle::new(
            "broken://",
            EnumBackend::remote(driver.clone()),
        ));
        let stream_src = Arc::clone(&fs)
            .open_async("src.bin".to_string(), "rb".to_string(), SpecOpenOptions::default())
            .await
            .expect("open src");
        let stream_dst = Arc::clone(&fs)
            .open_async("dst.bin".to_string(), "wb".to_string(), SpecOpenOptions::default())
            .await
            .expect("open dst");

        let err = copy_stream(stream_src, stream_dst, 4).await.expect_err("read fails");
        match err {
            FsError::Io { ref path, ref source } => {
                assert_eq!(path, "broken://src.bin");
                assert_eq!(source.to_string(), "read broke");
            }
            other => panic!("expected the read error, got {other:?}"),
        }
        let l_events = driver.l_events.lock().clone();
        assert!(l_events.contains(&"reader released"));
        assert!(l_events.contains(&"sink finished"));
    }

    #[tokio::test]
    async fn copy_stream_surfaces_close_failure_after_clean_transfer() {
        let (_, fs_src) = memory_fs("memory://");
        fs_src.write_path("src.bin", b"abc").expect("write");
        let fs_dst: FsRef = Arc::new(FilesystemHandle::new(
            "broken://",
            EnumBackend::remote(BrokenDriver::default()),
        ));

        let stream_src = Arc::clone(&fs_src)
            .open_async("src.bin".to_string(), "rb".to_string(), SpecOpenOptions::default())
            .await
            .expect("open src");
        let stream_dst = Arc::clone(&fs_dst)
            .open_async("dst.bin".to_string(), "wb".to_string(), SpecOpenOptions::default())
            .await
            .expect("open dst");

        let err = copy_stream(stream_src, stream_dst, 2).await.expect_err("finish fails");
        assert!(
            matches!(err, FsError::Io { ref source, .. } if source.to_string() == "finish broke")
        );
    }

    #[tokio::test]
    async fn copy_with_templates_and_recompression() {
        let (driver_src, fs_src) = memory_fs("memory://src");
        let (driver_dst, fs_dst) = memory_fs("memory://dst/");
        fs_src.write_path("a.txt", b"alpha").expect("write a");
        fs_src.write_path("b.txt", b"beta").expect("write b");

        let spec_cp_options = SpecCopyOptions {
            target_path: Some("out/{name}.zip".to_string()),
            target_compression: Some(
                SpecCompression::new("zip_ex").with_filename("{name}.txt"),
            ),
            records: Some(vec![json!({"name": "a"}), json!({"name": "b"})]),
            block_size: 2,
            ..SpecCopyOptions::default()
        };
        let report = copy_filesystem("{name}.txt", &fs_src, &fs_dst, spec_cp_options)
            .await
            .expect("copy");

        assert_eq!(
            report.pairs,
            vec![
                ("a.txt".to_string(), "out/a.zip".to_string()),
                ("b.txt".to_string(), "out/b.zip".to_string()),
            ]
        );
        assert_eq!(report.cnt_staged, 2);
        assert_eq!(report.bytes_committed, 9);
        assert_eq!(driver_src.paths().len(), 2);

        let spec_open = SpecOpenOptions::compressed(Some(
            SpecCompression::new("zip_ex").with_filename("b.txt"),
        ));
        let mut stream = fs_dst.open("out/b.zip", "rb", &spec_open).expect("open");
        assert_eq!(stream.read_to_end().expect("read"), b"beta");
        assert_eq!(driver_dst.paths().len(), 2);
    }

    #[tokio::test]
    async fn empty_records_do_nothing() {
        let (_, fs_src) = memory_fs("memory://src");
        let (driver_dst, fs_dst) = memory_fs("memory://dst");

        let spec_cp_options = SpecCopyOptions {
            records: Some(vec![]),
            ..SpecCopyOptions::default()
        };
        let report = copy_filesystem("missing.txt", &fs_src, &fs_dst, spec_cp_options)
            .await
            .expect("noop");
        assert!(report.is_empty());
        assert!(driver_dst.paths().is_empty());
    }

    #[tokio::test]
    async fn first_failure_aborts_with_context() {
        let (_, fs_src) = memory_fs("memory://src");
        let (driver_dst, fs_dst) = memory_fs("memory://dst");
        fs_src.write_path("a.txt", b"a").expect("write a");

        let spec_cp_options = SpecCopyOptions {
            records: Some(vec![json!({"name": "a"}), json!({"name": "zz"})]),
            ..SpecCopyOptions::default()
        };
        let err = copy_filesystem("{name}.txt", &fs_src, &fs_dst, spec_cp_options)
            .await
            .expect_err("second source missing");

        assert_eq!(err.stage, EnumCopyStage::Stage);
        assert_eq!(err.source_path, "memory://src/zz.txt");
        assert_eq!(err.target_path, "memory://dst/zz.txt");
        assert!(err.error.is_not_found());
        // Staging aborts before anything reaches the target.
        assert!(driver_dst.paths().is_empty());
    }

    #[tokio::test]
    async fn expand_failures_report_templates() {
        let (_, fs_src) = memory_fs("memory://src");
        let (_, fs_dst) = memory_fs("memory://dst");

        let spec_cp_options = SpecCopyOptions {
            records: Some(vec![json!({"other": 1})]),
            ..SpecCopyOptions::default()
        };
        let err = copy_filesystem("{name}.txt", &fs_src, &fs_dst, spec_cp_options)
            .await
            .expect_err("missing field");
        assert_eq!(err.stage, EnumCopyStage::Expand);
        assert_eq!(err.source_path, "{name}.txt");
        assert!(matches!(err.error, FsError::MissingField { .. }));
    }

    #[tokio::test]
    async fn escaping_target_path_is_rejected() {
        let (_, fs_src) = memory_fs("memory://src");
        let (_, fs_dst) = memory_fs("memory://dst");
        fs_src.write_path("a.txt", b"a").expect("write");

        let spec_cp_options = SpecCopyOptions {
            target_path: Some("../../escape.txt".to_string()),
            ..SpecCopyOptions::default()
        };
        let err = copy_filesystem("a.txt", &fs_src, &fs_dst, spec_cp_options)
            .await
            .expect_err("unsafe");
        assert_eq!(err.stage, EnumCopyStage::Stage);
        assert!(matches!(err.error, FsError::InvalidPath(_)));
    }
}
