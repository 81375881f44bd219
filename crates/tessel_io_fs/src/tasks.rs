//! Task-level entry points: put, get and copy.

use std::sync::Arc;

use crate::copy::copy_filesystem;
use crate::filesystem::FsRef;
use crate::spec::{
    CopyError, EnumContent, EnumTransform, FsError, SpecCompression, SpecCopyOptions,
    SpecGetOptions, SpecOpenOptions, SpecTextOptions,
};
use crate::stream::AsyncFsStream;

/// Encoding value that selects a binary read in `filesystem_get`.
pub const C_ENCODING_NONE: &str = "none";

async fn _close_after<T>(
    stream: AsyncFsStream,
    result: Result<T, FsError>,
) -> Result<T, FsError> {
    let path = stream.path().to_string();
    let result_close = stream.close().await;
    match result {
        Ok(value) => result_close.map(|_| value),
        Err(e) => {
            if let Err(e_close) = result_close {
                tracing::warn!("Suppressed close failure on {}: {}", path, e_close);
            }
            Err(e)
        }
    }
}

/// Write `content` to `filename` and return the full backend path.
///
/// Bytes are written in binary mode, text and structured content in text
/// mode; structured content is serialized as JSON.
pub async fn filesystem_put(
    content: EnumContent,
    filename: &str,
    fs: &FsRef,
    compression: Option<SpecCompression>,
) -> Result<String, FsError> {
    let mode = match content {
        EnumContent::Bytes(_) => "wb",
        EnumContent::Text(_) | EnumContent::Structured(_) => "wt",
    };
    let mut stream = Arc::clone(fs)
        .open_async(
            filename.to_string(),
            mode.to_string(),
            SpecOpenOptions::compressed(compression),
        )
        .await?;

    let result_write = match content {
        EnumContent::Bytes(data) => stream.write(data).await,
        EnumContent::Text(txt) => stream.write_text(txt).await,
        EnumContent::Structured(value) => match serde_json::to_string(&value) {
            Ok(txt) => stream.write_text(txt).await,
            Err(e) => Err(FsError::from(e)),
        },
    };
    _close_after(stream, result_write).await?;

    tracing::info!("Written to {}", filename);
    Ok(fs.build_path(filename))
}

fn _apply_transform(
    content: EnumContent,
    transform: EnumTransform,
) -> Result<EnumContent, FsError> {
    match transform {
        EnumTransform::Identity => Ok(content),
        EnumTransform::Json => match content {
            EnumContent::Bytes(data) => Ok(EnumContent::Structured(serde_json::from_slice(&data)?)),
            EnumContent::Text(txt) => Ok(EnumContent::Structured(serde_json::from_str(&txt)?)),
            EnumContent::Structured(value) => Ok(EnumContent::Structured(value)),
        },
        EnumTransform::Custom(transform_fn) => transform_fn(content),
    }
}

async fn _read_content(
    filename: &str,
    fs: &FsRef,
    compression: Option<SpecCompression>,
    encoding: Option<String>,
) -> Result<EnumContent, FsError> {
    let encoding = encoding.filter(|e| e != C_ENCODING_NONE);
    let (mode, spec_text) = match encoding {
        None => ("rb", SpecTextOptions::default()),
        Some(encoding) => (
            "rt",
            SpecTextOptions {
                encoding,
                ..SpecTextOptions::default()
            },
        ),
    };
    let if_binary = mode == "rb";

    let mut stream = Arc::clone(fs)
        .open_async(
            filename.to_string(),
            mode.to_string(),
            SpecOpenOptions {
                compression,
                spec_text,
                ..SpecOpenOptions::default()
            },
        )
        .await?;
    let result_read = if if_binary {
        stream.read_to_end().await.map(EnumContent::Bytes)
    } else {
        stream.read_text().await.map(EnumContent::Text)
    };
    _close_after(stream, result_read).await
}

/// Read `filename`, optionally transformed.
///
/// `encoding = None` (or `"none"`) reads bytes, anything else reads text.
/// A missing file yields `default_value` when one is given, `NotFound`
/// otherwise.
pub async fn filesystem_get(
    filename: &str,
    fs: &FsRef,
    spec_get: SpecGetOptions,
) -> Result<EnumContent, FsError> {
    let SpecGetOptions {
        compression,
        encoding,
        transform,
        default_value,
    } = spec_get;

    let content = match _read_content(filename, fs, compression, encoding).await {
        Ok(content) => content,
        Err(e) if e.is_not_found() => {
            tracing::info!("File does not exist {}", filename);
            return default_value.ok_or(e);
        }
        Err(e) => return Err(e),
    };
    tracing::info!("Read from {}", filename);
    _apply_transform(content, transform)
}

/// Staged copy returning the rendered `(source, target)` path pairs.
pub async fn filesystem_copy(
    source_path: &str,
    fs_source: &FsRef,
    fs_target: &FsRef,
    spec_cp_options: SpecCopyOptions,
) -> Result<Vec<(String, String)>, CopyError> {
    let report = copy_filesystem(source_path, fs_source, fs_target, spec_cp_options).await?;
    if report.is_empty() {
        tracing::info!("Nothing to do");
        return Ok(Vec::new());
    }
    tracing::info!("Copied {} items", report.cnt_committed);
    tracing::debug!("{}", report);
    Ok(report.pairs)
}
