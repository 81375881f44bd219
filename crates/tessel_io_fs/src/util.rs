use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::spec::FsError;

/// URI scheme prefix for local paths.
pub(crate) const C_FILE_SCHEME: &str = "file://";

////////////////////////////////////////////////////////////////////////////////
// #region BasePath

/// Split `base` into its root part (`scheme://`, `file:///`, `/`) and rest.
fn _split_root(base: &str) -> (&str, &str) {
    if let Some(idx) = base.find("://") {
        let mut n_root = idx + 3;
        if base[n_root..].starts_with('/') {
            n_root += 1;
        }
        return base.split_at(n_root);
    }
    if base.starts_with('/') {
        return base.split_at(1);
    }
    ("", base)
}

/// Strip trailing separators without touching a scheme or filesystem root.
pub(crate) fn normalize_base_path(base: &str) -> String {
    let (c_root, c_rest) = _split_root(base);
    format!("{c_root}{}", c_rest.trim_end_matches('/'))
}

/// Join a logical path onto a normalized base path.
pub(crate) fn join_base_path(base: &str, path: &str) -> String {
    let path_rel = path.trim_start_matches('/');
    if base.is_empty() {
        return path_rel.to_string();
    }
    if base.ends_with('/') {
        return format!("{base}{path_rel}");
    }
    format!("{base}/{path_rel}")
}

/// Local filesystem path from a plain path or `file://` URI.
pub(crate) fn strip_file_scheme(path: &str) -> &str {
    path.strip_prefix(C_FILE_SCHEME).unwrap_or(path)
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region StagingSafety

/// Check that `path_rel` stays under `path_dir_root`.
///
/// Rejects parent-directory components and any existing symlink along the
/// way, so a rendered path cannot write outside the staging directory.
pub(crate) fn validate_staging_path_safety(
    path_rel: &str,
    path_dir_root: &Path,
) -> Result<PathBuf, FsError> {
    let path_rel_trimmed = Path::new(path_rel.trim_start_matches('/'));
    for part_rel in path_rel_trimmed.components() {
        match part_rel {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(FsError::InvalidPath(format!(
                    "Staging path escapes staging root: {path_rel} (root={})",
                    path_dir_root.display()
                )));
            }
        }
    }

    let mut path_cursor = path_dir_root.to_path_buf();
    for part_rel in path_rel_trimmed.components() {
        path_cursor.push(part_rel.as_os_str());
        match fs::symlink_metadata(&path_cursor) {
            Ok(meta_cursor) => {
                if meta_cursor.file_type().is_symlink() {
                    return Err(FsError::InvalidPath(format!(
                        "Staging path traverses symlink component: {}",
                        path_cursor.display()
                    )));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(FsError::Io {
                    path: path_cursor.display().to_string(),
                    source: e,
                });
            }
        }
    }

    Ok(path_dir_root.join(path_rel_trimmed))
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
