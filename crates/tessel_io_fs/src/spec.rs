//! Open/copy specification models and top-level error types.

use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Default staging block size for [`SpecCopyOptions::block_size`].
pub const N_BLOCK_SIZE_DEFAULT: usize = 1024 * 1024;
/// Default text encoding.
pub const C_ENCODING_DEFAULT: &str = "utf-8";

////////////////////////////////////////////////////////////////////////////////
// #region EnumsInit

/// Error policy for the text adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnumTextErrors {
    /// Fail on undecodable/unencodable characters.
    #[default]
    Strict,
    /// Substitute a replacement character.
    Replace,
    /// Drop offending characters.
    Ignore,
}

impl EnumTextErrors {
    /// Parse the conventional error-policy names.
    pub fn parse(value: &str) -> Result<Self, FsError> {
        match value {
            "strict" => Ok(Self::Strict),
            "replace" => Ok(Self::Replace),
            "ignore" => Ok(Self::Ignore),
            _ => Err(FsError::UnsupportedEncoding(format!(
                "Invalid error policy: `{value}`. Expected one of: ['strict', 'replace', 'ignore']"
            ))),
        }
    }
}

/// Copy state-machine step, used to tag failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumCopyStage {
    /// Rendering record templates into path pairs.
    Expand,
    /// Source -> local staging.
    Stage,
    /// Local staging -> target.
    Commit,
}

impl fmt::Display for EnumCopyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expand => write!(f, "expand"),
            Self::Stage => write!(f, "stage"),
            Self::Commit => write!(f, "commit"),
        }
    }
}

/// Payload accepted by `filesystem_put` and produced by `filesystem_get`.
#[derive(Debug, Clone, PartialEq)]
pub enum EnumContent {
    /// Raw bytes, written in binary mode.
    Bytes(Vec<u8>),
    /// Text, written through the text adapter.
    Text(String),
    /// Structured value, serialized as JSON text.
    Structured(Value),
}

/// Post-read transformation for `filesystem_get`.
pub enum EnumTransform {
    /// Return the content as read.
    Identity,
    /// Parse the content as JSON.
    Json,
    /// Caller-supplied conversion.
    Custom(Box<dyn FnOnce(EnumContent) -> Result<EnumContent, FsError> + Send>),
}

impl fmt::Debug for EnumTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identity => write!(f, "Identity"),
            Self::Json => write!(f, "Json"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region OpenMode

/// Parsed `r`/`w`/`b`/`t` open mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecOpenMode {
    /// Read (`r`) when true, write (`w`) otherwise.
    pub if_read: bool,
    /// Text semantics requested (`t`, or no `b`).
    pub if_text: bool,
}

impl SpecOpenMode {
    /// Binary read mode (`rb`).
    pub const READ_BINARY: Self = Self {
        if_read: true,
        if_text: false,
    };
    /// Binary write mode (`wb`).
    pub const WRITE_BINARY: Self = Self {
        if_read: false,
        if_text: false,
    };

    /// Parse a conventional mode string.
    ///
    /// Exactly one of `r`/`w` is required; `b` and `t` are mutually
    /// exclusive and a mode without `b` is text.
    pub fn parse(mode: &str) -> Result<Self, FsError> {
        let unsupported = |message: &str| FsError::UnsupportedMode {
            mode: mode.to_string(),
            message: message.to_string(),
        };

        let (mut n_read, mut n_write, mut n_binary, mut n_text) = (0, 0, 0, 0);
        for c in mode.chars() {
            match c {
                'r' => n_read += 1,
                'w' => n_write += 1,
                'b' => n_binary += 1,
                't' => n_text += 1,
                _ => return Err(unsupported(&format!("unknown flag `{c}`"))),
            }
        }
        if n_read + n_write != 1 {
            return Err(unsupported("exactly one of `r` or `w` is required"));
        }
        if n_binary > 1 || n_text > 1 || (n_binary == 1 && n_text == 1) {
            return Err(unsupported("`b` and `t` cannot be combined"));
        }

        Ok(Self {
            if_read: n_read == 1,
            if_text: n_binary == 0,
        })
    }

    /// Same direction, binary semantics.
    pub fn as_binary(self) -> Self {
        Self {
            if_text: false,
            ..self
        }
    }
}

impl fmt::Display for SpecOpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c_dir = if self.if_read { "r" } else { "w" };
        let c_kind = if self.if_text { "t" } else { "b" };
        write!(f, "{c_dir}{c_kind}")
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Compression

/// How a stream is encoded/decoded: `(kind, options, optional entry filename)`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(try_from = "Value")]
pub struct SpecCompression {
    /// Registry key or driver-native identifier. `None` means uncompressed.
    pub kind: Option<String>,
    /// Inner entry name for archive-style codecs.
    pub filename: Option<String>,
    /// Remaining codec-specific options (never contains `type`).
    pub options: Map<String, Value>,
}

impl SpecCompression {
    /// Descriptor for a bare identifier.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            ..Self::default()
        }
    }

    /// Builder: set the archive entry filename.
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Builder: add one codec option.
    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Resolve a structured descriptor.
    ///
    /// Strings are bare kinds. For objects the `type` key becomes the kind
    /// and is removed; `filename` is lifted out; the rest are codec options.
    pub fn from_value(value: &Value) -> Result<Option<Self>, FsError> {
        match value {
            Value::Null => Ok(None),
            Value::String(kind) => Ok(Some(Self::new(kind.clone()))),
            Value::Object(map) => {
                let mut options = map.clone();
                let kind = match options.remove("type") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(s)) => Some(s),
                    Some(other) => {
                        return Err(FsError::InvalidCompression(format!(
                            "`type` must be a string, got {other}"
                        )));
                    }
                };
                let filename = match options.remove("filename") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(s)) => Some(s),
                    Some(other) => {
                        return Err(FsError::InvalidCompression(format!(
                            "`filename` must be a string, got {other}"
                        )));
                    }
                };
                Ok(Some(Self {
                    kind,
                    filename,
                    options,
                }))
            }
            other => Err(FsError::InvalidCompression(format!(
                "expected a string or an object, got {other}"
            ))),
        }
    }

    /// Options handed to a codec factory.
    pub fn codec_options(&self) -> SpecCodecOptions {
        SpecCodecOptions {
            filename: self.filename.clone(),
            options: self.options.clone(),
        }
    }
}

impl TryFrom<Value> for SpecCompression {
    type Error = FsError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Ok(Self::from_value(&value)?.unwrap_or_default())
    }
}

impl From<&str> for SpecCompression {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

/// Codec parameters after the `type` key was extracted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpecCodecOptions {
    /// Archive entry name.
    pub filename: Option<String>,
    /// Codec-specific options.
    pub options: Map<String, Value>,
}

/// One rendered backend-relative path plus its compression.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecResolvedPath {
    pub path: String,
    pub compression: Option<SpecCompression>,
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Options

/// Text adapter policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SpecTextOptions {
    /// `utf-8` or `ascii`.
    pub encoding: String,
    /// Undecodable/unencodable character policy.
    pub errors: EnumTextErrors,
    /// `None`: universal newlines. `""`: untranslated. Otherwise the
    /// terminator written for `\n`.
    pub newline: Option<String>,
}

impl Default for SpecTextOptions {
    fn default() -> Self {
        Self {
            encoding: C_ENCODING_DEFAULT.to_string(),
            errors: EnumTextErrors::Strict,
            newline: None,
        }
    }
}

/// Input options for `open`/`open_async`.
#[derive(Debug, Clone, Default)]
pub struct SpecOpenOptions {
    /// Compression descriptor; `None` opens the raw stream.
    pub compression: Option<SpecCompression>,
    /// Applied only when the mode requests text semantics.
    pub spec_text: SpecTextOptions,
    /// Passed through to the backend driver unchanged.
    pub driver_options: Map<String, Value>,
}

impl SpecOpenOptions {
    /// Options with only a compression descriptor set.
    pub fn compressed(compression: Option<SpecCompression>) -> Self {
        Self {
            compression,
            ..Self::default()
        }
    }
}

/// Input options for `copy_filesystem`.
#[derive(Debug, Clone)]
pub struct SpecCopyOptions {
    /// Target path template; defaults to the source path template.
    pub target_path: Option<String>,
    /// Compression applied when reading the source.
    pub source_compression: Option<SpecCompression>,
    /// Compression applied when writing the target.
    pub target_compression: Option<SpecCompression>,
    /// Template contexts. `None` means one implicit empty record.
    pub records: Option<Vec<Value>>,
    /// Bytes per read during both copy steps.
    pub block_size: usize,
    /// Parent of the per-run staging directory; the system temp dir if `None`.
    pub staging_root: Option<PathBuf>,
}

impl Default for SpecCopyOptions {
    fn default() -> Self {
        Self {
            target_path: None,
            source_compression: None,
            target_compression: None,
            records: None,
            block_size: N_BLOCK_SIZE_DEFAULT,
            staging_root: None,
        }
    }
}

/// Input options for `filesystem_get`.
#[derive(Debug)]
pub struct SpecGetOptions {
    pub compression: Option<SpecCompression>,
    /// `None` (or `"none"`) reads bytes; anything else reads text.
    pub encoding: Option<String>,
    pub transform: EnumTransform,
    /// Returned instead of failing when the file does not exist.
    pub default_value: Option<EnumContent>,
}

impl Default for SpecGetOptions {
    fn default() -> Self {
        Self {
            compression: None,
            encoding: Some(C_ENCODING_DEFAULT.to_string()),
            transform: EnumTransform::Identity,
            default_value: None,
        }
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Errors

/// Filesystem, codec and template failures.
#[derive(Debug, Error)]
pub enum FsError {
    /// Logical path absent on a backend.
    #[error("No such file: {path}")]
    NotFound { path: String },
    /// Driver resolution failed.
    #[error("Unsupported backend: {0}")]
    UnsupportedBackend(String),
    /// Requested archive entry is absent.
    #[error("Archive entry not found: {name}")]
    EntryNotFound { name: String },
    /// Archive has no entries to pick from.
    #[error("Archive contains no entries")]
    NoEntries,
    /// Template placeholder has no matching record field.
    #[error("Missing field `{field}` for template `{template}`")]
    MissingField { field: String, template: String },
    /// Template is malformed.
    #[error("Invalid template `{template}`: {message}")]
    InvalidTemplate { template: String, message: String },
    /// Conflicting or unknown open flags.
    #[error("Unsupported mode `{mode}`: {message}")]
    UnsupportedMode { mode: String, message: String },
    /// Driver has no native support for this identifier.
    #[error("Unsupported compression: {kind}")]
    UnsupportedCompression { kind: String },
    /// Structured descriptor could not be interpreted.
    #[error("Invalid compression descriptor: {0}")]
    InvalidCompression(String),
    /// Unknown text encoding or error policy.
    #[error("Unsupported encoding: {0}")]
    UnsupportedEncoding(String),
    /// Bytes are not valid for the requested encoding.
    #[error("Failed to decode {path} as {encoding}: {message}")]
    Decode {
        path: String,
        encoding: String,
        message: String,
    },
    /// Path escapes the root it must stay under.
    #[error("Unsafe path: {0}")]
    InvalidPath(String),
    /// Archive container is corrupt or unreadable.
    #[error("Invalid archive: {0}")]
    Archive(String),
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("I/O failure on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    /// Blocking worker task panicked or was cancelled.
    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl FsError {
    /// Map an I/O error, keeping `NotFound` distinguishable.
    pub fn from_io(path: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            return Self::NotFound {
                path: path.to_string(),
            };
        }
        Self::Io {
            path: path.to_string(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// A multi-record copy failure with the pair and step that failed.
#[derive(Debug, Error)]
#[error("Copy failed during {stage} ({source_path} -> {target_path}): {error}")]
pub struct CopyError {
    pub stage: EnumCopyStage,
    pub source_path: String,
    pub target_path: String,
    #[source]
    pub error: FsError,
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
