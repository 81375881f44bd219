//! Path templater: `{field}` placeholders rendered from one record.

use once_cell::sync::OnceCell;
use regex::Regex;
use serde_json::{Map, Value};

use crate::spec::{FsError, SpecCompression, SpecResolvedPath};

static RE_PLACEHOLDER: OnceCell<Regex> = OnceCell::new();

fn _placeholder_regex(template: &str) -> Result<&'static Regex, FsError> {
    RE_PLACEHOLDER
        .get_or_try_init(|| Regex::new(r"\{\{|\}\}|\{([^{}]*)\}|[{}]"))
        .map_err(|e| FsError::InvalidTemplate {
            template: template.to_string(),
            message: e.to_string(),
        })
}

fn _render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render `template` against `record`.
///
/// `{{` and `}}` are literal braces. Placeholders are plain field names;
/// format specs, conversions and unbalanced braces are rejected.
pub fn render_template(template: &str, record: &Map<String, Value>) -> Result<String, FsError> {
    let invalid = |message: String| FsError::InvalidTemplate {
        template: template.to_string(),
        message,
    };

    let re_placeholder = _placeholder_regex(template)?;
    let mut txt = String::with_capacity(template.len());
    let mut idx_last = 0;
    for caps in re_placeholder.captures_iter(template) {
        let Some(m) = caps.get(0) else { continue };
        txt.push_str(&template[idx_last..m.start()]);
        idx_last = m.end();

        match m.as_str() {
            "{{" => txt.push('{'),
            "}}" => txt.push('}'),
            "{" | "}" => {
                return Err(invalid(format!("single `{}` at position {}", m.as_str(), m.start())));
            }
            _ => {
                let field = caps.get(1).map_or("", |c| c.as_str());
                if field.is_empty() {
                    return Err(invalid("empty placeholder".to_string()));
                }
                if field.contains([':', '!', '.', '[']) {
                    return Err(invalid(format!("unsupported placeholder `{{{field}}}`")));
                }
                let value = record.get(field).ok_or_else(|| FsError::MissingField {
                    field: field.to_string(),
                    template: template.to_string(),
                })?;
                txt.push_str(&_render_value(value));
            }
        }
    }
    txt.push_str(&template[idx_last..]);
    Ok(txt)
}

/// Render a path template and the compression entry filename for one record.
///
/// Non-object records pass both through unchanged. The entry filename is only
/// rendered when it contains a placeholder.
pub fn render_path_format(
    record: &Value,
    path_template: &str,
    compression: Option<&SpecCompression>,
) -> Result<SpecResolvedPath, FsError> {
    let Value::Object(dict_record) = record else {
        return Ok(SpecResolvedPath {
            path: path_template.to_string(),
            compression: compression.cloned(),
        });
    };

    let path = render_template(path_template, dict_record)?;
    let compression = match compression {
        Some(spec_compression) => match spec_compression.filename.as_deref() {
            Some(filename) if filename.contains('{') => Some(SpecCompression {
                filename: Some(render_template(filename, dict_record)?),
                ..spec_compression.clone()
            }),
            _ => Some(spec_compression.clone()),
        },
        None => None,
    };
    Ok(SpecResolvedPath { path, compression })
}

/// Coerce a records argument into a list of template contexts.
///
/// `null` is one empty record, an array is its elements, anything else is a
/// single record.
pub fn records_from_value(value: Value) -> Vec<Value> {
    match value {
        Value::Null => vec![Value::Object(Map::new())],
        Value::Array(l_records) => l_records,
        other => vec![other],
    }
}
