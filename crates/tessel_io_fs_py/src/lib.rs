use std::sync::Arc;

use once_cell::sync::OnceCell;
use pyo3::exceptions::{PyFileNotFoundError, PyKeyError, PyOSError, PyTypeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyDict, PyList, PyString, PyTuple};
use serde_json::Value;
use tessel_io_fs::{
    AbstractFilesystem, CopyError, EnumBackend, EnumContent, FilesystemHandle, FsError, FsRef,
    LocalFilesystem, MemoryDriver, SpecCompression, SpecCopyOptions, SpecGetOptions,
    filesystem_copy, filesystem_get, filesystem_put, records_from_value,
};
use tokio::runtime::{Builder, Runtime};

const N_BRIDGE_ABI_VERSION: u64 = 1;
const C_BRIDGE_CONTRACT_VERSION: &str = "tessel.fs.tasks.v1";
const C_BRIDGE_TRANSPORT: &str = "rust_native";
const C_TRANSFORM_JSON: &str = "json";

static RUNTIME: OnceCell<Runtime> = OnceCell::new();

fn runtime() -> PyResult<&'static Runtime> {
    RUNTIME.get_or_try_init(|| {
        Builder::new_multi_thread()
            .thread_name("tessel-io-fs")
            .enable_all()
            .build()
            .map_err(|e| PyOSError::new_err(format!("Failed to start runtime: {e}")))
    })
}

#[pyclass(name = "FileSystem")]
#[derive(Debug, Clone)]
struct PyFileSystem {
    fs: FsRef,
}

#[pymethods]
impl PyFileSystem {
    /// Local-disk filesystem rooted at `root_path`.
    #[staticmethod]
    #[pyo3(signature = (root_path, auto_mkdir = false))]
    fn local(root_path: String, auto_mkdir: bool) -> Self {
        Self {
            fs: Arc::new(LocalFilesystem::new(root_path, auto_mkdir)),
        }
    }

    /// In-process filesystem; each call creates independent storage.
    #[staticmethod]
    #[pyo3(signature = (base_path = "memory://"))]
    fn memory(base_path: &str) -> Self {
        Self {
            fs: Arc::new(FilesystemHandle::new(
                base_path,
                EnumBackend::remote(MemoryDriver::new()),
            )),
        }
    }

    #[getter]
    fn base_path(&self) -> String {
        self.fs.base_path()
    }

    fn build_path(&self, path: &str) -> String {
        self.fs.build_path(path)
    }

    fn __repr__(&self) -> String {
        format!("FileSystem(base_path={:?})", self.fs.base_path())
    }
}

fn map_fs_error(exception: FsError) -> PyErr {
    let message = exception.to_string();
    match exception {
        FsError::NotFound { .. } => PyFileNotFoundError::new_err(message),
        FsError::EntryNotFound { .. } => PyKeyError::new_err(message),
        FsError::Io { .. } | FsError::Worker(_) => PyOSError::new_err(message),
        _ => PyValueError::new_err(message),
    }
}

fn map_copy_error(exception: CopyError) -> PyErr {
    let message = exception.to_string();
    match exception.error {
        FsError::NotFound { .. } => PyFileNotFoundError::new_err(message),
        FsError::EntryNotFound { .. } => PyKeyError::new_err(message),
        FsError::Io { .. } | FsError::Worker(_) => PyOSError::new_err(message),
        _ => PyValueError::new_err(message),
    }
}

fn py_to_value(py: Python<'_>, obj: &Bound<'_, PyAny>) -> PyResult<Value> {
    let txt: String = py
        .import("json")?
        .call_method1("dumps", (obj,))?
        .extract()?;
    serde_json::from_str(&txt).map_err(|e| PyValueError::new_err(e.to_string()))
}

fn value_to_py(py: Python<'_>, value: &Value) -> PyResult<PyObject> {
    Ok(py
        .import("json")?
        .call_method1("loads", (value.to_string(),))?
        .unbind())
}

fn content_to_py(py: Python<'_>, content: EnumContent) -> PyResult<PyObject> {
    match content {
        EnumContent::Bytes(data) => Ok(PyBytes::new(py, &data).into_any().unbind()),
        EnumContent::Text(txt) => Ok(PyString::new(py, &txt).into_any().unbind()),
        EnumContent::Structured(value) => value_to_py(py, &value),
    }
}

fn parse_content(py: Python<'_>, content: &Bound<'_, PyAny>) -> PyResult<EnumContent> {
    if let Ok(py_bytes) = content.downcast::<PyBytes>() {
        return Ok(EnumContent::Bytes(py_bytes.as_bytes().to_vec()));
    }
    if content.is_instance_of::<PyString>() {
        return Ok(EnumContent::Text(content.extract()?));
    }
    if content.is_instance_of::<PyList>()
        || content.is_instance_of::<PyDict>()
        || content.is_instance_of::<PyTuple>()
    {
        return Ok(EnumContent::Structured(py_to_value(py, content)?));
    }
    Err(PyTypeError::new_err(format!(
        "Invalid content type: `{}`. Expected one of: ['bytes', 'str', 'list', 'dict', 'tuple']",
        content.get_type().name()?
    )))
}

fn parse_compression(
    py: Python<'_>,
    compression: Option<&Bound<'_, PyAny>>,
) -> PyResult<Option<SpecCompression>> {
    let Some(compression) = compression else {
        return Ok(None);
    };
    let value = py_to_value(py, compression)?;
    SpecCompression::from_value(&value).map_err(map_fs_error)
}

#[pyfunction(name = "filesystem_put")]
#[pyo3(signature = (content, filename, filesystem, compression = None))]
fn filesystem_put_py(
    py: Python<'_>,
    content: &Bound<'_, PyAny>,
    filename: String,
    filesystem: PyRef<'_, PyFileSystem>,
    compression: Option<&Bound<'_, PyAny>>,
) -> PyResult<String> {
    let content = parse_content(py, content)?;
    let compression = parse_compression(py, compression)?;
    let fs = Arc::clone(&filesystem.fs);
    let rt = runtime()?;

    py.allow_threads(move || rt.block_on(filesystem_put(content, &filename, &fs, compression)))
        .map_err(map_fs_error)
}

/// Read `filename`. `transform` is `None`, `"json"` or a callable.
///
/// Pass `default_value=...` to get it back instead of `FileNotFoundError`.
#[pyfunction(name = "filesystem_get")]
#[pyo3(signature = (filename, filesystem, compression = None, encoding = Some("utf-8".to_string()), transform = None, **kwargs))]
fn filesystem_get_py(
    py: Python<'_>,
    filename: String,
    filesystem: PyRef<'_, PyFileSystem>,
    compression: Option<&Bound<'_, PyAny>>,
    encoding: Option<String>,
    transform: Option<&Bound<'_, PyAny>>,
    kwargs: Option<&Bound<'_, PyDict>>,
) -> PyResult<PyObject> {
    let mut default_value = None;
    if let Some(kwargs) = kwargs {
        for (key, value) in kwargs.iter() {
            let key: String = key.extract()?;
            if key != "default_value" {
                return Err(PyTypeError::new_err(format!(
                    "Unexpected keyword argument: `{key}`. Expected one of: ['default_value']"
                )));
            }
            default_value = Some(value.unbind());
        }
    }
    if let Some(transform) = transform {
        let if_json = transform
            .extract::<String>()
            .is_ok_and(|txt| txt == C_TRANSFORM_JSON);
        if !if_json && !transform.is_callable() {
            return Err(PyValueError::new_err(
                "Invalid transform. Expected one of: [None, 'json', <callable>]",
            ));
        }
    }

    let spec_get = SpecGetOptions {
        compression: parse_compression(py, compression)?,
        encoding,
        ..SpecGetOptions::default()
    };
    let fs = Arc::clone(&filesystem.fs);
    let rt = runtime()?;

    let content =
        match py.allow_threads(move || rt.block_on(filesystem_get(&filename, &fs, spec_get))) {
            Ok(content) => content,
            Err(e) if e.is_not_found() => {
                return match default_value {
                    Some(default_value) => Ok(default_value),
                    None => Err(map_fs_error(e)),
                };
            }
            Err(e) => return Err(map_fs_error(e)),
        };

    let content = content_to_py(py, content)?;
    match transform {
        None => Ok(content),
        Some(transform) if transform.is_callable() => Ok(transform.call1((content,))?.unbind()),
        Some(_) => Ok(py
            .import("json")?
            .call_method1("loads", (content,))?
            .unbind()),
    }
}

#[pyfunction(name = "filesystem_copy")]
#[pyo3(signature = (
    source_filename,
    source_filesystem,
    target_filesystem,
    target_filename = None,
    source_compression = None,
    target_compression = None,
    datasource = None,
    block_size = 1024 * 1024
))]
#[allow(clippy::too_many_arguments)]
fn filesystem_copy_py(
    py: Python<'_>,
    source_filename: String,
    source_filesystem: PyRef<'_, PyFileSystem>,
    target_filesystem: PyRef<'_, PyFileSystem>,
    target_filename: Option<String>,
    source_compression: Option<&Bound<'_, PyAny>>,
    target_compression: Option<&Bound<'_, PyAny>>,
    datasource: Option<&Bound<'_, PyAny>>,
    block_size: usize,
) -> PyResult<Vec<(String, String)>> {
    let records = match datasource {
        Some(datasource) => records_from_value(py_to_value(py, datasource)?),
        None => records_from_value(Value::Null),
    };
    let spec_cp_options = SpecCopyOptions {
        target_path: target_filename,
        source_compression: parse_compression(py, source_compression)?,
        target_compression: parse_compression(py, target_compression)?,
        records: Some(records),
        block_size,
        ..SpecCopyOptions::default()
    };
    let fs_source = Arc::clone(&source_filesystem.fs);
    let fs_target = Arc::clone(&target_filesystem.fs);
    let rt = runtime()?;

    py.allow_threads(move || {
        rt.block_on(filesystem_copy(
            &source_filename,
            &fs_source,
            &fs_target,
            spec_cp_options,
        ))
    })
    .map_err(map_copy_error)
}

#[pymodule]
fn _tessel_io_fs_rs(module: &Bound<'_, PyModule>) -> PyResult<()> {
    module.add_class::<PyFileSystem>()?;
    module.add_function(wrap_pyfunction!(filesystem_put_py, module)?)?;
    module.add_function(wrap_pyfunction!(filesystem_get_py, module)?)?;
    module.add_function(wrap_pyfunction!(filesystem_copy_py, module)?)?;
    module.add("__bridge_abi__", N_BRIDGE_ABI_VERSION)?;
    module.add("__bridge_contract__", C_BRIDGE_CONTRACT_VERSION)?;
    module.add("__bridge_transport__", C_BRIDGE_TRANSPORT)?;
    Ok(())
}
