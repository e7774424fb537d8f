//! Engine binding for a module living in an embedded Python interpreter.
//!
//! The module (by default `cubit`) is imported from the library path and
//! initialized with the host's arguments; the module object itself is the
//! root. Member calls go through `getattr` and the Python call protocol, and
//! results are classified into base values, objects and lists.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use pyo3::prelude::*;
use pyo3::types::{
    PyBool, PyByteArray, PyBytes, PyDict, PyFloat, PyFrozenSet, PyInt, PyList, PySet, PyString,
    PyTuple,
};
use pyo3::IntoPyObjectExt;

use crate::protocol::{AttributeInfo, BaseValue, GeometryKind, Parameters};

use super::{log_path_from_args, Engine, EngineError, EngineValue};

/// A Python object kept alive by the registry.
#[derive(Clone)]
pub struct PyHandle(Arc<Py<PyAny>>);

impl PyHandle {
    fn new(object: Bound<'_, PyAny>) -> Self {
        Self(Arc::new(object.unbind()))
    }
}

impl PartialEq for PyHandle {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_ptr() == other.0.as_ptr()
    }
}

impl fmt::Debug for PyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PyHandle({:p})", self.0.as_ptr())
    }
}

/// Engine backed by a Python module.
pub struct PythonEngine {
    module_name: String,
    library_dirs: Vec<PathBuf>,
    log_path: Option<String>,
    module: Option<Py<PyModule>>,
}

impl PythonEngine {
    pub fn new(module_name: &str, library_dirs: Vec<PathBuf>) -> Self {
        Self {
            module_name: module_name.to_string(),
            library_dirs,
            log_path: None,
            module: None,
        }
    }

    fn module<'py>(&self, py: Python<'py>) -> Result<Bound<'py, PyModule>, EngineError> {
        self.module
            .as_ref()
            .map(|m| m.bind(py).clone())
            .ok_or_else(|| EngineError::Raised("engine is not initialized".to_string()))
    }

    fn kind_class<'py>(&self, py: Python<'py>, kind: GeometryKind) -> Option<Bound<'py, PyAny>> {
        let module = self.module(py).ok()?;
        let name = match kind {
            GeometryKind::Vertex => "Vertex",
            GeometryKind::Curve => "Curve",
            GeometryKind::Surface => "Surface",
            GeometryKind::Volume => "Volume",
        };
        module.getattr(name).ok()
    }
}

fn raised(err: PyErr) -> EngineError {
    EngineError::Raised(err.to_string())
}

/// Make `dir` importable and, where the platform supports it, a DLL
/// search directory.
fn add_library_dir(py: Python<'_>, dir: &str) -> PyResult<()> {
    let sys_path = py.import("sys")?.getattr("path")?;
    if !sys_path.contains(dir)? {
        sys_path.call_method1("insert", (0, dir))?;
    }

    let os = py.import("os")?;
    if os.hasattr("add_dll_directory")? {
        if let Err(e) = os.call_method1("add_dll_directory", (dir,)) {
            tracing::debug!("add_dll_directory({}) failed: {}", dir, e);
        }
    }
    Ok(())
}

fn classify(value: &Bound<'_, PyAny>) -> Result<EngineValue<PyHandle>, EngineError> {
    if value.is_none() {
        return Ok(EngineValue::none());
    }
    // bool before int: Python bools are ints.
    if value.is_instance_of::<PyBool>() {
        return Ok(EngineValue::bool(value.extract().map_err(raised)?));
    }
    if value.is_instance_of::<PyInt>() {
        let v: i64 = value
            .extract()
            .map_err(|_| EngineError::UnsupportedType("int outside 64-bit range".to_string()))?;
        return Ok(EngineValue::int(v));
    }
    if value.is_instance_of::<PyFloat>() {
        return Ok(EngineValue::float(value.extract().map_err(raised)?));
    }
    if value.is_instance_of::<PyString>() {
        return Ok(EngineValue::str(value.extract::<String>().map_err(raised)?));
    }
    if value.is_instance_of::<PyList>() || value.is_instance_of::<PyTuple>() {
        let items = value
            .try_iter()
            .map_err(raised)?
            .map(|item| item.map_err(raised).and_then(|item| classify(&item)))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(EngineValue::List(items));
    }
    if value.is_instance_of::<PyDict>()
        || value.is_instance_of::<PySet>()
        || value.is_instance_of::<PyFrozenSet>()
        || value.is_instance_of::<PyBytes>()
        || value.is_instance_of::<PyByteArray>()
    {
        let type_name = value
            .get_type()
            .name()
            .map(|n| n.to_string())
            .unwrap_or_else(|_| "object".to_string());
        return Err(EngineError::UnsupportedType(type_name));
    }
    Ok(EngineValue::Object(PyHandle::new(value.clone())))
}

fn to_python<'py>(
    py: Python<'py>,
    value: EngineValue<PyHandle>,
) -> PyResult<Bound<'py, PyAny>> {
    match value {
        EngineValue::Base(BaseValue::None) => Ok(py.None().into_bound(py)),
        EngineValue::Base(BaseValue::Bool(v)) => v.into_bound_py_any(py),
        EngineValue::Base(BaseValue::Int(v)) => v.into_bound_py_any(py),
        EngineValue::Base(BaseValue::Float(v)) => v.into_bound_py_any(py),
        EngineValue::Base(BaseValue::Str(v)) => v.into_bound_py_any(py),
        EngineValue::Object(handle) => Ok(handle.0.bind(py).clone()),
        EngineValue::List(items) => {
            let items = items
                .into_iter()
                .map(|item| to_python(py, item))
                .collect::<PyResult<Vec<_>>>()?;
            PyList::new(py, items)?.into_bound_py_any(py)
        }
    }
}

impl Engine for PythonEngine {
    type Object = PyHandle;

    fn load(&mut self, params: &Parameters) -> Result<(), EngineError> {
        self.log_path = params.log_path.clone();

        let mut dirs: Vec<String> = self
            .library_dirs
            .iter()
            .map(|d| d.display().to_string())
            .collect();
        dirs.push(params.library_path.clone());

        Python::attach(|py| {
            for dir in &dirs {
                add_library_dir(py, dir)?;
            }
            Ok::<_, PyErr>(())
        })
        .map_err(|e| EngineError::Load(e.to_string()))?;

        tracing::info!("Python engine library path: {:?}", dirs);
        Ok(())
    }

    fn init(&mut self, args: &[String]) -> Result<PyHandle, EngineError> {
        if self.module.is_some() {
            return Err(EngineError::Raised("engine is already initialized".to_string()));
        }

        let mut args = args.to_vec();
        if log_path_from_args(&args).is_none() {
            if let Some(path) = &self.log_path {
                args.push("-log".to_string());
                args.push(path.clone());
            }
        }

        Python::attach(|py| {
            let module = py.import(self.module_name.as_str()).map_err(|e| {
                EngineError::Load(format!("cannot import {}: {}", self.module_name, e))
            })?;
            module.call_method1("init", (args,)).map_err(raised)?;
            let root = PyHandle::new(module.clone().into_any());
            self.module = Some(module.unbind());
            Ok(root)
        })
    }

    fn identity(&self, obj: &PyHandle) -> u64 {
        obj.0.as_ptr() as usize as u64
    }

    fn describe(&self, obj: &PyHandle) -> String {
        Python::attach(|py| {
            let object = obj.0.bind(py);
            object
                .str()
                .map(|s| s.to_string())
                .unwrap_or_else(|_| "<engine object>".to_string())
        })
    }

    fn attributes(&self, obj: &PyHandle) -> Result<Vec<AttributeInfo>, EngineError> {
        Python::attach(|py| {
            let object = obj.0.bind(py);
            let names = object.dir().map_err(raised)?;
            let mut attributes = Vec::with_capacity(names.len());
            for name in names.iter() {
                let name: String = name.extract().map_err(raised)?;
                let callable = object
                    .getattr(name.as_str())
                    .map(|member| member.is_callable())
                    .unwrap_or(false);
                attributes.push(AttributeInfo { name, callable });
            }
            Ok(attributes)
        })
    }

    fn invoke(
        &mut self,
        obj: &PyHandle,
        name: &str,
        args: Vec<EngineValue<PyHandle>>,
    ) -> Result<EngineValue<PyHandle>, EngineError> {
        Python::attach(|py| {
            let member = obj.0.bind(py).getattr(name).map_err(raised)?;

            let result = if member.is_callable() {
                let args = args
                    .into_iter()
                    .map(|arg| to_python(py, arg))
                    .collect::<PyResult<Vec<_>>>()
                    .map_err(raised)?;
                let args = PyTuple::new(py, args).map_err(raised)?;
                member.call1(args).map_err(raised)?
            } else if args.is_empty() {
                member
            } else {
                return Err(EngineError::Raised(format!("'{}' is not callable", name)));
            };

            classify(&result)
        })
    }

    fn is_kind(&self, obj: &PyHandle, kind: GeometryKind) -> bool {
        Python::attach(|py| {
            let Some(class) = self.kind_class(py, kind) else {
                return false;
            };
            obj.0.bind(py).is_instance(&class).unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_classify_base_values() {
        Python::attach(|py| {
            let value = 3i64.into_bound_py_any(py).unwrap();
            assert_eq!(classify(&value).unwrap(), EngineValue::int(3));

            let value = true.into_bound_py_any(py).unwrap();
            assert_eq!(classify(&value).unwrap(), EngineValue::bool(true));

            let value = py.None().into_bound(py);
            assert_eq!(classify(&value).unwrap(), EngineValue::none());
        });
    }

    #[test]
    fn test_classify_nested_sequences() {
        Python::attach(|py| {
            let value = py.eval(c"[1, (2.5, 'a'), []]", None, None).unwrap();
            match classify(&value).unwrap() {
                EngineValue::List(items) => {
                    assert_eq!(items[0], EngineValue::int(1));
                    assert!(matches!(&items[1], EngineValue::List(inner) if inner.len() == 2));
                    assert!(matches!(&items[2], EngineValue::List(inner) if inner.is_empty()));
                }
                _ => panic!("Expected list"),
            }
        });
    }

    #[test]
    fn test_classify_rejects_mappings() {
        Python::attach(|py| {
            let value = py.eval(c"{'a': 1}", None, None).unwrap();
            assert!(matches!(
                classify(&value),
                Err(EngineError::UnsupportedType(name)) if name == "dict"
            ));
        });
    }
}
