//! Conversions between JSON values and interpreter objects.

use pyo3::prelude::*;
use pyo3::types::{PyBool, PyDict, PyFloat, PyFrozenSet, PyInt, PyList, PySet, PyString, PyTuple};
use serde_json::{Map, Number, Value};

/// Deepest container nesting converted structurally; anything deeper falls
/// back to `repr`.
const MAX_DEPTH: usize = 64;

/// Build an interpreter object from a JSON value.
pub(crate) fn to_py(py: Python<'_>, value: &Value) -> PyResult<PyObject> {
    Ok(match value {
        Value::Null => py.None(),
        Value::Bool(b) => b.into_py(py),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.into_py(py)
            } else if let Some(u) = n.as_u64() {
                u.into_py(py)
            } else {
                n.as_f64().unwrap_or(f64::NAN).into_py(py)
            }
        }
        Value::String(s) => s.into_py(py),
        Value::Array(items) => {
            let list = PyList::empty_bound(py);
            for item in items {
                list.append(to_py(py, item)?)?;
            }
            list.into_py(py)
        }
        Value::Object(map) => {
            let dict = PyDict::new_bound(py);
            for (k, v) in map {
                dict.set_item(k, to_py(py, v)?)?;
            }
            dict.into_py(py)
        }
    })
}

/// Convert an interpreter object to JSON.
///
/// Scalars, lists, tuples, sets and string-keyable dicts convert
/// structurally. Other objects, integers outside 64 bits and non-finite
/// floats become their `repr`.
pub(crate) fn to_json(obj: &Bound<'_, PyAny>) -> Value {
    convert(obj, 0)
}

fn convert(obj: &Bound<'_, PyAny>, depth: usize) -> Value {
    if obj.is_none() {
        return Value::Null;
    }
    if depth > MAX_DEPTH {
        return repr(obj);
    }
    if let Ok(b) = obj.downcast::<PyBool>() {
        return Value::Bool(b.is_true());
    }
    if obj.is_instance_of::<PyInt>() {
        if let Ok(i) = obj.extract::<i64>() {
            return Value::from(i);
        }
        if let Ok(u) = obj.extract::<u64>() {
            return Value::from(u);
        }
        return repr(obj);
    }
    if let Ok(f) = obj.downcast::<PyFloat>() {
        return Number::from_f64(f.value())
            .map(Value::Number)
            .unwrap_or_else(|| repr(obj));
    }
    if let Ok(s) = obj.downcast::<PyString>() {
        return Value::String(s.to_string_lossy().into_owned());
    }
    if let Ok(list) = obj.downcast::<PyList>() {
        return Value::Array(list.iter().map(|item| convert(&item, depth + 1)).collect());
    }
    if let Ok(tuple) = obj.downcast::<PyTuple>() {
        return Value::Array(tuple.iter().map(|item| convert(&item, depth + 1)).collect());
    }
    if obj.is_instance_of::<PySet>() || obj.is_instance_of::<PyFrozenSet>() {
        if let Ok(iter) = obj.iter() {
            return Value::Array(
                iter.filter_map(Result::ok)
                    .map(|item| convert(&item, depth + 1))
                    .collect(),
            );
        }
    }
    if let Ok(dict) = obj.downcast::<PyDict>() {
        let mut map = Map::new();
        for (k, v) in dict.iter() {
            let key = match k.downcast::<PyString>() {
                Ok(s) => s.to_string_lossy().into_owned(),
                Err(_) => match k.str() {
                    Ok(s) => s.to_string_lossy().into_owned(),
                    Err(_) => continue,
                },
            };
            map.insert(key, convert(&v, depth + 1));
        }
        return Value::Object(map);
    }
    repr(obj)
}

fn repr(obj: &Bound<'_, PyAny>) -> Value {
    match obj.repr() {
        Ok(r) => Value::String(r.to_string_lossy().into_owned()),
        Err(_) => Value::String("<unrepresentable>".to_string()),
    }
}
