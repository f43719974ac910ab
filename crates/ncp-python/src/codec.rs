//! Conversion between host values and interpreter objects.

use crate::arguments::CallArguments;
use crate::buffer::{ElementType, HostBuffer};
use crate::callback::HostCallable;
use crate::errors::BridgeError;
use crate::handles::HandleRegistry;
use crate::value::HostValue;
use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use pyo3::prelude::*;
use pyo3::types::{
    PyBool, PyByteArray, PyBytes, PyDict, PyFloat, PyInt, PyList, PyMemoryView, PyString, PyTuple,
};
use std::collections::HashSet;
use std::mem;
use std::os::raw::c_long;

/// Deepest container nesting accepted in either direction
pub const MAX_DEPTH: usize = 128;

/// Interpreter-side stand-in for the host's "unset" value.
///
/// Distinct from `None`, which stands for the host's explicit null. Falsy, so
/// `if not value:` treats both absent states alike.
#[pyclass(frozen, module = "nodecallspython", name = "Undefined")]
pub(crate) struct Undefined;

#[pymethods]
impl Undefined {
    fn __bool__(&self) -> bool {
        false
    }

    fn __repr__(&self) -> &'static str {
        "undefined"
    }
}

static UNDEFINED: OnceCell<Py<Undefined>> = OnceCell::new();

/// The process-wide `undefined` instance
pub(crate) fn undefined(py: Python<'_>) -> PyResult<Bound<'_, PyAny>> {
    let instance = UNDEFINED.get_or_try_init(|| Py::new(py, Undefined))?;
    Ok(instance.bind(py).clone().into_any())
}

/// Convert a host value into an interpreter object.
///
/// Handles are looked up in `handles`; nothing is registered.
pub(crate) fn to_interpreter<'py>(
    py: Python<'py>,
    value: &HostValue,
    handles: &HandleRegistry,
) -> Result<Bound<'py, PyAny>, BridgeError> {
    encode(py, value, handles, 0)
}

fn encode<'py>(
    py: Python<'py>,
    value: &HostValue,
    handles: &HandleRegistry,
    depth: usize,
) -> Result<Bound<'py, PyAny>, BridgeError> {
    if depth > MAX_DEPTH {
        return Err(BridgeError::UnknownType(format!(
            "nesting deeper than {}",
            MAX_DEPTH
        )));
    }

    let object = match value {
        HostValue::Undefined => undefined(py)?,
        HostValue::Null => py.None().into_bound(py),
        HostValue::Bool(b) => PyBool::new(py, *b).to_owned().into_any(),
        HostValue::Int(i) => PyInt::new(py, *i).into_any(),
        HostValue::Float(f) => PyFloat::new(py, *f).into_any(),
        HostValue::String(s) => PyString::new(py, s).into_any(),
        HostValue::Array(items) => {
            let list = PyList::empty(py);
            for item in items {
                list.append(encode(py, item, handles, depth + 1)?)?;
            }
            list.into_any()
        }
        HostValue::Tuple(items) => {
            let items = items
                .iter()
                .map(|item| encode(py, item, handles, depth + 1))
                .collect::<Result<Vec<_>, _>>()?;
            PyTuple::new(py, items)?.into_any()
        }
        HostValue::Object(map) => {
            let dict = PyDict::new(py);
            for (key, item) in map {
                dict.set_item(key, encode(py, item, handles, depth + 1)?)?;
            }
            dict.into_any()
        }
        HostValue::Buffer(buffer) => encode_buffer(py, buffer)?,
        HostValue::Function(function) => {
            Bound::new(py, HostCallable::new(function.clone()))?.into_any()
        }
        HostValue::Handle(handle) => handles.object(py, *handle)?.into_bound(py),
        HostValue::Unsupported(type_name) => {
            return Err(BridgeError::UnknownType(type_name.clone()));
        }
    };

    Ok(object)
}

/// A writable `memoryview` over host memory, or a `bytearray` copy
fn encode_buffer<'py>(py: Python<'py>, buffer: &HostBuffer) -> PyResult<Bound<'py, PyAny>> {
    if buffer.is_copy() {
        return Ok(PyByteArray::new(py, &buffer.to_vec()).into_any());
    }
    let exporter = Bound::new(py, buffer.exporter())?.into_any();
    Ok(PyMemoryView::from(&exporter)?.into_any())
}

/// Convert call arguments into a positional tuple and optional keyword dict.
///
/// Every argument is converted before anything is called, so a bad argument
/// fails the call without running any interpreter code.
pub(crate) fn encode_arguments<'py>(
    py: Python<'py>,
    arguments: &CallArguments,
    handles: &HandleRegistry,
) -> Result<(Bound<'py, PyTuple>, Option<Bound<'py, PyDict>>), BridgeError> {
    let positional = arguments
        .positional
        .iter()
        .map(|value| to_interpreter(py, value, handles))
        .collect::<Result<Vec<_>, _>>()?;
    let positional = PyTuple::new(py, positional)?;

    if arguments.keyword.is_empty() {
        return Ok((positional, None));
    }

    let keyword = PyDict::new(py);
    for (name, value) in &arguments.keyword {
        keyword.set_item(name, to_interpreter(py, value, handles)?)?;
    }
    Ok((positional, Some(keyword)))
}

/// Convert an interpreter object into a host value
pub(crate) fn to_host(object: &Bound<'_, PyAny>) -> Result<HostValue, BridgeError> {
    let mut seen = HashSet::new();
    decode(object, 0, &mut seen)
}

fn decode(
    object: &Bound<'_, PyAny>,
    depth: usize,
    seen: &mut HashSet<usize>,
) -> Result<HostValue, BridgeError> {
    if depth > MAX_DEPTH {
        return Err(BridgeError::UnknownType(format!(
            "nesting deeper than {}",
            MAX_DEPTH
        )));
    }

    if object.is_none() {
        return Ok(HostValue::Null);
    }
    if object.is_instance_of::<Undefined>() {
        return Ok(HostValue::Undefined);
    }
    if let Ok(b) = object.cast::<PyBool>() {
        return Ok(HostValue::Bool(b.is_true()));
    }
    if object.is_instance_of::<PyInt>() {
        // Out-of-range integers degrade to floating point, like host numbers
        if let Ok(i) = object.extract::<i64>() {
            return Ok(HostValue::Int(i));
        }
        return Ok(HostValue::Float(int_to_f64(object)?));
    }
    if let Ok(f) = object.cast::<PyFloat>() {
        return Ok(HostValue::Float(f.value()));
    }
    if let Ok(s) = object.cast::<PyString>() {
        return Ok(HostValue::String(s.to_str()?.to_string()));
    }
    if let Ok(bytes) = object.cast::<PyBytes>() {
        return Ok(HostValue::Buffer(HostBuffer::from_bytes(bytes.as_bytes())));
    }
    if let Ok(bytes) = object.cast::<PyByteArray>() {
        return Ok(HostValue::Buffer(HostBuffer::from_vec(bytes.to_vec())));
    }
    if object.is_instance_of::<PyMemoryView>() {
        return decode_memoryview(object);
    }
    if let Ok(callable) = object.cast::<HostCallable>() {
        return Ok(HostValue::Function(callable.get().function().clone()));
    }

    if let Ok(tuple) = object.cast::<PyTuple>() {
        let items = enter(object, seen, |seen| {
            tuple
                .iter()
                .map(|item| decode(&item, depth + 1, seen))
                .collect()
        })?;
        return Ok(HostValue::Tuple(items));
    }
    if let Ok(list) = object.cast::<PyList>() {
        let items = enter(object, seen, |seen| {
            list.iter()
                .map(|item| decode(&item, depth + 1, seen))
                .collect()
        })?;
        return Ok(HostValue::Array(items));
    }
    if let Ok(dict) = object.cast::<PyDict>() {
        let map = enter(object, seen, |seen| {
            let mut map = IndexMap::with_capacity(dict.len());
            for (key, item) in dict.iter() {
                map.insert(key.str()?.to_string(), decode(&item, depth + 1, seen)?);
            }
            Ok(map)
        })?;
        return Ok(HostValue::Object(map));
    }

    // Sets, generators and other iterables arrive as arrays
    if let Ok(iterator) = object.try_iter() {
        let items = enter(object, seen, |seen| {
            iterator
                .map(|item| decode(&item?, depth + 1, seen))
                .collect()
        })?;
        return Ok(HostValue::Array(items));
    }

    Ok(HostValue::Undefined)
}

/// Run `convert` with `object` marked as in progress, rejecting cycles
fn enter<T>(
    object: &Bound<'_, PyAny>,
    seen: &mut HashSet<usize>,
    convert: impl FnOnce(&mut HashSet<usize>) -> Result<T, BridgeError>,
) -> Result<T, BridgeError> {
    let ptr = object.as_ptr() as usize;
    if !seen.insert(ptr) {
        return Err(BridgeError::UnknownType(format!(
            "cyclic {}",
            object
                .get_type()
                .name()
                .map(|name| name.to_string())
                .unwrap_or_else(|_| "container".to_string())
        )));
    }
    let result = convert(seen);
    seen.remove(&ptr);
    result
}

fn decode_memoryview(object: &Bound<'_, PyAny>) -> Result<HostValue, BridgeError> {
    let bytes = object.call_method0("tobytes")?;
    let bytes = bytes.cast::<PyBytes>().map_err(PyErr::from)?;
    let format = object.getattr("format")?.extract::<String>()?;

    let buffer = HostBuffer::from_bytes(bytes.as_bytes());
    let element = element_for_format(&format).unwrap_or(ElementType::U8);
    if element == ElementType::U8 {
        return Ok(HostValue::Buffer(buffer));
    }
    // Fall back to a byte view when the length does not divide evenly
    let typed = buffer.view(0, buffer.byte_len(), element).unwrap_or(buffer);
    Ok(HostValue::Buffer(typed))
}

/// An integer too large for `i64` as a float; beyond `f64` range it saturates to infinity
fn int_to_f64(object: &Bound<'_, PyAny>) -> Result<f64, BridgeError> {
    match object.extract::<f64>() {
        Ok(f) => Ok(f),
        Err(_) if object.gt(0)? => Ok(f64::INFINITY),
        Err(_) => Ok(f64::NEG_INFINITY),
    }
}

/// Element type for a `struct` format code.
///
/// Byte-order prefixes are honoured: a byte order foreign to this machine
/// yields `None`, so the data stays a plain byte buffer.
fn element_for_format(format: &str) -> Option<ElementType> {
    let (order, code) = match format.chars().next() {
        Some(order @ ('@' | '=' | '<' | '>' | '!')) => (order, &format[1..]),
        _ => ('@', format),
    };
    let foreign = match order {
        '<' => cfg!(target_endian = "big"),
        '>' | '!' => cfg!(target_endian = "little"),
        _ => false,
    };
    if foreign {
        return None;
    }

    // `l`/`L` are C longs natively and 4 bytes in the standard sizes
    let long_is_wide = order == '@' && mem::size_of::<c_long>() == 8;
    let element = match code {
        "B" | "c" => ElementType::U8,
        "b" => ElementType::I8,
        "H" => ElementType::U16,
        "h" => ElementType::I16,
        "I" => ElementType::U32,
        "i" => ElementType::I32,
        "l" if long_is_wide => ElementType::I64,
        "l" => ElementType::I32,
        "L" if long_is_wide => ElementType::U64,
        "L" => ElementType::U32,
        "Q" => ElementType::U64,
        "q" => ElementType::I64,
        "f" => ElementType::F32,
        "d" => ElementType::F64,
        _ => return None,
    };
    Some(element)
}
