//! Binary buffers shared between the host and the interpreter.
//!
//! A `HostBuffer` is a typed view (element type, byte offset, byte length) over
//! reference-counted storage, mirroring how host runtimes layer typed arrays over
//! a backing buffer. Sub-views share storage with their parent.
//!
//! Storage is a slice of `AtomicU8`, which has the same in-memory layout as `u8`.
//! That lets the interpreter write through a zero-copy `memoryview` while host-side
//! reads and writes stay free of data races on the Rust side.

use crate::errors::BridgeError;
use pyo3::exceptions::PyBufferError;
use pyo3::ffi;
use pyo3::prelude::*;
use std::fmt;
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Element type of a typed view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl ElementType {
    /// Size of one element in bytes
    pub fn size(self) -> usize {
        match self {
            ElementType::U8 | ElementType::I8 => 1,
            ElementType::U16 | ElementType::I16 => 2,
            ElementType::U32 | ElementType::I32 | ElementType::F32 => 4,
            ElementType::U64 | ElementType::I64 | ElementType::F64 => 8,
        }
    }
}

struct Storage {
    bytes: Box<[AtomicU8]>,
}

impl Storage {
    fn new(bytes: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            bytes: bytes.into_iter().map(AtomicU8::new).collect(),
        })
    }

    fn len(&self) -> usize {
        self.bytes.len()
    }
}

/// A typed view over shared byte storage
#[derive(Clone)]
pub struct HostBuffer {
    storage: Arc<Storage>,
    offset: usize,
    len: usize,
    element: ElementType,
    copy: bool,
}

impl HostBuffer {
    /// Take ownership of `bytes` as a plain byte view
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self::typed(bytes, ElementType::U8)
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::from_vec(bytes.to_vec())
    }

    /// Zero-filled byte view of `len` bytes
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    pub fn from_f32(values: &[f32]) -> Self {
        Self::typed(
            values.iter().flat_map(|v| v.to_ne_bytes()).collect(),
            ElementType::F32,
        )
    }

    pub fn from_f64(values: &[f64]) -> Self {
        Self::typed(
            values.iter().flat_map(|v| v.to_ne_bytes()).collect(),
            ElementType::F64,
        )
    }

    pub fn from_i32(values: &[i32]) -> Self {
        Self::typed(
            values.iter().flat_map(|v| v.to_ne_bytes()).collect(),
            ElementType::I32,
        )
    }

    fn typed(bytes: Vec<u8>, element: ElementType) -> Self {
        let len = bytes.len();
        Self {
            storage: Storage::new(bytes),
            offset: 0,
            len,
            element,
            copy: false,
        }
    }

    /// New view over the same storage, addressed in bytes relative to the storage start
    pub fn view(
        &self,
        byte_offset: usize,
        byte_len: usize,
        element: ElementType,
    ) -> Result<Self, BridgeError> {
        let end = byte_offset
            .checked_add(byte_len)
            .ok_or_else(|| BridgeError::Argument("Buffer view overflows".to_string()))?;
        if end > self.storage.len() {
            return Err(BridgeError::Argument(format!(
                "Buffer view {}..{} exceeds storage of {} bytes",
                byte_offset,
                end,
                self.storage.len()
            )));
        }
        if byte_offset % element.size() != 0 || byte_len % element.size() != 0 {
            return Err(BridgeError::Argument(format!(
                "Buffer view {}..{} is not aligned to {:?} elements",
                byte_offset, end, element
            )));
        }
        Ok(Self {
            storage: Arc::clone(&self.storage),
            offset: byte_offset,
            len: byte_len,
            element,
            copy: self.copy,
        })
    }

    /// Sub-view of elements `start..end` of this view, sharing storage
    pub fn subarray(&self, start: usize, end: usize) -> Result<Self, BridgeError> {
        if start > end || end > self.len() {
            return Err(BridgeError::Argument(format!(
                "Subarray {}..{} out of range for {} elements",
                start,
                end,
                self.len()
            )));
        }
        let size = self.element.size();
        self.view(self.offset + start * size, (end - start) * size, self.element)
    }

    /// Ask for the interpreter to receive an independent copy instead of a view
    pub fn with_copy(mut self, copy: bool) -> Self {
        self.copy = copy;
        self
    }

    pub fn is_copy(&self) -> bool {
        self.copy
    }

    pub fn element(&self) -> ElementType {
        self.element
    }

    pub fn byte_offset(&self) -> usize {
        self.offset
    }

    pub fn byte_len(&self) -> usize {
        self.len
    }

    /// Number of elements in the view
    pub fn len(&self) -> usize {
        self.len / self.element.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether two views alias the same storage
    pub fn shares_storage(&self, other: &HostBuffer) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    fn window(&self) -> &[AtomicU8] {
        &self.storage.bytes[self.offset..self.offset + self.len]
    }

    /// Copy the viewed bytes out
    pub fn to_vec(&self) -> Vec<u8> {
        self.window()
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect()
    }

    /// Overwrite viewed bytes starting at `index`
    pub fn write(&self, index: usize, bytes: &[u8]) -> Result<(), BridgeError> {
        let window = self.window();
        let end = index.saturating_add(bytes.len());
        if end > window.len() {
            return Err(BridgeError::Argument(format!(
                "Write of {} bytes at {} exceeds view of {} bytes",
                bytes.len(),
                index,
                window.len()
            )));
        }
        for (slot, byte) in window[index..end].iter().zip(bytes) {
            slot.store(*byte, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Reinterpret the viewed bytes as native-endian `f32`s
    pub fn to_f32s(&self) -> Vec<f32> {
        self.to_vec()
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    pub fn to_f64s(&self) -> Vec<f64> {
        self.to_vec()
            .chunks_exact(8)
            .map(|c| f64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect()
    }

    pub fn to_i32s(&self) -> Vec<i32> {
        self.to_vec()
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Zero-copy exporter handed to the interpreter
    pub(crate) fn exporter(&self) -> BufferView {
        BufferView {
            storage: Arc::clone(&self.storage),
            offset: self.offset,
            len: self.len,
        }
    }
}

impl PartialEq for HostBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.element == other.element && self.to_vec() == other.to_vec()
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("element", &self.element)
            .field("byte_offset", &self.offset)
            .field("byte_len", &self.len)
            .field("copy", &self.copy)
            .finish()
    }
}

/// Buffer-protocol exporter over host storage.
///
/// The interpreter wraps it in a `memoryview`; the exporter keeps the storage
/// alive for as long as any view over it exists.
#[pyclass(frozen, module = "nodecallspython", name = "HostBufferView")]
pub(crate) struct BufferView {
    storage: Arc<Storage>,
    offset: usize,
    len: usize,
}

#[pymethods]
impl BufferView {
    fn __len__(&self) -> usize {
        self.len
    }

    /// # Safety
    ///
    /// Called by the interpreter with a valid `Py_buffer` to fill. The exported
    /// pointer stays valid while `view.obj` holds a reference to this exporter,
    /// because the exporter owns an `Arc` to the storage and storage never resizes.
    unsafe fn __getbuffer__(
        slf: Bound<'_, Self>,
        view: *mut ffi::Py_buffer,
        flags: c_int,
    ) -> PyResult<()> {
        if view.is_null() {
            return Err(PyBufferError::new_err("View is null"));
        }

        let this = slf.get();
        let window = &this.storage.bytes[this.offset..this.offset + this.len];
        let buf = window.as_ptr().cast::<u8>().cast_mut().cast::<c_void>();
        let len = isize::try_from(this.len)
            .map_err(|_| PyBufferError::new_err("Buffer too large to export"))?;

        (*view).obj = slf.into_any().into_ptr();
        (*view).buf = buf;
        (*view).len = len;
        (*view).readonly = 0;
        (*view).itemsize = 1;
        (*view).format = if (flags & ffi::PyBUF_FORMAT) == ffi::PyBUF_FORMAT {
            c"B".as_ptr().cast_mut()
        } else {
            ptr::null_mut()
        };
        (*view).ndim = 1;
        (*view).shape = if (flags & ffi::PyBUF_ND) == ffi::PyBUF_ND {
            &mut (*view).len
        } else {
            ptr::null_mut()
        };
        (*view).strides = if (flags & ffi::PyBUF_STRIDES) == ffi::PyBUF_STRIDES {
            &mut (*view).itemsize
        } else {
            ptr::null_mut()
        };
        (*view).suboffsets = ptr::null_mut();
        (*view).internal = ptr::null_mut();

        Ok(())
    }

    unsafe fn __releasebuffer__(&self, _view: *mut ffi::Py_buffer) {}
}
