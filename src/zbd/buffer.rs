//! Block-aligned I/O buffer
//!
//! Zone appends and cleaner copies go through O_DIRECT descriptors, which
//! require both the buffer address and length to be aligned to the device
//! block size. [`AlignedBuf`] wraps a manually laid-out allocation that
//! guarantees this, with slice access via `Deref`.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::slice;

use crate::error::{Error, Result};

/// A heap buffer whose address and length are multiples of a block size.
///
/// The buffer is zero-initialized, so padding bytes written after a short
/// payload are already zeroes.
#[derive(Debug)]
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    size: usize,
    layout: Layout,
}

// SAFETY: AlignedBuf owns its allocation exclusively; moving it between
// threads transfers that ownership.
unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    /// Allocate a zeroed buffer of at least `min_size` bytes, rounded up to
    /// the next multiple of `align` (which must be a nonzero power of two).
    pub fn zeroed(min_size: usize, align: usize) -> Result<Self> {
        if min_size == 0 {
            return Err(Error::InvalidArgument("buffer size must be > 0".into()));
        }
        if align == 0 || !align.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "alignment {align} must be a power of two"
            )));
        }
        let size = (min_size + align - 1) & !(align - 1);
        let layout = Layout::from_size_align(size, align)
            .map_err(|e| Error::InvalidArgument(format!("bad buffer layout: {e}")))?;
        // SAFETY: layout has nonzero size, checked above.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| Error::io(format!("failed allocating {size}-byte aligned buffer")))?;
        Ok(Self { ptr, size, layout })
    }

    /// Buffer length in bytes (the rounded-up size).
    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr is valid for size bytes for the lifetime of self.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for size bytes and we have exclusive access.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: allocated with this exact layout in `zeroed`.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}
