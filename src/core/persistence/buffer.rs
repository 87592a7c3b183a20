//! Owned, page-aligned byte region. The unit of I/O payload.
//!
//! Moves by value into a submission and comes back through the completion,
//! so the engine never has to trust the caller to keep memory alive.

use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use std::alloc::{self, Layout};

use super::error::{Result, StorageError};

/// Default page alignment for O_DIRECT.
pub const PAGE_SIZE: usize = 4096;

pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer uniquely owns its allocation. No interior sharing.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Zeroed buffer of `size` bytes aligned to `alignment` (a power of two).
    pub fn new(size: usize, alignment: usize) -> Result<Self> {
        if size == 0 {
            return Err(StorageError::InvalidSize(size));
        }
        let layout = Layout::from_size_align(size, alignment)
            .map_err(|_| StorageError::Alloc { size, alignment })?;

        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(StorageError::Alloc { size, alignment })?;
        Ok(Self { ptr, layout })
    }

    /// Page-aligned buffer.
    pub fn page_aligned(size: usize) -> Result<Self> {
        Self::new(size, PAGE_SIZE)
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    #[inline(always)]
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    #[inline(always)]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline(always)]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Copy `data` to the front and zero the remainder.
    pub fn fill_from(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.len() {
            return Err(StorageError::BufferTooSmall {
                size: data.len(),
                capacity: self.len(),
            });
        }
        let (head, tail) = self.split_at_mut(data.len());
        head.copy_from_slice(data);
        tail.fill(0);
        Ok(())
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    #[inline(always)]
    fn deref(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() initialized bytes.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl DerefMut for AlignedBuffer {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: unique ownership, valid for layout.size() bytes.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl core::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len())
            .field("alignment", &self.alignment())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_alignment() {
        let buf = AlignedBuffer::page_aligned(PAGE_SIZE * 3).unwrap();
        assert_eq!(buf.as_ptr() as usize % PAGE_SIZE, 0, "buffer must be 4K aligned");
        assert_eq!(buf.len(), PAGE_SIZE * 3);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(
            AlignedBuffer::page_aligned(0),
            Err(StorageError::InvalidSize(0))
        ));
    }

    #[test]
    fn test_bad_alignment_rejected() {
        assert!(matches!(
            AlignedBuffer::new(4096, 3000),
            Err(StorageError::Alloc { .. })
        ));
    }

    #[test]
    fn test_fill_from_zero_pads() {
        let mut buf = AlignedBuffer::page_aligned(PAGE_SIZE).unwrap();
        buf.fill(0xFF);
        buf.fill_from(&[1, 2, 3]).unwrap();
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert!(buf[3..].iter().all(|&b| b == 0));

        let too_big = vec![0u8; PAGE_SIZE + 1];
        assert!(matches!(
            buf.fill_from(&too_big),
            Err(StorageError::BufferTooSmall { .. })
        ));
    }
}
