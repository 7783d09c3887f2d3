//! Memory regions shared with the kernel.
//!
//! Packet rings and decoder buffers are both plain byte regions whose
//! ownership is arbitrated by a protocol outside the type system (ring status
//! words, decoder slot states). `MemoryRegion` only owns the mapping; callers
//! uphold exclusivity.

use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::ptr::NonNull;
use std::slice;

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use tracing::warn;
use v4l2r::ioctl::PlaneMapping;

use crate::error::{IngestError, Result};

enum Backing {
    /// `mmap`ed from a descriptor, unmapped on drop.
    Mapped,
    /// A V4L2 buffer plane; the mapping unmaps itself.
    Plane(#[allow(dead_code)] PlaneMapping),
    /// Process memory standing in for a device mapping.
    Heap(#[allow(dead_code)] Vec<u64>),
}

/// A fixed-size, page- or word-aligned byte region.
pub struct MemoryRegion {
    ptr: NonNull<u8>,
    len: usize,
    backing: Backing,
}

// The region is a raw byte buffer; synchronisation of its content is the
// responsibility of the ownership protocol layered on top.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    /// Map `len` bytes of `fd` at `offset`, shared and read-write.
    ///
    /// # Arguments
    ///
    /// * `fd` - descriptor to map, a packet socket or device node
    /// * `len` - mapping length in bytes, must not be zero
    /// * `offset` - offset into the descriptor, page aligned
    pub fn map_shared<F: AsFd>(fd: F, len: usize, offset: i64) -> Result<Self> {
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| IngestError::Config("cannot map an empty region".into()))?;
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                offset,
            )?
        };
        Ok(Self {
            ptr: ptr.cast(),
            len,
            backing: Backing::Mapped,
        })
    }

    /// Take over a V4L2 plane mapping.
    pub fn from_plane(mut mapping: PlaneMapping) -> Self {
        let len = mapping.len();
        // moving the mapping object leaves the mapped pages in place
        let ptr = NonNull::new(mapping.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self {
            ptr,
            len,
            backing: Backing::Plane(mapping),
        }
    }

    /// Zeroed process memory with the alignment of `u64`.
    pub fn anonymous(len: usize) -> Self {
        let mut words = vec![0u64; len.div_ceil(8).max(1)];
        // the vector is never resized, so its buffer stays put
        let ptr = NonNull::new(words.as_mut_ptr().cast::<u8>()).unwrap_or(NonNull::dangling());
        Self {
            ptr,
            len,
            backing: Backing::Heap(words),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.backing, Backing::Mapped | Backing::Plane(_))
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Shared view of `len` bytes at `offset`, clamped to the region.
    ///
    /// # Safety
    ///
    /// No one may write the range while the returned slice is alive.
    pub unsafe fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        let (offset, len) = self.clamp(offset, len);
        slice::from_raw_parts(self.ptr.as_ptr().add(offset), len)
    }

    /// Exclusive view of `len` bytes at `offset`, clamped to the region.
    ///
    /// # Safety
    ///
    /// The caller must hold exclusive ownership of the range for the lifetime
    /// of the returned slice.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        let (offset, len) = self.clamp(offset, len);
        slice::from_raw_parts_mut(self.ptr.as_ptr().add(offset), len)
    }

    fn clamp(&self, offset: usize, len: usize) -> (usize, usize) {
        let offset = offset.min(self.len);
        (offset, len.min(self.len - offset))
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        if let Backing::Mapped = self.backing {
            if let Err(e) = unsafe { munmap(self.ptr.cast(), self.len) } {
                warn!("Failed to unmap {} bytes: {}", self.len, e);
            }
        }
    }
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_region() {
        let region = MemoryRegion::anonymous(13);
        assert_eq!(region.len(), 13);
        assert!(!region.is_mapped());
        assert_eq!(region.as_ptr() as usize % 8, 0);

        unsafe {
            region.bytes_mut(10, 8).copy_from_slice(&[1, 2, 3]);
            assert_eq!(region.bytes(0, 64).len(), 13);
            assert_eq!(region.bytes(10, 3), &[1, 2, 3]);
            assert!(region.bytes(20, 4).is_empty());
        }
    }
}
