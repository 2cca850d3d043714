// SPDX-License-Identifier: MIT OR Apache-2.0
use crate::ffi::{KVM_MEM_LOG_DIRTY_PAGES, KVM_MEM_READONLY};
use bitflags::bitflags;
use libc::{MAP_ANON, MAP_FAILED, MAP_NORESERVE, MAP_PRIVATE, PROT_READ, PROT_WRITE, mmap, munmap};
use std::io::Error;
use std::num::NonZero;
use std::ptr::{NonNull, null_mut};
use thiserror::Error;

/// Anonymous host memory used as guest RAM.
///
/// The address never changes for the whole lifetime of this struct, which is what KVM requires
/// while the memory is installed in a slot.
pub struct GuestMemory {
    mem: NonNull<u8>,
    len: NonZero<usize>,
}

impl GuestMemory {
    pub fn new(len: NonZero<usize>) -> Result<Self, MemoryError> {
        let prot = PROT_READ | PROT_WRITE;
        let flags = MAP_PRIVATE | MAP_ANON | MAP_NORESERVE;
        let mem = unsafe { mmap(null_mut(), len.get(), prot, flags, -1, 0) };

        if mem == MAP_FAILED {
            return Err(MemoryError::AllocFailed(len, Error::last_os_error()));
        }

        let mem = NonNull::new(mem.cast()).ok_or(MemoryError::AllocFailed(
            len,
            Error::other("mmap returned a null address"),
        ))?;

        Ok(Self { mem, len })
    }

    /// Allocates enough memory for `len` bytes and copies `data` at `off`.
    pub fn with_data(len: NonZero<usize>, off: usize, data: &[u8]) -> Result<Self, MemoryError> {
        let mut mem = Self::new(len)?;
        mem.write(off, data)?;
        Ok(mem)
    }

    pub fn len(&self) -> NonZero<usize> {
        self.len
    }

    /// Returns the host virtual address of the first byte.
    pub fn as_ptr(&self) -> *const u8 {
        self.mem.as_ptr()
    }

    pub fn write(&mut self, off: usize, data: &[u8]) -> Result<(), MemoryError> {
        self.check(off, data.len())?;

        unsafe {
            self.mem
                .as_ptr()
                .add(off)
                .copy_from_nonoverlapping(data.as_ptr(), data.len())
        };

        Ok(())
    }

    /// # Safety
    /// The guest may be writing into this range at the same time. The caller is responsible for
    /// making sure the vCPUs are not touching it if the content need to be consistent.
    pub unsafe fn read(&self, off: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.check(off, buf.len())?;

        unsafe {
            self.mem
                .as_ptr()
                .add(off)
                .copy_to_nonoverlapping(buf.as_mut_ptr(), buf.len())
        };

        Ok(())
    }

    fn check(&self, off: usize, len: usize) -> Result<(), MemoryError> {
        if off.checked_add(len).is_none_or(|end| end > self.len.get()) {
            Err(MemoryError::OutOfRange {
                off,
                len,
                size: self.len,
            })
        } else {
            Ok(())
        }
    }
}

impl Drop for GuestMemory {
    fn drop(&mut self) {
        if unsafe { munmap(self.mem.as_ptr().cast(), self.len.get()) } < 0 {
            panic!(
                "failed to unmap guest memory at {:p}: {}",
                self.mem,
                Error::last_os_error()
            );
        }
    }
}

unsafe impl Send for GuestMemory {}
unsafe impl Sync for GuestMemory {}

bitflags! {
    /// Flags of a memory slot.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryFlags: u32 {
        const LOG_DIRTY_PAGES = KVM_MEM_LOG_DIRTY_PAGES;
        const READONLY = KVM_MEM_READONLY;
    }
}

/// Represents an error when [`GuestMemory`] fails.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("couldn't allocate {0} bytes")]
    AllocFailed(NonZero<usize>, #[source] Error),

    #[error("{len} bytes at {off:#x} is outside {size} bytes of memory")]
    OutOfRange {
        off: usize,
        len: usize,
        size: NonZero<usize>,
    },
}
