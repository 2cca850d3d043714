// SPDX-License-Identifier: MIT OR Apache-2.0
use crate::ffi::KvmRun;
use bytemuck::Pod;
use std::mem::offset_of;
use std::num::NonZero;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;

/// Read-only view of a `kvm_run` buffer.
///
/// Every access is a bounds-checked copy so an exit can be decoded from a mapped buffer or from a
/// plain byte slice alike.
pub trait RunRegion {
    fn len(&self) -> usize;

    /// Copies `buf.len()` bytes starting at `off`. Returns `false` without touching `buf` if the
    /// range is not entirely inside the region.
    fn copy_to(&self, off: usize, buf: &mut [u8]) -> bool;
}

impl RunRegion for [u8] {
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }

    fn copy_to(&self, off: usize, buf: &mut [u8]) -> bool {
        match off
            .checked_add(buf.len())
            .and_then(|end| self.get(off..end))
        {
            Some(src) => {
                buf.copy_from_slice(src);
                true
            }
            None => false,
        }
    }
}

/// `kvm_run` shared between the kernel and a vCPU.
///
/// The mapping itself is owned by [`crate::VirtualCpu`]. This is only a view that lives as long
/// as the vCPU does.
pub struct RunBuffer {
    ptr: NonNull<u8>,
    len: NonZero<usize>,
}

impl RunBuffer {
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes until this struct is dropped.
    pub(crate) unsafe fn new(ptr: NonNull<u8>, len: NonZero<usize>) -> Self {
        assert!(len.get() >= size_of::<KvmRun>());

        Self { ptr, len }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn exit_reason(&self) -> u32 {
        // Length is checked in the constructor.
        read(self, offset_of!(KvmRun, exit_reason)).unwrap_or_default()
    }

    pub fn immediate_exit(&self) -> bool {
        self.exit_request().get()
    }

    /// Takes a snapshot of the fixed fields at the start of the buffer.
    pub fn header(&self) -> RunHeader {
        // Length is checked in the constructor so the only possible failure is unreachable.
        let mut h = RunHeader::read(self).unwrap_or_default();

        h.immediate_exit = self.immediate_exit();
        h
    }

    pub(crate) fn mapping(&self) -> (NonNull<u8>, NonZero<usize>) {
        (self.ptr, self.len)
    }

    pub(crate) fn exit_request(&self) -> ExitRequest {
        let off = offset_of!(KvmRun, immediate_exit);

        ExitRequest(unsafe { self.ptr.add(off) })
    }
}

impl RunRegion for RunBuffer {
    fn len(&self) -> usize {
        self.len.get()
    }

    fn copy_to(&self, off: usize, buf: &mut [u8]) -> bool {
        if off
            .checked_add(buf.len())
            .is_none_or(|end| end > self.len.get())
        {
            return false;
        }

        unsafe {
            self.ptr
                .as_ptr()
                .add(off)
                .copy_to_nonoverlapping(buf.as_mut_ptr(), buf.len())
        };

        true
    }
}

unsafe impl Send for RunBuffer {}

/// Handle to `kvm_run::immediate_exit` that can be used from other threads.
///
/// The owner of this handle must guarantee the buffer is still mapped before each access.
#[derive(Clone, Copy)]
pub(crate) struct ExitRequest(NonNull<u8>);

impl ExitRequest {
    pub fn get(&self) -> bool {
        unsafe { AtomicU8::from_ptr(self.0.as_ptr()) }.load(Ordering::SeqCst) != 0
    }

    pub fn set(&self, v: bool) {
        unsafe { AtomicU8::from_ptr(self.0.as_ptr()) }.store(v.into(), Ordering::SeqCst);
    }
}

unsafe impl Send for ExitRequest {}
unsafe impl Sync for ExitRequest {}

/// Fixed fields of `kvm_run`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunHeader {
    pub request_interrupt_window: bool,
    pub immediate_exit: bool,
    pub exit_reason: u32,
    pub ready_for_interrupt_injection: bool,
    pub if_flag: bool,
    pub flags: u16,
    pub cr8: u64,
    pub apic_base: u64,
    pub valid_regs: u64,
    pub dirty_regs: u64,
}

impl RunHeader {
    pub fn read<R: RunRegion + ?Sized>(run: &R) -> Result<Self, DecodeError> {
        Ok(Self {
            request_interrupt_window: read::<u8, _>(run, offset_of!(KvmRun, request_interrupt_window))?
                != 0,
            immediate_exit: read::<u8, _>(run, offset_of!(KvmRun, immediate_exit))? != 0,
            exit_reason: read(run, offset_of!(KvmRun, exit_reason))?,
            ready_for_interrupt_injection: read::<u8, _>(
                run,
                offset_of!(KvmRun, ready_for_interrupt_injection),
            )? != 0,
            if_flag: read::<u8, _>(run, offset_of!(KvmRun, if_flag))? != 0,
            flags: read(run, offset_of!(KvmRun, flags))?,
            cr8: read(run, offset_of!(KvmRun, cr8))?,
            apic_base: read(run, offset_of!(KvmRun, apic_base))?,
            valid_regs: read(run, offset_of!(KvmRun, kvm_valid_regs))?,
            dirty_regs: read(run, offset_of!(KvmRun, kvm_dirty_regs))?,
        })
    }
}

/// Copies a `T` at `off` out of `run`.
pub(crate) fn read<T: Pod, R: RunRegion + ?Sized>(run: &R, off: usize) -> Result<T, DecodeError> {
    let mut v = T::zeroed();

    if run.copy_to(off, bytemuck::bytes_of_mut(&mut v)) {
        Ok(v)
    } else {
        Err(DecodeError::Truncated {
            off,
            len: size_of::<T>(),
            size: run.len(),
        })
    }
}

/// Represents an error when decoding `kvm_run` fails.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{len} bytes at {off:#x} is outside kvm_run with {size} bytes")]
    Truncated { off: usize, len: usize, size: usize },

    #[error("I/O data of {len} bytes at {off:#x} is outside kvm_run with {size} bytes")]
    IoDataOutOfBounds { off: u64, len: u64, size: usize },

    #[error("unknown I/O direction {0}")]
    UnknownIoDirection(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_bounds() {
        let data = [1u8, 2, 3, 4];
        let mut buf = [0u8; 2];

        assert!(data[..].copy_to(2, &mut buf));
        assert_eq!(buf, [3, 4]);
        assert!(!data[..].copy_to(3, &mut buf));
        assert!(!data[..].copy_to(usize::MAX, &mut buf));
        assert_eq!(buf, [3, 4]);
    }

    #[test]
    fn header() {
        let mut data = vec![0u8; size_of::<KvmRun>()];

        data[1] = 1;
        data[8..12].copy_from_slice(&5u32.to_ne_bytes());
        data[13] = 1;
        data[24..32].copy_from_slice(&0xFEE00900u64.to_ne_bytes());

        let h = RunHeader::read(&data[..]).unwrap();

        assert!(h.immediate_exit);
        assert!(!h.request_interrupt_window);
        assert_eq!(h.exit_reason, 5);
        assert!(h.if_flag);
        assert_eq!(h.apic_base, 0xFEE00900);
    }

    #[test]
    fn truncated() {
        let data = [0u8; 10];

        assert_eq!(
            read::<u32, _>(&data[..], 8),
            Err(DecodeError::Truncated {
                off: 8,
                len: 4,
                size: 10
            })
        );
    }

    #[test]
    fn exit_request() {
        let mut data = vec![0u8; size_of::<KvmRun>()];
        let len = NonZero::new(data.len()).unwrap();
        let run = unsafe { RunBuffer::new(NonNull::new(data.as_mut_ptr()).unwrap(), len) };

        assert!(!run.immediate_exit());
        run.exit_request().set(true);
        assert!(run.header().immediate_exit);
        run.exit_request().set(false);
        assert!(!run.immediate_exit());
    }
}
