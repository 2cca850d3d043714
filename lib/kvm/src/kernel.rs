// SPDX-License-Identifier: MIT OR Apache-2.0
use crate::KvmError;
use crate::ffi::Request;
use libc::{
    MAP_FAILED, MAP_SHARED, O_CLOEXEC, O_RDWR, PROT_READ, PROT_WRITE, SIGUSR2, ioctl, mmap, munmap,
    open, pthread_kill, pthread_t, sigaction, sigemptyset, sighandler_t,
};
use std::ffi::c_int;
use std::io::Error;
use std::mem::zeroed;
use std::num::NonZero;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr::{NonNull, null_mut};
use std::sync::OnceLock;

/// Signal used to knock a vCPU thread out of `KVM_RUN`.
///
/// The handler installed for this signal does nothing. Its only purpose is to make the blocking
/// `KVM_RUN` on the target thread return with `EINTR`.
pub const KICK_SIGNAL: c_int = SIGUSR2;

/// Kernel services used to drive KVM.
///
/// [`Host`] forwards everything to the running kernel. Having this as a trait allows the whole
/// control plane to be exercised without `/dev/kvm`.
pub trait Kernel: Send + Sync + 'static {
    /// Opens `/dev/kvm` for reading and writing. The descriptor must not be inherited by child
    /// processes.
    fn open_device(&self) -> Result<OwnedFd, Error>;

    /// Issues `req` on `fd` and returns the non-negative result.
    ///
    /// # Safety
    /// `arg` must be what `req` expects. For requests that carry a structure this is a pointer to
    /// a live value of the size encoded in the request code.
    unsafe fn ioctl(&self, fd: BorrowedFd, req: Request, arg: usize) -> Result<c_int, Error>;

    /// Maps `len` bytes of `fd` as shared and writable.
    ///
    /// # Safety
    /// `fd` must be a vCPU descriptor.
    unsafe fn mmap(&self, fd: BorrowedFd, len: NonZero<usize>) -> Result<NonNull<u8>, Error>;

    /// # Safety
    /// `addr` and `len` must come from a previous successful [`Kernel::mmap()`] on the same
    /// instance and nothing may reference the mapping after this call.
    unsafe fn munmap(&self, addr: NonNull<u8>, len: NonZero<usize>) -> Result<(), Error>;

    /// Interrupts `KVM_RUN` currently blocking on `thread`, if any.
    fn kick(&self, thread: pthread_t) -> Result<(), Error>;
}

/// Implementation of [`Kernel`] backed by the running Linux kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct Host;

impl Kernel for Host {
    fn open_device(&self) -> Result<OwnedFd, Error> {
        let fd = unsafe { open(c"/dev/kvm".as_ptr(), O_RDWR | O_CLOEXEC) };

        if fd < 0 {
            Err(Error::last_os_error())
        } else {
            Ok(unsafe { OwnedFd::from_raw_fd(fd) })
        }
    }

    unsafe fn ioctl(&self, fd: BorrowedFd, req: Request, arg: usize) -> Result<c_int, Error> {
        match unsafe { ioctl(fd.as_raw_fd(), req.code(), arg) } {
            v if v < 0 => Err(Error::last_os_error()),
            v => Ok(v),
        }
    }

    unsafe fn mmap(&self, fd: BorrowedFd, len: NonZero<usize>) -> Result<NonNull<u8>, Error> {
        let addr = unsafe {
            mmap(
                null_mut(),
                len.get(),
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };

        if addr == MAP_FAILED {
            return Err(Error::last_os_error());
        }

        NonNull::new(addr.cast()).ok_or_else(|| Error::other("mmap returned a null address"))
    }

    unsafe fn munmap(&self, addr: NonNull<u8>, len: NonZero<usize>) -> Result<(), Error> {
        if unsafe { munmap(addr.as_ptr().cast(), len.get()) } < 0 {
            Err(Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn kick(&self, thread: pthread_t) -> Result<(), Error> {
        install_kick_handler()?;

        match unsafe { pthread_kill(thread, KICK_SIGNAL) } {
            0 => Ok(()),
            v => Err(Error::from_raw_os_error(v)),
        }
    }
}

/// Issues `req` and tags a failure with the request that caused it.
///
/// # Safety
/// Same as [`Kernel::ioctl()`].
pub(crate) unsafe fn request<K: Kernel + ?Sized>(
    kernel: &K,
    fd: BorrowedFd,
    req: Request,
    arg: usize,
) -> Result<c_int, KvmError> {
    unsafe { kernel.ioctl(fd, req, arg) }.map_err(|e| KvmError::RequestFailed(req, e))
}

fn install_kick_handler() -> Result<(), Error> {
    static INSTALLED: OnceLock<Result<(), i32>> = OnceLock::new();

    let r = INSTALLED.get_or_init(|| unsafe {
        // SA_RESTART must not be set otherwise KVM_RUN will be restarted instead of returning.
        let mut act: sigaction = zeroed();

        act.sa_sigaction = on_kick as extern "C" fn(c_int) as sighandler_t;
        act.sa_flags = 0;

        sigemptyset(&mut act.sa_mask);

        if sigaction(KICK_SIGNAL, &act, null_mut()) < 0 {
            Err(Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL))
        } else {
            Ok(())
        }
    });

    (*r).map_err(Error::from_raw_os_error)
}

extern "C" fn on_kick(_: c_int) {}
