// SPDX-License-Identifier: MIT OR Apache-2.0
//! Minimal control plane for Linux KVM on x86-64.
//!
//! A [`Vm`] owns guest memory slots and creates [`VirtualCpu`]s. A vCPU can be driven directly
//! with [`VirtualCpu::run()`] or handed to a [`RunLoop`], which runs it on its own thread and
//! supports pausing and resuming from other threads.
pub use self::cpu::*;
pub use self::exit::*;
pub use self::ffi::Request;
pub use self::kernel::*;
pub use self::ram::*;
pub use self::regs::*;
pub use self::run::{DecodeError, RunBuffer, RunHeader, RunRegion};
pub use self::runloop::*;
pub use self::vm::*;

use std::ffi::c_int;
use std::io::Error;
use thiserror::Error;

pub mod log;

mod cpu;
mod exit;
#[cfg(test)]
mod fake;
mod ffi;
mod kernel;
mod ram;
mod regs;
mod run;
mod runloop;
mod vm;

/// Represents an error when a KVM operation fails.
#[derive(Debug, Error)]
pub enum KvmError {
    #[error("couldn't open /dev/kvm")]
    DeviceUnavailable(#[source] Error),

    #[error("{0} failed")]
    RequestFailed(Request, #[source] Error),

    #[error("unexpected KVM API version {0}")]
    ApiVersionMismatch(c_int),

    #[error("KVM_GET_VCPU_MMAP_SIZE returned invalid size {0}")]
    InvalidMmapSize(c_int),

    #[error("couldn't map kvm_run")]
    MapRunBufferFailed(#[source] Error),
}

impl KvmError {
    /// Returns the OS error number that caused this error, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::DeviceUnavailable(e) | Self::RequestFailed(_, e) | Self::MapRunBufferFailed(e) => {
                e.raw_os_error()
            }
            Self::ApiVersionMismatch(_) | Self::InvalidMmapSize(_) => None,
        }
    }

    /// Returns the request that failed, if this error came from a request.
    pub fn request(&self) -> Option<Request> {
        match self {
            Self::RequestFailed(r, _) => Some(*r),
            _ => None,
        }
    }
}
