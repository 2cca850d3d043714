// SPDX-License-Identifier: MIT OR Apache-2.0
use crate::exit::{ExitEvent, decode_exit};
use crate::ffi::Request;
use crate::kernel::{Host, Kernel, request};
use crate::regs::{Registers, SpecialRegisters};
use crate::run::{DecodeError, RunBuffer};
use crate::vm::Vm;
use crate::KvmError;
use libc::EINTR;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;
use thiserror::Error;

/// Virtual CPU of a [`Vm`].
///
/// The vCPU keeps its VM alive. Only one thread should drive a vCPU at a time so everything that
/// changes its state takes `&mut self`.
pub struct VirtualCpu<K: Kernel = Host> {
    id: u32,
    run: RunBuffer,
    fd: OwnedFd,
    vm: Arc<Vm<K>>,
}

impl<K: Kernel> VirtualCpu<K> {
    /// # Safety
    /// - `run` must be a mapping of `fd` obtained from [`Kernel::mmap()`] of the kernel in `vm`.
    /// - The length of `run` must be the same value that used on mapping.
    pub(crate) unsafe fn new(id: u32, vm: Arc<Vm<K>>, fd: OwnedFd, run: RunBuffer) -> Self {
        Self { id, run, fd, vm }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn vm(&self) -> &Arc<Vm<K>> {
        &self.vm
    }

    pub fn run_buffer(&self) -> &RunBuffer {
        &self.run
    }

    pub fn get_registers(&self) -> Result<Registers, KvmError> {
        let mut regs = Registers::default();

        unsafe { self.request(Request::GetRegs, &raw mut regs as usize)? };

        Ok(regs)
    }

    pub fn set_registers(&mut self, regs: &Registers) -> Result<(), KvmError> {
        unsafe { self.request(Request::SetRegs, regs as *const Registers as usize)? };

        Ok(())
    }

    pub fn get_sregisters(&self) -> Result<SpecialRegisters, KvmError> {
        let mut sregs = SpecialRegisters::default();

        unsafe { self.request(Request::GetSregs, &raw mut sregs as usize)? };

        Ok(sregs)
    }

    pub fn set_sregisters(&mut self, sregs: &SpecialRegisters) -> Result<(), KvmError> {
        unsafe { self.request(Request::SetSregs, sregs as *const SpecialRegisters as usize)? };

        Ok(())
    }

    /// Enters the guest until the next exit.
    ///
    /// [`VcpuRunError::Interrupted`] means `KVM_RUN` was cut short by a signal or by
    /// `kvm_run::immediate_exit` before the guest made any progress.
    pub fn run(&mut self) -> Result<ExitEvent, VcpuRunError> {
        let fd = self.fd.as_fd();

        match unsafe { self.vm.kernel().ioctl(fd, Request::Run, 0) } {
            Ok(_) => decode_exit(&self.run).map_err(VcpuRunError::Decode),
            Err(e) if e.raw_os_error() == Some(EINTR) => Err(VcpuRunError::Interrupted),
            Err(e) => Err(VcpuRunError::Run(KvmError::RequestFailed(Request::Run, e))),
        }
    }

    unsafe fn request(&self, req: Request, arg: usize) -> Result<(), KvmError> {
        unsafe { request(self.vm.kernel(), self.fd.as_fd(), req, arg)? };
        Ok(())
    }
}

impl<K: Kernel> Drop for VirtualCpu<K> {
    fn drop(&mut self) {
        let (addr, len) = self.run.mapping();

        if let Err(e) = unsafe { self.vm.kernel().munmap(addr, len) } {
            panic!("failed to munmap kvm_run: {e}");
        }
    }
}

/// Represents an error when [`VirtualCpu::run()`] fails.
#[derive(Debug, Error)]
pub enum VcpuRunError {
    #[error("KVM_RUN was interrupted")]
    Interrupted,

    #[error("couldn't enter the guest")]
    Run(#[source] KvmError),

    #[error("couldn't decode kvm_run")]
    Decode(#[source] DecodeError),
}
