// SPDX-License-Identifier: MIT OR Apache-2.0
use crate::cpu::VirtualCpu;
use crate::ffi::{KVM_API_VERSION, KvmRun, KvmUserspaceMemoryRegion, Request};
use crate::kernel::{Host, Kernel, request};
use crate::ram::{GuestMemory, MemoryFlags};
use crate::run::RunBuffer;
use crate::{KvmError, error, info};
use std::collections::BTreeMap;
use std::ffi::c_int;
use std::num::NonZero;
use std::os::fd::{AsFd, FromRawFd, OwnedFd};
use std::sync::{Arc, Mutex};

/// Virtual machine created from `/dev/kvm`.
///
/// The device descriptor is only needed while creating the VM so it is closed before this struct
/// is returned.
pub struct Vm<K: Kernel = Host> {
    kernel: K,
    fd: OwnedFd, // Must be dropped before slots.
    vcpu_mmap_size: NonZero<usize>,
    slots: Mutex<BTreeMap<u32, Slot>>,
}

impl Vm<Host> {
    pub fn new() -> Result<Arc<Self>, KvmError> {
        Self::create(Host)
    }
}

impl<K: Kernel> Vm<K> {
    pub fn create(kernel: K) -> Result<Arc<Self>, KvmError> {
        // Open KVM device.
        let kvm = kernel
            .open_device()
            .map_err(KvmError::DeviceUnavailable)?;

        // Check KVM version.
        let version = unsafe { request(&kernel, kvm.as_fd(), Request::GetApiVersion, 0)? };

        if version != KVM_API_VERSION {
            return Err(KvmError::ApiVersionMismatch(version));
        }

        // Create a VM.
        let vm = unsafe { request(&kernel, kvm.as_fd(), Request::CreateVm, 0)? };
        let vm = unsafe { OwnedFd::from_raw_fd(vm) };

        // Get size of kvm_run.
        let size = unsafe { request(&kernel, kvm.as_fd(), Request::GetVcpuMmapSize, 0)? };
        let vcpu_mmap_size = usize::try_from(size)
            .ok()
            .and_then(NonZero::new)
            .filter(|v| v.get() >= size_of::<KvmRun>())
            .ok_or(KvmError::InvalidMmapSize(size))?;

        drop(kvm);

        info!(
            "VM created with {} bytes of kvm_run per vCPU.",
            vcpu_mmap_size
        );

        Ok(Arc::new(Self {
            kernel,
            fd: vm,
            vcpu_mmap_size,
            slots: Mutex::default(),
        }))
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn vcpu_mmap_size(&self) -> NonZero<usize> {
        self.vcpu_mmap_size
    }

    /// Returns the value of `KVM_CHECK_EXTENSION` for `cap` on this VM.
    pub fn check_extension(&self, cap: c_int) -> Result<c_int, KvmError> {
        unsafe {
            request(
                &self.kernel,
                self.fd.as_fd(),
                Request::CheckExtension,
                cap as usize,
            )
        }
    }

    /// Installs `mem` as the backing of guest-physical `base` in `slot`.
    ///
    /// The VM takes ownership of `mem` so it cannot be freed while the guest can still reach it.
    /// If `slot` is already in use it is deleted from KVM before the new region is installed
    /// since KVM cannot change the backing of a live slot. The previous backing is released only
    /// after the new one was accepted. When the new region is rejected the previous one is put
    /// back.
    pub fn map_user_memory(
        &self,
        slot: u32,
        flags: MemoryFlags,
        base: u64,
        mem: GuestMemory,
    ) -> Result<(), KvmError> {
        let mut slots = self.slots.lock().unwrap();
        let new = Slot { flags, base, mem };
        let region = new.region(slot);

        match slots.get(&slot) {
            Some(old) => {
                unsafe { self.set_region(&old.deletion(slot))? };

                if let Err(e) = unsafe { self.set_region(&region) } {
                    if let Err(e) = unsafe { self.set_region(&old.region(slot)) } {
                        error!(e, "Couldn't restore slot #{}", slot);
                        slots.remove(&slot);
                    }

                    return Err(e);
                }
            }
            None => unsafe { self.set_region(&region)? },
        }

        info!(
            "Slot #{} mapped {:#x}..{:#x} to {:p}.",
            slot,
            base,
            base.wrapping_add(region.memory_size),
            new.mem.as_ptr()
        );

        slots.insert(slot, new);

        Ok(())
    }

    /// Removes `slot` from the VM and gives its backing memory back.
    ///
    /// Returns [`None`] if nothing was installed in `slot`.
    pub fn unmap_user_memory(&self, slot: u32) -> Result<Option<GuestMemory>, KvmError> {
        let mut slots = self.slots.lock().unwrap();
        let Some(s) = slots.get(&slot) else {
            return Ok(None);
        };

        unsafe { self.set_region(&s.deletion(slot))? };

        Ok(slots.remove(&slot).map(|s| s.mem))
    }

    /// Invokes `f` with the memory installed in `slot`.
    pub fn with_memory<R>(&self, slot: u32, f: impl FnOnce(&GuestMemory) -> R) -> Option<R> {
        self.slots.lock().unwrap().get(&slot).map(|s| f(&s.mem))
    }

    /// Returns `(slot, base, length, flags)` for each installed region.
    pub fn regions(&self) -> Vec<(u32, u64, NonZero<usize>, MemoryFlags)> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .map(|(&n, s)| (n, s.base, s.mem.len(), s.flags))
            .collect()
    }

    pub fn create_vcpu(self: &Arc<Self>, id: u32) -> Result<VirtualCpu<K>, KvmError> {
        let fd = unsafe { request(&self.kernel, self.fd.as_fd(), Request::CreateVcpu, id as usize)? };
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let len = self.vcpu_mmap_size;
        let run = unsafe { self.kernel.mmap(fd.as_fd(), len) }
            .map_err(KvmError::MapRunBufferFailed)?;

        info!("vCPU #{} created.", id);

        Ok(unsafe { VirtualCpu::new(id, self.clone(), fd, RunBuffer::new(run, len)) })
    }

    unsafe fn set_region(&self, region: &KvmUserspaceMemoryRegion) -> Result<(), KvmError> {
        let arg = region as *const KvmUserspaceMemoryRegion as usize;

        unsafe {
            request(
                &self.kernel,
                self.fd.as_fd(),
                Request::SetUserMemoryRegion,
                arg,
            )?
        };

        Ok(())
    }
}

struct Slot {
    flags: MemoryFlags,
    base: u64,
    mem: GuestMemory,
}

impl Slot {
    fn region(&self, slot: u32) -> KvmUserspaceMemoryRegion {
        KvmUserspaceMemoryRegion {
            slot,
            flags: self.flags.bits(),
            guest_phys_addr: self.base,
            memory_size: self.mem.len().get() as u64,
            userspace_addr: self.mem.as_ptr() as u64,
        }
    }

    /// A region with zero size deletes the slot.
    fn deletion(&self, slot: u32) -> KvmUserspaceMemoryRegion {
        KvmUserspaceMemoryRegion {
            memory_size: 0,
            userspace_addr: 0,
            ..self.region(slot)
        }
    }
}
