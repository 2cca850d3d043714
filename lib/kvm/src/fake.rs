// SPDX-License-Identifier: MIT OR Apache-2.0
use crate::ffi::{
    KVM_API_VERSION, KVM_EXIT_IO, KVM_EXIT_IO_IN, KVM_EXIT_IO_OUT, KvmExitIo, KvmRun,
    KvmUserspaceMemoryRegion, Request,
};
use crate::kernel::Kernel;
use crate::regs::{Registers, SpecialRegisters};
use libc::{EBADF, EINTR, EINVAL, pthread_t};
use std::collections::{HashMap, VecDeque};
use std::ffi::c_int;
use std::fs::File;
use std::io::Error;
use std::mem::offset_of;
use std::num::NonZero;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// In-memory model of KVM.
///
/// Descriptors are real (a pipe for the device and `/dev/null` for the rest) so they can be owned
/// and closed as usual. The result of each `KVM_RUN` comes from a script set with
/// [`FakeKernel::script()`]. With nothing scripted `KVM_RUN` blocks like a guest spinning forever
/// until `immediate_exit` is set.
#[derive(Clone)]
pub struct FakeKernel(Arc<Mutex<State>>);

impl FakeKernel {
    pub const MMAP_SIZE: usize = 12288;

    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(State {
            objects: HashMap::new(),
            devices: Vec::new(),
            unavailable: None,
            api_version: KVM_API_VERSION,
            mmap_size: Self::MMAP_SIZE as c_int,
            failures: HashMap::new(),
            pending: Vec::new(),
            requests: Vec::new(),
            regions: Vec::new(),
            scripts: HashMap::new(),
            mappings: 0,
            kicks: 0,
        })))
    }

    pub fn set_unavailable(&self, errno: i32) {
        self.lock().unavailable = Some(errno);
    }

    pub fn set_api_version(&self, v: c_int) {
        self.lock().api_version = v;
    }

    pub fn set_mmap_size(&self, v: c_int) {
        self.lock().mmap_size = v;
    }

    /// Makes every subsequent `req` fail with `errno`.
    pub fn fail(&self, req: Request, errno: i32) {
        self.lock().failures.insert(req, errno);
    }

    /// Appends `steps` to the `KVM_RUN` script of vCPU `id`.
    pub fn script(&self, id: u32, steps: impl IntoIterator<Item = Step>) {
        self.lock().scripts.entry(id).or_default().extend(steps);
    }

    /// Makes only the `nth` subsequent `req` (counting from zero) fail with `errno`.
    pub fn fail_nth(&self, req: Request, nth: usize, errno: i32) {
        self.lock().pending.push((req, nth, errno));
    }

    pub fn requests(&self) -> Vec<Request> {
        self.lock().requests.clone()
    }

    pub fn count(&self, req: Request) -> usize {
        self.lock().requests.iter().filter(|&&r| r == req).count()
    }

    /// Returns every `KVM_SET_USER_MEMORY_REGION` that was accepted.
    pub fn regions(&self) -> Vec<KvmUserspaceMemoryRegion> {
        self.lock().regions.clone()
    }

    /// Returns the slots currently installed in all VMs.
    pub fn installed(&self) -> Vec<KvmUserspaceMemoryRegion> {
        let s = self.lock();
        let mut v: Vec<KvmUserspaceMemoryRegion> = s
            .objects
            .values()
            .flat_map(|o| match o {
                Object::Vm(slots) => slots.values().copied().collect(),
                _ => Vec::new(),
            })
            .collect();

        v.sort_by_key(|r| r.slot);
        v
    }

    /// Returns the number of `/dev/kvm` descriptors that are still open.
    pub fn open_devices(&self) -> usize {
        self.lock().devices.iter().filter(|w| has_reader(w)).count()
    }

    pub fn mappings(&self) -> usize {
        self.lock().mappings
    }

    pub fn kicks(&self) -> usize {
        self.lock().kicks
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.0.lock().unwrap()
    }

    fn new_fd(&self, obj: Object) -> Result<OwnedFd, Error> {
        let fd: OwnedFd = File::open("/dev/null")?.into();

        self.lock().objects.insert(fd.as_raw_fd(), obj);

        Ok(fd)
    }

    fn run(&self, fd: RawFd) -> Result<c_int, Error> {
        let (run, step) = {
            let mut s = self.lock();
            let (id, run) = match s.objects.get(&fd) {
                Some(Object::Vcpu(v)) => (v.id, v.run),
                _ => return Err(Error::from_raw_os_error(EBADF)),
            };

            let run = run.ok_or(Error::from_raw_os_error(EBADF))?;

            // KVM checks this before doing anything.
            if immediate_exit(run) {
                return Err(Error::from_raw_os_error(EINTR));
            }

            let step = s
                .scripts
                .get_mut(&id)
                .and_then(|v| v.pop_front())
                .unwrap_or(Step::Spin);

            (run, step)
        };

        match step {
            Step::Exit(reason, payload, data) => {
                let base = run.as_ptr();

                unsafe {
                    base.add(offset_of!(KvmRun, exit_reason))
                        .cast::<u32>()
                        .write_unaligned(reason);
                    base.add(offset_of!(KvmRun, exit))
                        .copy_from_nonoverlapping(payload.as_ptr(), payload.len());

                    if let Some((off, data)) = data {
                        base.add(off)
                            .copy_from_nonoverlapping(data.as_ptr(), data.len());
                    }
                }

                Ok(0)
            }
            Step::Spin => loop {
                if immediate_exit(run) {
                    return Err(Error::from_raw_os_error(EINTR));
                }

                std::thread::sleep(Duration::from_millis(1));
            },
            Step::Fail(errno) => Err(Error::from_raw_os_error(errno)),
        }
    }
}

impl Kernel for FakeKernel {
    fn open_device(&self) -> Result<OwnedFd, Error> {
        let mut s = self.lock();

        if let Some(e) = s.unavailable {
            return Err(Error::from_raw_os_error(e));
        }

        // Keep the write end so we can tell when the caller closed the device.
        let mut fds = [0; 2];

        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
            return Err(Error::last_os_error());
        }

        let r = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let w = unsafe { OwnedFd::from_raw_fd(fds[1]) };

        s.objects.insert(r.as_raw_fd(), Object::Device);
        s.devices.push(w);

        Ok(r)
    }

    unsafe fn ioctl(&self, fd: BorrowedFd, req: Request, arg: usize) -> Result<c_int, Error> {
        let fd = fd.as_raw_fd();

        // Record.
        {
            let mut s = self.lock();

            s.requests.push(req);

            if let Some(&e) = s.failures.get(&req) {
                return Err(Error::from_raw_os_error(e));
            }

            let mut failed = None;

            s.pending.retain_mut(|(r, n, e)| {
                if *r != req || failed.is_some() {
                    true
                } else if *n == 0 {
                    failed = Some(*e);
                    false
                } else {
                    *n -= 1;
                    true
                }
            });

            if let Some(e) = failed {
                return Err(Error::from_raw_os_error(e));
            }
        }

        match req {
            Request::GetApiVersion => Ok(self.lock().api_version),
            Request::CreateVm => Ok(self.new_fd(Object::Vm(HashMap::new()))?.into_raw_fd()),
            Request::CheckExtension => Ok(1),
            Request::GetVcpuMmapSize => Ok(self.lock().mmap_size),
            Request::CreateVcpu => {
                let vcpu = FakeVcpu {
                    id: arg.try_into().unwrap(),
                    regs: Registers::default(),
                    sregs: SpecialRegisters::default(),
                    run: None,
                };

                Ok(self.new_fd(Object::Vcpu(vcpu))?.into_raw_fd())
            }
            Request::SetUserMemoryRegion => {
                let r = unsafe { *(arg as *const KvmUserspaceMemoryRegion) };
                let mut s = self.lock();
                let slots = match s.objects.get_mut(&fd) {
                    Some(Object::Vm(v)) => v,
                    _ => return Err(Error::from_raw_os_error(EBADF)),
                };

                // Same rules as KVM: a live slot can only be deleted, moved or have its flags
                // changed.
                if r.memory_size == 0 {
                    if slots.remove(&r.slot).is_none() {
                        return Err(Error::from_raw_os_error(EINVAL));
                    }
                } else {
                    if let Some(old) = slots.get(&r.slot) {
                        if old.memory_size != r.memory_size
                            || old.userspace_addr != r.userspace_addr
                        {
                            return Err(Error::from_raw_os_error(EINVAL));
                        }
                    }

                    slots.insert(r.slot, r);
                }

                s.regions.push(r);

                Ok(0)
            }
            Request::Run => self.run(fd),
            Request::GetRegs | Request::SetRegs | Request::GetSregs | Request::SetSregs => {
                let mut s = self.lock();
                let cpu = match s.objects.get_mut(&fd) {
                    Some(Object::Vcpu(v)) => v,
                    _ => return Err(Error::from_raw_os_error(EBADF)),
                };

                unsafe {
                    match req {
                        Request::GetRegs => *(arg as *mut Registers) = cpu.regs,
                        Request::SetRegs => cpu.regs = *(arg as *const Registers),
                        Request::GetSregs => *(arg as *mut SpecialRegisters) = cpu.sregs,
                        _ => cpu.sregs = *(arg as *const SpecialRegisters),
                    }
                }

                Ok(0)
            }
        }
    }

    unsafe fn mmap(&self, fd: BorrowedFd, len: NonZero<usize>) -> Result<NonNull<u8>, Error> {
        let mut s = self.lock();
        let cpu = match s.objects.get_mut(&fd.as_raw_fd()) {
            Some(Object::Vcpu(v)) => v,
            _ => return Err(Error::from_raw_os_error(EBADF)),
        };

        let buf = Box::into_raw(vec![0u8; len.get()].into_boxed_slice());
        let ptr = unsafe { NonNull::new_unchecked(buf.cast::<u8>()) };

        cpu.run = Some(ptr);
        s.mappings += 1;

        Ok(ptr)
    }

    unsafe fn munmap(&self, addr: NonNull<u8>, len: NonZero<usize>) -> Result<(), Error> {
        let mut s = self.lock();

        for o in s.objects.values_mut() {
            if let Object::Vcpu(v) = o {
                if v.run == Some(addr) {
                    v.run = None;
                }
            }
        }

        s.mappings -= 1;

        drop(unsafe {
            Box::from_raw(std::ptr::slice_from_raw_parts_mut(addr.as_ptr(), len.get()))
        });

        Ok(())
    }

    fn kick(&self, _: pthread_t) -> Result<(), Error> {
        // Spinning KVM_RUN polls immediate_exit so there is nothing to interrupt.
        self.lock().kicks += 1;
        Ok(())
    }
}

/// Result of a single scripted `KVM_RUN`.
pub enum Step {
    /// Writes exit reason and payload, plus optional data at an offset from the start of
    /// `kvm_run`, then returns success.
    Exit(u32, Vec<u8>, Option<(usize, Vec<u8>)>),
    /// Blocks until `immediate_exit` is set.
    Spin,
    Fail(i32),
}

impl Step {
    pub fn exit(reason: u32) -> Self {
        Self::Exit(reason, Vec::new(), None)
    }

    pub fn exit_with<T: bytemuck::Pod>(reason: u32, payload: T) -> Self {
        Self::Exit(reason, bytemuck::bytes_of(&payload).to_vec(), None)
    }

    pub fn io_out(port: u16, data: &[u8]) -> Self {
        Self::io(KVM_EXIT_IO_OUT, port, data)
    }

    pub fn io_in(port: u16, data: &[u8]) -> Self {
        Self::io(KVM_EXIT_IO_IN, port, data)
    }

    fn io(direction: u8, port: u16, data: &[u8]) -> Self {
        let off = 0x1000;
        let io = KvmExitIo {
            direction,
            size: data.len().try_into().unwrap(),
            port,
            count: 1,
            data_offset: off as u64,
        };

        Self::Exit(
            KVM_EXIT_IO,
            bytemuck::bytes_of(&io).to_vec(),
            Some((off, data.to_vec())),
        )
    }
}

struct State {
    objects: HashMap<RawFd, Object>,
    devices: Vec<OwnedFd>,
    unavailable: Option<i32>,
    api_version: c_int,
    mmap_size: c_int,
    failures: HashMap<Request, i32>,
    pending: Vec<(Request, usize, i32)>,
    requests: Vec<Request>,
    regions: Vec<KvmUserspaceMemoryRegion>,
    scripts: HashMap<u32, VecDeque<Step>>,
    mappings: usize,
    kicks: usize,
}

unsafe impl Send for State {}

enum Object {
    Device,
    Vm(HashMap<u32, KvmUserspaceMemoryRegion>),
    Vcpu(FakeVcpu),
}

struct FakeVcpu {
    id: u32,
    regs: Registers,
    sregs: SpecialRegisters,
    run: Option<NonNull<u8>>,
}

fn immediate_exit(run: NonNull<u8>) -> bool {
    let ptr = unsafe { run.as_ptr().add(offset_of!(KvmRun, immediate_exit)) };

    unsafe { AtomicU8::from_ptr(ptr) }.load(Ordering::SeqCst) != 0
}

fn has_reader(w: &OwnedFd) -> bool {
    let mut p = libc::pollfd {
        fd: w.as_raw_fd(),
        events: libc::POLLOUT,
        revents: 0,
    };

    unsafe { libc::poll(&mut p, 1, 0) };

    p.revents & libc::POLLERR == 0
}
