// SPDX-License-Identifier: MIT OR Apache-2.0
use crate::cpu::{VcpuRunError, VirtualCpu};
use crate::exit::ExitEvent;
use crate::kernel::{Host, Kernel};
use crate::run::{DecodeError, ExitRequest};
use crate::vm::Vm;
use crate::{KvmError, error, info};
use libc::{pthread_self, pthread_t};
use std::fmt::{Display, Formatter};
use std::io::Error;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use thiserror::Error;

/// Drives a [`VirtualCpu`] on a dedicated thread until it reaches a terminal state.
///
/// Only port I/O lets the guest continue. [`ExitEvent::Halt`] and [`ExitEvent::Shutdown`] end the
/// loop normally and any other exit is fatal. The loop can be paused and resumed from any thread
/// through [`RunHandle`].
pub struct RunLoop<K: Kernel = Host> {
    handle: RunHandle<K>,
    worker: Option<JoinHandle<(VirtualCpu<K>, Result<Terminal, RunError>)>>,
}

impl<K: Kernel> RunLoop<K> {
    /// Moves `cpu` to a new thread named `vcpu-<id>` and starts running it.
    ///
    /// `observer` is invoked on that thread for every exit before it is acted on.
    pub fn spawn(cpu: VirtualCpu<K>, observer: impl ExitObserver) -> Result<Self, Error> {
        let shared = Arc::new(Shared {
            control: Mutex::new(Control {
                state: RunState::Idle,
                pause: false,
                cancel: false,
                thread: None,
                exit: Some(cpu.run_buffer().exit_request()),
            }),
            cv: Condvar::new(),
        });

        let handle = RunHandle {
            shared: shared.clone(),
            vm: cpu.vm().clone(),
        };

        let worker = std::thread::Builder::new()
            .name(format!("vcpu-{}", cpu.id()))
            .spawn(move || Worker { cpu, shared }.main(observer))?;

        Ok(Self {
            handle,
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> &RunHandle<K> {
        &self.handle
    }

    pub fn state(&self) -> RunState {
        self.handle.state()
    }

    pub fn request_pause(&self) -> Result<(), Error> {
        self.handle.request_pause()
    }

    pub fn resume(&self) -> Result<(), ResumeError> {
        self.handle.resume()
    }

    pub fn cancel(&self) -> Result<(), Error> {
        self.handle.cancel()
    }

    pub fn wait_until_terminal(&self) -> RunState {
        self.handle.wait_until_terminal()
    }

    /// Waits for the worker to stop and gives the vCPU back.
    pub fn join(mut self) -> (VirtualCpu<K>, Result<Terminal, RunError>) {
        // The worker is only taken here or in drop.
        let worker = self.worker.take().unwrap();

        match worker.join() {
            Ok(v) => v,
            Err(e) => std::panic::resume_unwind(e),
        }
    }
}

impl<K: Kernel> Drop for RunLoop<K> {
    fn drop(&mut self) {
        let worker = match self.worker.take() {
            Some(v) => v,
            None => return,
        };

        if let Err(e) = self.handle.cancel() {
            // The worker will never return if we can't interrupt it.
            error!(e, "Couldn't cancel vCPU");
            return;
        }

        // Don't panic while dropping.
        drop(worker.join());
    }
}

/// Controls a [`RunLoop`] from other threads.
pub struct RunHandle<K: Kernel = Host> {
    shared: Arc<Shared>,
    vm: Arc<Vm<K>>,
}

impl<K: Kernel> RunHandle<K> {
    pub fn state(&self) -> RunState {
        self.shared.lock().state
    }

    /// Asks the vCPU to stop at the next opportunity and move to [`RunState::Suspended`].
    ///
    /// This returns immediately. A request while the loop is suspended or already finished does
    /// nothing.
    pub fn request_pause(&self) -> Result<(), Error> {
        let mut ctl = self.shared.lock();

        if ctl.state == RunState::Suspended || ctl.state.is_terminal() {
            return Ok(());
        }

        self.interrupt(&mut ctl)
    }

    /// Lets a suspended vCPU continue from where it was interrupted.
    pub fn resume(&self) -> Result<(), ResumeError> {
        let mut ctl = self.shared.lock();

        if ctl.state != RunState::Suspended {
            return Err(ResumeError::NotSuspended(ctl.state));
        }

        ctl.state = RunState::Running;
        self.shared.cv.notify_all();

        Ok(())
    }

    /// Stops the loop with [`Terminal::Cancelled`] unless it already reached a terminal state.
    pub fn cancel(&self) -> Result<(), Error> {
        let mut ctl = self.shared.lock();

        if ctl.state.is_terminal() {
            return Ok(());
        }

        ctl.cancel = true;
        self.shared.cv.notify_all();

        self.interrupt(&mut ctl)
    }

    pub fn wait_until_terminal(&self) -> RunState {
        self.wait(RunState::is_terminal)
    }

    /// Blocks until the loop is neither idle nor running.
    pub fn wait_until_settled(&self) -> RunState {
        self.wait(|s| !matches!(s, RunState::Idle | RunState::Running))
    }

    fn wait(&self, f: impl Fn(RunState) -> bool) -> RunState {
        let mut ctl = self.shared.lock();

        while !f(ctl.state) {
            ctl = self.shared.cv.wait(ctl).unwrap();
        }

        ctl.state
    }

    fn interrupt(&self, ctl: &mut Control) -> Result<(), Error> {
        ctl.pause = true;

        // The order is important. KVM checks immediate_exit before entering the guest, which
        // covers the case where the signal arrives before KVM_RUN.
        if let Some(exit) = ctl.exit {
            exit.set(true);
        }

        match ctl.thread {
            Some(t) => self.vm.kernel().kick(t),
            None => Ok(()),
        }
    }
}

impl<K: Kernel> Clone for RunHandle<K> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            vm: self.vm.clone(),
        }
    }
}

/// Receives every exit of a [`RunLoop`].
pub trait ExitObserver: Send + 'static {
    fn exited(&mut self, exit: &ExitEvent);
}

impl<F: FnMut(&ExitEvent) + Send + 'static> ExitObserver for F {
    fn exited(&mut self, exit: &ExitEvent) {
        self(exit)
    }
}

/// State of a [`RunLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Suspended,
    Halted,
    ShutdownObserved,
    Fatal,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Halted | Self::ShutdownObserved | Self::Fatal | Self::Cancelled
        )
    }
}

impl Display for RunState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let v = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Halted => "halted",
            Self::ShutdownObserved => "shutdown",
            Self::Fatal => "fatal",
            Self::Cancelled => "cancelled",
        };

        f.write_str(v)
    }
}

/// How a [`RunLoop`] finished without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Halted,
    ShutdownObserved,
    Cancelled,
}

impl From<Terminal> for RunState {
    fn from(value: Terminal) -> Self {
        match value {
            Terminal::Halted => Self::Halted,
            Terminal::ShutdownObserved => Self::ShutdownObserved,
            Terminal::Cancelled => Self::Cancelled,
        }
    }
}

struct Shared {
    control: Mutex<Control>,
    cv: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap()
    }
}

/// Everything in here is only touched with the lock held.
struct Control {
    state: RunState,
    pause: bool,
    cancel: bool,
    thread: Option<pthread_t>,
    exit: Option<ExitRequest>, // None once the vCPU left the worker.
}

struct Worker<K: Kernel> {
    cpu: VirtualCpu<K>,
    shared: Arc<Shared>,
}

impl<K: Kernel> Worker<K> {
    fn main(
        mut self,
        mut observer: impl ExitObserver,
    ) -> (VirtualCpu<K>, Result<Terminal, RunError>) {
        let id = self.cpu.id();
        let mut retire = Retire {
            shared: self.shared.clone(),
            id,
            state: RunState::Fatal,
        };

        // Register ourself to receive kicks.
        {
            let mut ctl = self.shared.lock();

            ctl.thread = Some(unsafe { pthread_self() });

            if ctl.state == RunState::Idle {
                ctl.state = RunState::Running;
            }

            self.shared.cv.notify_all();
        }

        info!("vCPU #{} started.", id);

        let r = self.run(&mut observer);

        match &r {
            Ok(v) => info!("vCPU #{} finished with {:?}.", id, v),
            Err(e) => error!(e, "vCPU #{} stopped", id),
        }

        retire.state = match &r {
            Ok(v) => (*v).into(),
            Err(_) => RunState::Fatal,
        };

        drop(retire);

        (self.cpu, r)
    }

    fn run(&mut self, observer: &mut impl ExitObserver) -> Result<Terminal, RunError> {
        loop {
            let exit = match self.cpu.run() {
                Ok(v) => v,
                Err(VcpuRunError::Interrupted) => match self.park() {
                    Some(v) => return Ok(v),
                    None => continue,
                },
                Err(VcpuRunError::Run(e)) => return Err(RunError::Run(e)),
                Err(VcpuRunError::Decode(e)) => return Err(RunError::Decode(e)),
            };

            observer.exited(&exit);

            match exit {
                ExitEvent::Io(_) => continue,
                ExitEvent::Halt => return Ok(Terminal::Halted),
                ExitEvent::Shutdown => return Ok(Terminal::ShutdownObserved),
                v => return Err(RunError::FatalExit(v)),
            }
        }
    }

    /// Handles `EINTR` from `KVM_RUN`. Returns [`Some`] if the loop should stop.
    fn park(&self) -> Option<Terminal> {
        let mut ctl = self.shared.lock();

        if ctl.cancel {
            return Some(Terminal::Cancelled);
        } else if !ctl.pause {
            // Some other signal.
            return None;
        }

        // Pause requests that come in after this point are absorbed by this suspension since
        // request_pause() will see Suspended.
        ctl.pause = false;
        ctl.state = RunState::Suspended;
        self.shared.cv.notify_all();

        info!("vCPU #{} suspended.", self.cpu.id());

        while ctl.state == RunState::Suspended && !ctl.cancel {
            ctl = self.shared.cv.wait(ctl).unwrap();
        }

        if ctl.cancel {
            return Some(Terminal::Cancelled);
        }

        // A new pause may have been requested between resume() and here, in which case the next
        // KVM_RUN must return right away.
        self.cpu.run_buffer().exit_request().set(ctl.pause);

        info!("vCPU #{} resumed.", self.cpu.id());

        None
    }
}

/// Detaches the worker from [`Control`] when dropped.
///
/// This also runs when the observer panics. It must be dropped before the vCPU since the handles
/// hold a pointer into its `kvm_run`.
struct Retire {
    shared: Arc<Shared>,
    id: u32,
    state: RunState,
}

impl Drop for Retire {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!("vCPU #{} panicked.", self.id);
        }

        let mut ctl = self
            .shared
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        ctl.thread = None;
        ctl.exit = None;
        ctl.state = self.state;

        self.shared.cv.notify_all();
    }
}

/// Represents an error when a [`RunLoop`] stops abnormally.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("couldn't run vCPU")]
    Run(#[source] KvmError),

    #[error("couldn't decode the exit")]
    Decode(#[source] DecodeError),

    #[error("unexpected {0}")]
    FatalExit(ExitEvent),
}

/// Represents an error when [`RunHandle::resume()`] fails.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResumeError {
    #[error("vCPU is {0}, not suspended")]
    NotSuspended(RunState),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeKernel, Step};
    use crate::ffi::{
        KVM_EXIT_HLT, KVM_EXIT_INTERNAL_ERROR, KVM_EXIT_SHUTDOWN, KvmExitInternal, Request,
    };
    use crate::{GuestMemory, IoDirection, MemoryFlags};
    use libc::EFAULT;
    use std::num::NonZero;
    use std::sync::mpsc::{Receiver, channel};
    use std::time::Duration;

    fn spawn(kernel: &FakeKernel) -> (RunLoop<FakeKernel>, Receiver<ExitEvent>) {
        let vm = Vm::create(kernel.clone()).unwrap();
        let cpu = vm.create_vcpu(0).unwrap();
        let (tx, rx) = channel();
        let rl = RunLoop::spawn(cpu, move |e: &ExitEvent| tx.send(e.clone()).unwrap()).unwrap();

        (rl, rx)
    }

    #[test]
    fn halt() {
        let kernel = FakeKernel::new();

        kernel.script(0, [Step::io_out(0x3F8, b"A"), Step::exit(KVM_EXIT_HLT)]);

        let (rl, rx) = spawn(&kernel);

        assert_eq!(rl.wait_until_terminal(), RunState::Halted);

        let (_, r) = rl.join();
        let exits: Vec<ExitEvent> = rx.try_iter().collect();

        assert_eq!(r.unwrap(), Terminal::Halted);
        assert_eq!(exits.len(), 2);
        assert!(matches!(&exits[0], ExitEvent::Io(io) if io.direction == IoDirection::Out && io.port == 0x3F8 && io.data == b"A"));
        assert_eq!(exits[1], ExitEvent::Halt);
        assert_eq!(kernel.count(Request::Run), 2);
    }

    #[test]
    fn shutdown() {
        let kernel = FakeKernel::new();

        kernel.script(0, [Step::io_in(0x60, &[0]), Step::exit(KVM_EXIT_SHUTDOWN)]);

        let (rl, _rx) = spawn(&kernel);
        let (_, r) = rl.join();

        assert_eq!(r.unwrap(), Terminal::ShutdownObserved);
    }

    #[test]
    fn fatal_exit() {
        let kernel = FakeKernel::new();

        kernel.script(0, [Step::exit(99), Step::exit(KVM_EXIT_HLT)]);

        let (rl, rx) = spawn(&kernel);

        assert_eq!(rl.wait_until_terminal(), RunState::Fatal);

        let (_, r) = rl.join();

        assert!(matches!(
            r,
            Err(RunError::FatalExit(ExitEvent::Unknown { reason: 99, .. }))
        ));

        // No more KVM_RUN after a fatal exit.
        assert_eq!(kernel.count(Request::Run), 1);
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn internal_error() {
        let kernel = FakeKernel::new();
        let payload = KvmExitInternal {
            suberror: 1,
            ndata: 1,
            data: [7; 16],
        };

        kernel.script(0, [Step::exit_with(KVM_EXIT_INTERNAL_ERROR, payload)]);

        let (rl, _rx) = spawn(&kernel);
        let (_, r) = rl.join();

        match r {
            Err(RunError::FatalExit(ExitEvent::InternalError { suberror, data })) => {
                assert_eq!(suberror, 1);
                assert_eq!(data, [7]);
            }
            r => panic!("unexpected result {r:?}"),
        }
    }

    #[test]
    fn observer_panic() {
        let kernel = FakeKernel::new();

        kernel.script(0, [Step::exit(KVM_EXIT_HLT)]);

        let vm = Vm::create(kernel.clone()).unwrap();
        let cpu = vm.create_vcpu(0).unwrap();
        let rl = RunLoop::spawn(cpu, |e: &ExitEvent| panic!("observer failed on {e}")).unwrap();
        let handle = rl.handle().clone();

        assert_eq!(handle.wait_until_terminal(), RunState::Fatal);

        let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| rl.join()));

        assert!(r.is_err());
        assert_eq!(kernel.mappings(), 0);

        // The handle must not reach into the unmapped kvm_run or kick the dead thread.
        handle.request_pause().unwrap();
        handle.cancel().unwrap();

        assert_eq!(handle.state(), RunState::Fatal);
        assert_eq!(handle.wait_until_settled(), RunState::Fatal);
        assert_eq!(kernel.kicks(), 0);
    }

    #[test]
    fn run_failed() {
        let kernel = FakeKernel::new();

        kernel.script(0, [Step::Fail(EFAULT)]);

        let (rl, rx) = spawn(&kernel);
        let (_, r) = rl.join();

        assert!(matches!(r, Err(RunError::Run(e)) if e.errno() == Some(EFAULT)));
        assert_eq!(rx.try_iter().count(), 0);
    }

    #[test]
    fn pause_and_resume() {
        let kernel = FakeKernel::new();

        // Nothing else is scripted so the guest spins after the I/O.
        kernel.script(0, [Step::io_out(0x80, &[1])]);

        let (rl, rx) = spawn(&kernel);

        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            ExitEvent::Io(_)
        ));

        rl.request_pause().unwrap();

        assert_eq!(rl.handle().wait_until_settled(), RunState::Suspended);
        assert_eq!(rl.state(), RunState::Suspended);
        assert_eq!(kernel.kicks(), 1);

        // Pause while suspended does nothing.
        rl.request_pause().unwrap();

        kernel.script(0, [Step::exit(KVM_EXIT_HLT)]);
        rl.resume().unwrap();

        assert_eq!(rl.wait_until_terminal(), RunState::Halted);

        let (cpu, r) = rl.join();

        assert_eq!(r.unwrap(), Terminal::Halted);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), [ExitEvent::Halt]);
        assert!(!cpu.run_buffer().immediate_exit());
    }

    #[test]
    fn resume_not_suspended() {
        let kernel = FakeKernel::new();
        let (rl, _rx) = spawn(&kernel);

        assert!(matches!(
            rl.resume(),
            Err(ResumeError::NotSuspended(RunState::Idle | RunState::Running))
        ));

        rl.cancel().unwrap();

        assert_eq!(rl.wait_until_terminal(), RunState::Cancelled);
        assert_eq!(
            rl.resume(),
            Err(ResumeError::NotSuspended(RunState::Cancelled))
        );
    }

    #[test]
    fn cancel_suspended() {
        let kernel = FakeKernel::new();
        let (rl, rx) = spawn(&kernel);

        rl.request_pause().unwrap();

        assert_eq!(rl.handle().wait_until_settled(), RunState::Suspended);

        rl.cancel().unwrap();

        let (_, r) = rl.join();

        assert_eq!(r.unwrap(), Terminal::Cancelled);
        assert_eq!(rx.try_iter().count(), 0);
    }

    #[test]
    fn drop_cancels() {
        let kernel = FakeKernel::new();
        let (rl, _rx) = spawn(&kernel);
        let handle = rl.handle().clone();

        drop(rl);

        assert_eq!(handle.state(), RunState::Cancelled);
        assert_eq!(kernel.mappings(), 0);
    }

    #[test]
    fn handle_from_other_thread() {
        let kernel = FakeKernel::new();
        let (rl, _rx) = spawn(&kernel);
        let handle = rl.handle().clone();
        let t = std::thread::spawn(move || {
            handle.request_pause().unwrap();
            handle.wait_until_settled()
        });

        assert_eq!(t.join().unwrap(), RunState::Suspended);

        rl.cancel().unwrap();

        assert_eq!(rl.join().1.unwrap(), Terminal::Cancelled);
    }

    // Tests below need a real /dev/kvm and do nothing when it is not available.

    fn real_cpu(code: &[u8]) -> Option<VirtualCpu> {
        let vm = match Vm::new() {
            Ok(v) => v,
            Err(e) => {
                eprintln!("skipping: {e}");
                return None;
            }
        };

        let len = NonZero::new(0x10000).unwrap();
        let mem = GuestMemory::with_data(len, 0, code).unwrap();

        vm.map_user_memory(0, MemoryFlags::empty(), 0, mem).unwrap();

        let mut cpu = vm.create_vcpu(0).unwrap();
        let mut regs = cpu.get_registers().unwrap();
        let mut sregs = cpu.get_sregisters().unwrap();

        regs.rip = 0;
        regs.rsp = 0x8000;
        regs.rflags = 0x2;
        sregs.cs.base = 0;
        sregs.cs.selector = 0;

        cpu.set_registers(&regs).unwrap();
        cpu.set_sregisters(&sregs).unwrap();

        Some(cpu)
    }

    #[test]
    fn real_halt() {
        // mov al, 0x41; out 0x10, al; hlt
        let Some(cpu) = real_cpu(&[0xB0, 0x41, 0xE6, 0x10, 0xF4]) else {
            return;
        };

        let (tx, rx) = channel();
        let rl = RunLoop::spawn(cpu, move |e: &ExitEvent| tx.send(e.clone()).unwrap()).unwrap();
        let (_, r) = rl.join();
        let exits: Vec<ExitEvent> = rx.try_iter().collect();

        assert_eq!(r.unwrap(), Terminal::Halted);
        assert_eq!(
            exits[0],
            ExitEvent::Io(crate::IoExit {
                direction: IoDirection::Out,
                size: 1,
                port: 0x10,
                count: 1,
                data: vec![0x41],
            })
        );
        assert_eq!(exits[1], ExitEvent::Halt);
    }

    #[test]
    fn real_pause() {
        // jmp $
        let Some(cpu) = real_cpu(&[0xEB, 0xFE]) else {
            return;
        };

        let rl = RunLoop::spawn(cpu, |e: &ExitEvent| panic!("unexpected exit {e}")).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        rl.request_pause().unwrap();

        assert_eq!(rl.handle().wait_until_settled(), RunState::Suspended);

        rl.resume().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        rl.request_pause().unwrap();

        assert_eq!(rl.handle().wait_until_settled(), RunState::Suspended);

        rl.cancel().unwrap();

        let (cpu, r) = rl.join();

        assert_eq!(r.unwrap(), Terminal::Cancelled);
        assert_eq!(cpu.get_registers().unwrap().rip, 0);
    }
}
