// SPDX-License-Identifier: MIT OR Apache-2.0
use kvm::{Kernel, RunHandle, RunState, error, info, warn};
use libc::{SIG_BLOCK, SIGUSR1, pthread_sigmask, sigaddset, sigemptyset, sigset_t, sigwait};
use std::io::Error;
use std::mem::zeroed;
use std::ptr::null_mut;
use std::thread::JoinHandle;

/// Signal that toggles the vCPU between running and suspended.
pub const TOGGLE_SIGNAL: i32 = SIGUSR1;

/// Operator console driven by signals.
///
/// [`TOGGLE_SIGNAL`] is blocked when this struct is created and only consumed by the console
/// thread with `sigwait`. Threads inherit the signal mask so this must be created before any other
/// thread is spawned, otherwise the signal may be delivered to a thread with the default action.
pub struct Console {
    set: sigset_t,
}

impl Console {
    pub fn new() -> Result<Self, Error> {
        let mut set: sigset_t = unsafe { zeroed() };

        unsafe { sigemptyset(&mut set) };
        unsafe { sigaddset(&mut set, TOGGLE_SIGNAL) };

        match unsafe { pthread_sigmask(SIG_BLOCK, &set, null_mut()) } {
            0 => Ok(Self { set }),
            v => Err(Error::from_raw_os_error(v)),
        }
    }

    /// Starts a thread that toggles `vcpu` each time [`TOGGLE_SIGNAL`] is received.
    ///
    /// The thread stops once the vCPU reached a terminal state and the next signal arrives. It is
    /// never joined.
    pub fn attach<K: Kernel>(self, vcpu: RunHandle<K>) -> Result<JoinHandle<()>, Error> {
        std::thread::Builder::new()
            .name("console".into())
            .spawn(move || self.run(vcpu))
    }

    fn run<K: Kernel>(self, vcpu: RunHandle<K>) {
        loop {
            let mut sig = 0;

            match unsafe { sigwait(&self.set, &mut sig) } {
                0 => {}
                v => {
                    let e = Error::from_raw_os_error(v);
                    error!(e, "Couldn't wait for console signal");
                    break;
                }
            }

            match Toggle::from(vcpu.state()) {
                Toggle::Pause => {
                    info!("Pausing vCPU.");

                    if let Err(e) = vcpu.request_pause() {
                        error!(e, "Couldn't pause vCPU");
                    }
                }
                Toggle::Resume => {
                    info!("Resuming vCPU.");

                    if let Err(e) = vcpu.resume() {
                        warn!(e, "Couldn't resume vCPU");
                    }
                }
                Toggle::Stop => break,
            }
        }
    }
}

/// What a toggle signal does to a vCPU in a particular state.
#[derive(Debug, PartialEq, Eq)]
enum Toggle {
    Pause,
    Resume,
    Stop,
}

impl From<RunState> for Toggle {
    fn from(value: RunState) -> Self {
        match value {
            RunState::Suspended => Self::Resume,
            v if v.is_terminal() => Self::Stop,
            _ => Self::Pause,
        }
    }
}
