// SPDX-License-Identifier: MIT OR Apache-2.0
use crate::ffi::*;
use crate::run::{DecodeError, RunRegion, read};
use std::fmt::{Display, Formatter};
use std::mem::offset_of;

/// Why `KVM_RUN` returned.
///
/// All data is copied out of `kvm_run` so this stays valid after the next run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitEvent {
    Unknown {
        reason: u32,
        hardware_exit_reason: u64,
    },
    Exception {
        exception: u32,
        error_code: u32,
    },
    Io(IoExit),
    Hypercall {
        nr: u64,
        args: [u64; 6],
        ret: u64,
    },
    Debug {
        exception: u32,
        pc: u64,
        dr6: u64,
        dr7: u64,
    },
    Halt,
    Mmio(MmioExit),
    IrqWindowOpen,
    Shutdown,
    FailEntry {
        hardware_entry_failure_reason: u64,
        cpu: u32,
    },
    Intr,
    SetTpr,
    TprAccess {
        rip: u64,
        is_write: bool,
    },
    Nmi,
    InternalError {
        suberror: u32,
        data: Vec<u64>,
    },
    SystemEvent {
        ty: u32,
        data: Vec<u64>,
    },
}

impl ExitEvent {
    /// Returns `KVM_EXIT_*` that produced this event.
    pub fn reason(&self) -> u32 {
        match self {
            Self::Unknown { reason, .. } => *reason,
            Self::Exception { .. } => KVM_EXIT_EXCEPTION,
            Self::Io(_) => KVM_EXIT_IO,
            Self::Hypercall { .. } => KVM_EXIT_HYPERCALL,
            Self::Debug { .. } => KVM_EXIT_DEBUG,
            Self::Halt => KVM_EXIT_HLT,
            Self::Mmio(_) => KVM_EXIT_MMIO,
            Self::IrqWindowOpen => KVM_EXIT_IRQ_WINDOW_OPEN,
            Self::Shutdown => KVM_EXIT_SHUTDOWN,
            Self::FailEntry { .. } => KVM_EXIT_FAIL_ENTRY,
            Self::Intr => KVM_EXIT_INTR,
            Self::SetTpr => KVM_EXIT_SET_TPR,
            Self::TprAccess { .. } => KVM_EXIT_TPR_ACCESS,
            Self::Nmi => KVM_EXIT_NMI,
            Self::InternalError { .. } => KVM_EXIT_INTERNAL_ERROR,
            Self::SystemEvent { .. } => KVM_EXIT_SYSTEM_EVENT,
        }
    }
}

impl Display for ExitEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown {
                reason,
                hardware_exit_reason,
            } => write!(
                f,
                "exit reason {reason} (hardware exit reason {hardware_exit_reason:#x})"
            ),
            Self::Exception {
                exception,
                error_code,
            } => write!(f, "exception {exception} (error code {error_code:#x})"),
            Self::Io(io) => write!(f, "{io}"),
            Self::Hypercall { nr, .. } => write!(f, "hypercall {nr}"),
            Self::Debug { exception, pc, .. } => {
                write!(f, "debug exception {exception} at {pc:#x}")
            }
            Self::Halt => f.write_str("halt"),
            Self::Mmio(mmio) => write!(f, "{mmio}"),
            Self::IrqWindowOpen => f.write_str("interrupt window open"),
            Self::Shutdown => f.write_str("shutdown"),
            Self::FailEntry {
                hardware_entry_failure_reason,
                cpu,
            } => write!(
                f,
                "entry failure on CPU {cpu} (hardware entry failure reason {hardware_entry_failure_reason:#x})"
            ),
            Self::Intr => f.write_str("interrupted"),
            Self::SetTpr => f.write_str("TPR write"),
            Self::TprAccess { rip, is_write } => {
                let op = if *is_write { "write" } else { "read" };
                write!(f, "TPR {op} at {rip:#x}")
            }
            Self::Nmi => f.write_str("NMI"),
            Self::InternalError { suberror, data } => {
                write!(f, "internal error {suberror} (data {data:x?})")
            }
            Self::SystemEvent { ty, data } => write!(f, "system event {ty} (data {data:x?})"),
        }
    }
}

/// Port I/O performed by the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoExit {
    pub direction: IoDirection,
    pub size: u8,
    pub port: u16,
    pub count: u32,
    /// Copy of `size` bytes from the data area of `kvm_run`.
    pub data: Vec<u8>,
}

impl Display for IoExit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let dir = match self.direction {
            IoDirection::In => "in",
            IoDirection::Out => "out",
        };

        write!(
            f,
            "{dir} {:#x} (size {}, count {}, data {:02x?})",
            self.port, self.size, self.count, self.data
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    In,
    Out,
}

/// Memory-mapped I/O on an address with no memory slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmioExit {
    pub phys_addr: u64,
    pub data: Vec<u8>,
    pub is_write: bool,
}

impl Display for MmioExit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let op = if self.is_write { "write" } else { "read" };

        write!(f, "MMIO {op} at {:#x} ({:02x?})", self.phys_addr, self.data)
    }
}

/// Decodes the exit currently recorded in `run`.
pub fn decode_exit<R: RunRegion + ?Sized>(run: &R) -> Result<ExitEvent, DecodeError> {
    let reason: u32 = read(run, offset_of!(KvmRun, exit_reason))?;
    let off = offset_of!(KvmRun, exit);
    let exit = match reason {
        KVM_EXIT_EXCEPTION => {
            let ex: KvmExitException = read(run, off)?;

            ExitEvent::Exception {
                exception: ex.exception,
                error_code: ex.error_code,
            }
        }
        KVM_EXIT_IO => ExitEvent::Io(decode_io(run, read(run, off)?)?),
        KVM_EXIT_HYPERCALL => {
            let hc: KvmExitHypercall = read(run, off)?;

            ExitEvent::Hypercall {
                nr: hc.nr,
                args: hc.args,
                ret: hc.ret,
            }
        }
        KVM_EXIT_DEBUG => {
            let d: KvmExitDebug = read(run, off)?;

            ExitEvent::Debug {
                exception: d.exception,
                pc: d.pc,
                dr6: d.dr6,
                dr7: d.dr7,
            }
        }
        KVM_EXIT_HLT => ExitEvent::Halt,
        KVM_EXIT_MMIO => {
            let mmio: KvmExitMmio = read(run, off)?;
            let len = usize::try_from(mmio.len).map_or(mmio.data.len(), |v| v.min(mmio.data.len()));

            ExitEvent::Mmio(MmioExit {
                phys_addr: mmio.phys_addr,
                data: mmio.data[..len].to_vec(),
                is_write: mmio.is_write != 0,
            })
        }
        KVM_EXIT_IRQ_WINDOW_OPEN => ExitEvent::IrqWindowOpen,
        KVM_EXIT_SHUTDOWN => ExitEvent::Shutdown,
        KVM_EXIT_FAIL_ENTRY => {
            let fe: KvmExitFailEntry = read(run, off)?;

            ExitEvent::FailEntry {
                hardware_entry_failure_reason: fe.hardware_entry_failure_reason,
                cpu: fe.cpu,
            }
        }
        KVM_EXIT_INTR => ExitEvent::Intr,
        KVM_EXIT_SET_TPR => ExitEvent::SetTpr,
        KVM_EXIT_TPR_ACCESS => {
            let tpr: KvmExitTprAccess = read(run, off)?;

            ExitEvent::TprAccess {
                rip: tpr.rip,
                is_write: tpr.is_write != 0,
            }
        }
        KVM_EXIT_NMI => ExitEvent::Nmi,
        KVM_EXIT_INTERNAL_ERROR => {
            let ie: KvmExitInternal = read(run, off)?;

            ExitEvent::InternalError {
                suberror: ie.suberror,
                data: trim(&ie.data, ie.ndata),
            }
        }
        KVM_EXIT_SYSTEM_EVENT => {
            let se: KvmExitSystemEvent = read(run, off)?;

            ExitEvent::SystemEvent {
                ty: se.ty,
                data: trim(&se.data, se.ndata),
            }
        }
        reason => {
            let unk: KvmExitUnknown = read(run, off)?;

            ExitEvent::Unknown {
                reason,
                hardware_exit_reason: unk.hardware_exit_reason,
            }
        }
    };

    Ok(exit)
}

fn decode_io<R: RunRegion + ?Sized>(run: &R, io: KvmExitIo) -> Result<IoExit, DecodeError> {
    let direction = match io.direction {
        KVM_EXIT_IO_IN => IoDirection::In,
        KVM_EXIT_IO_OUT => IoDirection::Out,
        v => return Err(DecodeError::UnknownIoDirection(v)),
    };

    let len = u64::from(io.size);
    let err = || DecodeError::IoDataOutOfBounds {
        off: io.data_offset,
        len,
        size: run.len(),
    };

    // Check the range before allocating since both values come from the shared page.
    let off = usize::try_from(io.data_offset).map_err(|_| err())?;
    let len = usize::try_from(len)
        .ok()
        .filter(|&len| off.checked_add(len).is_some_and(|end| end <= run.len()))
        .ok_or_else(err)?;
    let mut data = vec![0; len];

    if !run.copy_to(off, &mut data) {
        return Err(err());
    }

    Ok(IoExit {
        direction,
        size: io.size,
        port: io.port,
        count: io.count,
        data,
    })
}

fn trim(data: &[u64], n: u32) -> Vec<u64> {
    let n = usize::try_from(n).map_or(data.len(), |n| n.min(data.len()));

    data[..n].to_vec()
}
