// SPDX-License-Identifier: MIT OR Apache-2.0
use crate::regs::{DescriptorTable, Registers, Segment, SpecialRegisters};
use bytemuck::{Pod, Zeroable};
use std::ffi::{c_int, c_ulong};
use std::fmt::{Display, Formatter};
use std::mem::offset_of;

pub const KVM_GET_API_VERSION: c_ulong = _IO(KVMIO, 0x00);
pub const KVM_CREATE_VM: c_ulong = _IO(KVMIO, 0x01);
pub const KVM_CHECK_EXTENSION: c_ulong = _IO(KVMIO, 0x03);
pub const KVM_GET_VCPU_MMAP_SIZE: c_ulong = _IO(KVMIO, 0x04);
pub const KVM_CREATE_VCPU: c_ulong = _IO(KVMIO, 0x41);
pub const KVM_SET_USER_MEMORY_REGION: c_ulong = _IOW::<KvmUserspaceMemoryRegion>(KVMIO, 0x46);
pub const KVM_RUN: c_ulong = _IO(KVMIO, 0x80);
pub const KVM_GET_REGS: c_ulong = _IOR::<Registers>(KVMIO, 0x81);
pub const KVM_SET_REGS: c_ulong = _IOW::<Registers>(KVMIO, 0x82);
pub const KVM_GET_SREGS: c_ulong = _IOR::<SpecialRegisters>(KVMIO, 0x83);
pub const KVM_SET_SREGS: c_ulong = _IOW::<SpecialRegisters>(KVMIO, 0x84);

pub const KVM_API_VERSION: c_int = 12;
pub const KVM_NR_INTERRUPTS: usize = 256;

pub const KVM_MEM_LOG_DIRTY_PAGES: u32 = 1 << 0;
pub const KVM_MEM_READONLY: u32 = 1 << 1;

pub const KVM_EXIT_EXCEPTION: u32 = 1;
pub const KVM_EXIT_IO: u32 = 2;
pub const KVM_EXIT_HYPERCALL: u32 = 3;
pub const KVM_EXIT_DEBUG: u32 = 4;
pub const KVM_EXIT_HLT: u32 = 5;
pub const KVM_EXIT_MMIO: u32 = 6;
pub const KVM_EXIT_IRQ_WINDOW_OPEN: u32 = 7;
pub const KVM_EXIT_SHUTDOWN: u32 = 8;
pub const KVM_EXIT_FAIL_ENTRY: u32 = 9;
pub const KVM_EXIT_INTR: u32 = 10;
pub const KVM_EXIT_SET_TPR: u32 = 11;
pub const KVM_EXIT_TPR_ACCESS: u32 = 12;
pub const KVM_EXIT_NMI: u32 = 16;
pub const KVM_EXIT_INTERNAL_ERROR: u32 = 17;
pub const KVM_EXIT_SYSTEM_EVENT: u32 = 24;

pub const KVM_EXIT_IO_IN: u8 = 0;
pub const KVM_EXIT_IO_OUT: u8 = 1;

const KVMIO: c_ulong = 0xAE;

const _IOC_NONE: c_ulong = 0;
const _IOC_WRITE: c_ulong = 1;
const _IOC_READ: c_ulong = 2;

const _IOC_NRSHIFT: c_ulong = 0;
const _IOC_NRBITS: c_ulong = 8;
const _IOC_TYPEBITS: c_ulong = 8;
const _IOC_SIZEBITS: c_ulong = 14;
const _IOC_TYPESHIFT: c_ulong = _IOC_NRSHIFT + _IOC_NRBITS;
const _IOC_SIZESHIFT: c_ulong = _IOC_TYPESHIFT + _IOC_TYPEBITS;
const _IOC_DIRSHIFT: c_ulong = _IOC_SIZESHIFT + _IOC_SIZEBITS;

#[allow(non_snake_case)]
const fn _IO(ty: c_ulong, nr: c_ulong) -> c_ulong {
    _IOC(_IOC_NONE, ty, nr, 0)
}

#[allow(non_snake_case)]
const fn _IOR<T>(ty: c_ulong, nr: c_ulong) -> c_ulong {
    _IOC(_IOC_READ, ty, nr, size_of::<T>() as _)
}

#[allow(non_snake_case)]
const fn _IOW<T>(ty: c_ulong, nr: c_ulong) -> c_ulong {
    _IOC(_IOC_WRITE, ty, nr, size_of::<T>() as _)
}

#[allow(non_snake_case)]
const fn _IOC(dir: c_ulong, ty: c_ulong, nr: c_ulong, size: c_ulong) -> c_ulong {
    (dir << _IOC_DIRSHIFT)
        | (ty << _IOC_TYPESHIFT)
        | (nr << _IOC_NRSHIFT)
        | (size << _IOC_SIZESHIFT)
}

// A wrong code here is not rejected by the kernel. It silently operates on a structure of another
// size so pin every code to the value from the Linux headers.
const _: () = assert!(KVM_GET_API_VERSION == 0xAE00);
const _: () = assert!(KVM_CREATE_VM == 0xAE01);
const _: () = assert!(KVM_CHECK_EXTENSION == 0xAE03);
const _: () = assert!(KVM_GET_VCPU_MMAP_SIZE == 0xAE04);
const _: () = assert!(KVM_CREATE_VCPU == 0xAE41);
const _: () = assert!(KVM_SET_USER_MEMORY_REGION == 0x4020AE46);
const _: () = assert!(KVM_RUN == 0xAE80);
const _: () = assert!(KVM_GET_REGS == 0x8090AE81);
const _: () = assert!(KVM_SET_REGS == 0x4090AE82);
const _: () = assert!(KVM_GET_SREGS == 0x8138AE83);
const _: () = assert!(KVM_SET_SREGS == 0x4138AE84);

const _: () = assert!(size_of::<KvmUserspaceMemoryRegion>() == 32);
const _: () = assert!(size_of::<Registers>() == 144);
const _: () = assert!(size_of::<Segment>() == 24);
const _: () = assert!(size_of::<DescriptorTable>() == 16);
const _: () = assert!(size_of::<SpecialRegisters>() == 312);
const _: () = assert!(offset_of!(KvmRun, exit_reason) == 8);
const _: () = assert!(offset_of!(KvmRun, exit) == 32);
const _: () = assert!(offset_of!(KvmRun, kvm_valid_regs) == 288);
const _: () = assert!(offset_of!(KvmRun, s) == 304);
const _: () = assert!(size_of::<KvmExitIo>() == 16);
const _: () = assert!(size_of::<KvmExitMmio>() == 24);
const _: () = assert!(size_of::<KvmExitInternal>() == 136);

/// Control requests issued to KVM.
///
/// Each entry maps to exactly one code from `linux/kvm.h`. The codes are derived with the `_IOC`
/// encoding (direction, `KVMIO` type, number and argument size).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Request {
    GetApiVersion,
    CreateVm,
    CheckExtension,
    GetVcpuMmapSize,
    CreateVcpu,
    SetUserMemoryRegion,
    Run,
    GetRegs,
    SetRegs,
    GetSregs,
    SetSregs,
}

impl Request {
    pub const fn code(self) -> c_ulong {
        match self {
            Self::GetApiVersion => KVM_GET_API_VERSION,
            Self::CreateVm => KVM_CREATE_VM,
            Self::CheckExtension => KVM_CHECK_EXTENSION,
            Self::GetVcpuMmapSize => KVM_GET_VCPU_MMAP_SIZE,
            Self::CreateVcpu => KVM_CREATE_VCPU,
            Self::SetUserMemoryRegion => KVM_SET_USER_MEMORY_REGION,
            Self::Run => KVM_RUN,
            Self::GetRegs => KVM_GET_REGS,
            Self::SetRegs => KVM_SET_REGS,
            Self::GetSregs => KVM_GET_SREGS,
            Self::SetSregs => KVM_SET_SREGS,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::GetApiVersion => "KVM_GET_API_VERSION",
            Self::CreateVm => "KVM_CREATE_VM",
            Self::CheckExtension => "KVM_CHECK_EXTENSION",
            Self::GetVcpuMmapSize => "KVM_GET_VCPU_MMAP_SIZE",
            Self::CreateVcpu => "KVM_CREATE_VCPU",
            Self::SetUserMemoryRegion => "KVM_SET_USER_MEMORY_REGION",
            Self::Run => "KVM_RUN",
            Self::GetRegs => "KVM_GET_REGS",
            Self::SetRegs => "KVM_SET_REGS",
            Self::GetSregs => "KVM_GET_SREGS",
            Self::SetSregs => "KVM_SET_SREGS",
        }
    }
}

impl Display for Request {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct KvmUserspaceMemoryRegion {
    pub slot: u32,
    pub flags: u32,
    pub guest_phys_addr: u64,
    pub memory_size: u64,
    pub userspace_addr: u64,
}

/// Layout of `kvm_run` on x86-64.
///
/// This type is never constructed. It only exists to derive the offsets of each field so the
/// mapped buffer can be accessed through bounds-checked copies.
#[repr(C)]
pub struct KvmRun {
    pub request_interrupt_window: u8,
    pub immediate_exit: u8,
    pub padding1: [u8; 6],

    pub exit_reason: u32,
    pub ready_for_interrupt_injection: u8,
    pub if_flag: u8,
    pub flags: u16,

    pub cr8: u64,
    pub apic_base: u64,
    pub exit: [u8; 256],

    pub kvm_valid_regs: u64,
    pub kvm_dirty_regs: u64,
    pub s: [u8; 2048],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct KvmExitUnknown {
    pub hardware_exit_reason: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct KvmExitException {
    pub exception: u32,
    pub error_code: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct KvmExitIo {
    pub direction: u8,
    pub size: u8,
    pub port: u16,
    pub count: u32,
    pub data_offset: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct KvmExitHypercall {
    pub nr: u64,
    pub args: [u64; 6],
    pub ret: u64,
    pub flags: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct KvmExitDebug {
    pub exception: u32,
    pub pad: u32,
    pub pc: u64,
    pub dr6: u64,
    pub dr7: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct KvmExitMmio {
    pub phys_addr: u64,
    pub data: [u8; 8],
    pub len: u32,
    pub is_write: u8,
    pub pad: [u8; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct KvmExitFailEntry {
    pub hardware_entry_failure_reason: u64,
    pub cpu: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct KvmExitTprAccess {
    pub rip: u64,
    pub is_write: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct KvmExitInternal {
    pub suberror: u32,
    pub ndata: u32,
    pub data: [u64; 16],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct KvmExitSystemEvent {
    pub ty: u32,
    pub ndata: u32,
    pub data: [u64; 16],
}
