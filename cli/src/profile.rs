// SPDX-License-Identifier: MIT OR Apache-2.0
use kvm::{MemoryFlags, Registers, SpecialRegisters};
use serde::Deserialize;
use std::fs::File;
use std::num::NonZero;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Contains settings to set up the VM and its only vCPU.
///
/// The defaults boot flat code at address zero in real mode with 1 GiB of memory.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Profile {
    pub memory_size: NonZero<usize>,
    pub memory_base: u64,
    pub read_only: bool,
    pub log_dirty_pages: bool,
    pub load_address: u64,
    pub entry: u64,
    pub stack: u64,
    pub rflags: u64,
    pub registers: RegisterOverrides,
    pub code_segment: CodeSegment,
}

impl Profile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProfileError> {
        let path = path.as_ref();
        let file = match File::open(path) {
            Ok(v) => v,
            Err(e) => return Err(ProfileError::OpenFile(path.into(), e)),
        };

        match serde_yaml::from_reader(file) {
            Ok(v) => Ok(v),
            Err(e) => Err(ProfileError::ReadProfile(path.into(), e)),
        }
    }

    pub fn memory_flags(&self) -> MemoryFlags {
        let mut flags = MemoryFlags::empty();

        flags.set(MemoryFlags::READONLY, self.read_only);
        flags.set(MemoryFlags::LOG_DIRTY_PAGES, self.log_dirty_pages);
        flags
    }

    /// Returns offset of [`Self::load_address`] within the guest memory.
    pub fn load_offset(&self) -> Option<usize> {
        self.load_address
            .checked_sub(self.memory_base)
            .and_then(|v| usize::try_from(v).ok())
    }

    pub fn apply(&self, regs: &mut Registers, sregs: &mut SpecialRegisters) {
        regs.rip = self.entry;
        regs.rsp = self.stack;
        regs.rflags = self.rflags;

        self.registers.apply(regs);

        sregs.cs.base = self.code_segment.base;
        sregs.cs.selector = self.code_segment.selector;
    }
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            memory_size: NonZero::new(0x40000000).unwrap(),
            memory_base: 0,
            read_only: false,
            log_dirty_pages: false,
            load_address: 0,
            entry: 0,
            stack: 0x200000,
            rflags: 0x2,
            registers: RegisterOverrides {
                rax: Some(2),
                rbx: Some(2),
                ..Default::default()
            },
            code_segment: CodeSegment::default(),
        }
    }
}

/// General purpose registers to set before the first run. Missing values keep what KVM reports.
#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RegisterOverrides {
    pub rax: Option<u64>,
    pub rbx: Option<u64>,
    pub rcx: Option<u64>,
    pub rdx: Option<u64>,
    pub rsi: Option<u64>,
    pub rdi: Option<u64>,
    pub rbp: Option<u64>,
    pub r8: Option<u64>,
    pub r9: Option<u64>,
    pub r10: Option<u64>,
    pub r11: Option<u64>,
    pub r12: Option<u64>,
    pub r13: Option<u64>,
    pub r14: Option<u64>,
    pub r15: Option<u64>,
}

impl RegisterOverrides {
    fn apply(&self, regs: &mut Registers) {
        let pairs = [
            (self.rax, &mut regs.rax),
            (self.rbx, &mut regs.rbx),
            (self.rcx, &mut regs.rcx),
            (self.rdx, &mut regs.rdx),
            (self.rsi, &mut regs.rsi),
            (self.rdi, &mut regs.rdi),
            (self.rbp, &mut regs.rbp),
            (self.r8, &mut regs.r8),
            (self.r9, &mut regs.r9),
            (self.r10, &mut regs.r10),
            (self.r11, &mut regs.r11),
            (self.r12, &mut regs.r12),
            (self.r13, &mut regs.r13),
            (self.r14, &mut regs.r14),
            (self.r15, &mut regs.r15),
        ];

        for (v, r) in pairs {
            if let Some(v) = v {
                *r = v;
            }
        }
    }
}

/// Cached base and selector of CS.
#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CodeSegment {
    pub base: u64,
    pub selector: u16,
}

/// Represents an error when [`Profile::load()`] fails.
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("couldn't open {0}")]
    OpenFile(PathBuf, #[source] std::io::Error),

    #[error("couldn't read {0}")]
    ReadProfile(PathBuf, #[source] serde_yaml::Error),
}
