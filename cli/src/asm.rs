// SPDX-License-Identifier: MIT OR Apache-2.0
use kvm::warn;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use thiserror::Error;
use uuid::Uuid;

/// Assembles 32-bit GNU assembler source into a flat binary that starts at `_start`.
///
/// This requires `as` and `ld` from GNU binutils.
pub fn assemble(src: &[u8]) -> Result<Vec<u8>, AsmError> {
    // Create a working directory.
    let dir = std::env::temp_dir().join(format!("barevm-{}", Uuid::new_v4()));

    if let Err(e) = std::fs::create_dir(&dir) {
        return Err(AsmError::CreateDirectory(dir, e));
    }

    let r = build(&dir, src);

    if let Err(e) = std::fs::remove_dir_all(&dir) {
        warn!(e, "Couldn't remove {}", dir.display());
    }

    r
}

fn build(dir: &Path, src: &[u8]) -> Result<Vec<u8>, AsmError> {
    // Assemble. The source is fed through stdin.
    let obj = dir.join("asm.o");
    let mut asm = Command::new("as")
        .args(["--32", "-o"])
        .arg(&obj)
        .arg("--")
        .stdin(Stdio::piped())
        .spawn()
        .map_err(|e| AsmError::Spawn("as", e))?;

    if let Some(mut stdin) = asm.stdin.take() {
        stdin.write_all(src).map_err(AsmError::WriteSource)?;
    }

    let status = asm.wait().map_err(|e| AsmError::Wait("as", e))?;

    if !status.success() {
        return Err(AsmError::Failed("as", status));
    }

    // Link.
    let bin = dir.join("asm.bin");
    let status = Command::new("ld")
        .args(["-m", "elf_i386", "--oformat=binary", "-e", "_start", "-o"])
        .arg(&bin)
        .arg(&obj)
        .status()
        .map_err(|e| AsmError::Spawn("ld", e))?;

    if !status.success() {
        return Err(AsmError::Failed("ld", status));
    }

    std::fs::read(&bin).map_err(|e| AsmError::ReadOutput(bin, e))
}

/// Represents an error when [`assemble()`] fails.
#[derive(Debug, Error)]
pub enum AsmError {
    #[error("couldn't create {0}")]
    CreateDirectory(PathBuf, #[source] std::io::Error),

    #[error("couldn't spawn {0}")]
    Spawn(&'static str, #[source] std::io::Error),

    #[error("couldn't write source to the assembler")]
    WriteSource(#[source] std::io::Error),

    #[error("couldn't wait for {0}")]
    Wait(&'static str, #[source] std::io::Error),

    #[error("{0} exited with {1}")]
    Failed(&'static str, ExitStatus),

    #[error("couldn't read {0}")]
    ReadOutput(PathBuf, #[source] std::io::Error),
}
