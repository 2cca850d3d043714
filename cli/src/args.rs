// SPDX-License-Identifier: MIT OR Apache-2.0
use clap::{Args, Parser, Subcommand};
use kvm::log::Level;
use std::num::{NonZero, ParseIntError};
use std::path::PathBuf;

/// Program arguments parsed from command line.
#[derive(Parser)]
#[command(name = "barevm", about = "Run flat x86 machine code on KVM.")]
pub struct ProgramArgs {
    /// Minimum level of log entries to print (info, warn, error or panic).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    pub log_level: Level,

    /// Write a copy of the log to the specified file.
    #[arg(long, value_name = "PATH", global = true)]
    pub log: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Assemble 32-bit GNU assembler source into a flat binary.
    Build(BuildArgs),

    /// Run a program on a single vCPU until it halts.
    Run(RunArgs),
}

#[derive(Args)]
pub struct BuildArgs {
    /// Assembly source.
    pub input: PathBuf,

    /// Where to write the flat binary.
    pub output: PathBuf,
}

#[derive(Args)]
pub struct RunArgs {
    /// Treat the file as a flat binary instead of assembly source.
    #[arg(long)]
    pub bin: bool,

    /// Load the run profile from a YAML file.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Size of guest memory in bytes.
    #[arg(long, value_name = "BYTES", value_parser = parse_size)]
    pub memory: Option<NonZero<usize>>,

    /// Initial instruction pointer.
    #[arg(long, value_name = "ADDR", value_parser = parse_addr)]
    pub entry: Option<u64>,

    /// Program to run.
    pub file: PathBuf,
}

fn parse_addr(s: &str) -> Result<u64, ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(v) => u64::from_str_radix(v, 16),
        None => s.parse(),
    }
}

fn parse_size(s: &str) -> Result<NonZero<usize>, String> {
    let v = parse_addr(s).map_err(|e| e.to_string())?;

    usize::try_from(v)
        .ok()
        .and_then(NonZero::new)
        .ok_or_else(|| format!("{s} is not a valid size"))
}
