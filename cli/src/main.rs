// SPDX-License-Identifier: MIT OR Apache-2.0
use self::args::{BuildArgs, Command, ProgramArgs, RunArgs};
use self::asm::{AsmError, assemble};
use self::console::{Console, TOGGLE_SIGNAL};
use self::profile::{Profile, ProfileError};
use clap::Parser;
use erdp::ErrorDisplay;
use kvm::{
    ExitEvent, GuestMemory, KvmError, MemoryError, RunError, RunLoop, Terminal, Vm, error, info,
};
use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;
use thiserror::Error;

mod args;
mod asm;
mod console;
mod profile;

fn main() -> ExitCode {
    let args = ProgramArgs::parse();

    // Setup logger.
    kvm::log::init(args.log_level);

    if let Some(path) = &args.log {
        let file = match File::create(path) {
            Ok(v) => v,
            Err(e) => {
                error!(e, "Couldn't create {}", path.display());
                return ExitCode::FAILURE;
            }
        };

        if let Some(l) = kvm::log::LOGGER.get() {
            l.set_file(file);
        }
    }

    // Run.
    let r = match args.command {
        Command::Build(v) => build(v),
        Command::Run(v) => run(v),
    };

    match r {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.display());
            ExitCode::FAILURE
        }
    }
}

fn build(args: BuildArgs) -> Result<(), ProgramError> {
    let src = std::fs::read(&args.input).map_err(|e| ProgramError::ReadFile(args.input, e))?;
    let bin = assemble(&src).map_err(ProgramError::Assemble)?;

    std::fs::write(&args.output, bin).map_err(|e| ProgramError::WriteFile(args.output, e))
}

fn run(args: RunArgs) -> Result<(), ProgramError> {
    // Load profile.
    let mut profile = match &args.config {
        Some(v) => Profile::load(v).map_err(ProgramError::LoadProfile)?,
        None => Profile::default(),
    };

    if let Some(v) = args.memory {
        profile.memory_size = v;
    }

    if let Some(v) = args.entry {
        profile.entry = v;
    }

    // Load program.
    let data = std::fs::read(&args.file).map_err(|e| ProgramError::ReadFile(args.file, e))?;
    let image = if args.bin {
        data
    } else {
        assemble(&data).map_err(ProgramError::Assemble)?
    };

    // This must be done before spawning any thread.
    let console = Console::new().map_err(ProgramError::SetupConsole)?;

    // Setup VM.
    let vm = Vm::new().map_err(ProgramError::CreateVm)?;
    let off = profile
        .load_offset()
        .ok_or(ProgramError::LoadAddress(profile.load_address))?;
    let mem = GuestMemory::with_data(profile.memory_size, off, &image)
        .map_err(ProgramError::LoadImage)?;

    vm.map_user_memory(0, profile.memory_flags(), profile.memory_base, mem)
        .map_err(ProgramError::MapMemory)?;

    // Setup vCPU.
    let mut cpu = vm.create_vcpu(0).map_err(ProgramError::CreateVcpu)?;
    let mut regs = cpu.get_registers().map_err(ProgramError::GetRegisters)?;
    let mut sregs = cpu.get_sregisters().map_err(ProgramError::GetRegisters)?;

    profile.apply(&mut regs, &mut sregs);

    cpu.set_registers(&regs)
        .map_err(ProgramError::SetRegisters)?;
    cpu.set_sregisters(&sregs)
        .map_err(ProgramError::SetRegisters)?;

    // Run.
    let rl = RunLoop::spawn(cpu, |e: &ExitEvent| {
        if let ExitEvent::Io(io) = e {
            println!("IO: {io}");
        }
    })
    .map_err(ProgramError::SpawnVcpu)?;

    console
        .attach(rl.handle().clone())
        .map_err(ProgramError::SetupConsole)?;

    info!(
        "Send signal {} to process {} to pause or resume the vCPU.",
        TOGGLE_SIGNAL,
        std::process::id()
    );

    match rl.join().1.map_err(ProgramError::Run)? {
        Terminal::Halted => println!("Halted"),
        Terminal::ShutdownObserved => println!("Shutdown"),
        Terminal::Cancelled => println!("Cancelled"),
    }

    Ok(())
}

/// Represents an error when our program fails.
#[derive(Debug, Error)]
enum ProgramError {
    #[error("couldn't read {0}")]
    ReadFile(PathBuf, #[source] std::io::Error),

    #[error("couldn't write {0}")]
    WriteFile(PathBuf, #[source] std::io::Error),

    #[error("couldn't assemble the program")]
    Assemble(#[source] AsmError),

    #[error("couldn't load profile")]
    LoadProfile(#[source] ProfileError),

    #[error("couldn't setup console")]
    SetupConsole(#[source] std::io::Error),

    #[error("couldn't create VM")]
    CreateVm(#[source] KvmError),

    #[error("load address {0:#x} is below the guest memory")]
    LoadAddress(u64),

    #[error("couldn't load the program into guest memory")]
    LoadImage(#[source] MemoryError),

    #[error("couldn't map guest memory")]
    MapMemory(#[source] KvmError),

    #[error("couldn't create vCPU")]
    CreateVcpu(#[source] KvmError),

    #[error("couldn't get vCPU registers")]
    GetRegisters(#[source] KvmError),

    #[error("couldn't set vCPU registers")]
    SetRegisters(#[source] KvmError),

    #[error("couldn't spawn vCPU thread")]
    SpawnVcpu(#[source] std::io::Error),

    #[error("vCPU stopped abnormally")]
    Run(#[source] RunError),
}
