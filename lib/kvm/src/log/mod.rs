// SPDX-License-Identifier: MIT OR Apache-2.0
pub use self::entry::*;
pub use termcolor::{Color, ColorSpec};

use std::fs::File;
use std::io::Write;
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;
use termcolor::{BufferWriter, ColorChoice};
use thiserror::Error;

mod entry;
mod macros;

/// A logger used by [`crate::info!`], [`crate::warn!`] and [`crate::error!`].
///
/// Nothing is logged until [`init()`] is called so the library stays silent when embedded.
pub static LOGGER: OnceLock<Logger> = OnceLock::new();

/// # Panics
/// If called a second time.
pub fn init(level: Level) {
    // Setup global instance.
    let l = Logger {
        stderr: BufferWriter::stderr(ColorChoice::Auto),
        file: Mutex::new(None),
        start: Instant::now(),
        level,
    };

    if LOGGER.set(l).is_err() {
        panic!("logger already initialized");
    }

    // SAFETY: This is safe because we just set the value on the above.
    let l = unsafe { LOGGER.get().unwrap_unchecked() };

    std::panic::set_hook(Box::new(|i| {
        let loc = i.location();
        let mut e = l.entry(
            Level::Panic,
            loc.map_or("<unknown>", |l| l.file()),
            loc.map_or(0, |l| l.line()),
        );

        if let Some(&p) = i.payload().downcast_ref::<&str>() {
            writeln!(e, "{p}").unwrap();
        } else if let Some(p) = i.payload().downcast_ref::<String>() {
            writeln!(e, "{p}").unwrap();
        } else {
            writeln!(e, "Don't know how to print the panic payload.").unwrap();
        }

        l.write(e);
    }));
}

/// Logger for the hypervisor.
///
/// Entries go to stderr so the guest output on stdout stays clean. A copy without colors can be
/// written to a file with [`Logger::set_file()`].
#[derive(Debug)]
pub struct Logger {
    stderr: BufferWriter,
    file: Mutex<Option<File>>,
    start: Instant,
    level: Level,
}

impl Logger {
    pub fn set_file(&self, file: File) {
        *self.file.lock().unwrap() = Some(file);
    }

    pub fn enabled(&self, level: Level) -> bool {
        level >= self.level
    }

    pub fn entry(&self, level: Level, file: &str, line: u32) -> LogEntry {
        let time = self.start.elapsed();

        LogEntry::new(self.stderr.buffer(), level, time, file, line)
    }

    pub fn write(&self, e: LogEntry) {
        let (colored, plain) = e.into_raw();

        self.stderr.print(&colored).unwrap();

        if let Some(f) = self.file.lock().unwrap().as_mut() {
            f.write_all(&plain).unwrap();
        }
    }
}

/// Severity of a log entry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    #[default]
    Info,
    Warn,
    Error,
    Panic,
}

impl Level {
    fn category(self) -> char {
        match self {
            Self::Info => 'I',
            Self::Warn => 'W',
            Self::Error => 'E',
            Self::Panic => 'P',
        }
    }

    fn color(self) -> ColorSpec {
        let mut c = ColorSpec::new();
        let fg = match self {
            Self::Info => Color::Cyan,
            Self::Warn => Color::Yellow,
            Self::Error => Color::Red,
            Self::Panic => Color::Magenta,
        };

        c.set_fg(Some(fg)).set_bold(true);
        c
    }
}

impl FromStr for Level {
    type Err = UnknownLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "panic" => Ok(Self::Panic),
            v => Err(UnknownLevel(v.into())),
        }
    }
}

/// Represents an error when parsing [`Level`] fails.
#[derive(Debug, Error)]
#[error("unknown log level '{0}'")]
pub struct UnknownLevel(String);
