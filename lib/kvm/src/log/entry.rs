// SPDX-License-Identifier: MIT OR Apache-2.0
use super::Level;
use std::error::Error;
use std::io::Write;
use std::time::Duration;
use termcolor::{Buffer, WriteColor};

/// An entry to log.
///
/// Everything is written twice: once with colors for the terminal and once as plain text for the
/// log file.
pub struct LogEntry {
    colored: Buffer,
    plain: Vec<u8>,
}

impl LogEntry {
    pub(super) fn new(
        colored: Buffer,
        level: Level,
        time: Duration,
        file: &str,
        line: u32,
    ) -> Self {
        let mut e = Self {
            colored,
            plain: Vec::new(),
        };

        // Write head. The message follows on the same line.
        let thread = std::thread::current();
        let thread = match thread.name() {
            Some(v) => v.to_owned(),
            None => format!("{}", unsafe { libc::gettid() }),
        };

        let secs = time.as_secs();
        let head = format!(
            "[{} {:02}:{:02}:{:02}.{:03} {} {}:{}]",
            level.category(),
            secs / 3600,
            (secs % 3600) / 60,
            secs % 60,
            time.subsec_millis(),
            thread,
            file,
            line
        );

        e.colored.set_color(&level.color()).unwrap();
        e.colored.write_all(head.as_bytes()).unwrap();
        e.colored.reset().unwrap();
        e.colored.write_all(b" ").unwrap();

        e.plain.extend_from_slice(head.as_bytes());
        e.plain.push(b' ');

        e
    }

    /// Writes `err` followed by all of its sources and ends the entry.
    pub fn write_chain<E: Error + ?Sized>(&mut self, err: &E) {
        write!(self, ": {err}").unwrap();

        let mut i = err.source();

        while let Some(v) = i {
            write!(self, " -> {v}").unwrap();
            i = v.source();
        }

        writeln!(self, ".").unwrap();
    }

    pub fn into_raw(self) -> (Buffer, Vec<u8>) {
        (self.colored, self.plain)
    }
}

impl Write for LogEntry {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.colored.write_all(buf)?;
        self.plain.extend_from_slice(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.colored.flush()
    }
}
