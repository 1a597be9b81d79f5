//! Diagnostic output, routed once at construction time.

use std::fmt;
use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};

use crate::outfile::Outfile;

/// Environment variable naming the diagnostic destination.
pub const LOGFILE_ENV: &str = "MEMSCOPETRACK_LOGFILE";

enum Destination {
    Discard,
    Stdout,
    Stderr,
    // Records can arrive from any thread that allocates.
    File(Mutex<Outfile>),
}

/// Formatted diagnostic sink selected from `MEMSCOPETRACK_LOGFILE`:
/// unset discards, `stdout`/`stderr` hit the standard streams, anything
/// else names a file (gzipped iff it ends in `.gz`).
pub struct LogSink {
    dest: Destination,
}

impl LogSink {
    pub fn from_env() -> LogSink {
        Self::from_destination(std::env::var(LOGFILE_ENV).ok().as_deref())
    }

    pub fn from_destination(dest: Option<&str>) -> LogSink {
        let dest = match dest {
            None => Destination::Discard,
            Some("stdout") => Destination::Stdout,
            Some("stderr") => Destination::Stderr,
            // An unopenable log file degrades to silence rather than
            // disturbing the host process.
            Some(path) => match Outfile::create(path) {
                Ok(file) => Destination::File(Mutex::new(file)),
                Err(_) => Destination::Discard,
            },
        };
        LogSink { dest }
    }

    pub fn discard() -> LogSink {
        LogSink {
            dest: Destination::Discard,
        }
    }

    /// Append one formatted record. Write failures are swallowed; losing a
    /// diagnostic must never disturb the allocator path.
    pub fn log(&self, record: fmt::Arguments) {
        match &self.dest {
            Destination::Discard => {}
            Destination::Stdout => {
                let mut out = io::stdout().lock();
                let _ = writeln!(out, "{record}");
            }
            Destination::Stderr => {
                let mut out = io::stderr().lock();
                let _ = writeln!(out, "{record}");
            }
            Destination::File(file) => {
                let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
                let _ = writeln!(file, "{record}");
            }
        }
    }

    /// Best-effort flush, used at process teardown.
    pub fn flush(&self) {
        if let Destination::File(file) = &self.dest {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn file_destination_appends_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diag.log");
        let path = path.to_str().unwrap();

        let sink = LogSink::from_destination(Some(path));
        sink.log(format_args!("tracking addr {:#x}", 0xdead_usize));
        sink.log(format_args!("release addr {:#x}", 0xdead_usize));
        sink.flush();

        let text = fs::read_to_string(path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.starts_with("tracking addr 0xdead\n"));
    }

    #[test]
    fn unset_destination_discards() {
        let sink = LogSink::from_destination(None);
        sink.log(format_args!("never seen"));
        sink.flush();
    }

    #[test]
    fn unopenable_file_degrades_to_discard() {
        let sink = LogSink::from_destination(Some("/nonexistent-dir/x/diag.log"));
        sink.log(format_args!("never seen"));
    }

    #[test]
    fn standard_streams_accept_records() {
        LogSink::from_destination(Some("stdout")).log(format_args!("to stdout"));
        LogSink::from_destination(Some("stderr")).log(format_args!("to stderr"));
    }
}
