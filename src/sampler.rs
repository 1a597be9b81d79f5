//! Background thread that appends timeline frames of per-scope totals.

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::guard::RecursionGuard;
use crate::logsink::LogSink;
use crate::outfile::Outfile;
use crate::tracking::TrackingState;

/// Environment variable naming the timeline output file.
pub const OUTFILE_ENV: &str = "MEMSCOPETRACK_OUTFILE";

const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

pub struct SamplerConfig {
    /// Explicit timeline path; a random compressed file in the working
    /// directory when absent.
    pub outfile: Option<String>,
    /// Path of the co-installed plotting script, printed (never run) as the
    /// suggested next step once sampling ends.
    pub graph_script: PathBuf,
}

struct Shared {
    stopped: Mutex<bool>,
    wakeup: Condvar,
}

/// Handle to the sampling thread. Dropping it flips the stop flag, wakes
/// the thread out of its timed wait, and joins it; the thread emits one
/// final frame and finalizes the output file before exiting.
pub struct Sampler {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Sampler {
    /// Launch the sampling thread. Returns `None` (sampling disabled,
    /// tracking unaffected) if the thread cannot be spawned.
    pub(crate) fn spawn(
        tracking: Arc<TrackingState>,
        log: Arc<LogSink>,
        config: SamplerConfig,
    ) -> Option<Sampler> {
        let shared = Arc::new(Shared {
            stopped: Mutex::new(false),
            wakeup: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let thread_log = Arc::clone(&log);
        let spawned = thread::Builder::new()
            .name("mem-scope-track".into())
            .spawn(move || run(tracking, thread_log, thread_shared, config));
        match spawned {
            Ok(handle) => Some(Sampler {
                shared,
                handle: Some(handle),
            }),
            Err(err) => {
                log.log(format_args!("memory timeline disabled: {err}"));
                None
            }
        }
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        {
            let mut stopped = self
                .shared
                .stopped
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *stopped = true;
        }
        self.shared.wakeup.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(tracking: Arc<TrackingState>, log: Arc<LogSink>, shared: Arc<Shared>, config: SamplerConfig) {
    // The whole thread counts as tracker-internal: its allocations must not
    // feed back into the ledger it is observing.
    let _guard = RecursionGuard::new();

    let outfile = match &config.outfile {
        Some(path) => Outfile::create(path),
        None => Outfile::random(),
    };
    let mut outfile = match outfile {
        Ok(outfile) => outfile,
        Err(err) => {
            log.log(format_args!("memory timeline disabled: {err}"));
            return;
        }
    };
    let graph_cmd = format!(
        "python {} {}",
        config.graph_script.display(),
        outfile.filename()
    );

    let start = Instant::now();
    if let Err(err) = emit_frame(&mut outfile, &tracking, start) {
        log.log(format_args!("memory timeline write failed: {err}"));
    }
    loop {
        let stopped = {
            let guard = shared
                .stopped
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let (guard, _timeout) = shared
                .wakeup
                .wait_timeout_while(guard, SAMPLE_INTERVAL, |stopped| !*stopped)
                .unwrap_or_else(PoisonError::into_inner);
            *guard
        };
        if let Err(err) = emit_frame(&mut outfile, &tracking, start) {
            log.log(format_args!("memory timeline write failed: {err}"));
        }
        if stopped {
            break;
        }
    }

    if let Err(err) = outfile.finish() {
        log.log(format_args!("memory timeline not finalized: {err}"));
    }
    println!("{graph_cmd}");
}

fn emit_frame(outfile: &mut Outfile, tracking: &TrackingState, start: Instant) -> Result<()> {
    let extents = tracking.get_extents();
    writeln!(outfile, "---{}", start.elapsed().as_micros())?;
    for (scope, bytes) in &extents {
        writeln!(outfile, "{scope}|{bytes}")?;
    }
    Ok(())
}
