//! This memory scope tracker attributes every heap allocation of a process
//! to a caller-declared "scope" label and periodically records the per-scope
//! resident bytes to a timeline file for later visualization.  Typical use
//! is coarse phase labeling: a host declares `parsing`, `simulation`,
//! `reporting` and the timeline shows which phase owns the resident set at
//! every point of the run.
//!
//! Unlike heap profilers that sample call stacks, this tracker attributes
//! allocations to the labels the host chooses, which makes the output small
//! and directly meaningful to the application's own phase structure.
//!
//! ## Using `mem_scope_track` via `LD_PRELOAD`
//!
//! The companion `lib_mem_scope_track` crate builds a dynamic library that
//! interposes `malloc`, `free`, `calloc`, and `realloc` ahead of the system
//! allocator:
//!
//! ```bash
//! LD_PRELOAD=/usr/lib/libmem_scope_track.so ./my_program
//! ```
//!
//! Libraries loaded into the instrumented process label their phases with
//! [`set_scope`]; allocations made while the scope is empty are not
//! attributed.  On exit, scopes still holding bytes are reported as unfreed
//! memory.
//!
//! ## Output
//!
//! A background thread appends one frame roughly every 100 ms:
//!
//! ```text
//! ---<microseconds-since-start>
//! <scope>|<bytes>
//! <scope>|<bytes>
//! ```
//!
//! The file is gzip-compressed iff its name ends in `.gz`.  When sampling
//! ends, the command line for the co-installed plotting script is printed to
//! stdout; running it is left to the operator.
//!
//! ## Environment
//!
//! | Variable | Effect |
//! |---|---|
//! | `MEMSCOPETRACK_OUTFILE` | timeline path; unset picks `mem-scope-track.<random>.gz` in the working directory |
//! | `MEMSCOPETRACK_LOGFILE` | diagnostics to `stdout`, `stderr`, or a file; unset discards |
//!
//! `LD_PRELOAD` is read once to locate this library (and the plotting script
//! installed next to it), then unset so child processes run uninstrumented.

use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use libc::c_void;
use once_cell::sync::OnceCell;

mod bootstrap;
mod error;
mod guard;
mod hooks;
mod logsink;
mod outfile;
mod sampler;
mod tracking;

pub use crate::hooks::ScopeAllocator;

use crate::guard::RecursionGuard;
use crate::logsink::LogSink;
use crate::sampler::{SamplerConfig, OUTFILE_ENV};
use crate::tracking::Tracking;

const PRELOAD_ENV: &str = "LD_PRELOAD";

// Guards all ledger access: false before init, true while tracking, false
// again once teardown begins so late allocator calls pass through.
static TRACKING_ENABLED: AtomicBool = AtomicBool::new(false);

// The process-wide current scope. A coarse label; overlapping writers race
// for the final value.
static SCOPE: Mutex<String> = Mutex::new(String::new());

static STATE: OnceCell<TrackerState> = OnceCell::new();

struct TrackerState {
    log: Arc<LogSink>,
    tracking: Tracking,
}

/// Install `scope` as the process-wide label for subsequent allocations on
/// every thread. The empty string turns attribution off.
pub fn set_scope(scope: &str) {
    let _guard = RecursionGuard::new();
    let mut current = SCOPE.lock().unwrap_or_else(PoisonError::into_inner);
    current.clear();
    current.push_str(scope);
}

/// Record a successful allocation at `addr`. Called from the intercepting
/// entry points; skips entirely on reentry or while tracking is disabled,
/// and only attributes when the current scope is non-empty.
pub fn track(addr: *mut c_void, size: usize) {
    let guard = RecursionGuard::new();
    if guard.reentered || !TRACKING_ENABLED.load(Ordering::Acquire) {
        return;
    }
    let Some(state) = STATE.get() else { return };
    let scope = current_scope();
    state.log.log(format_args!(
        "tracking addr {:#x} with size {:8} bytes in scope {}",
        addr as usize, size, scope
    ));
    if !scope.is_empty() {
        state.tracking.add(addr as usize, &scope, size);
    }
}

/// Record the free of `addr`. Unknown addresses (pre-init allocations,
/// other allocators) are silently ignored by the ledger.
pub fn release(addr: *mut c_void) {
    let guard = RecursionGuard::new();
    if guard.reentered || !TRACKING_ENABLED.load(Ordering::Acquire) {
        return;
    }
    let Some(state) = STATE.get() else { return };
    state
        .log
        .log(format_args!("release addr {:#x}", addr as usize));
    state.tracking.remove(addr as usize);
}

/// Resolve the downstream allocator and start tracking. Idempotent; invoked
/// automatically by the first intercepted allocator call. Aborts the
/// process when the preload environment is missing or a required symbol
/// cannot be resolved.
pub fn init() {
    hooks::ensure_init();
}

fn current_scope() -> String {
    SCOPE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

// Runs inside `ensure_init`, after symbol resolution: every allocation made
// here already forwards to the real allocator, and nothing is tracked until
// the enabled flag flips at the end.
pub(crate) fn init_runtime() {
    let preload = match env::var(PRELOAD_ENV) {
        Ok(value) => value,
        Err(_) => hooks::die(
            "mem-scope-track: LD_PRELOAD not set; cannot locate the library or its plotting script\n",
        ),
    };
    let mut graph_script = library_path(&preload);
    graph_script.pop();
    graph_script.push("python");
    graph_script.push("timeline.py");
    // Children of the instrumented process run uninstrumented.
    env::remove_var(PRELOAD_ENV);

    let log = Arc::new(LogSink::from_env());
    let tracking = Tracking::new(Arc::clone(&log));
    tracking.start(SamplerConfig {
        outfile: env::var(OUTFILE_ENV).ok(),
        graph_script,
    });

    if STATE.set(TrackerState { log, tracking }).is_err() {
        return;
    }
    unsafe {
        libc::atexit(teardown);
    }
    TRACKING_ENABLED.store(true, Ordering::Release);
}

// Registered with atexit: disable tracking before tearing anything down so
// allocator calls from other exit handlers become pass-through.
extern "C" fn teardown() {
    TRACKING_ENABLED.store(false, Ordering::Release);
    if let Some(state) = STATE.get() {
        state.tracking.shutdown();
        state.log.flush();
    }
}

// LD_PRELOAD may list several objects separated by colons or spaces; ours
// is the one carrying this crate's name.
fn library_path(preload: &str) -> PathBuf {
    let mut first = None;
    for entry in preload.split([':', ' ']).filter(|s| !s.is_empty()) {
        if entry.contains("mem_scope_track") {
            return PathBuf::from(entry);
        }
        first.get_or_insert(entry);
    }
    PathBuf::from(first.unwrap_or_default())
}
