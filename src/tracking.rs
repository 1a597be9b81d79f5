//! The allocation ledger: live addresses and per-scope totals.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::logsink::LogSink;
use crate::sampler::{Sampler, SamplerConfig};

#[derive(Default)]
struct Maps {
    by_addr: HashMap<usize, (String, usize)>,
    by_scope: HashMap<String, usize>,
}

/// The maps shared with the sampler thread. Both maps live under one mutex;
/// every address entry contributes exactly its recorded size to exactly one
/// scope total.
pub(crate) struct TrackingState {
    maps: Mutex<Maps>,
}

impl TrackingState {
    fn new() -> TrackingState {
        TrackingState {
            maps: Mutex::new(Maps::default()),
        }
    }

    /// Copy of the per-scope totals. The copy keeps the lock hold time
    /// short and isolates the caller from further mutation.
    pub(crate) fn get_extents(&self) -> HashMap<String, usize> {
        self.lock().by_scope.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Maps> {
        self.maps.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Process-wide record of live allocations, their scopes, and per-scope
/// byte totals, plus the sampler that periodically snapshots the totals.
pub struct Tracking {
    state: Arc<TrackingState>,
    log: Arc<LogSink>,
    sampler: Mutex<Option<Sampler>>,
    finished: AtomicBool,
}

impl Tracking {
    pub fn new(log: Arc<LogSink>) -> Tracking {
        Tracking {
            state: Arc::new(TrackingState::new()),
            log,
            sampler: Mutex::new(None),
            finished: AtomicBool::new(false),
        }
    }

    /// Start writing timeline frames in the background.
    pub fn start(&self, config: SamplerConfig) {
        let sampler = Sampler::spawn(
            Arc::clone(&self.state),
            Arc::clone(&self.log),
            config,
        );
        *self.sampler_slot() = sampler;
    }

    /// Stop and join the sampler, if one is running.
    pub fn stop(&self) {
        let sampler = self.sampler_slot().take();
        drop(sampler);
    }

    /// Record a live allocation. A duplicate address is an anomaly: it is
    /// logged with the previous and new `(scope, size)` and the ledger is
    /// left untouched.
    pub fn add(&self, addr: usize, scope: &str, size: usize) {
        let duplicate = {
            let mut maps = self.state.lock();
            let Maps { by_addr, by_scope } = &mut *maps;
            match by_addr.entry(addr) {
                Entry::Occupied(existing) => Some(existing.get().clone()),
                Entry::Vacant(slot) => {
                    *by_scope.entry(scope.to_owned()).or_insert(0) += size;
                    slot.insert((scope.to_owned(), size));
                    None
                }
            }
        };
        if let Some((kept_scope, kept_size)) = duplicate {
            self.log.log(format_args!(
                "duplicate memory address {addr:#x}: kept {kept_scope} ({kept_size} bytes), \
                 ignored {scope} ({size} bytes)"
            ));
        }
    }

    /// Forget a live allocation. Unknown addresses are silent: frees of
    /// pre-init allocations and of memory from other allocators land here.
    /// The scope entry survives at zero so the timeline shows the scope
    /// returning to baseline.
    pub fn remove(&self, addr: usize) {
        let mut maps = self.state.lock();
        let Maps { by_addr, by_scope } = &mut *maps;
        if let Some((scope, size)) = by_addr.remove(&addr) {
            if let Some(total) = by_scope.get_mut(&scope) {
                *total = total.saturating_sub(size);
            }
        }
    }

    pub fn get_extents(&self) -> HashMap<String, usize> {
        self.state.get_extents()
    }

    /// Stop the sampler, then report every scope still holding bytes.
    /// Runs at most once; `Drop` funnels here as well.
    pub fn shutdown(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop();

        let extents = self.state.get_extents();
        let mut leaked: Vec<(&String, &usize)> =
            extents.iter().filter(|(_, &bytes)| bytes != 0).collect();
        if leaked.is_empty() {
            return;
        }
        leaked.sort();
        self.log.log(format_args!("Unfreed memory:"));
        for (scope, bytes) in leaked {
            self.log.log(format_args!("  {scope} - {bytes}"));
        }
    }

    fn sampler_slot(&self) -> MutexGuard<'_, Option<Sampler>> {
        self.sampler.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Tracking {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn tracking() -> Tracking {
        Tracking::new(Arc::new(LogSink::discard()))
    }

    #[test]
    fn matched_free_leaves_scope_at_zero() {
        let map = tracking();
        map.add(0x1000, "A", 100);
        assert_eq!(map.get_extents()["A"], 100);

        map.remove(0x1000);
        // The entry is retained at zero, not erased.
        assert_eq!(map.get_extents()["A"], 0);
    }

    #[test]
    fn free_is_attributed_to_the_scope_at_allocation_time() {
        let map = tracking();
        map.add(0x10, "A", 10);
        map.add(0x20, "B", 20);

        map.remove(0x10);
        let extents = map.get_extents();
        assert_eq!(extents["A"], 0);
        assert_eq!(extents["B"], 20);

        map.remove(0x20);
        assert_eq!(map.get_extents()["B"], 0);
    }

    #[test]
    fn duplicate_add_is_logged_and_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diag.log");
        let path = path.to_str().unwrap();

        let log = Arc::new(LogSink::from_destination(Some(path)));
        let map = Tracking::new(Arc::clone(&log));
        map.add(0xa0, "A", 10);
        map.add(0xa0, "B", 20);

        let extents = map.get_extents();
        assert_eq!(extents["A"], 10);
        assert!(!extents.contains_key("B"));

        log.flush();
        let text = fs::read_to_string(path).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains("duplicate memory address 0xa0"));
        assert!(text.contains("kept A (10 bytes)"));
    }

    #[test]
    fn unknown_remove_is_silent() {
        let map = tracking();
        map.add(0x1, "A", 5);
        map.remove(0xdead);
        assert_eq!(map.get_extents()["A"], 5);
    }

    #[test]
    fn zero_size_allocations_are_matched() {
        let map = tracking();
        map.add(0x2, "A", 0);
        assert_eq!(map.get_extents()["A"], 0);
        map.remove(0x2);
        assert_eq!(map.get_extents()["A"], 0);
        // The address entry is gone, so a re-add is not a duplicate.
        map.add(0x2, "A", 7);
        assert_eq!(map.get_extents()["A"], 7);
    }

    #[test]
    fn first_allocation_initializes_the_total_to_its_size() {
        let map = tracking();
        map.add(0x3, "fresh", 17);
        assert_eq!(map.get_extents()["fresh"], 17);
    }

    #[test]
    fn totals_never_underflow() {
        let map = tracking();
        map.add(0x10, "A", 10);
        map.add(0x20, "A", 30);
        map.remove(0x20);
        map.remove(0x10);
        map.remove(0x10);
        assert_eq!(map.get_extents()["A"], 0);
    }

    #[test]
    fn concurrent_cycles_settle_at_zero() {
        let map = Arc::new(tracking());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    let scope = format!("T{t}");
                    for i in 0..1000 {
                        let addr = (t + 1) * 0x100_0000 + i;
                        map.add(addr, &scope, 64);
                        map.remove(addr);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let extents = map.get_extents();
        assert_eq!(extents.len(), 8);
        assert!(extents.values().all(|&bytes| bytes == 0));
    }

    #[test]
    fn shutdown_reports_each_leaking_scope_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diag.log");
        let path = path.to_str().unwrap();

        let log = Arc::new(LogSink::from_destination(Some(path)));
        let map = Tracking::new(Arc::clone(&log));
        map.add(0x10, "main", 40);
        map.add(0x20, "two", 9);
        map.add(0x30, "done", 8);
        map.remove(0x30);

        map.shutdown();
        // Drop also funnels into shutdown; the report must not repeat.
        drop(map);

        log.flush();
        let text = fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, ["Unfreed memory:", "  main - 40", "  two - 9"]);
    }

    #[test]
    fn clean_shutdown_reports_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diag.log");
        let path = path.to_str().unwrap();

        let log = Arc::new(LogSink::from_destination(Some(path)));
        let map = Tracking::new(Arc::clone(&log));
        map.add(0x10, "main", 40);
        map.remove(0x10);
        map.shutdown();

        log.flush();
        assert_eq!(fs::read_to_string(path).unwrap(), "");
    }
}
