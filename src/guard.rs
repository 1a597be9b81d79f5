//! Per-thread reentrancy detection for the allocator path.

use std::cell::Cell;

thread_local! {
    // Set while the current thread is anywhere inside the tracker.
    static IN_TRACKER: Cell<bool> = const { Cell::new(false) };
}

/// Scoped acquisition of the per-thread recursion flag.
///
/// Construction records whether the flag was already set (`reentered`) and
/// leaves it set; dropping the guard clears the flag only for the instance
/// that set it. Anything inside the tracker that may itself allocate (map
/// rehashing, string copies, stream buffering, thread spawn) must run with
/// a guard alive, so the nested allocator call sees `reentered == true` and
/// skips all tracker work instead of recursing.
///
/// Acquisition touches only a const-initialized thread-local `Cell`, so the
/// guard itself never allocates.
pub struct RecursionGuard {
    pub reentered: bool,
}

impl RecursionGuard {
    pub fn new() -> RecursionGuard {
        // Treat TLS errors during thread destruction as reentry: the thread
        // is past the point where tracking it would be safe.
        let reentered = IN_TRACKER.try_with(|flag| flag.replace(true)).unwrap_or(true);
        RecursionGuard { reentered }
    }
}

impl Drop for RecursionGuard {
    fn drop(&mut self) {
        if !self.reentered {
            let _ = IN_TRACKER.try_with(|flag| flag.set(false));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RecursionGuard;

    #[test]
    fn outermost_guard_owns_the_flag() {
        let outer = RecursionGuard::new();
        assert!(!outer.reentered);

        let inner = RecursionGuard::new();
        assert!(inner.reentered);
        drop(inner);

        // The nested guard must not have cleared the flag.
        assert!(RecursionGuard::new().reentered);
        drop(outer);

        assert!(!RecursionGuard::new().reentered);
    }

    #[test]
    fn guards_are_per_thread() {
        let _outer = RecursionGuard::new();
        std::thread::spawn(|| {
            assert!(!RecursionGuard::new().reentered);
        })
        .join()
        .unwrap();
    }
}
