//! Interception of the C allocator entry points.
//!
//! Each entry point forwards through a slot holding the next definition of
//! the symbol in the loader's search chain, resolved on first use. The
//! calloc slot starts out pointing at the bootstrap arena because the
//! resolver itself calls `calloc` on some platforms.

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use libc::{c_char, c_void, size_t};

use crate::bootstrap;

type MallocFn = unsafe extern "C" fn(size_t) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type CallocFn = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void;

// Resolved "next" definitions, written during init and read unsynchronized
// afterwards (published by the init-state flag).
static REAL_MALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_FREE: AtomicUsize = AtomicUsize::new(0);
static REAL_CALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_REALLOC: AtomicUsize = AtomicUsize::new(0);

const UNINITIALIZED: usize = 0;
const INITIALIZING: usize = 1;
const READY: usize = 2;
static INIT_STATE: AtomicUsize = AtomicUsize::new(UNINITIALIZED);

/// Write a static diagnostic to stderr and abort. Formatting machinery may
/// allocate, so fatal paths stick to `libc::write`.
pub(crate) fn die(msg: &str) -> ! {
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            msg.as_ptr() as *const c_void,
            msg.len() as size_t,
        );
        libc::abort();
    }
}

unsafe fn resolve_next(symbol: &'static [u8], fail_msg: &'static str) -> usize {
    let addr = libc::dlsym(libc::RTLD_NEXT, symbol.as_ptr() as *const c_char);
    if addr.is_null() {
        die(fail_msg);
    }
    addr as usize
}

/// Resolve the downstream allocator and bring the tracking runtime up.
/// Idempotent; the losing side of the race (including reentrant calls made
/// by the resolver itself) falls back to the bootstrap arena until the
/// winning thread finishes.
pub(crate) fn ensure_init() {
    if INIT_STATE
        .compare_exchange(
            UNINITIALIZED,
            INITIALIZING,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_err()
    {
        return;
    }

    unsafe {
        // dlsym may itself call calloc; give it the arena until the real
        // symbol is known.
        REAL_CALLOC.store(bootstrap::calloc as usize, Ordering::Release);
        REAL_MALLOC.store(
            resolve_next(b"malloc\0", "mem-scope-track: could not resolve next `malloc`\n"),
            Ordering::Release,
        );
        REAL_FREE.store(
            resolve_next(b"free\0", "mem-scope-track: could not resolve next `free`\n"),
            Ordering::Release,
        );
        REAL_REALLOC.store(
            resolve_next(b"realloc\0", "mem-scope-track: could not resolve next `realloc`\n"),
            Ordering::Release,
        );
        REAL_CALLOC.store(
            resolve_next(b"calloc\0", "mem-scope-track: could not resolve next `calloc`\n"),
            Ordering::Release,
        );
    }

    crate::init_runtime();
    INIT_STATE.store(READY, Ordering::Release);
}

/// The intercepting allocator entry points, exported with their C names by
/// the preload shim crate.
pub struct ScopeAllocator;

impl ScopeAllocator {
    /// # Safety
    ///
    /// Same contract as C `malloc`.
    pub unsafe fn malloc(size: size_t) -> *mut c_void {
        if REAL_MALLOC.load(Ordering::Acquire) == 0 {
            ensure_init();
        }
        let slot = REAL_MALLOC.load(Ordering::Acquire);
        if slot == 0 {
            // Resolution is still in flight on this or another thread.
            return bootstrap::alloc(size as usize);
        }
        let real: MallocFn = mem::transmute(slot);
        let ptr = real(size);
        if !ptr.is_null() {
            crate::track(ptr, size as usize);
        }
        ptr
    }

    /// # Safety
    ///
    /// Same contract as C `free`.
    pub unsafe fn free(ptr: *mut c_void) {
        if ptr.is_null() {
            return;
        }
        // Arena memory predates the real allocator and is never reclaimed.
        if bootstrap::contains(ptr) {
            return;
        }
        if REAL_FREE.load(Ordering::Acquire) == 0 {
            ensure_init();
        }
        let slot = REAL_FREE.load(Ordering::Acquire);
        if slot == 0 {
            return;
        }
        // Release before forwarding: once the block is back in the free
        // pool another thread may be handed the same address.
        crate::release(ptr);
        let real: FreeFn = mem::transmute(slot);
        real(ptr);
    }

    /// # Safety
    ///
    /// Same contract as C `calloc`.
    pub unsafe fn calloc(num: size_t, size: size_t) -> *mut c_void {
        if REAL_CALLOC.load(Ordering::Acquire) == 0 {
            ensure_init();
        }
        let slot = REAL_CALLOC.load(Ordering::Acquire);
        if slot == 0 {
            return bootstrap::calloc(num, size);
        }
        let real: CallocFn = mem::transmute(slot);
        let ptr = real(num, size);
        if !ptr.is_null() {
            crate::track(ptr, (num as usize).saturating_mul(size as usize));
        }
        ptr
    }

    /// # Safety
    ///
    /// Same contract as C `realloc`.
    pub unsafe fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
        if REAL_REALLOC.load(Ordering::Acquire) == 0 {
            ensure_init();
        }
        let slot = REAL_REALLOC.load(Ordering::Acquire);
        if slot == 0 {
            if ptr.is_null() {
                return bootstrap::alloc(size as usize);
            }
            die("mem-scope-track: realloc before symbol resolution\n");
        }
        let real: ReallocFn = mem::transmute(slot);

        if bootstrap::contains(ptr) {
            // Migrate an arena block onto the real heap. The original size
            // is unknown; copying up to the end of the arena covers it.
            let fresh = real(ptr::null_mut(), size);
            if !fresh.is_null() {
                let copy = (size as usize).min(bootstrap::tail_len(ptr));
                ptr::copy_nonoverlapping(ptr as *const u8, fresh as *mut u8, copy);
                crate::track(fresh, size as usize);
            }
            return fresh;
        }

        let fresh = real(ptr, size);
        if fresh.is_null() {
            // A failed grow leaves the old block live; a shrink to zero
            // frees it.
            if size == 0 && !ptr.is_null() {
                crate::release(ptr);
            }
            return fresh;
        }
        if !ptr.is_null() {
            crate::release(ptr);
        }
        crate::track(fresh, size as usize);
        fresh
    }
}
