//! Companion crate to `mem_scope_track`.  This crate compiles into a dynamic
//! library that can be loaded via `LD_PRELOAD` to interpose the C allocator
//! entry points and attribute every allocation to the current scope.
//!
//! Instrumented C code declares the scope entry point itself:
//!
//! ```c
//! extern void mst_set_scope(const char* scope);
//! ```

use std::ffi::CStr;

use libc::{c_char, c_void, size_t};
use mem_scope_track::ScopeAllocator;

/// When this library is loaded with `LD_PRELOAD`, this `malloc` catches the
/// program's allocations, forwards them to the next `malloc` in the loader's
/// search chain, and records the result against the current scope.
///
/// # Safety
///
/// Same contract as C `malloc`.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    ScopeAllocator::malloc(size)
}

/// # Safety
///
/// Same contract as C `free`.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    ScopeAllocator::free(ptr)
}

/// # Safety
///
/// Same contract as C `calloc`.
#[no_mangle]
pub unsafe extern "C" fn calloc(num: size_t, size: size_t) -> *mut c_void {
    ScopeAllocator::calloc(num, size)
}

/// # Safety
///
/// Same contract as C `realloc`.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    ScopeAllocator::realloc(ptr, size)
}

/// Label all subsequent allocations, process-wide, with `scope`. A null or
/// empty scope turns attribution off.
///
/// # Safety
///
/// `scope` must be null or a valid NUL-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn mst_set_scope(scope: *const c_char) {
    if scope.is_null() {
        mem_scope_track::set_scope("");
        return;
    }
    let scope = CStr::from_ptr(scope);
    mem_scope_track::set_scope(&scope.to_string_lossy());
}
