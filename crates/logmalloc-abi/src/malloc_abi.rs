//! Exported allocator entry points.
//!
//! Every symbol forwards to [`crate::tracker()`]. Failures follow the C
//! contract: null plus `errno` for the pointer-returning calls, a status code
//! for `posix_memalign`.

use std::ffi::{c_int, c_void};

use crate::tracker;

#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    tracker().allocate(size)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    tracker().zero_allocate(nmemb, size)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    // SAFETY: C callers pass null or a block from this allocator family.
    unsafe { tracker().resize(ptr, size) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
    tracker().aligned_allocate(alignment, size)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    if memptr.is_null() {
        return libc::EINVAL;
    }
    // SAFETY: `memptr` is non-null and points at caller storage.
    unsafe { tracker().aligned_allocate_status(memptr, alignment, size) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    tracker().page_allocate(size)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    // SAFETY: C callers pass null or a block from this allocator family.
    unsafe { tracker().release(ptr) }
}
