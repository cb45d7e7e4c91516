//! Real allocator bindings.
//!
//! [`ResolvedTable`] looks up every underlying allocator entry point exactly
//! once. The first caller to move the table out of `UNRESOLVED` does the
//! lookup inline on its own thread; anyone arriving while that is in flight
//! (including the resolving thread itself, when the symbol lookup allocates)
//! gets [`TraceError::ResolveInProgress`] and fails the call instead of
//! waiting. A failed lookup is final.
//!
//! [`LibcAllocator`] binds straight to the `libc` crate's symbols. It is only
//! correct in binaries that do not themselves export `malloc`.

#![allow(unsafe_code)]

use std::ffi::{CStr, c_void};
use std::mem;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use libc::c_int;

use crate::error::TraceError;

type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
type MemalignFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type PosixMemalignFn = unsafe extern "C" fn(*mut *mut c_void, usize, usize) -> c_int;
type VallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type UsableSizeFn = unsafe extern "C" fn(*mut c_void) -> usize;

/// Outcome of [`RealAllocator::ensure_resolved`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// This call performed the one-time resolution.
    Fresh,
    /// Bindings were already usable.
    Ready,
}

/// The allocator underneath the tracker.
///
/// # Safety
///
/// Implementations must behave like the C allocator functions they name:
/// blocks from any allocating method are released by `free`, resized by
/// `realloc`, and measured by `usable_size`.
pub unsafe trait RealAllocator {
    /// Make the bindings usable. Must never block on another thread.
    fn ensure_resolved(&self) -> Result<Resolution, TraceError>;

    /// # Safety
    /// Bindings must be resolved.
    unsafe fn malloc(&self, size: usize) -> *mut c_void;
    /// # Safety
    /// Bindings must be resolved.
    unsafe fn calloc(&self, count: usize, size: usize) -> *mut c_void;
    /// # Safety
    /// `ptr` must be null or a live block from this allocator.
    unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void;
    /// # Safety
    /// Bindings must be resolved.
    unsafe fn memalign(&self, alignment: usize, size: usize) -> *mut c_void;
    /// # Safety
    /// `out` must be valid for a pointer write.
    unsafe fn posix_memalign(&self, out: *mut *mut c_void, alignment: usize, size: usize) -> c_int;
    /// # Safety
    /// Bindings must be resolved.
    unsafe fn valloc(&self, size: usize) -> *mut c_void;
    /// # Safety
    /// `ptr` must be null or a live block from this allocator.
    unsafe fn free(&self, ptr: *mut c_void);
    /// # Safety
    /// `ptr` must be a live block from this allocator.
    unsafe fn usable_size(&self, ptr: *mut c_void) -> usize;
}

/// Symbol lookup used to fill a [`ResolvedTable`].
pub trait SymbolLookup {
    /// Address of the next definition of `name`, or null.
    fn lookup(&self, name: &CStr) -> *mut c_void;
}

const UNRESOLVED: u8 = 0;
const RESOLVING: u8 = 1;
const READY: u8 = 2;
const FAILED: u8 = 3;

const SLOTS: usize = 8;
const NAMES: [&CStr; SLOTS] = [
    c"malloc",
    c"calloc",
    c"realloc",
    c"memalign",
    c"posix_memalign",
    c"valloc",
    c"free",
    c"malloc_usable_size",
];
const MALLOC: usize = 0;
const CALLOC: usize = 1;
const REALLOC: usize = 2;
const MEMALIGN: usize = 3;
const POSIX_MEMALIGN: usize = 4;
const VALLOC: usize = 5;
const FREE: usize = 6;
const USABLE_SIZE: usize = 7;

/// Function table resolved once through a [`SymbolLookup`].
pub struct ResolvedTable<L> {
    lookup: L,
    state: AtomicU8,
    slots: [AtomicPtr<c_void>; SLOTS],
}

impl<L: SymbolLookup> ResolvedTable<L> {
    #[must_use]
    pub const fn new(lookup: L) -> Self {
        Self {
            lookup,
            state: AtomicU8::new(UNRESOLVED),
            slots: [const { AtomicPtr::new(std::ptr::null_mut()) }; SLOTS],
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == READY
    }

    fn resolve_all(&self) -> bool {
        let mut found = [std::ptr::null_mut(); SLOTS];
        for (slot, name) in found.iter_mut().zip(NAMES) {
            *slot = self.lookup.lookup(name);
            if slot.is_null() {
                return false;
            }
        }
        for (cell, ptr) in self.slots.iter().zip(found) {
            cell.store(ptr, Ordering::Relaxed);
        }
        true
    }

    /// Raw slot address. Only read after the state reached `READY`.
    #[inline]
    fn slot(&self, index: usize) -> *mut c_void {
        self.slots[index].load(Ordering::Relaxed)
    }
}

macro_rules! call_slot {
    ($table:expr, $index:expr, $ty:ty, $fallback:expr, ($($arg:expr),*)) => {{
        let raw = $table.slot($index);
        if raw.is_null() {
            $fallback
        } else {
            // SAFETY: non-null slots hold the address of the named C function,
            // whose signature matches `$ty`.
            let f: $ty = unsafe { mem::transmute::<*mut c_void, $ty>(raw) };
            // SAFETY: forwarded caller contract.
            unsafe { f($($arg),*) }
        }
    }};
}

// SAFETY: every method forwards to the resolved C allocator entry point.
unsafe impl<L: SymbolLookup> RealAllocator for ResolvedTable<L> {
    fn ensure_resolved(&self) -> Result<Resolution, TraceError> {
        match self.state.load(Ordering::Acquire) {
            READY => return Ok(Resolution::Ready),
            FAILED => return Err(TraceError::ResolveFailed),
            RESOLVING => return Err(TraceError::ResolveInProgress),
            _ => {}
        }
        if let Err(current) = self.state.compare_exchange(
            UNRESOLVED,
            RESOLVING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return match current {
                READY => Ok(Resolution::Ready),
                FAILED => Err(TraceError::ResolveFailed),
                _ => Err(TraceError::ResolveInProgress),
            };
        }
        if self.resolve_all() {
            self.state.store(READY, Ordering::Release);
            Ok(Resolution::Fresh)
        } else {
            self.state.store(FAILED, Ordering::Release);
            Err(TraceError::ResolveFailed)
        }
    }

    unsafe fn malloc(&self, size: usize) -> *mut c_void {
        call_slot!(self, MALLOC, MallocFn, std::ptr::null_mut(), (size))
    }

    unsafe fn calloc(&self, count: usize, size: usize) -> *mut c_void {
        call_slot!(self, CALLOC, CallocFn, std::ptr::null_mut(), (count, size))
    }

    unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        call_slot!(self, REALLOC, ReallocFn, std::ptr::null_mut(), (ptr, size))
    }

    unsafe fn memalign(&self, alignment: usize, size: usize) -> *mut c_void {
        call_slot!(self, MEMALIGN, MemalignFn, std::ptr::null_mut(), (alignment, size))
    }

    unsafe fn posix_memalign(&self, out: *mut *mut c_void, alignment: usize, size: usize) -> c_int {
        call_slot!(self, POSIX_MEMALIGN, PosixMemalignFn, libc::ENOMEM, (out, alignment, size))
    }

    unsafe fn valloc(&self, size: usize) -> *mut c_void {
        call_slot!(self, VALLOC, VallocFn, std::ptr::null_mut(), (size))
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        call_slot!(self, FREE, FreeFn, (), (ptr))
    }

    unsafe fn usable_size(&self, ptr: *mut c_void) -> usize {
        call_slot!(self, USABLE_SIZE, UsableSizeFn, 0, (ptr))
    }
}

// Not exported by the `libc` crate.
unsafe extern "C" {
    fn valloc(size: usize) -> *mut c_void;
}

/// Direct binding to the process's libc allocator.
#[derive(Debug, Clone, Copy, Default)]
pub struct LibcAllocator;

// SAFETY: forwards to libc's allocator, which satisfies the contract.
unsafe impl RealAllocator for LibcAllocator {
    fn ensure_resolved(&self) -> Result<Resolution, TraceError> {
        Ok(Resolution::Ready)
    }

    unsafe fn malloc(&self, size: usize) -> *mut c_void {
        // SAFETY: plain libc call.
        unsafe { libc::malloc(size) }
    }

    unsafe fn calloc(&self, count: usize, size: usize) -> *mut c_void {
        // SAFETY: plain libc call.
        unsafe { libc::calloc(count, size) }
    }

    unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        // SAFETY: caller passes null or a live libc block.
        unsafe { libc::realloc(ptr, size) }
    }

    unsafe fn memalign(&self, alignment: usize, size: usize) -> *mut c_void {
        // SAFETY: plain libc call.
        unsafe { libc::memalign(alignment, size) }
    }

    unsafe fn posix_memalign(&self, out: *mut *mut c_void, alignment: usize, size: usize) -> c_int {
        // SAFETY: caller guarantees `out` is writable.
        unsafe { libc::posix_memalign(out, alignment, size) }
    }

    unsafe fn valloc(&self, size: usize) -> *mut c_void {
        // SAFETY: plain libc call.
        unsafe { valloc(size) }
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        // SAFETY: caller passes null or a live libc block.
        unsafe { libc::free(ptr) }
    }

    unsafe fn usable_size(&self, ptr: *mut c_void) -> usize {
        // SAFETY: caller passes a live libc block.
        unsafe { libc::malloc_usable_size(ptr) }
    }
}
