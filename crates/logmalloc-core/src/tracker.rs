//! Interposition logic: the tracked allocator family.
//!
//! Each entry point follows the same path: make sure the real bindings exist,
//! call the real allocator with room for an [`Envelope`], stamp it, update
//! the totals, count the call and emit one event line. A failed real call is
//! still counted and logged, as a zero-size event with a null pointer.
//!
//! Once the context is finalized every entry point forwards straight to the
//! real allocator. Releases and resizes still classify their pointer so a
//! tracked block always goes back at its real base.

#![allow(unsafe_code)]

use std::ffi::c_void;
use std::fmt::{self, Write};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use libc::c_int;

use crate::config::{APP_LINE_CAPACITY, LINE_CAPACITY};
use crate::context::{Totals, TrackingContext};
use crate::envelope::{self, Block, Envelope, HEADER_SIZE};
use crate::error::TraceError;
use crate::event::{Event, Extra, LineBuf, Op};
use crate::logger::EventLogger;
use crate::resolver::{RealAllocator, Resolution};
use crate::sink::TraceSink;
use crate::stack::StackCapturer;

/// A freshly stamped block.
#[derive(Debug, Clone, Copy)]
struct Adopted {
    user: *mut c_void,
    size: usize,
    totals: Totals,
}

fn errno_slot() -> *mut c_int {
    // SAFETY: always returns this thread's errno slot.
    unsafe { libc::__errno_location() }
}

fn set_errno(value: c_int) {
    // SAFETY: errno_slot points at thread-local storage owned by libc.
    unsafe { *errno_slot() = value };
}

/// Restores errno on drop so trace writes never leak their own failures.
struct ErrnoGuard(c_int);

impl ErrnoGuard {
    fn save() -> Self {
        // SAFETY: see `set_errno`.
        Self(unsafe { *errno_slot() })
    }
}

impl Drop for ErrnoGuard {
    fn drop(&mut self) {
        set_errno(self.0);
    }
}

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// System page size, cached after the first query.
#[must_use]
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    // SAFETY: sysconf has no preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page = usize::try_from(raw)
        .ok()
        .filter(|p| envelope::valid_offset(*p))
        .unwrap_or(4096);
    PAGE_SIZE.store(page, Ordering::Relaxed);
    page
}

/// Validate an alignment request for the aligned variants.
///
/// The envelope sits between the real base and the user pointer, so the
/// alignment doubles as the offset and must be able to hold the header.
pub fn check_alignment(alignment: usize, pointer_multiple: bool) -> Result<(), TraceError> {
    if !alignment.is_power_of_two()
        || (pointer_multiple && alignment % size_of::<*mut c_void>() != 0)
    {
        return Err(TraceError::InvalidAlignment(alignment));
    }
    if alignment < HEADER_SIZE {
        return Err(TraceError::AlignmentTooSmall {
            alignment,
            header: HEADER_SIZE,
        });
    }
    Ok(())
}

/// The tracking engine: a real allocator, a context and a logger.
pub struct Tracker<A, S, C> {
    alloc: A,
    ctx: TrackingContext,
    logger: EventLogger<S, C>,
}

impl<A: RealAllocator, S: TraceSink, C: StackCapturer> Tracker<A, S, C> {
    #[must_use]
    pub const fn new(alloc: A, sink: S, capturer: C) -> Self {
        Self {
            alloc,
            ctx: TrackingContext::new(),
            logger: EventLogger::new(sink, capturer),
        }
    }

    pub fn context(&self) -> &TrackingContext {
        &self.ctx
    }

    pub fn logger(&self) -> &EventLogger<S, C> {
        &self.logger
    }

    pub fn sink(&self) -> &S {
        self.logger.sink()
    }

    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    /// Currently tracked requested bytes.
    #[must_use]
    pub fn usage(&self) -> usize {
        self.ctx.totals().requested
    }

    pub fn set_trace_enabled(&self, enabled: bool) {
        self.ctx.set_trace_enabled(enabled);
    }

    /// Pre-warm stack capture outside of allocator or signal context.
    pub fn warm_up(&self) {
        self.logger.capturer().warm_up();
    }

    /// Write an application line into the trace stream.
    ///
    /// Only the permanent descriptor failure suppresses these lines; the
    /// runtime trace switch does not.
    pub fn trace_fmt(&self, args: fmt::Arguments<'_>) -> Result<usize, TraceError> {
        if self.ctx.logging_dead() {
            return Err(TraceError::LoggingDisabled);
        }
        let _errno = ErrnoGuard::save();
        self.logger
            .emit_plain::<APP_LINE_CAPACITY>(args)
            .inspect_err(|err| self.logging_failed(*err))
    }

    /// Make the real bindings usable, opening the snapshot on first success.
    pub(crate) fn bindings(&self) -> Result<(), TraceError> {
        match self.alloc.ensure_resolved() {
            Ok(Resolution::Fresh) => {
                // Failure is reported once, at attach.
                let _ = self.logger.sink().open_snapshot();
                Ok(())
            }
            Ok(Resolution::Ready) => Ok(()),
            Err(err) => {
                self.ctx.record_untracked();
                Err(err)
            }
        }
    }

    pub(crate) fn emit(&self, event: Event) {
        if !self.ctx.trace_enabled() {
            return;
        }
        let _errno = ErrnoGuard::save();
        if let Err(err) = self.logger.emit(&event) {
            self.logging_failed(err);
        }
    }

    pub(crate) fn emit_plain(&self, args: fmt::Arguments<'_>) {
        if !self.ctx.trace_enabled() {
            return;
        }
        let _errno = ErrnoGuard::save();
        if let Err(err) = self.logger.emit_plain::<APP_LINE_CAPACITY>(args) {
            self.logging_failed(err);
        }
    }

    pub(crate) fn diagnostic(&self, args: fmt::Arguments<'_>) {
        let _errno = ErrnoGuard::save();
        let mut line = LineBuf::<LINE_CAPACITY>::new();
        let _ = line.write_fmt(args);
        self.logger.sink().diagnostic(line.finish(None));
    }

    pub(crate) fn logging_failed(&self, err: TraceError) {
        if err.disables_logging() && self.ctx.kill_logging() {
            self.diagnostic(format_args!("log-malloc: {err}; tracing disabled"));
        }
    }

    /// Stamp a block returned by the real allocator and account for it.
    ///
    /// # Safety
    ///
    /// `base` must be null or a fresh block of at least `offset + size` bytes.
    unsafe fn adopt(&self, base: *mut c_void, size: usize, offset: usize) -> Option<Adopted> {
        if base.is_null() {
            return None;
        }
        // SAFETY: `base` is a live block from the real allocator.
        let usable = unsafe { self.alloc.usable_size(base) };
        // SAFETY: the block spans `offset + size` bytes and is MIN_ALIGN aligned.
        let user = unsafe { envelope::stamp(base, Envelope::new(size, usable, offset)) };
        let totals = self.ctx.apply(size as isize, usable as isize);
        Some(Adopted { user, size, totals })
    }

    /// Emit the event for an allocating call and hand back its pointer.
    fn finish_allocation(&self, op: Op, adopted: Option<Adopted>, extra: Extra) -> *mut c_void {
        let (event, user) = match adopted {
            Some(a) => (Event::new(op, a.size as isize, a.user as usize, a.totals), a.user),
            None => (Event::new(op, 0, 0, self.ctx.totals()), ptr::null_mut()),
        };
        self.emit(event.with_extra(extra));
        user
    }

    /// `malloc`.
    pub fn allocate(&self, size: usize) -> *mut c_void {
        if let Err(err) = self.bindings() {
            set_errno(err.errno());
            return ptr::null_mut();
        }
        if self.ctx.is_finalized() {
            self.ctx.record_untracked();
            // SAFETY: bindings are resolved.
            return unsafe { self.alloc.malloc(size) };
        }
        self.ctx.record_call(Op::Malloc);
        let adopted = match HEADER_SIZE.checked_add(size) {
            // SAFETY: bindings are resolved; the block is fresh.
            Some(total) => unsafe { self.adopt(self.alloc.malloc(total), size, HEADER_SIZE) },
            None => {
                set_errno(libc::ENOMEM);
                None
            }
        };
        self.finish_allocation(Op::Malloc, adopted, Extra::None)
    }

    /// `calloc`. A `count * size` overflow is rejected with `ENOMEM`.
    pub fn zero_allocate(&self, count: usize, size: usize) -> *mut c_void {
        if let Err(err) = self.bindings() {
            set_errno(err.errno());
            return ptr::null_mut();
        }
        if self.ctx.is_finalized() {
            self.ctx.record_untracked();
            // SAFETY: bindings are resolved.
            return unsafe { self.alloc.calloc(count, size) };
        }
        self.ctx.record_call(Op::Calloc);
        let sized = count
            .checked_mul(size)
            .and_then(|bytes| bytes.checked_add(HEADER_SIZE).map(|total| (bytes, total)));
        let adopted = match sized {
            // SAFETY: bindings are resolved; calloc zeroes header and body.
            Some((bytes, total)) => unsafe { self.adopt(self.alloc.calloc(1, total), bytes, HEADER_SIZE) },
            None => {
                set_errno(TraceError::SizeOverflow { count, size }.errno());
                None
            }
        };
        self.finish_allocation(Op::Calloc, adopted, Extra::Elements { count, size })
    }

    /// `memalign`. Alignments below the header size are refused with `ENOMEM`.
    pub fn aligned_allocate(&self, alignment: usize, size: usize) -> *mut c_void {
        if let Err(err) = self.bindings() {
            set_errno(err.errno());
            return ptr::null_mut();
        }
        if self.ctx.is_finalized() {
            self.ctx.record_untracked();
            // SAFETY: bindings are resolved.
            return unsafe { self.alloc.memalign(alignment, size) };
        }
        self.ctx.record_call(Op::Memalign);
        let adopted = match check_alignment(alignment, false) {
            Ok(()) => match size.checked_add(alignment) {
                // SAFETY: bindings are resolved; the block is `alignment` aligned.
                Some(total) => unsafe { self.adopt(self.alloc.memalign(alignment, total), size, alignment) },
                None => {
                    set_errno(libc::ENOMEM);
                    None
                }
            },
            Err(err) => {
                set_errno(err.errno());
                None
            }
        };
        self.finish_allocation(Op::Memalign, adopted, Extra::Alignment(alignment))
    }

    /// `posix_memalign`. Returns the status code; `*out` is written only on success.
    ///
    /// # Safety
    ///
    /// `out` must be valid for a pointer write.
    pub unsafe fn aligned_allocate_status(
        &self,
        out: *mut *mut c_void,
        alignment: usize,
        size: usize,
    ) -> c_int {
        if let Err(err) = self.bindings() {
            return err.errno();
        }
        if self.ctx.is_finalized() {
            self.ctx.record_untracked();
            // SAFETY: forwarded caller contract.
            return unsafe { self.alloc.posix_memalign(out, alignment, size) };
        }
        self.ctx.record_call(Op::PosixMemalign);
        let (status, adopted) = match check_alignment(alignment, true) {
            Err(err) => (err.errno(), None),
            Ok(()) => match size.checked_add(alignment) {
                None => (libc::ENOMEM, None),
                Some(total) => {
                    let mut raw = ptr::null_mut();
                    // SAFETY: `raw` is a valid out slot.
                    let status = unsafe { self.alloc.posix_memalign(&mut raw, alignment, total) };
                    // SAFETY: on success `raw` is a fresh aligned block of `total` bytes.
                    (status, unsafe { self.adopt(if status == 0 { raw } else { ptr::null_mut() }, size, alignment) })
                }
            },
        };
        let event = match adopted {
            Some(a) => {
                // SAFETY: caller guarantees `out` is writable.
                unsafe { *out = a.user };
                Event::new(Op::PosixMemalign, a.size as isize, a.user as usize, a.totals)
            }
            None => Event::new(Op::PosixMemalign, 0, 0, self.ctx.totals()),
        };
        let status = if adopted.is_none() && status == 0 { libc::ENOMEM } else { status };
        self.emit(event.with_extra(Extra::AlignedStatus {
            alignment,
            size,
            status,
        }));
        status
    }

    /// `valloc`: page-aligned allocation.
    pub fn page_allocate(&self, size: usize) -> *mut c_void {
        if let Err(err) = self.bindings() {
            set_errno(err.errno());
            return ptr::null_mut();
        }
        if self.ctx.is_finalized() {
            self.ctx.record_untracked();
            // SAFETY: bindings are resolved.
            return unsafe { self.alloc.valloc(size) };
        }
        self.ctx.record_call(Op::Valloc);
        let page = page_size();
        let adopted = size.checked_add(page).and_then(|total| {
            // SAFETY: bindings are resolved; valloc returns a page-aligned block.
            unsafe { self.adopt(self.alloc.valloc(total), size, page) }
        });
        if adopted.is_none() {
            set_errno(libc::ENOMEM);
        }
        self.finish_allocation(Op::Valloc, adopted, Extra::None)
    }

    /// `realloc`.
    ///
    /// Foreign blocks are passed through untracked: the real allocator
    /// resizes them in place of the caller and the result stays foreign.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live block from this tracker or the real allocator.
    pub unsafe fn resize(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        if let Err(err) = self.bindings() {
            set_errno(err.errno());
            return ptr::null_mut();
        }
        if ptr.is_null() {
            return self.resize_null(size);
        }
        // SAFETY: `ptr` is a live allocator block, so the bytes before it are readable.
        match unsafe { envelope::classify(ptr) } {
            // SAFETY: forwarded caller contract.
            Block::Foreign => unsafe { self.resize_foreign(ptr, size) },
            // SAFETY: `base` and `old` describe the live tracked block behind `ptr`.
            Block::Tracked { base, envelope: old } => unsafe { self.resize_tracked(ptr, base, old, size) },
        }
    }

    fn resize_null(&self, size: usize) -> *mut c_void {
        if self.ctx.is_finalized() {
            self.ctx.record_untracked();
            // SAFETY: realloc(NULL, n) is malloc(n).
            return unsafe { self.alloc.realloc(ptr::null_mut(), size) };
        }
        self.ctx.record_call(Op::Realloc);
        let adopted = HEADER_SIZE.checked_add(size).and_then(|total| {
            // SAFETY: a null input makes realloc a fresh allocation.
            unsafe { self.adopt(self.alloc.realloc(ptr::null_mut(), total), size, HEADER_SIZE) }
        });
        let event = match adopted {
            Some(a) => Event::new(Op::Realloc, size as isize, 0, a.totals).with_ptr2(a.user as usize),
            None => {
                set_errno(libc::ENOMEM);
                Event::new(Op::Realloc, 0, 0, self.ctx.totals()).with_ptr2(0)
            }
        };
        self.emit(event.with_extra(Extra::Resize { old: 0, new: size }));
        adopted.map_or(ptr::null_mut(), |a| a.user)
    }

    unsafe fn resize_foreign(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        if self.ctx.is_finalized() {
            self.ctx.record_untracked();
            // SAFETY: foreign blocks belong to the real allocator.
            return unsafe { self.alloc.realloc(ptr, size) };
        }
        self.ctx.record_call(Op::Realloc);
        // SAFETY: foreign blocks belong to the real allocator.
        let fresh = unsafe { self.alloc.realloc(ptr, size) };
        let event = Event::new(Op::Realloc, 0, ptr as usize, self.ctx.totals())
            .with_ptr2(fresh as usize)
            .with_extra(Extra::Resize { old: 0, new: size })
            .foreign();
        self.emit(event);
        fresh
    }

    unsafe fn resize_tracked(
        &self,
        ptr: *mut c_void,
        base: *mut c_void,
        old: Envelope,
        size: usize,
    ) -> *mut c_void {
        let finalized = self.ctx.is_finalized();
        if finalized {
            self.ctx.record_untracked();
        } else {
            self.ctx.record_call(Op::Realloc);
        }
        let extra = Extra::Resize {
            old: old.size,
            new: size,
        };
        let moved = match old.offset.checked_add(size) {
            // SAFETY: `base` is the live real block behind `ptr`.
            Some(total) => unsafe { self.alloc.realloc(base, total) },
            None => ptr::null_mut(),
        };
        if moved.is_null() {
            set_errno(libc::ENOMEM);
            if !finalized {
                let event = Event::new(Op::Realloc, 0, ptr as usize, self.ctx.totals()).with_ptr2(0);
                self.emit(event.with_extra(extra));
            }
            return ptr::null_mut();
        }
        // SAFETY: `moved` is live and its first `offset` bytes were copied from `base`.
        let usable = unsafe { self.alloc.usable_size(moved) };
        // SAFETY: the block spans `offset + size` bytes.
        let user = unsafe { envelope::stamp(moved, Envelope::new(size, usable, old.offset)) };
        if finalized {
            return user;
        }
        let delta = size as isize - old.size as isize;
        let totals = self.ctx.apply(delta, usable as isize - old.usable as isize);
        let event = Event::new(Op::Realloc, delta, ptr as usize, totals).with_ptr2(user as usize);
        self.emit(event.with_extra(extra));
        user
    }

    /// `free`. Null is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live block from this tracker or the real allocator.
    pub unsafe fn release(&self, ptr: *mut c_void) {
        if ptr.is_null() {
            return;
        }
        // Without bindings there is nothing safe to forward to.
        if self.bindings().is_err() {
            return;
        }
        let finalized = self.ctx.is_finalized();
        if finalized {
            self.ctx.record_untracked();
        } else {
            self.ctx.record_call(Op::Free);
        }
        // SAFETY: `ptr` is a live allocator block.
        match unsafe { envelope::classify(ptr) } {
            Block::Tracked { base, envelope: header } => {
                // SAFETY: the header is ours and still live.
                unsafe { envelope::retire(ptr) };
                if !finalized {
                    let size = header.size as isize;
                    let totals = self.ctx.apply(-size, -(header.usable as isize));
                    self.emit(Event::new(Op::Free, -size, ptr as usize, totals));
                }
                // SAFETY: `base` is what the real allocator returned for this block.
                unsafe { self.alloc.free(base) };
            }
            Block::Foreign => {
                if !finalized {
                    // SAFETY: foreign blocks belong to the real allocator.
                    let usable = unsafe { self.alloc.usable_size(ptr) };
                    let event = Event::new(Op::Free, -(usable as isize), ptr as usize, self.ctx.totals());
                    self.emit(event.foreign());
                }
                // SAFETY: forwarded unshifted.
                unsafe { self.alloc.free(ptr) };
            }
        }
    }
}
