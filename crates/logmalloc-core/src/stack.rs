//! Call-stack capture.
//!
//! Two strategies share the [`StackCapturer`] trait:
//! - [`ReturnAddressWalk`]: raw return addresses from glibc's `backtrace(3)`,
//!   named lazily with `dladdr` and printed like `backtrace_symbols_fd`.
//! - [`CursorUnwind`]: the `backtrace` crate's unwinder cursor, which also
//!   records each frame's function start, with per-frame symbol resolution
//!   through its debug-info reader.
//!
//! Both cap the frame count and print a bare hex address for anything they
//! cannot name. Symbol resolution may allocate on first use, so callers
//! should run [`StackCapturer::warm_up`] once at a safe point.

#![allow(unsafe_code)]

use std::ffi::{CStr, c_void};
use std::fmt::{self, Write};

use libc::c_int;

use crate::config::BACKTRACE_DEPTH;
use crate::event::{LineBuf, Lossy};

/// Frames belonging to the capture machinery itself.
const INTERNAL_FRAMES: usize = 2;

unsafe extern "C" {
    /// glibc `backtrace(3)`: return addresses only, no per-frame lookups.
    #[link_name = "backtrace"]
    fn libc_backtrace(buffer: *mut *mut c_void, size: c_int) -> c_int;
}

/// One captured frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Frame {
    /// Instruction pointer (return address for all but the innermost frame).
    pub ip: usize,
    /// Start of the enclosing function as reported by the unwinder, or 0.
    pub symbol_address: usize,
}

/// Bounded frame storage that lives on the stack.
#[derive(Debug, Clone, Copy)]
pub struct FrameList {
    frames: [Frame; BACKTRACE_DEPTH],
    len: usize,
}

impl FrameList {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            frames: [Frame {
                ip: 0,
                symbol_address: 0,
            }; BACKTRACE_DEPTH],
            len: 0,
        }
    }

    /// Append a frame. Returns false once the list is full.
    pub fn push(&mut self, frame: Frame) -> bool {
        if self.len == BACKTRACE_DEPTH {
            return false;
        }
        self.frames[self.len] = frame;
        self.len += 1;
        self.len < BACKTRACE_DEPTH
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Frame] {
        &self.frames[..self.len]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl Default for FrameList {
    fn default() -> Self {
        Self::new()
    }
}

/// Stack-capture strategy.
pub trait StackCapturer {
    /// Fill `out` with up to `min(depth, BACKTRACE_DEPTH)` caller frames.
    fn capture(&self, out: &mut FrameList);

    /// Render frame number `index` as one trace line (without newline).
    fn write_frame<W: Write>(&self, index: usize, frame: &Frame, out: &mut W) -> fmt::Result;

    /// Exercise capture and naming once so lazy initialisation happens now.
    fn warm_up(&self) {
        let mut frames = FrameList::new();
        self.capture(&mut frames);
        let mut sink = LineBuf::<256>::new();
        for (i, frame) in frames.as_slice().iter().enumerate() {
            sink.clear();
            let _ = self.write_frame(i, frame, &mut sink);
        }
    }
}

/// Raw return addresses from glibc, skipping this function's own frame.
#[inline(never)]
fn return_addresses(depth: usize, out: &mut FrameList) {
    out.clear();
    let depth = depth.min(BACKTRACE_DEPTH);
    if depth == 0 {
        return;
    }
    let mut buf = [std::ptr::null_mut::<c_void>(); BACKTRACE_DEPTH + 1];
    // SAFETY: `buf` holds `depth + 1` writable slots.
    let n = unsafe { libc_backtrace(buf.as_mut_ptr(), (depth + 1) as c_int) };
    let n = usize::try_from(n).unwrap_or(0);
    for ip in buf.iter().take(n).skip(1) {
        if !out.push(Frame {
            ip: *ip as usize,
            symbol_address: 0,
        }) {
            break;
        }
    }
}

/// Walk the stack with the unsynchronised tracer, skipping our own frames.
fn walk(depth: usize, out: &mut FrameList) {
    out.clear();
    let depth = depth.min(BACKTRACE_DEPTH);
    if depth == 0 {
        return;
    }
    let mut skipped = 0;
    // SAFETY: the closure does not allocate or re-enter the tracer. The
    // unsynchronised walk is used because the synchronised one takes a lock
    // that a signal handler could already hold.
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            if skipped < INTERNAL_FRAMES {
                skipped += 1;
                return true;
            }
            out.push(Frame {
                ip: frame.ip() as usize,
                symbol_address: frame.symbol_address() as usize,
            }) && out.len() < depth
        });
    }
}

/// Cheap return-address walk named through the dynamic linker.
#[derive(Debug, Clone, Copy)]
pub struct ReturnAddressWalk {
    depth: usize,
}

impl ReturnAddressWalk {
    #[must_use]
    pub const fn new(depth: usize) -> Self {
        Self { depth }
    }
}

impl StackCapturer for ReturnAddressWalk {
    fn capture(&self, out: &mut FrameList) {
        return_addresses(self.depth, out);
    }

    fn write_frame<W: Write>(&self, _index: usize, frame: &Frame, out: &mut W) -> fmt::Result {
        let mut info = libc::Dl_info {
            dli_fname: std::ptr::null(),
            dli_fbase: std::ptr::null_mut(),
            dli_sname: std::ptr::null(),
            dli_saddr: std::ptr::null_mut(),
        };
        // SAFETY: dladdr only reads loader tables and fills `info`.
        let found = unsafe { libc::dladdr(frame.ip as *const c_void, &mut info) } != 0;
        if !found || info.dli_fname.is_null() {
            return write!(out, "[{:#x}]", frame.ip);
        }
        // SAFETY: dladdr returned non-null NUL-terminated strings owned by the loader.
        let module = unsafe { CStr::from_ptr(info.dli_fname) };
        write!(out, "{}", Lossy(module.to_bytes()))?;
        if info.dli_sname.is_null() {
            let off = frame.ip.wrapping_sub(info.dli_fbase as usize);
            return write!(out, "(+{off:#x})[{:#x}]", frame.ip);
        }
        // SAFETY: as above.
        let symbol = unsafe { CStr::from_ptr(info.dli_sname) };
        let off = frame.ip.wrapping_sub(info.dli_saddr as usize);
        write!(out, "({}+{off:#x})[{:#x}]", Lossy(symbol.to_bytes()), frame.ip)
    }
}

/// Cursor unwinder with debug-info symbol resolution.
#[derive(Debug, Clone, Copy)]
pub struct CursorUnwind {
    depth: usize,
}

impl CursorUnwind {
    #[must_use]
    pub const fn new(depth: usize) -> Self {
        Self { depth }
    }
}

impl StackCapturer for CursorUnwind {
    fn capture(&self, out: &mut FrameList) {
        walk(self.depth, out);
    }

    fn write_frame<W: Write>(&self, index: usize, frame: &Frame, out: &mut W) -> fmt::Result {
        write!(out, "#{index} {:#x} ", frame.ip)?;
        let mut named = false;
        let mut result = Ok(());
        // SAFETY: resolution runs on this thread only and the callback does
        // not call back into the resolver.
        unsafe {
            backtrace::resolve_unsynchronized(frame.ip as *mut c_void, |symbol| {
                if named {
                    return;
                }
                if let Some(name) = symbol.name() {
                    let start = symbol
                        .addr()
                        .map(|a| a as usize)
                        .filter(|a| *a != 0)
                        .unwrap_or(frame.symbol_address);
                    let off = frame.ip.wrapping_sub(start);
                    result = write!(out, "{name}+{off:#x}");
                    named = true;
                }
            });
        }
        result?;
        if !named {
            out.write_str("??")?;
        }
        Ok(())
    }
}

/// Captures nothing. For builds or tests that want bare event lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFrames;

impl StackCapturer for NoFrames {
    fn capture(&self, out: &mut FrameList) {
        out.clear();
    }

    fn write_frame<W: Write>(&self, _index: usize, frame: &Frame, out: &mut W) -> fmt::Result {
        write!(out, "[{:#x}]", frame.ip)
    }
}

#[cfg(feature = "detailed-unwind")]
pub type DefaultCapturer = CursorUnwind;
#[cfg(not(feature = "detailed-unwind"))]
pub type DefaultCapturer = ReturnAddressWalk;

/// Capturer selected by the `detailed-unwind` feature, at the configured depth.
#[must_use]
pub const fn default_capturer() -> DefaultCapturer {
    DefaultCapturer::new(BACKTRACE_DEPTH)
}
