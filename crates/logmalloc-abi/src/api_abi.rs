//! Runtime control surface for the traced program.

use std::ffi::{CStr, c_char};
use std::fmt;

use logmalloc_core::TraceError;
use logmalloc_core::event::Lossy;

use crate::tracker;

/// Requested bytes currently tracked.
#[unsafe(no_mangle)]
pub extern "C" fn log_malloc_get_usage() -> usize {
    tracker().usage()
}

#[unsafe(no_mangle)]
pub extern "C" fn log_malloc_trace_enable() {
    tracker().set_trace_enabled(true);
}

/// Suppress event and header lines. Counters keep running.
#[unsafe(no_mangle)]
pub extern "C" fn log_malloc_trace_disable() {
    tracker().set_trace_enabled(false);
}

/// Write `line` into the trace stream. Returns the bytes written, or -1 with `errno` set.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn log_malloc_trace_puts(line: *const c_char) -> isize {
    if line.is_null() {
        set_errno(libc::EINVAL);
        return -1;
    }
    // SAFETY: the caller passes a NUL-terminated string.
    let text = unsafe { CStr::from_ptr(line) };
    match trace_fmt(format_args!("{}", Lossy(text.to_bytes()))) {
        Ok(n) => n as isize,
        Err(err) => {
            set_errno(err.errno());
            -1
        }
    }
}

/// Rust-side counterpart of [`log_malloc_trace_puts`]; used by [`trace_printf!`].
pub fn trace_fmt(args: fmt::Arguments<'_>) -> Result<usize, TraceError> {
    tracker().trace_fmt(args)
}

fn set_errno(value: libc::c_int) {
    // SAFETY: __errno_location returns this thread's errno slot.
    unsafe { *libc::__errno_location() = value };
}

/// Format a line into the trace stream, like `printf` into the trace fd.
///
/// ```ignore
/// logmalloc_abi::trace_printf!("# phase {} done", phase)?;
/// ```
#[macro_export]
macro_rules! trace_printf {
    ($($arg:tt)*) => {
        $crate::api_abi::trace_fmt(::std::format_args!($($arg)*))
    };
}
