//! Load and unload handling.
//!
//! `attach` runs once when the library is loaded: it resolves the real
//! allocator, opens the snapshot source and writes the trace header.
//! `detach` runs once at unload: it writes the final counters, the process
//! memory map and the elapsed CPU clock, then switches every entry point to
//! untracked pass-through.

#![allow(unsafe_code)]

use std::ffi::{CStr, c_char};

use crate::config::{CLOCK_TICKS_PER_SEC, MAPS_PATH, TraceSwitch, trace_switch_from_env};
use crate::event::{CountersLine, Lossy};
use crate::resolver::RealAllocator;
use crate::sink::TraceSink;
use crate::stack::StackCapturer;
use crate::tracker::Tracker;

const PATH_CAPACITY: usize = 512;

/// Settings read once at attach.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachOptions {
    pub trace: TraceSwitch,
}

impl AttachOptions {
    /// Read `LOGMALLOC_TRACE` from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            trace: trace_switch_from_env(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached,
    AlreadyAttached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachOutcome {
    Detached,
    AlreadyFinalized,
}

/// CPU time used by the process, in `clock(3)` ticks.
fn clock_ticks() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid out-pointer for the duration of the call.
    if unsafe { libc::clock_gettime(libc::CLOCK_PROCESS_CPUTIME_ID, &mut ts) } != 0 {
        return 0;
    }
    let secs = i64::from(ts.tv_sec);
    let nanos = i64::from(ts.tv_nsec);
    secs * CLOCK_TICKS_PER_SEC + nanos * CLOCK_TICKS_PER_SEC / 1_000_000_000
}

/// `<seconds>.<micros>` for a tick difference.
struct ClockDiff(i64);

impl std::fmt::Display for ClockDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ticks = self.0.max(0);
        let secs = ticks / CLOCK_TICKS_PER_SEC;
        let micros = (ticks % CLOCK_TICKS_PER_SEC) * 1_000_000 / CLOCK_TICKS_PER_SEC;
        write!(f, "{secs}.{micros:06}")
    }
}

/// Target of `/proc/self/exe`, into `buf`.
fn read_exe(buf: &mut [u8; PATH_CAPACITY]) -> Option<&[u8]> {
    // SAFETY: readlink writes at most `buf.len()` bytes and does not terminate.
    let n = unsafe {
        libc::readlink(
            c"/proc/self/exe".as_ptr(),
            buf.as_mut_ptr().cast::<c_char>(),
            buf.len(),
        )
    };
    usize::try_from(n).ok().filter(|n| *n > 0).map(|n| &buf[..n])
}

/// Working directory, into `buf`.
fn read_cwd(buf: &mut [u8; PATH_CAPACITY]) -> Option<&[u8]> {
    // SAFETY: getcwd NUL-terminates within `buf.len()` or returns null.
    let p = unsafe { libc::getcwd(buf.as_mut_ptr().cast::<c_char>(), buf.len()) };
    if p.is_null() {
        return None;
    }
    CStr::from_bytes_until_nul(buf).ok().map(CStr::to_bytes)
}

impl<A: RealAllocator, S: TraceSink, C: StackCapturer> Tracker<A, S, C> {
    /// NOT_INITIALIZED -> READY. Only the first call does anything.
    ///
    /// Tracking does not wait for attach: calls made by earlier constructors
    /// are already counted in the `+ INIT` line.
    pub fn attach(&self, options: AttachOptions) -> AttachOutcome {
        if !self.context().begin_attach() {
            return AttachOutcome::AlreadyAttached;
        }
        self.set_trace_enabled(options.trace.enabled());

        if let Err(err) = self.sink().open_snapshot() {
            self.diagnostic(format_args!("log-malloc: {err}"));
        }
        if let Err(err) = self.allocator().ensure_resolved() {
            self.diagnostic(format_args!("log-malloc: {err}"));
        }
        let start = clock_ticks();
        self.context().set_clock_start(start);

        self.diagnostic(format_args!(
            " *** log-malloc trace-fd = {} *** ",
            self.sink().descriptor()
        ));
        self.emit_plain(format_args!(
            "{}",
            CountersLine {
                tag: "INIT",
                totals: self.context().totals(),
                calls: self.context().calls(),
            }
        ));
        self.emit_plain(format_args!("# PID {}", std::process::id()));

        let mut buf = [0u8; PATH_CAPACITY];
        if let Some(exe) = read_exe(&mut buf) {
            self.emit_plain(format_args!("# EXE {}", Lossy(exe)));
        }
        let mut buf = [0u8; PATH_CAPACITY];
        if let Some(cwd) = read_cwd(&mut buf) {
            self.emit_plain(format_args!("# CWD {}", Lossy(cwd)));
        }
        self.emit_plain(format_args!("# CLOCK-START {start}"));
        AttachOutcome::Attached
    }

    /// Any state -> FINALIZED. Later calls are no-ops.
    pub fn detach(&self) -> DetachOutcome {
        if self.context().begin_detach().is_none() {
            return DetachOutcome::AlreadyFinalized;
        }
        self.emit_plain(format_args!(
            "{}",
            CountersLine {
                tag: "FINI",
                totals: self.context().totals(),
                calls: self.context().calls(),
            }
        ));
        if self.context().trace_enabled() {
            self.emit_plain(format_args!("# FILE {}", Lossy(MAPS_PATH.to_bytes())));
            if let Err(err) = self.sink().dump_file(MAPS_PATH) {
                self.logging_failed(err);
            }
        }
        let end = clock_ticks();
        self.emit_plain(format_args!("# CLOCK-END {end}"));
        self.emit_plain(format_args!(
            "# CLOCK-DIFF {}",
            ClockDiff(end - self.context().clock_start())
        ));
        self.sink().close_snapshot();
        DetachOutcome::Detached
    }
}
