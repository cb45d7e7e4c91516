//! Reentrancy-safe trace writer.
//!
//! One call produces one line, written with a single `write`. If the
//! logger is re-entered on the same thread (stack capture or symbol lookup
//! allocating, a signal handler allocating mid-line) the inner call writes a
//! degraded line instead: no snapshot, no stack, and a trailing `!`.
//!
//! Stack frames are kept next to their event line by a try-only lock. When
//! the lock is busy the event line is written alone and its frames dropped;
//! nothing on this path ever waits.

use std::cell::Cell;
use std::fmt::{self, Write};

use parking_lot::{Mutex, const_mutex};

use crate::config::LINE_CAPACITY;
use crate::error::TraceError;
use crate::event::{Event, LineBuf};
use crate::sink::TraceSink;
use crate::stack::{FrameList, StackCapturer};

thread_local! {
    static IN_TRACE: Cell<bool> = const { Cell::new(false) };
}

/// Marks this thread as inside the logger for as long as it lives.
struct TraceGuard;

impl TraceGuard {
    /// `None` when this thread is already logging, or its TLS is gone.
    fn enter() -> Option<Self> {
        IN_TRACE
            .try_with(|flag| if flag.replace(true) { None } else { Some(TraceGuard) })
            .ok()
            .flatten()
    }
}

impl Drop for TraceGuard {
    fn drop(&mut self) {
        let _ = IN_TRACE.try_with(|flag| flag.set(false));
    }
}

/// How a line ended up on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emitted {
    /// Full line, with snapshot and frames when requested and available.
    Full,
    /// Full line but its frames were dropped because the lock was busy.
    Unsynchronized,
    /// Reentrant call: minimal line marked with `!`.
    Degraded,
}

pub struct EventLogger<S, C> {
    sink: S,
    capturer: C,
    lock: Mutex<()>,
}

impl<S: TraceSink, C: StackCapturer> EventLogger<S, C> {
    #[must_use]
    pub const fn new(sink: S, capturer: C) -> Self {
        Self {
            sink,
            capturer,
            lock: const_mutex(()),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn capturer(&self) -> &C {
        &self.capturer
    }

    /// Write one event line, plus snapshot and stack when possible.
    pub fn emit(&self, event: &Event) -> Result<Emitted, TraceError> {
        let mut line = LineBuf::<LINE_CAPACITY>::new();
        let _ = write!(line, "{event}");

        let Some(_guard) = TraceGuard::enter() else {
            self.sink.write_line(line.finish(Some(b'!')))?;
            return Ok(Emitted::Degraded);
        };

        let mut frames = FrameList::new();
        if event.wants_stack() {
            self.capturer.capture(&mut frames);
        }
        self.append_snapshot(&mut line);
        let bytes = line.finish(None);

        if frames.is_empty() {
            self.sink.write_line(bytes)?;
            return Ok(Emitted::Full);
        }
        match self.lock.try_lock() {
            Some(_held) => {
                self.sink.write_line(bytes)?;
                self.write_frames(&frames)?;
                Ok(Emitted::Full)
            }
            None => {
                self.sink.write_line(bytes)?;
                Ok(Emitted::Unsynchronized)
            }
        }
    }

    /// Write a plain line (header, marker, application text) with no snapshot or stack.
    pub fn emit_plain<const N: usize>(&self, args: fmt::Arguments<'_>) -> Result<usize, TraceError> {
        let mut line = LineBuf::<N>::new();
        let _ = line.write_fmt(args);
        self.sink.write_line(line.finish(None))
    }

    fn append_snapshot(&self, line: &mut LineBuf<LINE_CAPACITY>) {
        // Need room for " #" and at least one byte of content.
        if line.remaining() < 3 {
            return;
        }
        let mark = line.len();
        line.push_str(" #");
        match self.sink.read_snapshot(line.spare_mut()) {
            Some(n) => {
                line.commit(n);
                line.trim_end();
            }
            None => line.truncate(mark),
        }
    }

    fn write_frames(&self, frames: &FrameList) -> Result<(), TraceError> {
        let mut line = LineBuf::<LINE_CAPACITY>::new();
        for (index, frame) in frames.as_slice().iter().enumerate() {
            line.clear();
            let _ = self.capturer.write_frame(index, frame, &mut line);
            self.sink.write_line(line.finish(None))?;
        }
        Ok(())
    }
}

/// Whether the calling thread is currently inside [`EventLogger::emit`].
#[must_use]
pub fn in_trace() -> bool {
    IN_TRACE.try_with(Cell::get).unwrap_or(true)
}
