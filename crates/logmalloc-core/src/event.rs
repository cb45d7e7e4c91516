//! Trace line formatting into fixed stack storage.
//!
//! Lines follow the trace wire format:
//!
//! ```text
//! + INIT [<used>:<rused>] malloc=<n> calloc=<n> realloc=<n> memalign=<n>/<n> valloc=<n> free=<n>
//! + <op> <size-or-delta> <ptr> [<ptr2>] [(<extra>)] [<used>:<rused>] [!f]
//! # <KEY> <value>
//! ```
//!
//! Nothing here allocates: lines are built in a [`LineBuf`] that silently
//! truncates once full, always keeping room for a marker and the newline.

use std::fmt;

use crate::context::{CallSnapshot, Totals};

/// Intercepted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Malloc,
    Calloc,
    Realloc,
    Memalign,
    PosixMemalign,
    Valloc,
    Free,
}

impl Op {
    pub const COUNT: usize = 7;

    pub const ALL: [Op; Op::COUNT] = [
        Op::Malloc,
        Op::Calloc,
        Op::Realloc,
        Op::Memalign,
        Op::PosixMemalign,
        Op::Valloc,
        Op::Free,
    ];

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Tag printed after `+ `.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Op::Malloc => "malloc",
            Op::Calloc => "calloc",
            Op::Realloc => "realloc",
            Op::Memalign => "memalign",
            Op::PosixMemalign => "posix_memalign",
            Op::Valloc => "valloc",
            Op::Free => "free",
        }
    }

    /// Whether a stack is captured for this op when the block is ours.
    #[must_use]
    pub const fn wants_stack(self) -> bool {
        !matches!(self, Op::Free)
    }
}

/// Operation-specific fields printed in parentheses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extra {
    None,
    /// `(<count> <size>)` for calloc.
    Elements { count: usize, size: usize },
    /// `(<old> <new>)` for realloc.
    Resize { old: usize, new: usize },
    /// `(<alignment>)` for memalign.
    Alignment(usize),
    /// `(<alignment> <size> : <status>)` for posix_memalign.
    AlignedStatus { alignment: usize, size: usize, status: i32 },
}

/// One tracked call, ready to format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub op: Op,
    /// Size for allocations, delta for realloc, negated size for free.
    pub amount: isize,
    pub ptr: usize,
    pub ptr2: Option<usize>,
    pub extra: Extra,
    pub totals: Totals,
    pub foreign: bool,
}

impl Event {
    #[must_use]
    pub const fn new(op: Op, amount: isize, ptr: usize, totals: Totals) -> Self {
        Self {
            op,
            amount,
            ptr,
            ptr2: None,
            extra: Extra::None,
            totals,
            foreign: false,
        }
    }

    #[must_use]
    pub const fn with_ptr2(mut self, ptr2: usize) -> Self {
        self.ptr2 = Some(ptr2);
        self
    }

    #[must_use]
    pub const fn with_extra(mut self, extra: Extra) -> Self {
        self.extra = extra;
        self
    }

    #[must_use]
    pub const fn foreign(mut self) -> Self {
        self.foreign = true;
        self
    }

    /// Whether the logger should capture a stack for this event.
    #[must_use]
    pub const fn wants_stack(&self) -> bool {
        self.op.wants_stack() || self.foreign
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+ {} {} {:#x}", self.op.tag(), self.amount, self.ptr)?;
        if let Some(ptr2) = self.ptr2 {
            write!(f, " {ptr2:#x}")?;
        }
        match self.extra {
            Extra::None => {}
            Extra::Elements { count, size } => write!(f, " ({count} {size})")?,
            Extra::Resize { old, new } => write!(f, " ({old} {new})")?,
            Extra::Alignment(alignment) => write!(f, " ({alignment})")?,
            Extra::AlignedStatus {
                alignment,
                size,
                status,
            } => write!(f, " ({alignment} {size} : {status})")?,
        }
        write!(f, " [{}:{}]", self.totals.requested, self.totals.usable)?;
        if self.foreign {
            f.write_str(" !f")?;
        }
        Ok(())
    }
}

/// `+ INIT` / `+ FINI` counters line.
pub struct CountersLine<'a> {
    pub tag: &'a str,
    pub totals: Totals,
    pub calls: CallSnapshot,
}

impl fmt::Display for CountersLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.calls;
        write!(
            f,
            "+ {} [{}:{}] malloc={} calloc={} realloc={} memalign={}/{} valloc={} free={}",
            self.tag,
            self.totals.requested,
            self.totals.usable,
            c.malloc,
            c.calloc,
            c.realloc,
            c.memalign,
            c.posix_memalign,
            c.valloc,
            c.free
        )
    }
}

/// Displays raw bytes, replacing invalid UTF-8 with `?`.
pub struct Lossy<'a>(pub &'a [u8]);

impl fmt::Display for Lossy<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for chunk in self.0.utf8_chunks() {
            f.write_str(chunk.valid())?;
            if !chunk.invalid().is_empty() {
                f.write_str("?")?;
            }
        }
        Ok(())
    }
}

/// Bytes kept free for a trailing marker and the newline.
const RESERVED: usize = 2;

/// Fixed-capacity line buffer.
pub struct LineBuf<const N: usize> {
    buf: [u8; N],
    len: usize,
    truncated: bool,
}

impl<const N: usize> LineBuf<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
            truncated: false,
        }
    }

    const fn limit() -> usize {
        N.saturating_sub(RESERVED)
    }

    /// Append raw bytes, dropping whatever does not fit.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        let room = Self::limit().saturating_sub(self.len);
        let take = bytes.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&bytes[..take]);
        self.len += take;
        if take < bytes.len() {
            self.truncated = true;
        }
    }

    pub fn push_str(&mut self, s: &str) {
        self.push_bytes(s.as_bytes());
    }

    /// Writable tail for an in-place read, capped so the newline still fits.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let limit = Self::limit();
        &mut self.buf[self.len.min(limit)..limit]
    }

    /// Account for `n` bytes written into [`Self::spare_mut`].
    pub fn commit(&mut self, n: usize) {
        self.len = (self.len + n).min(Self::limit());
    }

    /// Cut the line back to `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    /// Drop trailing `\n`/`\r`/spaces.
    pub fn trim_end(&mut self) {
        while self.len > 0 && matches!(self.buf[self.len - 1], b'\n' | b'\r' | b' ') {
            self.len -= 1;
        }
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        Self::limit().saturating_sub(self.len)
    }

    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Terminate with an optional single-byte marker and a newline.
    pub fn finish(&mut self, marker: Option<u8>) -> &[u8] {
        if self.len > 0 && self.buf[self.len - 1] == b'\n' {
            self.len -= 1;
        }
        if let Some(m) = marker {
            self.buf[self.len] = m;
            self.len += 1;
        }
        self.buf[self.len] = b'\n';
        self.len += 1;
        &self.buf[..self.len]
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.truncated = false;
    }
}

impl<const N: usize> Default for LineBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for LineBuf<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_str(s);
        // Truncation is silent: a short line beats a failed format.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fmt::Write;

    use super::*;

    fn render(event: &Event) -> String {
        let mut line = LineBuf::<256>::new();
        write!(line, "{event}").unwrap();
        String::from_utf8(line.as_bytes().to_vec()).unwrap()
    }

    fn totals(requested: usize, usable: usize) -> Totals {
        Totals { requested, usable }
    }

    #[test]
    fn malloc_line_shape() {
        let e = Event::new(Op::Malloc, 64, 0x1000, totals(64, 88));
        assert_eq!(render(&e), "+ malloc 64 0x1000 [64:88]");
    }

    #[test]
    fn free_line_carries_negative_size_and_foreign_marker() {
        let e = Event::new(Op::Free, -64, 0x1000, totals(0, 0));
        assert_eq!(render(&e), "+ free -64 0x1000 [0:0]");
        let f = Event::new(Op::Free, -24, 0x2000, totals(5, 7)).foreign();
        assert_eq!(render(&f), "+ free -24 0x2000 [5:7] !f");
        assert!(f.wants_stack());
        assert!(!e.wants_stack());
    }

    #[test]
    fn realloc_line_has_both_pointers_and_sizes() {
        let e = Event::new(Op::Realloc, -96, 0x10, totals(32, 56))
            .with_ptr2(0x20)
            .with_extra(Extra::Resize { old: 128, new: 32 });
        assert_eq!(render(&e), "+ realloc -96 0x10 0x20 (128 32) [32:56]");
    }

    #[test]
    fn aligned_lines() {
        let m = Event::new(Op::Memalign, 10, 0x40, totals(10, 90)).with_extra(Extra::Alignment(64));
        assert_eq!(render(&m), "+ memalign 10 0x40 (64) [10:90]");
        let p = Event::new(Op::PosixMemalign, 0, 0, totals(0, 0)).with_extra(Extra::AlignedStatus {
            alignment: 16,
            size: 10,
            status: 12,
        });
        assert_eq!(render(&p), "+ posix_memalign 0 0x0 (16 10 : 12) [0:0]");
    }

    #[test]
    fn calloc_line_has_element_shape() {
        let e = Event::new(Op::Calloc, 640, 0x80, totals(640, 680))
            .with_extra(Extra::Elements { count: 10, size: 64 });
        assert_eq!(render(&e), "+ calloc 640 0x80 (10 64) [640:680]");
    }

    #[test]
    fn counters_line_shape() {
        let calls = CallSnapshot {
            malloc: 3,
            calloc: 1,
            realloc: 2,
            memalign: 4,
            posix_memalign: 5,
            valloc: 6,
            free: 7,
            unreliable: 0,
        };
        let line = CountersLine {
            tag: "INIT",
            totals: totals(1, 2),
            calls,
        };
        assert_eq!(
            line.to_string(),
            "+ INIT [1:2] malloc=3 calloc=1 realloc=2 memalign=4/5 valloc=6 free=7"
        );
    }

    #[test]
    fn line_buf_truncates_but_keeps_room_for_terminator() {
        let mut line = LineBuf::<8>::new();
        line.push_str("abcdefghij");
        assert!(line.is_truncated());
        assert_eq!(line.as_bytes(), b"abcdef");
        assert_eq!(line.finish(Some(b'!')), b"abcdef!\n");
    }

    #[test]
    fn finish_does_not_double_newline() {
        let mut line = LineBuf::<16>::new();
        line.push_str("hello\n");
        assert_eq!(line.finish(None), b"hello\n");
    }

    #[test]
    fn spare_and_commit_append_in_place() {
        let mut line = LineBuf::<16>::new();
        line.push_str("ab #");
        let spare = line.spare_mut();
        assert_eq!(spare.len(), 10);
        spare[..3].copy_from_slice(b"1 2");
        line.commit(3);
        assert_eq!(line.as_bytes(), b"ab #1 2");
        assert_eq!(line.remaining(), 7);
    }

    #[test]
    fn lossy_replaces_invalid_utf8() {
        assert_eq!(Lossy(b"lib\xffx.so").to_string(), "lib?x.so");
        assert_eq!(Lossy(b"/usr/bin/true").to_string(), "/usr/bin/true");
    }

    #[test]
    fn op_indices_are_dense() {
        for (i, op) in Op::ALL.iter().enumerate() {
            assert_eq!(op.index(), i);
        }
    }
}
