//! Trace output and memory-snapshot access.
//!
//! [`FdSink`] is what the interposer uses: raw `write(2)` on a numbered
//! descriptor plus positioned reads of the snapshot file, none of which
//! allocate. [`MemorySink`] captures everything in memory for tests, benches
//! and offline replays.

#![allow(unsafe_code)]

use std::ffi::CStr;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use libc::c_int;
use parking_lot::Mutex;

use crate::error::TraceError;

/// Destination of trace lines.
pub trait TraceSink {
    /// Write one complete line (or frame) with as few syscalls as possible.
    fn write_line(&self, line: &[u8]) -> Result<usize, TraceError>;

    /// Open the memory-snapshot source. Repeated calls are no-ops.
    fn open_snapshot(&self) -> Result<(), TraceError>;

    /// Positioned read of the snapshot into `buf`. `None` when unavailable.
    fn read_snapshot(&self, buf: &mut [u8]) -> Option<usize>;

    fn close_snapshot(&self);

    /// Copy a whole file (the process map) onto the trace stream.
    fn dump_file(&self, path: &CStr) -> Result<usize, TraceError>;

    /// One-shot operator warning, outside the trace stream.
    fn diagnostic(&self, line: &[u8]);

    /// Descriptor number reported in diagnostics.
    fn descriptor(&self) -> c_int;
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Write all of `bytes` to `fd`, retrying on EINTR and short writes.
fn write_fd(fd: c_int, bytes: &[u8]) -> Result<usize, TraceError> {
    let mut done = 0;
    while done < bytes.len() {
        let rest = &bytes[done..];
        // SAFETY: `rest` is a valid readable slice for its whole length.
        let n = unsafe { libc::write(fd, rest.as_ptr().cast(), rest.len()) };
        if n < 0 {
            let errno = last_errno();
            match errno {
                libc::EINTR => continue,
                libc::EBADF | libc::EINVAL | libc::EPIPE => {
                    return Err(TraceError::DescriptorInvalid { fd, errno });
                }
                _ => return Err(TraceError::WriteFailed { fd, errno }),
            }
        }
        if n == 0 {
            return Err(TraceError::WriteFailed { fd, errno: 0 });
        }
        done += n as usize;
    }
    Ok(done)
}

const CLOSED: c_int = -1;

/// Descriptor-backed sink.
pub struct FdSink {
    trace_fd: c_int,
    diag_fd: c_int,
    snapshot_path: &'static CStr,
    snapshot_fd: AtomicI32,
}

impl FdSink {
    #[must_use]
    pub const fn new(trace_fd: c_int, snapshot_path: &'static CStr) -> Self {
        Self {
            trace_fd,
            diag_fd: libc::STDERR_FILENO,
            snapshot_path,
            snapshot_fd: AtomicI32::new(CLOSED),
        }
    }

    /// Route diagnostics somewhere other than stderr.
    #[must_use]
    pub const fn with_diagnostics(mut self, fd: c_int) -> Self {
        self.diag_fd = fd;
        self
    }
}

impl TraceSink for FdSink {
    fn write_line(&self, line: &[u8]) -> Result<usize, TraceError> {
        write_fd(self.trace_fd, line)
    }

    fn open_snapshot(&self) -> Result<(), TraceError> {
        if self.snapshot_fd.load(Ordering::Acquire) != CLOSED {
            return Ok(());
        }
        // SAFETY: the path is a NUL-terminated static string.
        let fd = unsafe { libc::open(self.snapshot_path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(TraceError::SnapshotUnavailable { errno: last_errno() });
        }
        if self
            .snapshot_fd
            .compare_exchange(CLOSED, fd, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Lost the race; the winner's descriptor stays.
            // SAFETY: `fd` was opened above and never shared.
            unsafe { libc::close(fd) };
        }
        Ok(())
    }

    fn read_snapshot(&self, buf: &mut [u8]) -> Option<usize> {
        let fd = self.snapshot_fd.load(Ordering::Acquire);
        if fd == CLOSED || buf.is_empty() {
            return None;
        }
        // SAFETY: `buf` is a valid writable slice; pread does not move the
        // shared file offset, so concurrent readers are fine.
        let n = unsafe { libc::pread(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
        (n > 0).then_some(n as usize)
    }

    fn close_snapshot(&self) {
        let fd = self.snapshot_fd.swap(CLOSED, Ordering::AcqRel);
        if fd != CLOSED {
            // SAFETY: ownership of `fd` moved out of the atomic above.
            unsafe { libc::close(fd) };
        }
    }

    fn dump_file(&self, path: &CStr) -> Result<usize, TraceError> {
        // SAFETY: `path` is NUL-terminated.
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(TraceError::SnapshotUnavailable { errno: last_errno() });
        }
        let mut chunk = [0u8; 4096];
        let mut total = 0;
        let result = loop {
            // SAFETY: `chunk` is a valid writable buffer.
            let n = unsafe { libc::read(fd, chunk.as_mut_ptr().cast(), chunk.len()) };
            if n < 0 {
                if last_errno() == libc::EINTR {
                    continue;
                }
                break Ok(total);
            }
            if n == 0 {
                break Ok(total);
            }
            match write_fd(self.trace_fd, &chunk[..n as usize]) {
                Ok(w) => total += w,
                Err(e) => break Err(e),
            }
        };
        // SAFETY: `fd` was opened above.
        unsafe { libc::close(fd) };
        result
    }

    fn diagnostic(&self, line: &[u8]) {
        let _ = write_fd(self.diag_fd, line);
    }

    fn descriptor(&self) -> c_int {
        self.trace_fd
    }
}

/// In-memory sink.
#[derive(Default)]
pub struct MemorySink {
    trace: Mutex<Vec<u8>>,
    diagnostics: Mutex<Vec<String>>,
    snapshot: Option<&'static [u8]>,
    snapshot_open: AtomicBool,
    fail_writes: AtomicBool,
    files: Vec<(&'static CStr, &'static [u8])>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `text` as the snapshot once opened.
    #[must_use]
    pub fn with_snapshot(mut self, text: &'static [u8]) -> Self {
        self.snapshot = Some(text);
        self
    }

    /// Serve `contents` when `path` is dumped.
    #[must_use]
    pub fn with_file(mut self, path: &'static CStr, contents: &'static [u8]) -> Self {
        self.files.push((path, contents));
        self
    }

    /// Make every subsequent write fail as if the descriptor were closed.
    pub fn break_descriptor(&self) {
        self.fail_writes.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.trace.lock()).into_owned()
    }

    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_owned).collect()
    }

    #[must_use]
    pub fn diagnostics(&self) -> Vec<String> {
        self.diagnostics.lock().clone()
    }

    #[must_use]
    pub fn snapshot_open(&self) -> bool {
        self.snapshot_open.load(Ordering::Relaxed)
    }
}

impl TraceSink for MemorySink {
    fn write_line(&self, line: &[u8]) -> Result<usize, TraceError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(TraceError::DescriptorInvalid {
                fd: self.descriptor(),
                errno: libc::EBADF,
            });
        }
        self.trace.lock().extend_from_slice(line);
        Ok(line.len())
    }

    fn open_snapshot(&self) -> Result<(), TraceError> {
        if self.snapshot.is_none() {
            return Err(TraceError::SnapshotUnavailable { errno: libc::ENOENT });
        }
        self.snapshot_open.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn read_snapshot(&self, buf: &mut [u8]) -> Option<usize> {
        if !self.snapshot_open() {
            return None;
        }
        let text = self.snapshot?;
        let n = text.len().min(buf.len());
        buf[..n].copy_from_slice(&text[..n]);
        (n > 0).then_some(n)
    }

    fn close_snapshot(&self) {
        self.snapshot_open.store(false, Ordering::Relaxed);
    }

    fn dump_file(&self, path: &CStr) -> Result<usize, TraceError> {
        let contents = self
            .files
            .iter()
            .find(|(p, _)| *p == path)
            .map(|(_, c)| *c)
            .ok_or(TraceError::SnapshotUnavailable { errno: libc::ENOENT })?;
        self.write_line(contents)
    }

    fn diagnostic(&self, line: &[u8]) {
        self.diagnostics
            .lock()
            .push(String::from_utf8_lossy(line).trim_end().to_owned());
    }

    fn descriptor(&self) -> c_int {
        -1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (c_int, c_int) {
        let mut fds = [0 as c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn drain(fd: c_int) -> Vec<u8> {
        let mut buf = [0u8; 512];
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        assert!(n >= 0);
        buf[..n as usize].to_vec()
    }

    #[test]
    fn fd_sink_writes_whole_line() {
        let (r, w) = pipe();
        let sink = FdSink::new(w, c"/proc/self/statm");
        assert_eq!(sink.write_line(b"+ malloc 1 0x10 [1:32]\n"), Ok(23));
        assert_eq!(drain(r), b"+ malloc 1 0x10 [1:32]\n");
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn fd_sink_reports_closed_descriptor_as_invalid() {
        let sink = FdSink::new(-1, c"/proc/self/statm");
        match sink.write_line(b"x\n") {
            Err(TraceError::DescriptorInvalid { fd, errno }) => {
                assert_eq!(fd, -1);
                assert_eq!(errno, libc::EBADF);
            }
            other => panic!("expected invalid descriptor, got {other:?}"),
        }
    }

    #[test]
    fn diagnostics_use_their_own_descriptor() {
        let (r, w) = pipe();
        let sink = FdSink::new(-1, c"/proc/self/statm").with_diagnostics(w);
        assert!(sink.write_line(b"+ malloc 1 0x10 [1:32]\n").is_err());
        sink.diagnostic(b"log-malloc: tracing disabled\n");
        assert_eq!(drain(r), b"log-malloc: tracing disabled\n");
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn fd_sink_reads_statm_repeatedly() {
        let sink = FdSink::new(-1, c"/proc/self/statm");
        sink.open_snapshot().unwrap();
        sink.open_snapshot().unwrap();
        let mut buf = [0u8; 64];
        let first = sink.read_snapshot(&mut buf).unwrap();
        assert!(first > 0);
        assert!(buf[0].is_ascii_digit());
        assert!(sink.read_snapshot(&mut buf).is_some());
        sink.close_snapshot();
        assert!(sink.read_snapshot(&mut buf).is_none());
    }

    #[test]
    fn fd_sink_missing_snapshot_is_reported() {
        let sink = FdSink::new(-1, c"/nonexistent/logmalloc/statm");
        assert!(matches!(
            sink.open_snapshot(),
            Err(TraceError::SnapshotUnavailable { .. })
        ));
        let mut buf = [0u8; 8];
        assert!(sink.read_snapshot(&mut buf).is_none());
    }

    #[test]
    fn fd_sink_dumps_file_through_trace_fd() {
        let (r, w) = pipe();
        let sink = FdSink::new(w, c"/proc/self/statm");
        let n = sink.dump_file(c"/proc/self/statm").unwrap();
        assert!(n > 0);
        let got = drain(r);
        assert_eq!(got.len(), n);
        assert_eq!(got.last(), Some(&b'\n'));
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn memory_sink_simulates_broken_descriptor() {
        let sink = MemorySink::new();
        sink.write_line(b"a\n").unwrap();
        sink.break_descriptor();
        assert!(sink.write_line(b"b\n").is_err());
        assert_eq!(sink.lines(), vec!["a"]);
    }

    #[test]
    fn memory_sink_snapshot_requires_open() {
        let sink = MemorySink::new().with_snapshot(b"10 5 3 1 0 2 0\n");
        let mut buf = [0u8; 32];
        assert!(sink.read_snapshot(&mut buf).is_none());
        sink.open_snapshot().unwrap();
        assert_eq!(sink.read_snapshot(&mut buf), Some(15));
    }
}
