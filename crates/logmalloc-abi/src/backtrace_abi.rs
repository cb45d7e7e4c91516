//! Crash-dump helper for signal handlers.
//!
//! Call [`log_malloc_backtrace_init`] once at startup, then
//! [`log_malloc_backtrace`] from a `SIGSEGV`/`SIGABRT` handler. The dump
//! uses no heap and writes straight to the given descriptor.

use std::ffi::c_int;
use std::fmt::Write;

use logmalloc_core::config::{LINE_CAPACITY, MAPS_PATH, STATM_PATH};
use logmalloc_core::stack::default_capturer;
use logmalloc_core::{FdSink, FrameList, LineBuf, StackCapturer, TraceError, TraceSink};

const BACKTRACE_BANNER: &[u8] = b"\n======= Backtrace =========\n";
const MAPS_BANNER: &[u8] = b"======= Memory map ========\n";
const END_BANNER: &[u8] = b"===================================\n";

/// Pre-warm stack capture so the first dump does not allocate.
#[unsafe(no_mangle)]
pub extern "C" fn log_malloc_backtrace_init() {
    default_capturer().warm_up();
}

/// Write the current stack and the process map to `fd`.
///
/// Returns the bytes written, or -1.
#[unsafe(no_mangle)]
pub extern "C" fn log_malloc_backtrace(fd: c_int) -> isize {
    match dump(&FdSink::new(fd, STATM_PATH)) {
        Ok(n) => n as isize,
        Err(_) => -1,
    }
}

fn dump<S: TraceSink>(sink: &S) -> Result<usize, TraceError> {
    let capturer = default_capturer();
    let mut frames = FrameList::new();
    capturer.capture(&mut frames);

    let mut written = sink.write_line(BACKTRACE_BANNER)?;
    let mut line = LineBuf::<LINE_CAPACITY>::new();
    for (index, frame) in frames.as_slice().iter().enumerate() {
        line.clear();
        let _ = capturer.write_frame(index, frame, &mut line);
        written += sink.write_line(line.finish(None))?;
    }
    written += sink.write_line(MAPS_BANNER)?;
    written += sink.dump_file(MAPS_PATH)?;
    written += sink.write_line(END_BANNER)?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use logmalloc_core::MemorySink;

    #[test]
    fn dump_frames_the_map_with_banners() {
        let sink = MemorySink::new().with_file(MAPS_PATH, b"7f00-7f01 r-xp 0 00:00 0 /lib/libc.so\n");
        let n = dump(&sink).unwrap();
        let text = sink.contents();
        assert_eq!(n, text.len());
        assert!(text.starts_with("\n======= Backtrace =========\n"));
        let maps = text.find("======= Memory map ========\n").unwrap();
        assert!(text[maps..].contains("/lib/libc.so\n"));
        assert!(text.ends_with("===================================\n"));
    }

    #[test]
    fn dump_fails_on_a_closed_descriptor() {
        assert_eq!(log_malloc_backtrace(-1), -1);
    }
}
