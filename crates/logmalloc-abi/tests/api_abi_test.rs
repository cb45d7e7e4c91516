//! Exercises the exported symbols against the process-wide tracker.

use std::ffi::c_void;
use std::fs;
use std::os::fd::AsRawFd;
use std::ptr;

use logmalloc_abi::api_abi::{log_malloc_get_usage, log_malloc_trace_puts};
use logmalloc_abi::backtrace_abi::{log_malloc_backtrace, log_malloc_backtrace_init};
use logmalloc_abi::malloc_abi::{calloc, free, malloc, memalign, posix_memalign, realloc, valloc};
use logmalloc_abi::tracker;
use logmalloc_core::config::TRACE_FD;
use logmalloc_core::{Block, HEADER_SIZE, envelope};

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn tracked_size(p: *mut c_void) -> Option<usize> {
    match unsafe { envelope::classify(p) } {
        Block::Tracked { envelope, .. } => Some(envelope.size),
        Block::Foreign => None,
    }
}

#[test]
fn malloc_and_free_go_through_the_tracker() {
    let p = unsafe { malloc(100) };
    assert!(!p.is_null());
    assert_eq!(tracked_size(p), Some(100));
    unsafe { free(p) };
    unsafe { free(ptr::null_mut()) };
}

#[test]
fn call_counting_follows_the_crate_feature() {
    let before = tracker().context().calls().valloc;
    let p = unsafe { valloc(24) };
    assert!(!p.is_null());
    let after = tracker().context().calls().valloc;
    if cfg!(feature = "call-counting") {
        assert!(after > before);
    } else {
        assert_eq!(after, 0);
    }
    unsafe { free(p) };
}

#[test]
fn usage_covers_a_live_block() {
    let big = 1 << 20;
    let p = unsafe { malloc(big) };
    assert!(log_malloc_get_usage() >= big);
    unsafe { free(p) };
}

#[test]
fn calloc_overflow_fails_with_enomem() {
    let p = unsafe { calloc(usize::MAX / 4, 8) };
    assert!(p.is_null());
    assert_eq!(errno(), libc::ENOMEM);
}

#[test]
fn realloc_keeps_contents_and_tracking() {
    let p = unsafe { realloc(ptr::null_mut(), 8) };
    unsafe { p.cast::<u64>().write(0x1122_3344_5566_7788) };
    let q = unsafe { realloc(p, 4096) };
    assert_eq!(tracked_size(q), Some(4096));
    assert_eq!(unsafe { q.cast::<u64>().read() }, 0x1122_3344_5566_7788);
    unsafe { free(q) };
}

#[test]
fn aligned_variants_honour_alignment() {
    let p = unsafe { memalign(128, 10) };
    assert_eq!(p as usize % 128, 0);
    assert_eq!(tracked_size(p), Some(10));
    unsafe { free(p) };

    let v = unsafe { valloc(10) };
    assert_eq!(v as usize % 4096, 0);
    unsafe { free(v) };

    assert!(unsafe { memalign(HEADER_SIZE / 2, 10) }.is_null());
    assert_eq!(errno(), libc::ENOMEM);
}

#[test]
fn posix_memalign_status_codes() {
    let mut out = ptr::null_mut();
    assert_eq!(unsafe { posix_memalign(&mut out, 64, 24) }, 0);
    assert_eq!(out as usize % 64, 0);
    unsafe { free(out) };

    assert_eq!(unsafe { posix_memalign(&mut out, 16, 24) }, libc::ENOMEM);
    assert_eq!(unsafe { posix_memalign(&mut out, 100, 24) }, libc::EINVAL);
    assert_eq!(unsafe { posix_memalign(ptr::null_mut(), 64, 24) }, libc::EINVAL);
}

#[test]
fn trace_puts_rejects_null() {
    assert_eq!(unsafe { log_malloc_trace_puts(ptr::null()) }, -1);
    assert_eq!(errno(), libc::EINVAL);
}

#[test]
fn trace_lines_fail_when_the_trace_fd_is_not_open() {
    if unsafe { libc::fcntl(TRACE_FD, libc::F_GETFD) } != -1 {
        return;
    }
    assert!(logmalloc_abi::trace_printf!("# APP {}", 1).is_err());
    assert_eq!(unsafe { log_malloc_trace_puts(c"# APP".as_ptr()) }, -1);
}

#[test]
fn backtrace_dump_writes_banners_and_map() {
    log_malloc_backtrace_init();
    let path = std::env::temp_dir().join(format!("logmalloc-bt-{}", std::process::id()));
    let file = fs::File::create(&path).unwrap();
    let n = log_malloc_backtrace(file.as_raw_fd());
    drop(file);
    let text = fs::read_to_string(&path).unwrap();
    fs::remove_file(&path).ok();

    assert!(n > 0);
    assert_eq!(n as usize, text.len());
    assert!(text.starts_with("\n======= Backtrace =========\n"));
    assert!(text.contains("======= Memory map ========\n"));
    assert!(text.contains("[stack]"));
    assert!(text.ends_with("===================================\n"));
}
