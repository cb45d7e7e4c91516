//! The process-wide tracker behind every export.

use std::ffi::{CStr, c_void};

use logmalloc_core::config::{STATM_PATH, TRACE_FD};
use logmalloc_core::stack::default_capturer;
use logmalloc_core::{DefaultCapturer, FdSink, ResolvedTable, SymbolLookup, Tracker};

/// Resolves the next definition of a symbol after this library.
#[derive(Debug, Clone, Copy, Default)]
pub struct DlsymNext;

impl SymbolLookup for DlsymNext {
    fn lookup(&self, name: &CStr) -> *mut c_void {
        // SAFETY: `name` is NUL-terminated; RTLD_NEXT is valid from a loaded object.
        unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) }
    }
}

pub type AbiTracker = Tracker<ResolvedTable<DlsymNext>, FdSink, DefaultCapturer>;

static TRACKER: AbiTracker = Tracker::new(
    ResolvedTable::new(DlsymNext),
    FdSink::new(TRACE_FD, STATM_PATH),
    default_capturer(),
);

/// The tracker shared by every thread and every export.
#[inline]
#[must_use]
pub fn tracker() -> &'static AbiTracker {
    &TRACKER
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlsym_next_finds_the_allocator() {
        assert!(!DlsymNext.lookup(c"malloc").is_null());
        assert!(!DlsymNext.lookup(c"malloc_usable_size").is_null());
        assert!(DlsymNext.lookup(c"logmalloc_no_such_symbol").is_null());
    }

    #[test]
    fn tracker_writes_to_the_configured_descriptor() {
        use logmalloc_core::TraceSink;
        assert_eq!(tracker().sink().descriptor(), TRACE_FD);
    }
}
