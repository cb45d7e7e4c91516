//! Build-time trace configuration.
//!
//! Everything here is fixed when the library is compiled:
//! - `TRACE_FD`: descriptor the trace is written to. Defaults to 1022 and can be
//!   overridden with `LOGMALLOC_TRACE_FD=<n>` in the build environment.
//! - `STATM_PATH` / `MAPS_PATH`: memory-snapshot and process-map sources.
//! - `BACKTRACE_DEPTH`: frame cap for stack capture.
//! - `call-counting` / `detailed-unwind` cargo features.
//!
//! The one runtime knob is `LOGMALLOC_TRACE`, read once at attach to decide
//! whether header and event lines start out enabled.

use std::ffi::CStr;

use libc::c_int;

/// Default trace descriptor when the build does not override it.
pub const DEFAULT_TRACE_FD: c_int = 1022;

/// Descriptor the trace stream is written to.
pub const TRACE_FD: c_int = parse_fd(option_env!("LOGMALLOC_TRACE_FD"), DEFAULT_TRACE_FD);

/// Memory-usage snapshot source, read with positioned reads at offset 0.
pub const STATM_PATH: &CStr = c"/proc/self/statm";

/// Process memory map, dumped once at detach.
pub const MAPS_PATH: &CStr = c"/proc/self/maps";

/// Maximum number of frames captured per event.
pub const BACKTRACE_DEPTH: usize = 7;

/// Per-operation call counters are maintained.
pub const COUNT_CALLS: bool = cfg!(feature = "call-counting");

/// Capacity of a single event line, snapshot fragment included.
pub const LINE_CAPACITY: usize = 256;

/// Capacity of an application-supplied trace line.
pub const APP_LINE_CAPACITY: usize = 1024;

/// Environment variable consulted at attach.
pub const TRACE_SWITCH_ENV: &CStr = c"LOGMALLOC_TRACE";

/// `clock()` ticks per second on Linux (POSIX XSI requires 1_000_000).
pub const CLOCK_TICKS_PER_SEC: i64 = 1_000_000;

/// Parse a decimal descriptor number at compile time, falling back to
/// `default` on anything malformed.
#[must_use]
pub const fn parse_fd(raw: Option<&str>, default: c_int) -> c_int {
    let Some(raw) = raw else {
        return default;
    };
    let bytes = raw.as_bytes();
    if bytes.is_empty() || bytes.len() > 9 {
        return default;
    }
    let mut value: c_int = 0;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if !b.is_ascii_digit() {
            return default;
        }
        value = value * 10 + (b - b'0') as c_int;
        i += 1;
    }
    value
}

/// Initial state of trace emission.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceSwitch {
    /// Header and event lines are written.
    #[default]
    On,
    /// Counters still run; nothing is written until re-enabled.
    Off,
}

impl TraceSwitch {
    /// Parse from raw environment bytes (case-insensitive).
    ///
    /// Works on bytes so it can run inside the load-time hook without
    /// allocating.
    #[must_use]
    pub fn from_bytes_loose(raw: &[u8]) -> Self {
        const OFF: [&[u8]; 5] = [b"0", b"off", b"false", b"no", b"disabled"];
        if OFF.iter().any(|word| raw.eq_ignore_ascii_case(word)) {
            Self::Off
        } else {
            Self::On
        }
    }

    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        Self::from_bytes_loose(s.trim().as_bytes())
    }

    #[must_use]
    pub const fn enabled(self) -> bool {
        matches!(self, Self::On)
    }
}

/// Read `LOGMALLOC_TRACE` without allocating.
#[must_use]
#[allow(unsafe_code)]
pub fn trace_switch_from_env() -> TraceSwitch {
    // SAFETY: getenv returns either null or a pointer into the environment
    // block, which stays valid while no one calls setenv concurrently.
    let raw = unsafe { libc::getenv(TRACE_SWITCH_ENV.as_ptr()) };
    if raw.is_null() {
        return TraceSwitch::default();
    }
    // SAFETY: non-null getenv results are NUL-terminated.
    let value = unsafe { CStr::from_ptr(raw) };
    TraceSwitch::from_bytes_loose(value.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fd_accepts_plain_decimal() {
        assert_eq!(parse_fd(Some("3"), 1022), 3);
        assert_eq!(parse_fd(Some("1022"), 7), 1022);
    }

    #[test]
    fn parse_fd_falls_back_on_garbage() {
        assert_eq!(parse_fd(None, 1022), 1022);
        assert_eq!(parse_fd(Some(""), 1022), 1022);
        assert_eq!(parse_fd(Some("-1"), 1022), 1022);
        assert_eq!(parse_fd(Some("12a"), 1022), 1022);
        assert_eq!(parse_fd(Some("9999999999"), 1022), 1022);
    }

    #[test]
    fn trace_switch_parses_loosely() {
        assert_eq!(TraceSwitch::from_str_loose("off"), TraceSwitch::Off);
        assert_eq!(TraceSwitch::from_str_loose("OFF"), TraceSwitch::Off);
        assert_eq!(TraceSwitch::from_str_loose(" 0 "), TraceSwitch::Off);
        assert_eq!(TraceSwitch::from_str_loose("Disabled"), TraceSwitch::Off);
        assert_eq!(TraceSwitch::from_str_loose("1"), TraceSwitch::On);
        assert_eq!(TraceSwitch::from_str_loose("yes"), TraceSwitch::On);
        assert_eq!(TraceSwitch::from_str_loose(""), TraceSwitch::On);
    }

    #[test]
    fn default_switch_is_enabled() {
        assert!(TraceSwitch::default().enabled());
        assert!(!TraceSwitch::Off.enabled());
    }

    #[test]
    fn default_paths_point_at_procfs() {
        assert_eq!(STATM_PATH.to_bytes(), b"/proc/self/statm");
        assert_eq!(MAPS_PATH.to_bytes(), b"/proc/self/maps");
        assert_eq!(BACKTRACE_DEPTH, 7);
    }
}
