//! Engine error type.
//!
//! Every variant is `Copy` and carries no heap data so it can be built on
//! allocator paths without allocating.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TraceError {
    #[error("real allocator bindings could not be resolved")]
    ResolveFailed,
    #[error("real allocator resolution already in progress on this path")]
    ResolveInProgress,
    #[error("memory snapshot source unavailable (errno {errno})")]
    SnapshotUnavailable { errno: i32 },
    #[error("trace descriptor {fd} is invalid (errno {errno})")]
    DescriptorInvalid { fd: i32, errno: i32 },
    #[error("write to trace descriptor {fd} failed (errno {errno})")]
    WriteFailed { fd: i32, errno: i32 },
    #[error("element count {count} times size {size} overflows")]
    SizeOverflow { count: usize, size: usize },
    #[error("alignment {0} is not a power of two multiple of the pointer size")]
    InvalidAlignment(usize),
    #[error("alignment {alignment} is smaller than the {header}-byte envelope header")]
    AlignmentTooSmall { alignment: usize, header: usize },
    #[error("usage at savepoint `{name}` changed: expected {expected}, found {actual}")]
    UsageChanged {
        name: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("trace logging is disabled")]
    LoggingDisabled,
}

impl TraceError {
    /// errno reported at the C boundary for this failure.
    #[must_use]
    pub const fn errno(self) -> i32 {
        match self {
            Self::InvalidAlignment(_) => libc::EINVAL,
            Self::DescriptorInvalid { errno, .. } | Self::WriteFailed { errno, .. } => errno,
            Self::SnapshotUnavailable { errno } => errno,
            _ => libc::ENOMEM,
        }
    }

    /// Whether the trace descriptor must be abandoned for the rest of the process.
    #[must_use]
    pub const fn disables_logging(self) -> bool {
        matches!(self, Self::DescriptorInvalid { .. })
    }
}
