//! # logmalloc-core
//!
//! Allocation-tracking engine behind the logmalloc interposer.
//!
//! Every block handed out through the [`tracker::Tracker`] is preceded by an
//! [`envelope::Envelope`] recording its requested size and an integrity word.
//! The tracker keeps byte-exact running totals in a [`context::TrackingContext`]
//! and writes one trace line per call through the [`logger::EventLogger`],
//! optionally followed by the caller's stack.
//!
//! Nothing in this crate exports allocator symbols. The platform-specific
//! interposition (symbol lookup, `no_mangle` entry points, load/unload hooks)
//! lives in `logmalloc-abi`, which plugs a [`resolver::ResolvedTable`] into
//! the generic tracker.

#![deny(unsafe_code)]

pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod logger;
pub mod resolver;
pub mod savepoint;
pub mod sink;
pub mod stack;
pub mod tracker;

pub use config::TraceSwitch;
pub use context::{CallSnapshot, LifecycleState, Totals, TrackingContext};
pub use envelope::{Block, Envelope, HEADER_SIZE};
pub use error::TraceError;
pub use event::{Event, Extra, LineBuf, Op};
pub use lifecycle::{AttachOptions, AttachOutcome, DetachOutcome};
pub use resolver::{LibcAllocator, RealAllocator, Resolution, ResolvedTable, SymbolLookup};
pub use savepoint::{Savepoint, UsageProbe};
pub use sink::{FdSink, MemorySink, TraceSink};
pub use stack::{CursorUnwind, DefaultCapturer, Frame, FrameList, NoFrames, ReturnAddressWalk, StackCapturer};
pub use tracker::Tracker;
