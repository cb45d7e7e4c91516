// All extern "C" exports take raw pointers from C callers and hand them to the
// tracker, which classifies them at runtime.
#![allow(clippy::missing_safety_doc)]
//! # logmalloc-abi
//!
//! `LD_PRELOAD`-able allocator boundary for logmalloc.
//!
//! This crate produces a `cdylib` exporting `malloc`, `calloc`, `realloc`,
//! `memalign`, `posix_memalign`, `valloc` and `free`. Each export forwards to
//! the single process-wide [`tracker()`], which resolves the next definition
//! of every symbol with `dlsym(RTLD_NEXT, ..)` and writes the trace to
//! descriptor [`logmalloc_core::config::TRACE_FD`].
//!
//! ```text
//! C caller -> export (this crate) -> Tracker -> real allocator
//!                                        \-> trace fd
//! ```
//!
//! The program can query and steer the trace through [`api_abi`] and dump a
//! crash report through [`backtrace_abi`].

mod trace_state;

pub use trace_state::{AbiTracker, DlsymNext, tracker};

// Gated behind cfg(not(test)) because these export malloc and friends, which
// would interpose the unit-test binary's own allocator.
#[cfg(not(test))]
pub mod malloc_abi;
#[cfg(not(test))]
mod startup_abi;

pub mod api_abi;
pub mod backtrace_abi;
