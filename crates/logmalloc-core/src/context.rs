//! Process-wide tracking context.
//!
//! Running totals and call counters use relaxed atomics: they are
//! best-effort accounting, and a trace line may show totals that already
//! include a racing update from another thread. The lifecycle state uses a
//! compare-and-swap so attach and detach each win exactly once.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicUsize, Ordering};

use crate::config::COUNT_CALLS;
use crate::event::Op;

/// Lifecycle of the tracking context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    NotInitialized = 0,
    Ready = 1,
    Finalized = 2,
}

impl LifecycleState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Ready,
            2 => Self::Finalized,
            _ => Self::NotInitialized,
        }
    }
}

/// Byte totals observed right after an update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    /// Sum of requested sizes of live tracked blocks.
    pub requested: usize,
    /// Sum of real allocator block sizes of live tracked blocks.
    pub usable: usize,
}

/// Point-in-time copy of the call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallSnapshot {
    pub malloc: usize,
    pub calloc: usize,
    pub realloc: usize,
    pub memalign: usize,
    pub posix_memalign: usize,
    pub valloc: usize,
    pub free: usize,
    /// Calls serviced without tracking.
    pub unreliable: usize,
}

impl CallSnapshot {
    #[must_use]
    pub const fn get(&self, op: Op) -> usize {
        match op {
            Op::Malloc => self.malloc,
            Op::Calloc => self.calloc,
            Op::Realloc => self.realloc,
            Op::Memalign => self.memalign,
            Op::PosixMemalign => self.posix_memalign,
            Op::Valloc => self.valloc,
            Op::Free => self.free,
        }
    }
}

/// Shared state of the tracking engine.
pub struct TrackingContext {
    state: AtomicU8,
    requested: AtomicUsize,
    usable: AtomicUsize,
    calls: [AtomicUsize; Op::COUNT],
    unreliable: AtomicUsize,
    /// Set by the runtime control surface; suppresses trace lines.
    trace_disabled: AtomicBool,
    /// Set after the first invalid-descriptor write; never cleared.
    logging_dead: AtomicBool,
    clock_start: AtomicI64,
}

impl TrackingContext {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::NotInitialized as u8),
            requested: AtomicUsize::new(0),
            usable: AtomicUsize::new(0),
            calls: [const { AtomicUsize::new(0) }; Op::COUNT],
            unreliable: AtomicUsize::new(0),
            trace_disabled: AtomicBool::new(false),
            logging_dead: AtomicBool::new(false),
            clock_start: AtomicI64::new(0),
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.state() == LifecycleState::Finalized
    }

    /// NOT_INITIALIZED -> READY. Returns true for the single winner.
    pub fn begin_attach(&self) -> bool {
        self.state
            .compare_exchange(
                LifecycleState::NotInitialized as u8,
                LifecycleState::Ready as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Any state -> FINALIZED. Returns the state it left, or `None` when
    /// the context was already finalized.
    pub fn begin_detach(&self) -> Option<LifecycleState> {
        let previous = self
            .state
            .swap(LifecycleState::Finalized as u8, Ordering::AcqRel);
        match LifecycleState::from_u8(previous) {
            LifecycleState::Finalized => None,
            other => Some(other),
        }
    }

    /// Apply signed deltas to both totals and return the values right after.
    pub fn apply(&self, requested: isize, usable: isize) -> Totals {
        // Wrapping adds of the two's-complement delta implement fetch_sub too.
        let r = self
            .requested
            .fetch_add(requested as usize, Ordering::Relaxed)
            .wrapping_add(requested as usize);
        let u = self
            .usable
            .fetch_add(usable as usize, Ordering::Relaxed)
            .wrapping_add(usable as usize);
        Totals {
            requested: r,
            usable: u,
        }
    }

    #[must_use]
    pub fn totals(&self) -> Totals {
        Totals {
            requested: self.requested.load(Ordering::Relaxed),
            usable: self.usable.load(Ordering::Relaxed),
        }
    }

    pub fn record_call(&self, op: Op) {
        if COUNT_CALLS {
            self.calls[op.index()].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_untracked(&self) {
        self.unreliable.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn calls(&self) -> CallSnapshot {
        let get = |op: Op| self.calls[op.index()].load(Ordering::Relaxed);
        CallSnapshot {
            malloc: get(Op::Malloc),
            calloc: get(Op::Calloc),
            realloc: get(Op::Realloc),
            memalign: get(Op::Memalign),
            posix_memalign: get(Op::PosixMemalign),
            valloc: get(Op::Valloc),
            free: get(Op::Free),
            unreliable: self.unreliable.load(Ordering::Relaxed),
        }
    }

    pub fn set_trace_enabled(&self, enabled: bool) {
        self.trace_disabled.store(!enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn trace_enabled(&self) -> bool {
        !self.trace_disabled.load(Ordering::Relaxed) && !self.logging_dead()
    }

    /// Abandon the trace descriptor. Returns true only for the first caller.
    pub fn kill_logging(&self) -> bool {
        !self.logging_dead.swap(true, Ordering::AcqRel)
    }

    #[must_use]
    pub fn logging_dead(&self) -> bool {
        self.logging_dead.load(Ordering::Relaxed)
    }

    pub fn set_clock_start(&self, ticks: i64) {
        self.clock_start.store(ticks, Ordering::Relaxed);
    }

    #[must_use]
    pub fn clock_start(&self) -> i64 {
        self.clock_start.load(Ordering::Relaxed)
    }
}

impl Default for TrackingContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_wins_once() {
        let ctx = TrackingContext::new();
        assert_eq!(ctx.state(), LifecycleState::NotInitialized);
        assert!(ctx.begin_attach());
        assert!(!ctx.begin_attach());
        assert_eq!(ctx.state(), LifecycleState::Ready);
    }

    #[test]
    fn detach_wins_once_even_without_attach() {
        let ctx = TrackingContext::new();
        assert_eq!(ctx.begin_detach(), Some(LifecycleState::NotInitialized));
        assert_eq!(ctx.begin_detach(), None);
        assert!(ctx.is_finalized());
        assert!(!ctx.begin_attach());
    }

    #[test]
    fn negative_deltas_subtract() {
        let ctx = TrackingContext::new();
        assert_eq!(ctx.apply(64, 80), Totals { requested: 64, usable: 80 });
        assert_eq!(ctx.apply(64, 48), Totals { requested: 128, usable: 128 });
        assert_eq!(ctx.apply(-96, -80), Totals { requested: 32, usable: 48 });
        assert_eq!(ctx.apply(-32, -48), Totals::default());
    }

    #[test]
    #[cfg_attr(not(feature = "call-counting"), ignore)]
    fn call_counters_are_per_operation() {
        let ctx = TrackingContext::new();
        ctx.record_call(Op::Malloc);
        ctx.record_call(Op::Malloc);
        ctx.record_call(Op::PosixMemalign);
        ctx.record_untracked();
        let calls = ctx.calls();
        assert_eq!(calls.malloc, 2);
        assert_eq!(calls.posix_memalign, 1);
        assert_eq!(calls.free, 0);
        assert_eq!(calls.unreliable, 1);
        assert_eq!(calls.get(Op::Malloc), 2);
    }

    #[test]
    fn dead_logging_overrides_enable() {
        let ctx = TrackingContext::new();
        assert!(ctx.trace_enabled());
        ctx.set_trace_enabled(false);
        assert!(!ctx.trace_enabled());
        ctx.set_trace_enabled(true);
        assert!(ctx.kill_logging());
        assert!(!ctx.kill_logging());
        assert!(!ctx.trace_enabled());
    }
}
