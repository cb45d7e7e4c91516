//! Replays a parsed trace to the set of blocks still live at its end.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::parse::{Counters, CountersTag, Record, TraceEvent};

/// A block allocated and never released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveBlock {
    pub ptr: u64,
    pub size: u64,
    pub op: String,
    /// Line of the event that produced the block's current address.
    pub line: usize,
    pub frames: Vec<String>,
}

/// A release of an address the replay never saw allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UnknownFree {
    pub ptr: u64,
    pub line: usize,
}

/// Outcome of a replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Replay {
    pub events: usize,
    pub live_blocks: Vec<LiveBlock>,
    pub live_bytes: u64,
    pub foreign_frees: usize,
    pub unknown_frees: Vec<UnknownFree>,
    pub degraded_lines: usize,
    /// `used` total on the last event or counters line.
    pub last_used: Option<u64>,
    /// Whether `live_bytes` matches `last_used`.
    pub consistent: bool,
    pub peak_used: u64,
    pub ops: BTreeMap<String, u64>,
    pub init: Option<Counters>,
    pub fini: Option<Counters>,
}

#[derive(Debug, Default)]
pub struct LeakFinder {
    live: HashMap<u64, LiveBlock>,
    events: usize,
    foreign_frees: usize,
    unknown_frees: Vec<UnknownFree>,
    degraded: usize,
    last_used: Option<u64>,
    peak_used: u64,
    ops: BTreeMap<String, u64>,
    init: Option<Counters>,
    fini: Option<Counters>,
    /// Block that stack frame lines attach to.
    frame_target: Option<u64>,
}

impl LeakFinder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay every record of a parsed trace.
    #[must_use]
    pub fn replay(records: &[(usize, Record)]) -> Replay {
        let mut finder = Self::new();
        for (line, record) in records {
            finder.feed(*line, record);
        }
        finder.finish()
    }

    pub fn feed(&mut self, line: usize, record: &Record) {
        match record {
            Record::Event(event) => self.apply(line, event),
            Record::Frame { text } => {
                if let Some(block) = self.frame_target.and_then(|ptr| self.live.get_mut(&ptr)) {
                    block.frames.push(text.clone());
                }
            }
            Record::Counters(counters) => {
                self.frame_target = None;
                self.observe_used(counters.used);
                match counters.tag {
                    CountersTag::Init => self.init = Some(counters.clone()),
                    CountersTag::Fini => self.fini = Some(counters.clone()),
                }
            }
            _ => self.frame_target = None,
        }
    }

    fn observe_used(&mut self, used: u64) {
        self.last_used = Some(used);
        self.peak_used = self.peak_used.max(used);
    }

    fn track(&mut self, line: usize, event: &TraceEvent, ptr: u64, size: u64) {
        self.live.insert(
            ptr,
            LiveBlock {
                ptr,
                size,
                op: event.op.clone(),
                line,
                frames: Vec::new(),
            },
        );
        self.frame_target = Some(ptr);
    }

    fn untrack(&mut self, line: usize, ptr: u64) -> Option<LiveBlock> {
        let block = self.live.remove(&ptr);
        if block.is_none() {
            self.unknown_frees.push(UnknownFree { ptr, line });
        }
        block
    }

    fn apply(&mut self, line: usize, event: &TraceEvent) {
        self.events += 1;
        *self.ops.entry(event.op.clone()).or_default() += 1;
        if event.degraded {
            self.degraded += 1;
        }
        self.observe_used(event.used);
        self.frame_target = None;

        if event.is_release() {
            if event.foreign {
                self.foreign_frees += 1;
            } else {
                self.untrack(line, event.ptr);
            }
            return;
        }
        if event.is_resize() {
            let fresh = event.ptr2.unwrap_or(0);
            if event.foreign || fresh == 0 {
                return;
            }
            let old_size = match event.ptr {
                0 => 0,
                old => self.untrack(line, old).map_or(0, |b| b.size),
            };
            let size = event
                .extra
                .get(1)
                .and_then(|n| u64::try_from(*n).ok())
                .unwrap_or_else(|| old_size.saturating_add_signed(event.amount));
            self.track(line, event, fresh, size);
            return;
        }
        if event.ptr != 0 {
            self.track(line, event, event.ptr, event.amount.unsigned_abs());
        }
    }

    #[must_use]
    pub fn finish(self) -> Replay {
        let mut live_blocks: Vec<LiveBlock> = self.live.into_values().collect();
        live_blocks.sort_by_key(|b| (b.line, b.ptr));
        let live_bytes = live_blocks.iter().map(|b| b.size).sum();
        Replay {
            events: self.events,
            consistent: self.last_used.is_none_or(|used| used == live_bytes),
            live_blocks,
            live_bytes,
            foreign_frees: self.foreign_frees,
            unknown_frees: self.unknown_frees,
            degraded_lines: self.degraded,
            last_used: self.last_used,
            peak_used: self.peak_used,
            ops: self.ops,
            init: self.init,
            fini: self.fini,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_trace;

    fn replay(text: &str) -> Replay {
        LeakFinder::replay(&parse_trace(text).unwrap())
    }

    #[test]
    fn balanced_trace_has_no_leaks() {
        let r = replay(
            "+ malloc 64 0x10 [64:96]\n\
             + realloc 64 0x10 0x20 (64 128) [128:160]\n\
             + realloc -96 0x20 0x30 (128 32) [32:64]\n\
             + free -32 0x30 [0:0]\n",
        );
        assert!(r.live_blocks.is_empty());
        assert_eq!(r.live_bytes, 0);
        assert!(r.consistent);
        assert_eq!(r.peak_used, 128);
        assert_eq!(r.ops["realloc"], 2);
    }

    #[test]
    fn leak_keeps_line_and_frames() {
        let r = replay(
            "+ malloc 10 0x10 [10:48]\n\
             demo(main+0x10)[0x401000]\n\
             demo(start+0x2)[0x400800]\n\
             + calloc 80 0x20 (10 8) [90:176]\n\
             + free -80 0x20 [10:48]\n",
        );
        assert_eq!(r.live_blocks.len(), 1);
        let leak = &r.live_blocks[0];
        assert_eq!((leak.ptr, leak.size, leak.line), (0x10, 10, 1));
        assert_eq!(leak.frames, vec!["demo(main+0x10)[0x401000]", "demo(start+0x2)[0x400800]"]);
        assert!(r.consistent);
    }

    #[test]
    fn unwinder_frames_attach_to_the_leak() {
        let r = replay(
            "+ malloc 10 0x10 [10:48]\n\
             #0 0x401000 main+0x10\n\
             #1 0x400800 start+0x2\n",
        );
        assert_eq!(r.live_blocks.len(), 1);
        assert_eq!(
            r.live_blocks[0].frames,
            vec!["#0 0x401000 main+0x10", "#1 0x400800 start+0x2"]
        );
    }

    #[test]
    fn failed_calls_do_not_create_blocks() {
        let r = replay(
            "+ calloc 0 0x0 (4611686018427387903 8) [0:0]\n\
             + realloc 0 0x40 0x0 (16 99999) [16:48]\n\
             + malloc 16 0x40 [16:48]\n",
        );
        assert_eq!(r.live_blocks.len(), 1);
        assert!(r.unknown_frees.is_empty());
    }

    #[test]
    fn foreign_and_unknown_frees_are_counted_separately() {
        let r = replay(
            "+ free -40 0x99 [0:0] !f\n\
             + realloc 0 0x98 0x97 (0 64) [0:0] !f\n\
             + free -8 0x55 [0:0]\n",
        );
        assert_eq!(r.foreign_frees, 1);
        assert_eq!(r.unknown_frees, vec![UnknownFree { ptr: 0x55, line: 3 }]);
        assert!(r.live_blocks.is_empty());
    }

    #[test]
    fn mismatched_totals_are_flagged() {
        let r = replay(
            "+ malloc 8 0x10 [8:48]!\n\
             + FINI [24:96] malloc=2 calloc=0 realloc=0 memalign=0/0 valloc=0 free=0\n",
        );
        assert_eq!(r.degraded_lines, 1);
        assert_eq!(r.last_used, Some(24));
        assert!(!r.consistent);
        assert!(r.fini.is_some());
    }
}
