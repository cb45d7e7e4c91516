use std::ffi::c_void;
use std::ptr;

use logmalloc_core::{
    Block, HEADER_SIZE, LibcAllocator, MemorySink, NoFrames, Tracker, envelope,
};

type TestTracker = Tracker<LibcAllocator, MemorySink, NoFrames>;

fn tracker() -> TestTracker {
    Tracker::new(LibcAllocator, MemorySink::new(), NoFrames)
}

/// Deterministic generator so failures replay.
struct XorShift64(u64);

impl XorShift64 {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

struct Live {
    ptr: *mut c_void,
    size: usize,
}

#[test]
fn usage_equals_sum_of_live_sizes_over_random_sequence() {
    let t = tracker();
    t.set_trace_enabled(false);
    let mut rng = XorShift64(0x9e37_79b9_7f4a_7c15);
    let mut live: Vec<Live> = Vec::new();

    for step in 0..4000 {
        match rng.below(6) {
            0 | 1 => {
                let size = rng.below(2048) as usize;
                let ptr = t.allocate(size);
                assert!(!ptr.is_null());
                live.push(Live { ptr, size });
            }
            2 => {
                let count = rng.below(16) as usize;
                let each = rng.below(64) as usize;
                let ptr = t.zero_allocate(count, each);
                assert!(!ptr.is_null());
                live.push(Live {
                    ptr,
                    size: count * each,
                });
            }
            3 if !live.is_empty() => {
                let i = rng.below(live.len() as u64) as usize;
                let size = rng.below(4096) as usize;
                let moved = unsafe { t.resize(live[i].ptr, size) };
                assert!(!moved.is_null());
                live[i] = Live { ptr: moved, size };
            }
            4 => {
                let alignment = 32usize << rng.below(5);
                let size = rng.below(512) as usize;
                let ptr = t.aligned_allocate(alignment, size);
                assert_eq!(ptr as usize % alignment, 0);
                live.push(Live { ptr, size });
            }
            _ if !live.is_empty() => {
                let i = rng.below(live.len() as u64) as usize;
                let gone = live.swap_remove(i);
                unsafe { t.release(gone.ptr) };
            }
            _ => {}
        }
        let expected: usize = live.iter().map(|l| l.size).sum();
        assert_eq!(t.usage(), expected, "step {step}");
    }

    for l in live.drain(..) {
        unsafe { t.release(l.ptr) };
    }
    assert_eq!(t.usage(), 0);
    assert_eq!(t.context().totals().usable, 0);
}

#[test]
#[cfg_attr(not(feature = "call-counting"), ignore)]
fn concurrent_threads_balance_to_zero() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 500;

    let t = tracker();
    std::thread::scope(|s| {
        for id in 0..THREADS {
            let t = &t;
            s.spawn(move || {
                for round in 0..ROUNDS {
                    let p = t.allocate(16 + (id * 7 + round) % 200);
                    assert!(!p.is_null());
                    unsafe { t.release(p) };
                }
            });
        }
    });

    assert_eq!(t.usage(), 0);
    assert_eq!(t.context().totals().usable, 0);
    let calls = t.context().calls();
    assert_eq!(calls.malloc, THREADS * ROUNDS);
    assert_eq!(calls.free, THREADS * ROUNDS);

    let lines = t.sink().lines();
    assert_eq!(lines.len(), 2 * THREADS * ROUNDS);
    assert!(
        lines
            .iter()
            .all(|l| (l.starts_with("+ malloc ") || l.starts_with("+ free -")) && l.ends_with(']')),
        "interleaved line found"
    );
}

#[test]
fn foreign_block_is_released_through_the_real_allocator() {
    let t = tracker();
    let foreign = unsafe { libc::malloc(100) };
    assert_eq!(unsafe { envelope::classify(foreign) }, Block::Foreign);
    unsafe { t.release(foreign) };
    assert_eq!(t.usage(), 0);
    let line = t.sink().lines().pop().unwrap();
    assert!(line.starts_with("+ free -"), "{line}");
    assert!(line.ends_with(" !f"), "{line}");
}

#[test]
fn every_tracked_pointer_keeps_the_header_directly_below() {
    let t = tracker();
    let p = t.allocate(1);
    match unsafe { envelope::classify(p) } {
        Block::Tracked { base, envelope } => {
            assert_eq!(p as usize - base as usize, HEADER_SIZE);
            assert_eq!(envelope.size, 1);
            assert!(envelope.usable >= HEADER_SIZE + 1);
        }
        Block::Foreign => panic!("fresh block classified foreign"),
    }
    unsafe { t.release(p) };
}

#[test]
fn realloc_scenario_produces_exact_deltas() {
    let t = tracker();
    let a = t.allocate(64);
    let b = unsafe { t.resize(a, 128) };
    let c = unsafe { t.resize(b, 32) };
    unsafe { t.release(c) };
    unsafe { t.release(ptr::null_mut()) };

    let amounts: Vec<String> = t
        .sink()
        .lines()
        .iter()
        .map(|l| l.split(' ').take(3).collect::<Vec<_>>().join(" "))
        .collect();
    assert_eq!(
        amounts,
        ["+ malloc 64", "+ realloc 64", "+ realloc -96", "+ free -32"]
    );
    assert_eq!(t.usage(), 0);
}
