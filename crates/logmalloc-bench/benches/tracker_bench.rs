//! Tracker hot-path benchmarks.

use std::fmt::Write;
use std::fs::File;
use std::os::fd::AsRawFd;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use logmalloc_core::config::{LINE_CAPACITY, STATM_PATH};
use logmalloc_core::{
    Event, Extra, FdSink, FrameList, LibcAllocator, LineBuf, NoFrames, Op, ReturnAddressWalk,
    StackCapturer, Totals, TraceSink, Tracker,
};

fn dev_null() -> File {
    File::options().write(true).open("/dev/null").unwrap()
}

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let null = dev_null();
    let sink = FdSink::new(null.as_raw_fd(), STATM_PATH);
    let _ = sink.open_snapshot();
    let tracker = Tracker::new(LibcAllocator, sink, NoFrames);

    let sizes: &[usize] = &[16, 64, 256, 4096];
    let mut group = c.benchmark_group("alloc_free_cycle");
    for &size in sizes {
        group.bench_with_input(BenchmarkId::new("traced", size), &size, |b, &sz| {
            b.iter(|| {
                let p = tracker.allocate(sz);
                unsafe { tracker.release(criterion::black_box(p)) };
            });
        });
    }
    tracker.set_trace_enabled(false);
    for &size in sizes {
        group.bench_with_input(BenchmarkId::new("untraced", size), &size, |b, &sz| {
            b.iter(|| {
                let p = tracker.allocate(sz);
                unsafe { tracker.release(criterion::black_box(p)) };
            });
        });
    }
    group.finish();
}

fn bench_line_format(c: &mut Criterion) {
    let event = Event::new(
        Op::Realloc,
        -96,
        0x5581_a000,
        Totals {
            requested: 1 << 20,
            usable: (1 << 20) + 4096,
        },
    )
    .with_ptr2(0x5581_b000)
    .with_extra(Extra::Resize { old: 128, new: 32 });

    c.bench_function("format_realloc_line", |b| {
        b.iter(|| {
            let mut line = LineBuf::<LINE_CAPACITY>::new();
            let _ = write!(line, "{}", criterion::black_box(&event));
            criterion::black_box(line.finish(None).len());
        });
    });
}

fn bench_stack_capture(c: &mut Criterion) {
    let walker = ReturnAddressWalk::new(7);
    walker.warm_up();
    c.bench_function("return_address_walk", |b| {
        b.iter(|| {
            let mut frames = FrameList::new();
            walker.capture(&mut frames);
            criterion::black_box(frames.len());
        });
    });
}

criterion_group!(benches, bench_alloc_free_cycle, bench_line_format, bench_stack_capture);
criterion_main!(benches);
