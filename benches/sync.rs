extern crate hostrt;

use criterion::{criterion_group, criterion_main, Criterion};
use hostrt::{
    sync::{Cookie, WaitOptions},
    thread::NativeThreadId,
    HostConfig, HostControl,
};
use std::{hint::black_box, time::Duration};

/// Monitor handoff without contention: the event is already signaled when the wait starts, so
/// this measures the fast path through the detector wrapper.
fn bench_monitor_uncontended(c: &mut Criterion) {
    let host = HostControl::new(HostConfig::default()).unwrap();
    let monitor = host.sync().create_monitor_event(Cookie(0x1));

    c.bench_function("monitor_set_wait", |b| {
        b.iter(|| {
            monitor.set();
            black_box(monitor.wait(Some(Duration::ZERO), WaitOptions::empty()))
        });
    });
}

fn bench_crst(c: &mut Criterion) {
    let host = HostControl::new(HostConfig::default()).unwrap();
    let crst = host.sync().create_crst();

    c.bench_function("crst_enter_leave", |b| {
        b.iter(|| {
            let guard = crst.lock();
            black_box(&guard);
        });
    });
}

/// Task table lookups with a populated table.
fn bench_task_lookup(c: &mut Criterion) {
    let host = HostControl::new(HostConfig::default()).unwrap();
    let me = host.tasks().current_task().id();
    let missing = NativeThreadId::new(u64::MAX);

    let mut group = c.benchmark_group("task_lookup");
    group.bench_function("hit", |b| {
        b.iter(|| black_box(host.tasks().lookup(black_box(me))));
    });
    group.bench_function("miss", |b| {
        b.iter(|| black_box(host.tasks().lookup(black_box(missing))));
    });
    group.finish();
}

criterion_group!(benches, bench_monitor_uncontended, bench_crst, bench_task_lookup);
criterion_main!(benches);
