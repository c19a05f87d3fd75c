use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::{FixedOffset, TimeZone, Utc};
use herald_core::schedule::{
    compute_backoff_with_near_window, compute_exponential_backoff, compute_next_daily_run_delay_seconds,
    compute_next_minute_boundary_delay_seconds, format_minute_key,
};
use herald_core::SlotKey;

/// Called by every recurring handler on every delivery.
fn bench_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff");

    for attempt in [1u32, 8, 64].iter() {
        group.bench_with_input(BenchmarkId::new("exponential", attempt), attempt, |b, &attempt| {
            b.iter(|| black_box(compute_exponential_backoff(black_box(attempt), 60, 3_600)));
        });
    }

    group.bench_function("near_window", |b| {
        b.iter(|| black_box(compute_backoff_with_near_window(black_box(900), 60, 3_600, 5)));
    });

    group.finish();
}

fn bench_aligned_delays(c: &mut Criterion) {
    let mut group = c.benchmark_group("aligned_delays");
    let utc = Utc.with_ymd_and_hms(2024, 3, 10, 12, 34, 56).unwrap();
    let offset = FixedOffset::east_opt(5 * 3_600 + 1_800).unwrap();
    let local = utc.with_timezone(&offset);

    group.bench_function("daily_utc", |b| {
        b.iter(|| black_box(compute_next_daily_run_delay_seconds(9, black_box(&utc))));
    });
    group.bench_function("daily_offset", |b| {
        b.iter(|| black_box(compute_next_daily_run_delay_seconds(9, black_box(&local))));
    });
    group.bench_function("minute_boundary", |b| {
        b.iter(|| black_box(compute_next_minute_boundary_delay_seconds(black_box(&utc), 60)));
    });

    group.finish();
}

fn bench_slot_keys(c: &mut Criterion) {
    let mut group = c.benchmark_group("slot_keys");
    group.throughput(Throughput::Elements(1));
    let at = Utc.with_ymd_and_hms(2024, 3, 10, 12, 34, 56).unwrap();

    group.bench_function("format_minute_key", |b| {
        b.iter(|| black_box(format_minute_key(black_box(&at))));
    });
    group.bench_function("slot_minute", |b| {
        b.iter(|| black_box(SlotKey::minute("heartbeat", black_box(&at))));
    });

    group.finish();
}

criterion_group!(benches, bench_backoff, bench_aligned_delays, bench_slot_keys);
criterion_main!(benches);
