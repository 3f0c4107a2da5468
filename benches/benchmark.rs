use criterion::BenchmarkId;
use criterion::{criterion_group, criterion_main, Criterion};
use ebsampler::histogram::PathHistogram;
use ebsampler::timers::CostCenterId;
use ebsampler::unwind::StackKey;

fn keys(count: usize, depth: usize) -> Vec<StackKey> {
    (0..count as u64)
        .map(|i| {
            let frames: Vec<u64> = (0..depth as u64).map(|d| 0x40_0000 + i * 0x100 + d).collect();
            StackKey::from_slice(&frames)
        })
        .collect()
}

pub fn benchmark_histogram_accumulate(c: &mut Criterion) {
    let mut group = c.benchmark_group("Histogram accumulate");
    let deltas = [10_000.0, 1.0];
    for depth in [1, 8, 32] {
        let keys = keys(512, depth);
        group.bench_with_input(BenchmarkId::new("existing keys", depth), &keys, |b, keys| {
            let mut histogram = PathHistogram::with_capacity(4096);
            let context = CostCenterId::from_index(1);
            b.iter(|| {
                for key in keys {
                    histogram.accumulate(context, key, &deltas);
                }
            })
        });
    }
    group.bench_function("drain after fill", |b: &mut criterion::Bencher| {
        let keys = keys(1024, 8);
        b.iter(|| {
            let mut histogram = PathHistogram::with_capacity(4096);
            for (i, key) in keys.iter().enumerate() {
                histogram.accumulate(CostCenterId::from_index(i % 4), key, &deltas);
            }
            histogram.drain_all()
        })
    });
    group.finish();
}

criterion_group!(benches, benchmark_histogram_accumulate);
criterion_main!(benches);
