use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use perf_engine::config::RegressionConfig;
use perf_engine::{AdaptiveCache, RegressionDetector, Sample, SampleBuffer};
use std::time::Duration;

fn bench_sample_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("sample_buffer");
    group.throughput(Throughput::Elements(1));

    group.bench_function("record", |b| {
        let buffer = SampleBuffer::new(10_000);
        b.iter(|| {
            buffer.record(black_box(Sample::timed("bench_op", 1.5)));
        })
    });

    for size in [100usize, 1_000, 10_000] {
        let buffer = SampleBuffer::new(size);
        for i in 0..size {
            buffer.record(Sample::timed("bench_op", i as f64));
        }
        group.bench_with_input(BenchmarkId::new("snapshot", size), &size, |b, _| {
            b.iter(|| black_box(buffer.snapshot("bench_op")))
        });
    }

    group.finish();
}

fn bench_adaptive_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("adaptive_cache");

    let cache: AdaptiveCache<u64> = AdaptiveCache::new(10_000);
    for i in 0..1_000u64 {
        cache.set(format!("key-{i}"), i, Duration::from_secs(600), &["bench"]);
    }

    group.bench_function("get_hit", |b| {
        b.iter(|| black_box(cache.get(black_box("key-500"))))
    });

    group.bench_function("get_miss", |b| {
        b.iter(|| black_box(cache.get(black_box("absent-key"))))
    });

    group.bench_function("set_overwrite", |b| {
        b.iter(|| {
            cache.set(
                black_box("key-500"),
                black_box(7),
                Duration::from_secs(600),
                &["bench"],
            )
        })
    });

    group.finish();
}

fn bench_regression_detection(c: &mut Criterion) {
    let mut group = c.benchmark_group("regression_detection");

    for size in [100usize, 1_000] {
        let detector = RegressionDetector::new(RegressionConfig::default());
        let baseline: Vec<Sample> = (0..size)
            .map(|i| Sample::timed("bench_op", 100.0 + (i % 21) as f64 - 10.0))
            .collect();
        detector.create_baseline("bench_op", &baseline).unwrap();
        let current: Vec<Sample> = (0..size)
            .map(|i| Sample::timed("bench_op", 150.0 + (i % 21) as f64 - 10.0))
            .collect();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("detect", size), &size, |b, _| {
            b.iter(|| {
                black_box(
                    detector
                        .detect_regression("bench_op", black_box(&current))
                        .unwrap(),
                )
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_sample_buffer,
    bench_adaptive_cache,
    bench_regression_detection
);
criterion_main!(benches);
