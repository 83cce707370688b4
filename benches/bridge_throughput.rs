use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use futures_util::stream;
use rs2_bridge::*;
use std::time::Duration;
use tokio::runtime::Runtime;

async fn drain<P: AsyncPull>(mut puller: P) -> usize {
    let mut count = 0;
    while let Ok(true) = puller.try_advance().await {
        black_box(puller.current());
        count += 1;
    }
    puller.dispose().await;
    count
}

fn bench_buffered_bounds(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("buffered_bridge");
    group.measurement_time(Duration::from_secs(10));

    let data_size = 10_000;
    let configs = vec![
        ("bounded_1", BridgeConfig::bounded(1)),
        ("bounded_64", BridgeConfig::bounded(64)),
        ("bounded_1024", BridgeConfig::bounded(1024)),
        ("unbounded", BridgeConfig::unbounded()),
    ];

    for (name, config) in configs {
        group.bench_with_input(BenchmarkId::new("throughput", name), &config, |b, config| {
            b.to_async(&rt).iter(|| async {
                let bridge = buffer(stream::iter(0..data_size), config.clone());
                black_box(drain(bridge).await)
            });
        });
    }

    group.finish();
}

fn bench_snapshot_bridge(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("latest_bridge_follow", |b| {
        b.to_async(&rt).iter(|| async {
            let bridge = latest(stream::iter(0..10_000), BridgeConfig::default());
            black_box(drain(bridge).await)
        });
    });
}

fn bench_rendezvous(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("rendezvous");
    group.measurement_time(Duration::from_secs(10));

    for width in [2usize, 3, 8] {
        group.bench_with_input(BenchmarkId::new("zip_all", width), &width, |b, &width| {
            b.to_async(&rt).iter(|| async move {
                let sources = (0..width).map(|_| stream::iter(0..1_000u64)).collect();
                let zipped = zip_all(sources, |values: Vec<u64>| values.iter().sum::<u64>());
                black_box(drain(zipped).await)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_buffered_bounds, bench_snapshot_bridge, bench_rendezvous);
criterion_main!(benches);
