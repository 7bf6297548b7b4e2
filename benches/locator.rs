//! Benchmarks for request routing.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kvcore::config::{ClusterConfig, CoreConfig, DefaultConfigurationProvider};
use kvcore::handler::RequestHandler;
use kvcore::node::Locators;
use kvcore::pipeline::ResponseSink;
use kvcore::testing::{partitioned_bucket, InMemoryCluster, MockServiceFactory};
use kvcore::{ClusterRequest, Core, CoreRequest};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn hosts(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("10.0.{}.{}", i / 256, i % 256)).collect()
}

fn bench_partition_hash(c: &mut Criterion) {
    let bucket = partitioned_bucket("default", &["10.0.0.1"], 1024);
    let keys: Vec<String> = (0..1024).map(|i| format!("user::{}", i)).collect();

    let mut group = c.benchmark_group("partition_for_key");
    group.throughput(Throughput::Elements(keys.len() as u64));
    group.bench_function("1024_keys", |b| {
        b.iter(|| {
            for key in &keys {
                black_box(bucket.partition_for_key(black_box(key)));
            }
        })
    });
    group.finish();
}

fn bench_binary_locate(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let mut group = c.benchmark_group("binary_locate");

    for node_count in [4usize, 16, 64].iter() {
        let names = hosts(*node_count);
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let config = Arc::new(
            ClusterConfig::new().with_bucket(partitioned_bucket("default", &refs, 1024)),
        );

        let handler = RequestHandler::new(
            Arc::new(CoreConfig::development()),
            Arc::new(MockServiceFactory::new()),
            ResponseSink::direct(),
        );
        runtime.block_on(handler.reconfigure(config.clone())).unwrap();

        let locators = Locators::new();
        let request = CoreRequest::get("default", "user::42");

        group.bench_with_input(BenchmarkId::from_parameter(node_count), node_count, |b, _| {
            b.iter(|| locators.locate(black_box(&request), handler.nodes(), Some(&config)))
        });
    }
    group.finish();
}

fn bench_core_round_trip(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let core = runtime.block_on(async {
        let cluster = InMemoryCluster::new()
            .with_host("10.0.0.1")
            .with_bucket(partitioned_bucket("default", &["10.0.0.1", "10.0.0.2"], 1024), None);
        let core = Core::new(
            CoreConfig::default(),
            Arc::new(DefaultConfigurationProvider::new(cluster)),
            Arc::new(MockServiceFactory::new()),
        )
        .unwrap();
        core.send(ClusterRequest::SeedNodes(vec!["10.0.0.1".into()]))
            .await
            .unwrap();
        core.send(ClusterRequest::OpenBucket {
            bucket: "default".into(),
            password: None,
        })
        .await
        .unwrap();
        core
    });

    let mut group = c.benchmark_group("core_round_trip");
    group.throughput(Throughput::Elements(1));
    group.bench_function("get", |b| {
        b.to_async(&runtime)
            .iter(|| async { core.send(CoreRequest::get("default", "user::42")).await })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_partition_hash,
    bench_binary_locate,
    bench_core_round_trip
);
criterion_main!(benches);
