//! Common test utilities for integration tests.

use kvcore::config::{BucketConfig, CoreConfig, DefaultConfigurationProvider};
use kvcore::testing::{partitioned_bucket, InMemoryCluster, MockServiceFactory};
use kvcore::{ClusterRequest, Core};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

/// Assert that a condition becomes true within a timeout
#[macro_export]
macro_rules! assert_eventually {
    ($cond:expr, $timeout_ms:expr) => {
        assert_eventually!(@ $cond, $timeout_ms, 10)
    };
    (@ $cond:expr, $timeout_ms:expr, $interval_ms:expr) => {{
        let start = std::time::Instant::now();
        let timeout = std::time::Duration::from_millis($timeout_ms);
        let interval = std::time::Duration::from_millis($interval_ms);

        while start.elapsed() < timeout {
            if $cond {
                break;
            }
            tokio::time::sleep(interval).await;
        }

        assert!(
            $cond,
            "Condition did not become true within {:?}",
            timeout
        );
    }};
}

/// A core wired to an in-memory cluster and mock services.
pub struct TestCore {
    pub core: Core,
    pub factory: Arc<MockServiceFactory>,
    pub provider: Arc<DefaultConfigurationProvider<InMemoryCluster>>,
}

impl TestCore {
    pub fn new(config: CoreConfig, cluster: InMemoryCluster) -> Self {
        Self::with_factory(config, cluster, Arc::new(MockServiceFactory::new()))
    }

    pub fn with_factory(
        config: CoreConfig,
        cluster: InMemoryCluster,
        factory: Arc<MockServiceFactory>,
    ) -> Self {
        let provider = Arc::new(DefaultConfigurationProvider::new(cluster));
        let core = Core::new(config, provider.clone(), factory.clone())
            .expect("Failed to start core");
        Self {
            core,
            factory,
            provider,
        }
    }

    /// Seed with `seeds` and open `bucket` without a password.
    pub async fn open(&self, seeds: &[&str], bucket: &str) {
        self.core
            .send(ClusterRequest::SeedNodes(
                seeds.iter().map(|s| s.to_string()).collect(),
            ))
            .await
            .expect("Failed to seed");
        self.core
            .send(ClusterRequest::OpenBucket {
                bucket: bucket.to_string(),
                password: None,
            })
            .await
            .expect("Failed to open bucket");
    }
}

/// An in-memory cluster serving `default` over `hosts`.
pub fn cluster_with(hosts: &[&str], partitions: usize) -> InMemoryCluster {
    let mut cluster = InMemoryCluster::new();
    for host in hosts {
        cluster = cluster.with_host(host);
    }
    cluster.with_bucket(partitioned_bucket("default", hosts, partitions), None)
}

/// Deterministic random document keys.
pub fn random_keys(count: usize, seed: u64) -> Vec<String> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| format!("doc::{:08x}", rng.gen::<u32>()))
        .collect()
}

/// A key whose partition is owned by `host`.
pub fn key_owned_by(bucket: &BucketConfig, host: &str) -> String {
    random_keys(4096, 7)
        .into_iter()
        .find(|key| {
            bucket
                .partition_for_key(key)
                .and_then(|p| bucket.active_host(p))
                == Some(host)
        })
        .expect("No key maps to host")
}
