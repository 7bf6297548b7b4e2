//! Locators: pick the live nodes a request is sent to.
//!
//! Locators are read-only over the [`NodeSet`] and the cluster configuration. An empty
//! result is a routing miss, not an error.
//!
//! | service | locator              | policy                                            |
//! |---------|----------------------|---------------------------------------------------|
//! | binary  | [`BinaryLocator`]    | partition owner of the key (or a replica)         |
//! | view    | [`RoundRobinLocator`]| one node hosting the service, round-robin         |
//! | query   | [`RoundRobinLocator`]| one node hosting the service, round-robin         |
//! | config  | [`ConfigLocator`]    | every node hosting the service                    |

use super::{Node, NodeSet};
use crate::config::ClusterConfig;
use crate::message::{BinaryRequest, CoreRequest, RequestKind};
use crate::service::ServiceType;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Routing strategy for one request category.
pub trait Locator: Send + Sync {
    fn locate(
        &self,
        request: &CoreRequest,
        nodes: &NodeSet,
        config: Option<&ClusterConfig>,
    ) -> Vec<Arc<Node>>;
}

/// Routes key/value requests to the node owning the key's partition.
#[derive(Debug, Default)]
pub struct BinaryLocator;

impl Locator for BinaryLocator {
    fn locate(
        &self,
        request: &CoreRequest,
        nodes: &NodeSet,
        config: Option<&ClusterConfig>,
    ) -> Vec<Arc<Node>> {
        let Some(bucket) = config.and_then(|c| c.bucket_config(request.bucket())) else {
            return Vec::new();
        };
        let RequestKind::Binary(operation) = request.kind() else {
            return Vec::new();
        };
        let Some(partition) = bucket.partition_for_key(operation.key()) else {
            return Vec::new();
        };

        let host = match operation {
            BinaryRequest::GetReplica { replica, .. } => bucket.replica_host(partition, *replica),
            _ => bucket.active_host(partition),
        };

        host.and_then(|host| nodes.get(host)).into_iter().collect()
    }
}

/// Picks one node hosting the service for the bucket, rotating across calls.
#[derive(Debug)]
pub struct RoundRobinLocator {
    service_type: ServiceType,
    next: AtomicUsize,
}

impl RoundRobinLocator {
    pub fn new(service_type: ServiceType) -> Self {
        Self {
            service_type,
            next: AtomicUsize::new(0),
        }
    }
}

impl Locator for RoundRobinLocator {
    fn locate(
        &self,
        request: &CoreRequest,
        nodes: &NodeSet,
        config: Option<&ClusterConfig>,
    ) -> Vec<Arc<Node>> {
        if !bucket_open(request, config) {
            return Vec::new();
        }

        let candidates = nodes.hosting(self.service_type, Some(request.bucket()));
        if candidates.is_empty() {
            return Vec::new();
        }

        let index = self.next.fetch_add(1, Ordering::Relaxed) % candidates.len();
        vec![candidates[index].clone()]
    }
}

/// Sends to every node hosting the config service.
#[derive(Debug, Default)]
pub struct ConfigLocator;

impl Locator for ConfigLocator {
    fn locate(
        &self,
        request: &CoreRequest,
        nodes: &NodeSet,
        config: Option<&ClusterConfig>,
    ) -> Vec<Arc<Node>> {
        if !bucket_open(request, config) {
            return Vec::new();
        }
        nodes.hosting(ServiceType::Config, Some(request.bucket()))
    }
}

fn bucket_open(request: &CoreRequest, config: Option<&ClusterConfig>) -> bool {
    config.map_or(false, |c| c.has_bucket(request.bucket()))
}

/// One locator per service type.
#[derive(Debug)]
pub struct Locators {
    binary: BinaryLocator,
    view: RoundRobinLocator,
    query: RoundRobinLocator,
    config: ConfigLocator,
}

impl Default for Locators {
    fn default() -> Self {
        Self::new()
    }
}

impl Locators {
    pub fn new() -> Self {
        Self {
            binary: BinaryLocator,
            view: RoundRobinLocator::new(ServiceType::View),
            query: RoundRobinLocator::new(ServiceType::Query),
            config: ConfigLocator,
        }
    }

    pub fn for_service(&self, service_type: ServiceType) -> &dyn Locator {
        match service_type {
            ServiceType::Binary => &self.binary,
            ServiceType::View => &self.view,
            ServiceType::Query => &self.query,
            ServiceType::Config => &self.config,
        }
    }

    pub fn locate(
        &self,
        request: &CoreRequest,
        nodes: &NodeSet,
        config: Option<&ClusterConfig>,
    ) -> Vec<Arc<Node>> {
        self.for_service(request.service_type())
            .locate(request, nodes, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BucketConfig, CoreConfig, NodeInfo, Partition};
    use crate::message::AddServiceRequest;
    use crate::pipeline::ResponseSink;
    use crate::testing::MockServiceFactory;

    fn node(hostname: &str) -> Arc<Node> {
        Arc::new(Node::new(
            hostname,
            Arc::new(MockServiceFactory::new()),
            Arc::new(CoreConfig::development()),
            ResponseSink::direct(),
        ))
    }

    async fn node_with(hostname: &str, services: &[ServiceType]) -> Arc<Node> {
        let node = node(hostname);
        for &service_type in services {
            node.add_service(&AddServiceRequest {
                service_type,
                bucket: Some("default".into()),
                password: None,
                port: 8091,
                hostname: hostname.into(),
            })
            .await
            .unwrap();
        }
        node
    }

    fn config(bucket: BucketConfig) -> ClusterConfig {
        ClusterConfig::new().with_bucket(bucket)
    }

    #[test]
    fn test_locate_partition_owner() {
        let nodes = NodeSet::new();
        nodes.insert(node("192.168.56.101"));
        nodes.insert(node("192.168.56.102"));

        let bucket = BucketConfig::new("default").with_partitions(
            vec!["192.168.56.101".into(), "192.168.56.102".into()],
            vec![
                Partition::new(0),
                Partition::new(0),
                Partition::new(1),
                Partition::new(1),
            ],
        );
        let config = config(bucket.clone());

        let request = CoreRequest::get("default", "key");
        let partition = bucket.partition_for_key("key").unwrap();
        let expected = if partition < 2 {
            "192.168.56.101"
        } else {
            "192.168.56.102"
        };

        let located = BinaryLocator.locate(&request, &nodes, Some(&config));
        assert_eq!(located.len(), 1);
        assert_eq!(located[0].hostname(), expected);
    }

    #[test]
    fn test_locate_ignores_degenerate_partitions() {
        let nodes = NodeSet::new();
        nodes.insert(node("A"));
        nodes.insert(node("B"));

        // Every partition points at host index 0.
        let bucket = BucketConfig::new("default")
            .with_partitions(vec!["A".into(), "B".into()], vec![Partition::new(0); 1024]);
        let config = config(bucket);

        for key in ["a", "b", "user::1", "user::2"] {
            let request = CoreRequest::get("default", key);
            let located = BinaryLocator.locate(&request, &nodes, Some(&config));
            assert_eq!(located.len(), 1);
            assert_eq!(located[0].hostname(), "A");
        }
    }

    #[test]
    fn test_locate_strips_port() {
        let nodes = NodeSet::new();
        nodes.insert(node("10.0.0.1"));
        let bucket = BucketConfig::new("default")
            .with_partitions(vec!["10.0.0.1:11210".into()], vec![Partition::new(0)]);

        let located = BinaryLocator.locate(
            &CoreRequest::get("default", "key"),
            &nodes,
            Some(&config(bucket)),
        );
        assert_eq!(located.len(), 1);
    }

    #[test]
    fn test_locate_replica() {
        let nodes = NodeSet::new();
        nodes.insert(node("A"));
        nodes.insert(node("B"));
        let bucket = BucketConfig::new("default").with_partitions(
            vec!["A".into(), "B".into()],
            vec![Partition::with_replicas(0, vec![1])],
        );
        let config = config(bucket);

        let located = BinaryLocator.locate(
            &CoreRequest::get_replica("default", "key", 1),
            &nodes,
            Some(&config),
        );
        assert_eq!(located[0].hostname(), "B");

        let missing = BinaryLocator.locate(
            &CoreRequest::get_replica("default", "key", 2),
            &nodes,
            Some(&config),
        );
        assert!(missing.is_empty());
    }

    #[test]
    fn test_locate_misses() {
        let nodes = NodeSet::new();
        nodes.insert(node("A"));
        let bucket = BucketConfig::new("default")
            .with_partitions(vec!["B".into()], vec![Partition::new(0)]);
        let config = config(bucket);

        // Owner not live.
        assert!(BinaryLocator
            .locate(&CoreRequest::get("default", "k"), &nodes, Some(&config))
            .is_empty());
        // Bucket not open.
        assert!(BinaryLocator
            .locate(&CoreRequest::get("travel", "k"), &nodes, Some(&config))
            .is_empty());
        // No configuration yet.
        assert!(BinaryLocator
            .locate(&CoreRequest::get("default", "k"), &nodes, None)
            .is_empty());
    }

    #[tokio::test]
    async fn test_round_robin_rotates() {
        let nodes = NodeSet::new();
        nodes.insert(node_with("A", &[ServiceType::View]).await);
        nodes.insert(node_with("B", &[ServiceType::View]).await);
        nodes.insert(node_with("C", &[ServiceType::Binary]).await);
        let config = config(BucketConfig::new("default").with_node(NodeInfo::new("A")));

        let locator = RoundRobinLocator::new(ServiceType::View);
        let request = CoreRequest::view("default", "design", "view");
        let picks: Vec<String> = (0..4)
            .map(|_| locator.locate(&request, &nodes, Some(&config))[0].hostname().to_string())
            .collect();

        assert_eq!(picks, vec!["A", "B", "A", "B"]);
    }

    #[tokio::test]
    async fn test_round_robin_without_candidates() {
        let nodes = NodeSet::new();
        nodes.insert(node_with("A", &[ServiceType::Binary]).await);
        let config = config(BucketConfig::new("default"));

        let locator = RoundRobinLocator::new(ServiceType::Query);
        assert!(locator
            .locate(&CoreRequest::query("default", "SELECT 1"), &nodes, Some(&config))
            .is_empty());
    }

    #[tokio::test]
    async fn test_config_broadcasts() {
        let nodes = NodeSet::new();
        nodes.insert(node_with("A", &[ServiceType::Config]).await);
        nodes.insert(node_with("B", &[ServiceType::Config]).await);
        nodes.insert(node_with("C", &[ServiceType::Binary]).await);
        let config = config(BucketConfig::new("default"));

        let located = Locators::new().locate(
            &CoreRequest::bucket_streaming("default"),
            &nodes,
            Some(&config),
        );
        let hosts: Vec<&str> = located.iter().map(|n| n.hostname()).collect();
        assert_eq!(hosts, vec!["A", "B"]);
    }
}
