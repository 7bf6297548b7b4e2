//! Cluster configuration snapshots.
//!
//! A [`ClusterConfig`] is an immutable view of every open bucket. Partitioned buckets carry
//! a partition map: each [`Partition`] names an active host index and replica host indices
//! into the bucket's `partition_hosts` list.

use crate::error::{ConfigurationError, CoreError, Result};
use crate::service::ServiceType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Snapshot of the configuration of every open bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    buckets: BTreeMap<String, BucketConfig>,
}

impl ClusterConfig {
    /// An empty configuration with no open buckets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a copy of this configuration with `bucket` added or replaced.
    pub fn with_bucket(mut self, bucket: BucketConfig) -> Self {
        self.buckets.insert(bucket.name.clone(), bucket);
        self
    }

    /// Return a copy of this configuration without `name`.
    pub fn without_bucket(mut self, name: &str) -> Self {
        self.buckets.remove(name);
        self
    }

    pub fn bucket_config(&self, name: &str) -> Option<&BucketConfig> {
        self.buckets.get(name)
    }

    pub fn has_bucket(&self, name: &str) -> bool {
        self.buckets.contains_key(name)
    }

    pub fn buckets(&self) -> impl Iterator<Item = &BucketConfig> {
        self.buckets.values()
    }

    /// Every hostname referenced by the node list of any open bucket.
    pub fn hostnames(&self) -> BTreeSet<String> {
        self.buckets
            .values()
            .flat_map(|bucket| bucket.nodes.iter().map(|node| node.hostname.clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }
}

/// Configuration of one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub name: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Revision; streamed updates are only applied when newer.
    #[serde(default)]
    pub rev: u64,
    pub nodes: Vec<NodeInfo>,
    /// Hostnames referenced by partition entries, optionally as `host:port`.
    #[serde(default)]
    pub partition_hosts: Vec<String>,
    #[serde(default)]
    pub partitions: Vec<Partition>,
}

impl BucketConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: None,
            rev: 0,
            nodes: Vec::new(),
            partition_hosts: Vec::new(),
            partitions: Vec::new(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_rev(mut self, rev: u64) -> Self {
        self.rev = rev;
        self
    }

    pub fn with_node(mut self, node: NodeInfo) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_partitions(mut self, hosts: Vec<String>, partitions: Vec<Partition>) -> Self {
        self.partition_hosts = hosts;
        self.partitions = partitions;
        self
    }

    /// Parse and validate a bucket configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: BucketConfig = serde_json::from_str(json).map_err(|e| {
            CoreError::Configuration(ConfigurationError::InvalidBucketConfig(e.to_string()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn is_partitioned(&self) -> bool {
        !self.partitions.is_empty()
    }

    /// Check partition map invariants.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| {
            CoreError::Configuration(ConfigurationError::InvalidBucketConfig(format!(
                "{}: {}",
                self.name, reason
            )))
        };

        if self.name.is_empty() {
            return Err(invalid("bucket name is empty".to_string()));
        }

        if !self.is_partitioned() {
            return Ok(());
        }

        if !self.partitions.len().is_power_of_two() {
            return Err(invalid(format!(
                "partition count {} is not a power of two",
                self.partitions.len()
            )));
        }

        let hosts = self.partition_hosts.len();
        for (index, partition) in self.partitions.iter().enumerate() {
            let indices = partition
                .active
                .iter()
                .chain(partition.replicas.iter().flatten());
            for &host in indices {
                if usize::from(host) >= hosts {
                    return Err(invalid(format!(
                        "partition {} references host index {} of {}",
                        index, host, hosts
                    )));
                }
            }
        }

        Ok(())
    }

    /// Partition index owning `key`.
    ///
    /// Returns `None` for buckets without a partition map.
    pub fn partition_for_key(&self, key: &str) -> Option<usize> {
        if self.partitions.is_empty() {
            return None;
        }
        let crc = crc32fast::hash(key.as_bytes());
        let hash = ((crc >> 16) & 0x7fff) as usize;
        Some(hash % self.partitions.len())
    }

    pub fn partition(&self, index: usize) -> Option<&Partition> {
        self.partitions.get(index)
    }

    /// Host (without port) of the active copy of partition `index`.
    pub fn active_host(&self, index: usize) -> Option<&str> {
        let host = self.partition(index)?.active?;
        self.partition_host(host)
    }

    /// Host (without port) of the `replica`-th replica (1-based) of partition `index`.
    pub fn replica_host(&self, index: usize, replica: u16) -> Option<&str> {
        let slot = usize::from(replica.checked_sub(1)?);
        let host = (*self.partition(index)?.replicas.get(slot)?)?;
        self.partition_host(host)
    }

    fn partition_host(&self, host: u16) -> Option<&str> {
        self.partition_hosts
            .get(usize::from(host))
            .map(|entry| host_part(entry))
    }
}

/// One node as advertised in a bucket configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub hostname: String,
    /// Plain ports per service type.
    #[serde(default)]
    pub services: BTreeMap<ServiceType, u16>,
    /// TLS ports per service type.
    #[serde(default)]
    pub ssl_services: BTreeMap<ServiceType, u16>,
}

impl NodeInfo {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            services: BTreeMap::new(),
            ssl_services: BTreeMap::new(),
        }
    }

    pub fn with_service(mut self, service_type: ServiceType, port: u16) -> Self {
        self.services.insert(service_type, port);
        self
    }

    pub fn with_ssl_service(mut self, service_type: ServiceType, port: u16) -> Self {
        self.ssl_services.insert(service_type, port);
        self
    }

    /// Port map to use depending on whether TLS is enabled.
    pub fn service_ports(&self, ssl: bool) -> &BTreeMap<ServiceType, u16> {
        if ssl {
            &self.ssl_services
        } else {
            &self.services
        }
    }
}

/// One shard of a bucket's keyspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Index of the active host, `None` while the partition has no owner.
    pub active: Option<u16>,
    /// Replica host indices; `None` marks an unassigned replica slot.
    #[serde(default)]
    pub replicas: Vec<Option<u16>>,
}

impl Partition {
    pub fn new(active: u16) -> Self {
        Self {
            active: Some(active),
            replicas: Vec::new(),
        }
    }

    pub fn with_replicas(active: u16, replicas: Vec<u16>) -> Self {
        Self {
            active: Some(active),
            replicas: replicas.into_iter().map(Some).collect(),
        }
    }
}

/// Strip an optional `:port` suffix from a partition host entry.
pub(crate) fn host_part(entry: &str) -> &str {
    if let Some(rest) = entry.strip_prefix('[') {
        // Bracketed IPv6, e.g. "[::1]:11210".
        return rest.split(']').next().unwrap_or(rest);
    }
    match entry.split_once(':') {
        Some((host, port)) if !port.contains(':') => host,
        _ => entry,
    }
}
