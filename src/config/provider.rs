//! Cluster configuration providers.
//!
//! A [`ConfigurationProvider`] owns the current [`ClusterConfig`] and publishes every new
//! snapshot on a watch channel. The request handler follows that channel and reconfigures
//! its node set on each change.

use super::cluster::{BucketConfig, ClusterConfig};
use crate::error::{ConfigurationError, CoreError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Source of cluster configuration snapshots.
#[async_trait]
pub trait ConfigurationProvider: Send + Sync {
    /// Feed of configuration snapshots. Each call returns an independent subscription
    /// starting at the current snapshot.
    fn configs(&self) -> watch::Receiver<Arc<ClusterConfig>>;

    /// The current snapshot.
    fn config(&self) -> Arc<ClusterConfig>;

    /// Replace the seed host list.
    async fn seed_hosts(&self, hosts: Vec<String>) -> bool;

    /// Load a bucket configuration from the seed hosts and publish it.
    async fn open_bucket(&self, bucket: &str, password: Option<&str>)
        -> Result<Arc<ClusterConfig>>;

    /// Drop every open bucket and publish the empty configuration.
    async fn close_buckets(&self) -> Result<Arc<ClusterConfig>>;
}

/// Failure fetching a bucket configuration from one seed host.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("Seed host unreachable: {0}")]
    Unreachable(String),

    #[error("Bucket not found")]
    BucketNotFound,

    #[error("Authentication failed")]
    AuthenticationFailure,

    #[error("Invalid configuration document: {0}")]
    Invalid(String),
}

/// Fetches a bucket configuration from one seed host.
#[async_trait]
pub trait ConfigLoader: Send + Sync {
    async fn load(
        &self,
        seed: &str,
        bucket: &str,
        password: Option<&str>,
    ) -> std::result::Result<BucketConfig, LoadError>;
}

/// Provider that bootstraps buckets through a [`ConfigLoader`].
pub struct DefaultConfigurationProvider<L> {
    loader: L,
    seeds: RwLock<Option<Vec<String>>>,
    sender: watch::Sender<Arc<ClusterConfig>>,
    // Serializes open/close so concurrent updates do not overwrite each other.
    update: Mutex<()>,
}

impl<L: ConfigLoader> DefaultConfigurationProvider<L> {
    pub fn new(loader: L) -> Self {
        let (sender, _) = watch::channel(Arc::new(ClusterConfig::new()));
        Self {
            loader,
            seeds: RwLock::new(None),
            sender,
            update: Mutex::new(()),
        }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    fn publish(&self, config: ClusterConfig) -> Arc<ClusterConfig> {
        let config = Arc::new(config);
        self.sender.send_replace(config.clone());
        config
    }

    /// Apply a streamed configuration update for an open bucket.
    ///
    /// Accepted only when the bucket is open and `bucket.rev` is newer than the current
    /// revision. Accepted updates are published.
    pub async fn propose_bucket_config(&self, bucket: BucketConfig) -> bool {
        let _guard = self.update.lock().await;
        let current = self.config();

        let current_rev = match current.bucket_config(&bucket.name) {
            Some(existing) => existing.rev,
            None => {
                debug!(bucket = %bucket.name, "Ignoring config for bucket that is not open");
                return false;
            }
        };

        if bucket.rev <= current_rev {
            debug!(
                bucket = %bucket.name,
                rev = bucket.rev,
                current_rev,
                "Ignoring stale bucket config"
            );
            return false;
        }

        if let Err(e) = bucket.validate() {
            warn!(bucket = %bucket.name, error = %e, "Rejecting invalid bucket config");
            return false;
        }

        info!(bucket = %bucket.name, rev = bucket.rev, "Applying new bucket config");
        self.publish(current.as_ref().clone().with_bucket(bucket));
        true
    }
}

#[async_trait]
impl<L: ConfigLoader> ConfigurationProvider for DefaultConfigurationProvider<L> {
    fn configs(&self) -> watch::Receiver<Arc<ClusterConfig>> {
        self.sender.subscribe()
    }

    fn config(&self) -> Arc<ClusterConfig> {
        self.sender.borrow().clone()
    }

    async fn seed_hosts(&self, hosts: Vec<String>) -> bool {
        debug!(seeds = ?hosts, "Seed hosts updated");
        *self.seeds.write() = Some(hosts);
        true
    }

    async fn open_bucket(
        &self,
        bucket: &str,
        password: Option<&str>,
    ) -> Result<Arc<ClusterConfig>> {
        let seeds = self.seeds.read().clone();
        let seeds = match seeds {
            None => return Err(ConfigurationError::NoSeedHosts.into()),
            Some(seeds) if seeds.is_empty() => {
                return Err(ConfigurationError::EmptySeedList.into())
            }
            Some(seeds) => seeds,
        };

        let _guard = self.update.lock().await;
        let current = self.config();
        if current.has_bucket(bucket) {
            debug!(bucket, "Bucket already open");
            return Ok(current);
        }

        let mut unreachable = Vec::new();
        for seed in &seeds {
            match self.loader.load(seed, bucket, password).await {
                Ok(mut loaded) => {
                    if loaded.name != bucket {
                        return Err(ConfigurationError::InvalidBucketConfig(format!(
                            "seed {} answered with bucket {} instead of {}",
                            seed, loaded.name, bucket
                        ))
                        .into());
                    }
                    loaded.validate()?;
                    if loaded.password.is_none() {
                        loaded.password = password.map(str::to_string);
                    }
                    info!(bucket, seed = %seed, rev = loaded.rev, "Bucket opened");
                    return Ok(self.publish(current.as_ref().clone().with_bucket(loaded)));
                }
                Err(LoadError::Unreachable(reason)) => {
                    warn!(bucket, seed = %seed, reason = %reason, "Seed host unreachable");
                    unreachable.push(seed.clone());
                }
                Err(LoadError::BucketNotFound) => {
                    return Err(ConfigurationError::BucketNotFound(bucket.to_string()).into())
                }
                Err(LoadError::AuthenticationFailure) => {
                    return Err(
                        ConfigurationError::AuthenticationFailure(bucket.to_string()).into(),
                    )
                }
                Err(LoadError::Invalid(reason)) => {
                    return Err(ConfigurationError::InvalidBucketConfig(reason).into())
                }
            }
        }

        Err(CoreError::Configuration(
            ConfigurationError::SeedsUnreachable(unreachable),
        ))
    }

    async fn close_buckets(&self) -> Result<Arc<ClusterConfig>> {
        let _guard = self.update.lock().await;
        info!("Closing all buckets");
        Ok(self.publish(ClusterConfig::new()))
    }
}
