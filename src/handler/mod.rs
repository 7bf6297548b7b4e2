//! The dispatch core.
//!
//! [`RequestHandler`] owns the live [`NodeSet`] and is the only place that mutates it. It
//! routes data-plane requests through the [`Locators`], manages nodes and services for
//! internal requests, and converges the node set onto every new [`ClusterConfig`].
//!
//! # Reconfiguration
//!
//! ```text
//! new ClusterConfig
//!   ├─ for each bucket (concurrently)
//!   │    └─ for each node (concurrently)
//!   │         add_node ─▶ add_service for every advertised (or synthesized) service
//!   ├─ join all buckets
//!   └─ prune live nodes no bucket references (disconnect in background)
//! ```
//!
//! Pruning starts only after every bucket has converged, so a node that one bucket drops
//! and another keeps is never removed in between.

mod dispatch;
mod response;

pub use dispatch::RequestDispatcher;
pub use response::ResponseHandler;

use crate::config::{BucketConfig, ClusterConfig, CoreConfig, NodeInfo};
use crate::error::{CoreError, Result};
use crate::message::{
    AddServiceRequest, CoreResponse, PendingRequest, RemoveServiceRequest, ServiceMessage,
};
use crate::node::{Locators, Node, NodeSet};
use crate::observability;
use crate::pipeline::ResponseSink;
use crate::service::{ServiceFactory, ServiceType};
use crate::shutdown::ShutdownCoordinator;
use crate::state::LifecycleState;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type PendingConnect = Shared<BoxFuture<'static, LifecycleState>>;

/// Counters describing what the handler has done.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerStats {
    /// Node connects started (one per newly added node).
    pub node_connects: u64,
    /// Node disconnects (explicit removals and pruning).
    pub node_disconnects: u64,
    /// Requests handed to at least one node.
    pub dispatched: u64,
    /// Requests for which no node was found.
    pub routing_misses: u64,
    /// Failed sends to individual nodes.
    pub send_failures: u64,
    /// Completed reconfigurations.
    pub reconfigurations: u64,
    /// Nodes currently live.
    pub live_nodes: usize,
}

#[derive(Debug, Default)]
struct Counters {
    node_connects: AtomicU64,
    node_disconnects: AtomicU64,
    dispatched: AtomicU64,
    routing_misses: AtomicU64,
    send_failures: AtomicU64,
    reconfigurations: AtomicU64,
}

/// Routes requests to nodes and keeps the node set in line with the cluster configuration.
pub struct RequestHandler {
    nodes: Arc<NodeSet>,
    /// Connects in flight, keyed by hostname. A node is here until it enters `nodes`.
    connecting: Arc<DashMap<String, PendingConnect>>,
    config: Arc<CoreConfig>,
    factory: Arc<dyn ServiceFactory>,
    responses: ResponseSink,
    configuration: RwLock<Option<Arc<ClusterConfig>>>,
    locators: Locators,
    reconfiguring: Mutex<()>,
    counters: Arc<Counters>,
}

impl RequestHandler {
    pub fn new(
        config: Arc<CoreConfig>,
        factory: Arc<dyn ServiceFactory>,
        responses: ResponseSink,
    ) -> Self {
        Self {
            nodes: Arc::new(NodeSet::new()),
            connecting: Arc::new(DashMap::new()),
            config,
            factory,
            responses,
            configuration: RwLock::new(None),
            locators: Locators::new(),
            reconfiguring: Mutex::new(()),
            counters: Arc::new(Counters::default()),
        }
    }

    fn metrics_enabled(&self) -> bool {
        self.config.observability.metrics_enabled
    }

    /// The live node set.
    pub fn nodes(&self) -> &NodeSet {
        &self.nodes
    }

    pub fn node(&self, hostname: &str) -> Option<Arc<Node>> {
        self.nodes.get(hostname)
    }

    /// The configuration the handler last converged on.
    pub fn configuration(&self) -> Option<Arc<ClusterConfig>> {
        self.configuration.read().clone()
    }

    pub fn stats(&self) -> HandlerStats {
        HandlerStats {
            node_connects: self.counters.node_connects.load(Ordering::Relaxed),
            node_disconnects: self.counters.node_disconnects.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            routing_misses: self.counters.routing_misses.load(Ordering::Relaxed),
            send_failures: self.counters.send_failures.load(Ordering::Relaxed),
            reconfigurations: self.counters.reconfigurations.load(Ordering::Relaxed),
            live_nodes: self.nodes.len(),
        }
    }

    // =========================================================================
    // Node and service management
    // =========================================================================

    /// Add a node and connect it, or return the state of the node already known.
    ///
    /// Concurrent calls for the same hostname share a single connect. The node becomes
    /// visible to routing only once its connect has resolved.
    pub async fn add_node(&self, hostname: &str) -> Result<LifecycleState> {
        if hostname.is_empty() {
            return Err(CoreError::InvalidArgument(
                "hostname must not be empty".to_string(),
            ));
        }

        if let Some(node) = self.nodes.get(hostname) {
            return Ok(node.state());
        }

        let pending = match self.connecting.entry(hostname.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                // The connect may have finished between the lookup above and the entry.
                if let Some(node) = self.nodes.get(hostname) {
                    return Ok(node.state());
                }
                let pending = self.start_connect(hostname);
                entry.insert(pending.clone());
                pending
            }
        };

        Ok(pending.await)
    }

    fn start_connect(&self, hostname: &str) -> PendingConnect {
        let node = Arc::new(Node::new(
            hostname,
            self.factory.clone(),
            self.config.clone(),
            self.responses.clone(),
        ));
        let nodes = self.nodes.clone();
        let connecting = self.connecting.clone();
        let counters = self.counters.clone();
        let metrics = self.metrics_enabled();

        info!(hostname, "Adding node");
        counters.node_connects.fetch_add(1, Ordering::Relaxed);

        let task = tokio::spawn(async move {
            let state = node.connect().await;
            let hostname = node.hostname().to_string();
            // Live before the in-flight entry goes away, so lookups always find one of them.
            nodes.insert(node);
            connecting.remove(&hostname);

            if metrics {
                observability::record_node_connect(state);
                observability::update_live_nodes(nodes.len());
            }
            info!(%hostname, %state, "Node added");
            state
        });

        async move {
            task.await.unwrap_or_else(|e| {
                warn!(error = %e, "Node connect task failed");
                LifecycleState::Disconnected
            })
        }
        .boxed()
        .shared()
    }

    /// Remove a node from the live set, then disconnect it.
    pub async fn remove_node(&self, hostname: &str) -> Result<LifecycleState> {
        let node = self
            .nodes
            .remove(hostname)
            .ok_or_else(|| CoreError::NodeNotFound(hostname.to_string()))?;

        info!(hostname, "Removing node");
        if self.metrics_enabled() {
            observability::update_live_nodes(self.nodes.len());
        }

        let state = node.disconnect().await;
        self.counters.node_disconnects.fetch_add(1, Ordering::Relaxed);
        debug!(hostname, %state, "Node removed");
        Ok(state)
    }

    pub async fn add_service(&self, request: &AddServiceRequest) -> Result<LifecycleState> {
        let node = self
            .nodes
            .get(&request.hostname)
            .ok_or_else(|| CoreError::NodeNotFound(request.hostname.clone()))?;
        node.add_service(request).await
    }

    pub async fn remove_service(&self, request: &RemoveServiceRequest) -> Result<LifecycleState> {
        let node = self
            .nodes
            .get(&request.hostname)
            .ok_or_else(|| CoreError::NodeNotFound(request.hostname.clone()))?;
        node.remove_service(request).await
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Route one request and hand it to every located node.
    ///
    /// Returns the nodes the request was handed to. When no node is found the request is
    /// completed right away with a `NotConnected` or `BucketNotOpen` response.
    pub fn dispatch(&self, pending: Arc<PendingRequest>) -> Vec<Arc<Node>> {
        let configuration = self.configuration();
        let request = &pending.request;
        let service_type = request.service_type();

        let targets = self
            .locators
            .locate(request, &self.nodes, configuration.as_deref());

        if targets.is_empty() {
            let bucket_open = configuration
                .as_ref()
                .map_or(false, |c| c.has_bucket(request.bucket()));
            let response = if bucket_open {
                CoreResponse::not_connected()
            } else {
                CoreResponse::bucket_not_open()
            };

            self.counters.routing_misses.fetch_add(1, Ordering::Relaxed);
            if self.metrics_enabled() {
                observability::record_routing_miss(service_type, response.status);
            }
            debug!(
                id = pending.id,
                bucket = request.bucket(),
                service = %service_type,
                status = ?response.status,
                "No node found for request"
            );
            pending.completion.succeed(response);
            return targets;
        }

        for node in &targets {
            if let Err(e) = node.send(ServiceMessage::Request(pending.clone())) {
                self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
                if self.metrics_enabled() {
                    observability::record_send_failure(service_type);
                }
                warn!(
                    id = pending.id,
                    hostname = node.hostname(),
                    error = %e,
                    "Failed to send request to node"
                );
                pending.completion.fail(e);
            }
        }

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        if self.metrics_enabled() {
            observability::record_dispatch(service_type);
        }
        targets
    }

    // =========================================================================
    // Reconfiguration
    // =========================================================================

    /// Converge the live nodes and services onto `config`.
    ///
    /// Every bucket converges even if another fails; pruning runs afterwards either way.
    /// Returns `config` unchanged, or [`CoreError::ReconfigurationFailed`] naming the
    /// buckets that did not converge.
    pub async fn reconfigure(&self, config: Arc<ClusterConfig>) -> Result<Arc<ClusterConfig>> {
        let _guard = self.reconfiguring.lock().await;
        let started = Instant::now();
        *self.configuration.write() = Some(config.clone());

        info!(buckets = config.len(), "Reconfiguring cluster");

        let results = join_all(config.buckets().map(|bucket| async move {
            (bucket.name.clone(), self.reconfigure_bucket(bucket).await)
        }))
        .await;

        let mut failed = Vec::new();
        for (bucket, result) in results {
            if let Err(e) = result {
                warn!(%bucket, error = %e, "Bucket failed to converge");
                failed.push(bucket);
            }
        }

        self.prune(&config);

        self.counters.reconfigurations.fetch_add(1, Ordering::Relaxed);
        if self.metrics_enabled() {
            observability::record_reconfiguration(started.elapsed(), failed.is_empty());
        }

        if failed.is_empty() {
            info!(
                nodes = self.nodes.len(),
                elapsed = ?started.elapsed(),
                "Reconfiguration complete"
            );
            Ok(config)
        } else {
            Err(CoreError::ReconfigurationFailed { buckets: failed })
        }
    }

    async fn reconfigure_bucket(&self, bucket: &BucketConfig) -> Result<()> {
        let results = join_all(
            bucket
                .nodes
                .iter()
                .map(|node| self.converge_node(bucket, node)),
        )
        .await;
        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }

    async fn converge_node(&self, bucket: &BucketConfig, info: &NodeInfo) -> Result<()> {
        self.add_node(&info.hostname).await?;

        let services = &self.config.services;
        let mut ports: BTreeMap<ServiceType, u16> =
            info.service_ports(services.ssl_enabled).clone();
        if services.query_enabled {
            ports
                .entry(ServiceType::Query)
                .or_insert(services.query_port);
        }

        let requests: Vec<AddServiceRequest> = ports
            .into_iter()
            .map(|(service_type, port)| AddServiceRequest {
                service_type,
                bucket: Some(bucket.name.clone()),
                password: bucket.password.clone(),
                port,
                hostname: info.hostname.clone(),
            })
            .collect();

        let results = join_all(requests.iter().map(|request| self.add_service(request))).await;
        for result in results {
            result?;
        }
        Ok(())
    }

    /// Remove every live node the configuration no longer references.
    fn prune(&self, config: &ClusterConfig) {
        let referenced = config.hostnames();

        for node in self.nodes.snapshot() {
            if referenced.contains(node.hostname()) {
                continue;
            }
            let Some(node) = self.nodes.remove(node.hostname()) else {
                continue;
            };

            info!(hostname = node.hostname(), "Pruning node no longer in configuration");
            let counters = self.counters.clone();
            tokio::spawn(async move {
                let state = node.disconnect().await;
                counters.node_disconnects.fetch_add(1, Ordering::Relaxed);
                debug!(hostname = node.hostname(), %state, "Pruned node disconnected");
            });
        }

        if self.metrics_enabled() {
            observability::update_live_nodes(self.nodes.len());
        }
    }

    /// Reconfigure on every configuration published on `configs` until shutdown.
    pub fn subscribe(
        self: Arc<Self>,
        mut configs: watch::Receiver<Arc<ClusterConfig>>,
        shutdown: ShutdownCoordinator,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.wait_for_shutdown() => break,
                    changed = configs.changed() => {
                        if changed.is_err() {
                            debug!("Configuration feed closed");
                            break;
                        }
                        let config = configs.borrow_and_update().clone();
                        if let Err(e) = self.reconfigure(config).await {
                            warn!(error = %e, "Reconfiguration from configuration feed failed");
                        }
                    }
                }
            }
            debug!("Configuration follower stopped");
        })
    }
}
