//! In-memory collaborators for tests and benchmarks.
//!
//! None of these touch the network. [`MockServiceFactory`] creates [`MockService`]s that
//! record what they receive and answer requests immediately; [`InMemoryCluster`] plays the
//! role of the seed hosts a [`DefaultConfigurationProvider`] bootstraps from.
//!
//! ## Usage Pattern
//!
//! ```ignore
//! let cluster = InMemoryCluster::new()
//!     .with_host("10.0.0.1")
//!     .with_bucket(partitioned_bucket("default", &["10.0.0.1"], 64), None);
//! let provider = Arc::new(DefaultConfigurationProvider::new(cluster));
//! let core = Core::new(CoreConfig::development(), provider, Arc::new(MockServiceFactory::new()))?;
//!
//! core.send(ClusterRequest::SeedNodes(vec!["10.0.0.1".into()])).await?;
//! core.send(ClusterRequest::OpenBucket { bucket: "default".into(), password: None }).await?;
//! ```
//!
//! [`DefaultConfigurationProvider`]: crate::config::DefaultConfigurationProvider

use crate::config::{BucketConfig, ConfigLoader, CoreConfig, LoadError, NodeInfo, Partition};
use crate::error::{CoreError, Result};
use crate::message::{
    AddServiceRequest, BinaryRequest, ConfigRequest, CoreRequest, CoreResponse, PendingRequest,
    RequestKind, ResponsePayload, ResponseStatus, ServiceMessage,
};
use crate::pipeline::ResponseSink;
use crate::service::{Service, ServiceFactory, ServiceType};
use crate::state::LifecycleState;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Service double that records traffic and answers requests immediately.
pub struct MockService {
    hostname: String,
    service_type: ServiceType,
    bucket: Option<String>,
    port: u16,
    state: Arc<watch::Sender<LifecycleState>>,
    connect_result: LifecycleState,
    disconnect_result: LifecycleState,
    connect_delay: Option<Duration>,
    responses: Option<ResponseSink>,
    fail_sends: AtomicBool,
    received: Mutex<Vec<Arc<PendingRequest>>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    flushes: AtomicUsize,
}

impl MockService {
    pub fn new(hostname: &str, service_type: ServiceType, bucket: Option<&str>) -> Self {
        let (state, _) = watch::channel(LifecycleState::Disconnected);
        Self {
            hostname: hostname.to_string(),
            service_type,
            bucket: bucket.map(str::to_string),
            port: 0,
            state: Arc::new(state),
            connect_result: LifecycleState::Connected,
            disconnect_result: LifecycleState::Disconnected,
            connect_delay: None,
            responses: None,
            fail_sends: AtomicBool::new(false),
            received: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// State reported by `connect`.
    pub fn with_connect_result(mut self, state: LifecycleState) -> Self {
        self.connect_result = state;
        self
    }

    /// State reported by `disconnect`. `Disconnecting` settles to `Disconnected` shortly
    /// afterwards.
    pub fn with_disconnect_result(mut self, state: LifecycleState) -> Self {
        self.disconnect_result = state;
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    /// Answer every request through `responses`.
    pub fn with_responses(mut self, responses: ResponseSink) -> Self {
        self.responses = Some(responses);
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<Arc<PendingRequest>> {
        self.received.lock().clone()
    }

    pub fn received_ids(&self) -> Vec<u64> {
        self.received.lock().iter().map(|r| r.id).collect()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    fn respond(&self, pending: &Arc<PendingRequest>) {
        if let Some(responses) = &self.responses {
            let response = mock_response(&pending.request, &self.hostname);
            responses.publish(pending.clone(), Ok(response));
        }
    }
}

#[async_trait]
impl Service for MockService {
    fn service_type(&self) -> ServiceType {
        self.service_type
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    fn states(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    async fn connect(&self) -> LifecycleState {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(LifecycleState::Connecting);
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        self.state.send_replace(self.connect_result);
        self.connect_result
    }

    async fn disconnect(&self) -> LifecycleState {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(self.disconnect_result);
        if self.disconnect_result == LifecycleState::Disconnecting {
            let state = self.state.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                state.send_replace(LifecycleState::Disconnected);
            });
        }
        self.disconnect_result
    }

    fn send(&self, message: ServiceMessage) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(CoreError::ConnectionFailed(format!(
                "{} service on {} is not writable",
                self.service_type, self.hostname
            )));
        }
        match message {
            ServiceMessage::Request(pending) => {
                self.received.lock().push(pending.clone());
                self.respond(&pending);
            }
            ServiceMessage::Flush => {
                self.flushes.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}

/// Canned successful response for a request served by `hostname`.
///
/// Reads return a document whose content names the serving host; view and query
/// requests return a single row holding the hostname.
pub fn mock_response(request: &CoreRequest, hostname: &str) -> CoreResponse {
    let payload = match request.kind() {
        RequestKind::Binary(BinaryRequest::Get { key })
        | RequestKind::Binary(BinaryRequest::GetReplica { key, .. }) => ResponsePayload::Document {
            key: key.clone(),
            content: hostname.as_bytes().to_vec(),
            cas: 1,
        },
        RequestKind::Binary(BinaryRequest::Upsert { key, content, .. }) => {
            ResponsePayload::Document {
                key: key.clone(),
                content: content.clone(),
                cas: 1,
            }
        }
        RequestKind::Binary(BinaryRequest::Remove { .. }) => ResponsePayload::Empty,
        RequestKind::View(_) | RequestKind::Query(_) => {
            ResponsePayload::Rows(vec![hostname.to_string()])
        }
        RequestKind::Config(ConfigRequest::BucketStreaming) => {
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(format!(
                "{{\"name\":\"{}\",\"host\":\"{}\"}}",
                request.bucket(),
                hostname
            ));
            ResponsePayload::ConfigStream {
                host: hostname.to_string(),
                configs: rx,
            }
        }
        RequestKind::Config(ConfigRequest::BucketConfig) => {
            ResponsePayload::Rows(vec![format!("{{\"name\":\"{}\"}}", request.bucket())])
        }
    };
    CoreResponse::new(ResponseStatus::Success, payload)
}

/// Factory producing [`MockService`]s, with per-host behavior overrides.
#[derive(Default)]
pub struct MockServiceFactory {
    created: Mutex<Vec<Arc<MockService>>>,
    connect_results: Mutex<HashMap<String, LifecycleState>>,
    disconnect_results: Mutex<HashMap<String, LifecycleState>>,
    connect_delay: Mutex<Option<Duration>>,
    failing_hosts: Mutex<HashSet<String>>,
    silent: AtomicBool,
}

impl MockServiceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Services created on `hostname` from now on report `state` when connecting.
    pub fn set_connect_result(&self, hostname: &str, state: LifecycleState) {
        self.connect_results
            .lock()
            .insert(hostname.to_string(), state);
    }

    /// Services created on `hostname` from now on report `state` when disconnecting.
    pub fn set_disconnect_result(&self, hostname: &str, state: LifecycleState) {
        self.disconnect_results
            .lock()
            .insert(hostname.to_string(), state);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = Some(delay);
    }

    /// Creating services on `hostname` fails from now on.
    pub fn fail_host(&self, hostname: &str) {
        self.failing_hosts.lock().insert(hostname.to_string());
    }

    /// Services created from now on never answer requests.
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<Arc<MockService>> {
        self.created.lock().clone()
    }

    pub fn created_on(&self, hostname: &str) -> Vec<Arc<MockService>> {
        self.created
            .lock()
            .iter()
            .filter(|s| s.hostname == hostname)
            .cloned()
            .collect()
    }

    pub fn service(
        &self,
        hostname: &str,
        service_type: ServiceType,
    ) -> Option<Arc<MockService>> {
        self.created
            .lock()
            .iter()
            .find(|s| s.hostname == hostname && s.service_type == service_type)
            .cloned()
    }
}

impl ServiceFactory for MockServiceFactory {
    fn create(
        &self,
        request: &AddServiceRequest,
        _config: &CoreConfig,
        responses: ResponseSink,
    ) -> Result<Arc<dyn Service>> {
        if self.failing_hosts.lock().contains(&request.hostname) {
            return Err(CoreError::ConnectionFailed(format!(
                "cannot reach {}:{}",
                request.hostname, request.port
            )));
        }

        let mut service = MockService::new(
            &request.hostname,
            request.service_type,
            request.bucket.as_deref(),
        )
        .with_port(request.port);
        if let Some(state) = self.connect_results.lock().get(&request.hostname) {
            service = service.with_connect_result(*state);
        }
        if let Some(state) = self.disconnect_results.lock().get(&request.hostname) {
            service = service.with_disconnect_result(*state);
        }
        if let Some(delay) = *self.connect_delay.lock() {
            service = service.with_connect_delay(delay);
        }
        if !self.silent.load(Ordering::SeqCst) {
            service = service.with_responses(responses);
        }

        let service = Arc::new(service);
        self.created.lock().push(service.clone());
        Ok(service)
    }
}

/// Seed hosts and bucket configurations served without a network.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    hosts: HashSet<String>,
    buckets: HashMap<String, (BucketConfig, Option<String>)>,
    loads: AtomicUsize,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `hostname` answer configuration requests.
    pub fn with_host(mut self, hostname: &str) -> Self {
        self.hosts.insert(hostname.to_string());
        self
    }

    /// Serve `bucket`, protected by `password`.
    pub fn with_bucket(mut self, bucket: BucketConfig, password: Option<&str>) -> Self {
        self.buckets.insert(
            bucket.name.clone(),
            (bucket, password.map(str::to_string)),
        );
        self
    }

    /// Number of load attempts made against this cluster.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigLoader for InMemoryCluster {
    async fn load(
        &self,
        seed: &str,
        bucket: &str,
        password: Option<&str>,
    ) -> std::result::Result<BucketConfig, LoadError> {
        self.loads.fetch_add(1, Ordering::SeqCst);

        if !self.hosts.contains(seed) {
            return Err(LoadError::Unreachable(format!("{}: connection refused", seed)));
        }

        let (config, expected) = self
            .buckets
            .get(bucket)
            .ok_or(LoadError::BucketNotFound)?;

        // A bucket without a password accepts an empty one.
        if expected.as_deref().unwrap_or("") != password.unwrap_or("") {
            return Err(LoadError::AuthenticationFailure);
        }

        Ok(config.clone())
    }
}

/// Standard ports advertised by [`partitioned_bucket`] nodes.
pub const BINARY_PORT: u16 = 11210;
pub const VIEW_PORT: u16 = 8092;
pub const CONFIG_PORT: u16 = 8091;
pub const BINARY_SSL_PORT: u16 = 11207;
pub const VIEW_SSL_PORT: u16 = 18092;
pub const CONFIG_SSL_PORT: u16 = 18091;

/// Node advertising binary, view and config services on the standard ports.
pub fn standard_node(hostname: &str) -> NodeInfo {
    NodeInfo::new(hostname)
        .with_service(ServiceType::Binary, BINARY_PORT)
        .with_service(ServiceType::View, VIEW_PORT)
        .with_service(ServiceType::Config, CONFIG_PORT)
        .with_ssl_service(ServiceType::Binary, BINARY_SSL_PORT)
        .with_ssl_service(ServiceType::View, VIEW_SSL_PORT)
        .with_ssl_service(ServiceType::Config, CONFIG_SSL_PORT)
}

/// A bucket spread over `hosts` with `partitions` partitions assigned round-robin.
///
/// With more than one host, each partition gets one replica on the next host.
pub fn partitioned_bucket(name: &str, hosts: &[&str], partitions: usize) -> BucketConfig {
    let partition_hosts: Vec<String> = hosts
        .iter()
        .map(|h| format!("{}:{}", h, BINARY_PORT))
        .collect();

    let count = hosts.len().max(1);
    let partitions = (0..partitions)
        .map(|i| {
            let active = (i % count) as u16;
            if hosts.len() > 1 {
                Partition::with_replicas(active, vec![((i + 1) % count) as u16])
            } else {
                Partition::new(active)
            }
        })
        .collect();

    let mut bucket = BucketConfig::new(name).with_rev(1);
    for host in hosts {
        bucket = bucket.with_node(standard_node(host));
    }
    bucket.with_partitions(partition_hosts, partitions)
}
