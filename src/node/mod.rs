//! Cluster nodes.
//!
//! A [`Node`] owns the services it hosts and never stores a lifecycle state of its own:
//! [`Node::state`] is always derived from the current service states, and `connect` /
//! `disconnect` report the aggregate of what their service operations returned.

mod locate;
mod set;

pub use locate::{BinaryLocator, ConfigLocator, Locator, Locators, RoundRobinLocator};
pub use set::NodeSet;

use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::message::{AddServiceRequest, RemoveServiceRequest, ServiceMessage};
use crate::pipeline::ResponseSink;
use crate::service::{BucketServiceMapping, Service, ServiceFactory, ServiceRegistry, ServiceType};
use crate::state::LifecycleState;
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One cluster member.
pub struct Node {
    hostname: String,
    registry: ServiceRegistry,
    factory: Arc<dyn ServiceFactory>,
    config: Arc<CoreConfig>,
    responses: ResponseSink,
}

impl Node {
    pub fn new(
        hostname: impl Into<String>,
        factory: Arc<dyn ServiceFactory>,
        config: Arc<CoreConfig>,
        responses: ResponseSink,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            registry: ServiceRegistry::new(),
            factory,
            config,
            responses,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Aggregated state of the services as they are right now.
    pub fn state(&self) -> LifecycleState {
        LifecycleState::aggregate_current(self.registry.services().iter().map(|s| s.state()))
    }

    /// Connect every registered service.
    pub async fn connect(&self) -> LifecycleState {
        let services = self.registry.services();
        let timeout = self.config.services.connect_timeout;
        let states = join_all(services.iter().map(|s| connect_service(s, timeout))).await;

        let state = LifecycleState::aggregate_connect(states);
        debug!(hostname = %self.hostname, services = services.len(), %state, "Node connected");
        state
    }

    /// Disconnect every registered service.
    pub async fn disconnect(&self) -> LifecycleState {
        let services = self.registry.services();
        let timeout = self.config.services.disconnect_timeout;
        let states = join_all(services.iter().map(|s| disconnect_service(s, timeout))).await;

        let state = LifecycleState::aggregate_disconnect(states);
        debug!(hostname = %self.hostname, %state, "Node disconnected");
        state
    }

    /// Hand a message to the service responsible for it.
    ///
    /// Requests go to the service matching their type and bucket. A flush goes to every
    /// service on the node.
    pub fn send(&self, message: ServiceMessage) -> Result<()> {
        match message {
            ServiceMessage::Request(pending) => {
                let service = self.registry.locate(&pending.request).ok_or_else(|| {
                    CoreError::ServiceNotFound {
                        hostname: self.hostname.clone(),
                        service_type: pending.request.service_type(),
                    }
                })?;
                service.send(ServiceMessage::Request(pending))
            }
            ServiceMessage::Flush => {
                for service in self.registry.services() {
                    if let Err(e) = service.send(ServiceMessage::Flush) {
                        debug!(
                            hostname = %self.hostname,
                            service = %service.service_type(),
                            error = %e,
                            "Flush failed"
                        );
                    }
                }
                Ok(())
            }
        }
    }

    /// Create and connect a service unless one already serves `(type, bucket)`.
    ///
    /// Returns the state of the service that ends up registered.
    pub async fn add_service(&self, request: &AddServiceRequest) -> Result<LifecycleState> {
        if request.port == 0 {
            return Err(CoreError::InvalidArgument(format!(
                "service {} on {} has no port",
                request.service_type, self.hostname
            )));
        }
        if request.service_type.mapping() == BucketServiceMapping::OnePerBucket
            && request.bucket.is_none()
        {
            return Err(CoreError::InvalidArgument(format!(
                "service {} requires a bucket",
                request.service_type
            )));
        }

        let bucket = request.bucket.as_deref();
        if let Some(existing) = self.registry.service_by(request.service_type, bucket) {
            return Ok(existing.state());
        }

        let service = self
            .factory
            .create(request, &self.config, self.responses.clone())?;
        let registered = self.registry.add_service(service.clone());
        if !Arc::ptr_eq(&registered, &service) {
            // Lost a race with a concurrent add of the same service.
            return Ok(registered.state());
        }

        info!(
            hostname = %self.hostname,
            service = %request.service_type,
            bucket = ?bucket,
            port = request.port,
            "Adding service"
        );
        Ok(connect_service(&service, self.config.services.connect_timeout).await)
    }

    /// Remove and disconnect a service.
    pub async fn remove_service(&self, request: &RemoveServiceRequest) -> Result<LifecycleState> {
        let service = self
            .registry
            .remove_service(request.service_type, request.bucket.as_deref())
            .ok_or_else(|| CoreError::ServiceNotFound {
                hostname: self.hostname.clone(),
                service_type: request.service_type,
            })?;

        info!(
            hostname = %self.hostname,
            service = %request.service_type,
            bucket = ?request.bucket,
            "Removing service"
        );

        let state = disconnect_service(&service, self.config.services.disconnect_timeout).await;
        if state == LifecycleState::Disconnecting {
            let mut states = service.states();
            let hostname = self.hostname.clone();
            let service_type = request.service_type;
            tokio::spawn(async move {
                loop {
                    let current = *states.borrow_and_update();
                    if current == LifecycleState::Disconnected {
                        break;
                    }
                    if states.changed().await.is_err() {
                        return;
                    }
                }
                debug!(%hostname, service = %service_type, "Service finished disconnecting");
            });
        }
        Ok(state)
    }

    pub fn has_service(&self, service_type: ServiceType, bucket: Option<&str>) -> bool {
        self.registry.contains(service_type, bucket)
    }

    pub fn service(
        &self,
        service_type: ServiceType,
        bucket: Option<&str>,
    ) -> Option<Arc<dyn Service>> {
        self.registry.service_by(service_type, bucket)
    }

    pub fn services(&self) -> Vec<Arc<dyn Service>> {
        self.registry.services()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("hostname", &self.hostname)
            .field("services", &self.registry.len())
            .field("state", &self.state())
            .finish()
    }
}

async fn connect_service(service: &Arc<dyn Service>, timeout: Duration) -> LifecycleState {
    let connecting = service.clone();
    let task = tokio::spawn(async move { connecting.connect().await });
    await_transition(service, task, timeout, "connect", LifecycleState::Connecting).await
}

async fn disconnect_service(service: &Arc<dyn Service>, timeout: Duration) -> LifecycleState {
    let disconnecting = service.clone();
    let task = tokio::spawn(async move { disconnecting.disconnect().await });
    await_transition(service, task, timeout, "disconnect", LifecycleState::Disconnecting).await
}

/// Wait up to `timeout` for a service transition running on its own task.
///
/// The task is left running when the timer fires, so the service still completes the
/// transition and publishes its final state.
async fn await_transition(
    service: &Arc<dyn Service>,
    mut task: JoinHandle<LifecycleState>,
    timeout: Duration,
    operation: &'static str,
    pending: LifecycleState,
) -> LifecycleState {
    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(state)) => state,
        Ok(Err(e)) => {
            warn!(
                hostname = %service.hostname(),
                service = %service.service_type(),
                operation,
                error = %e,
                "Service task failed"
            );
            service.state()
        }
        Err(_) => {
            warn!(
                hostname = %service.hostname(),
                service = %service.service_type(),
                operation,
                ?timeout,
                "Service transition still running after timeout"
            );
            pending
        }
    }
}
