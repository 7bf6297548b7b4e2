//! The core entry point.
//!
//! [`Core`] accepts every request through [`Core::send`]:
//!
//! - data-plane requests ([`CoreRequest`]) are pushed onto the bounded request pipeline
//!   and dispatched by the request consumer;
//! - cluster requests ([`ClusterRequest`]) are answered by the configuration provider and
//!   the request handler;
//! - internal requests ([`InternalRequest`]) go straight to the request handler.
//!
//! Background tasks (request consumer, response consumer, configuration follower) stop
//! on `ClusterRequest::Disconnect` or when the last `Core` handle is dropped.

use crate::config::{ConfigurationProvider, CoreConfig};
use crate::error::{ConfigurationError, CoreError, Result};
use crate::handler::{RequestDispatcher, RequestHandler, ResponseHandler};
use crate::message::{
    ClusterRequest, Completion, CoreRequest, CoreResponse, InternalRequest, PendingRequest,
    Request, ResponseEvent, ResponseFuture, ResponsePayload, ResponseStatus,
};
use crate::pipeline::{EventPipeline, RequestPipeline, ResponseSink};
use crate::service::ServiceFactory;
use crate::shutdown::ShutdownCoordinator;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Handle to a running core. Cheap to clone.
#[derive(Clone)]
pub struct Core {
    inner: Arc<CoreInner>,
}

struct CoreInner {
    config: Arc<CoreConfig>,
    handler: Arc<RequestHandler>,
    provider: Arc<dyn ConfigurationProvider>,
    requests: RequestPipeline,
    shutdown: ShutdownCoordinator,
    next_id: AtomicU64,
}

impl Core {
    /// Validate `config`, build the pipelines and start the background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: CoreConfig,
        provider: Arc<dyn ConfigurationProvider>,
        factory: Arc<dyn ServiceFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let shutdown = ShutdownCoordinator::new();
        let dispatch = &config.dispatch;
        let metrics = config.observability.metrics_enabled;

        let (response_sink, response_stream) =
            EventPipeline::bounded::<ResponseEvent>(dispatch.response_buffer_size);
        let handler = Arc::new(RequestHandler::new(
            config.clone(),
            factory,
            ResponseSink::new(response_sink),
        ));

        let (request_sink, request_stream) =
            EventPipeline::bounded::<Arc<PendingRequest>>(dispatch.request_buffer_size);

        let max_batch = dispatch.max_batch_size;
        let request_consumer = tokio::spawn(request_stream.with_metrics(metrics).run(
            RequestDispatcher::new(handler.clone()),
            max_batch,
            shutdown.clone(),
        ));
        shutdown.register(
            "request-consumer",
            tokio::spawn(async move {
                if let Ok(dispatcher) = request_consumer.await {
                    debug!(flushes = dispatcher.flushes(), "Request consumer finished");
                }
            }),
        );

        let response_consumer = tokio::spawn(response_stream.with_metrics(metrics).run(
            ResponseHandler::new(),
            max_batch,
            shutdown.clone(),
        ));
        shutdown.register(
            "response-consumer",
            tokio::spawn(async move {
                if let Ok(handler) = response_consumer.await {
                    debug!(
                        delivered = handler.delivered(),
                        dropped = handler.dropped(),
                        "Response consumer finished"
                    );
                }
            }),
        );

        shutdown.register(
            "configuration-follower",
            handler.clone().subscribe(provider.configs(), shutdown.clone()),
        );

        info!(
            request_buffer = dispatch.request_buffer_size,
            response_buffer = dispatch.response_buffer_size,
            max_batch,
            "Core started"
        );

        Ok(Self {
            inner: Arc::new(CoreInner {
                config,
                handler,
                provider,
                requests: RequestPipeline::new(request_sink).with_metrics(metrics),
                shutdown,
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Submit a request and get a future for its response.
    ///
    /// Data-plane requests are admitted synchronously: if the request pipeline is full the
    /// returned future is already resolved with [`CoreError::Backpressure`].
    pub fn send(&self, request: impl Into<Request>) -> ResponseFuture {
        match request.into() {
            Request::Data(request) => self.inner.submit(request),
            Request::Cluster(request) => {
                let (completion, future) = Completion::channel();
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    completion.complete(inner.handle_cluster(request).await);
                });
                future
            }
            Request::Internal(request) => {
                let (completion, future) = Completion::channel();
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    completion.complete(inner.handle_internal(request).await);
                });
                future
            }
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }

    pub fn handler(&self) -> &Arc<RequestHandler> {
        &self.inner.handler
    }

    pub fn provider(&self) -> &Arc<dyn ConfigurationProvider> {
        &self.inner.provider
    }

    /// Free slots in the request pipeline.
    pub fn remaining_capacity(&self) -> usize {
        self.inner.requests.remaining_capacity()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_shutting_down()
    }
}

impl CoreInner {
    fn submit(&self, request: CoreRequest) -> ResponseFuture {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (pending, future) = PendingRequest::new(id, request);

        if self.shutdown.is_shutting_down() {
            pending.completion.fail(CoreError::Shutdown);
        } else {
            self.requests.submit(pending);
        }
        future
    }

    async fn handle_cluster(&self, request: ClusterRequest) -> Result<CoreResponse> {
        if self.shutdown.is_shutting_down() {
            return Err(CoreError::Shutdown);
        }

        match request {
            ClusterRequest::SeedNodes(hosts) => {
                if self.provider.seed_hosts(hosts).await {
                    Ok(CoreResponse::success())
                } else {
                    Ok(CoreResponse::failure())
                }
            }
            ClusterRequest::OpenBucket { bucket, password } => {
                self.open_bucket(&bucket, password.as_deref()).await
            }
            ClusterRequest::Disconnect => self.disconnect().await,
        }
    }

    async fn open_bucket(&self, bucket: &str, password: Option<&str>) -> Result<CoreResponse> {
        info!(bucket, "Opening bucket");
        let config = self.provider.open_bucket(bucket, password).await?;

        let config = match self.handler.reconfigure(config).await {
            Ok(config) => config,
            Err(CoreError::ReconfigurationFailed { buckets })
                if !buckets.iter().any(|b| b == bucket) =>
            {
                warn!(bucket, failed = ?buckets, "Other buckets failed to converge");
                self.provider.config()
            }
            Err(e) => return Err(e),
        };

        if config.has_bucket(bucket) {
            info!(bucket, "Bucket open");
            Ok(CoreResponse::success())
        } else {
            Err(ConfigurationError::BucketNotOpened(bucket.to_string()).into())
        }
    }

    async fn disconnect(&self) -> Result<CoreResponse> {
        info!("Disconnecting core");
        let config = self.provider.close_buckets().await?;
        if let Err(e) = self.handler.reconfigure(config).await {
            warn!(error = %e, "Reconfiguration during disconnect failed");
        }

        self.shutdown.shutdown();
        if !self.shutdown.drain().await {
            warn!("Core background tasks did not stop in time");
        }
        Ok(CoreResponse::success())
    }

    async fn handle_internal(&self, request: InternalRequest) -> Result<CoreResponse> {
        if self.shutdown.is_shutting_down() {
            return Err(CoreError::Shutdown);
        }

        match request {
            InternalRequest::AddNode { hostname } => {
                self.handler.add_node(&hostname).await?;
                Ok(node_response(hostname))
            }
            InternalRequest::RemoveNode { hostname } => {
                self.handler.remove_node(&hostname).await?;
                Ok(node_response(hostname))
            }
            InternalRequest::AddService(request) => {
                require_hostname(&request.hostname)?;
                self.handler.add_service(&request).await?;
                Ok(service_response(request.service_type, request.hostname))
            }
            InternalRequest::RemoveService(request) => {
                require_hostname(&request.hostname)?;
                self.handler.remove_service(&request).await?;
                Ok(service_response(request.service_type, request.hostname))
            }
        }
    }
}

impl Drop for CoreInner {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

fn require_hostname(hostname: &str) -> Result<()> {
    if hostname.is_empty() {
        return Err(CoreError::InvalidArgument(
            "hostname must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn node_response(hostname: String) -> CoreResponse {
    CoreResponse::new(ResponseStatus::Success, ResponsePayload::Node { hostname })
}

fn service_response(service_type: crate::service::ServiceType, hostname: String) -> CoreResponse {
    CoreResponse::new(
        ResponseStatus::Success,
        ResponsePayload::Service {
            service_type,
            hostname,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DefaultConfigurationProvider;
    use crate::message::AddServiceRequest;
    use crate::service::ServiceType;
    use crate::testing::{partitioned_bucket, InMemoryCluster, MockServiceFactory};

    fn core(factory: Arc<MockServiceFactory>) -> Core {
        let cluster = InMemoryCluster::new()
            .with_host("a")
            .with_bucket(partitioned_bucket("default", &["a"], 4), None);
        Core::new(
            CoreConfig::development(),
            Arc::new(DefaultConfigurationProvider::new(cluster)),
            factory,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let mut config = CoreConfig::development();
        config.dispatch.request_buffer_size = 0;
        let result = Core::new(
            config,
            Arc::new(DefaultConfigurationProvider::new(InMemoryCluster::new())),
            Arc::new(MockServiceFactory::new()),
        );
        assert!(matches!(result, Err(CoreError::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn test_metrics_follow_observability_config() {
        let disabled = core(Arc::new(MockServiceFactory::new()));
        assert!(!disabled.config().observability.metrics_enabled);
        assert!(!disabled.inner.requests.metrics_enabled());

        let mut config = CoreConfig::development();
        config.observability.metrics_enabled = true;
        let enabled = Core::new(
            config,
            Arc::new(DefaultConfigurationProvider::new(InMemoryCluster::new())),
            Arc::new(MockServiceFactory::new()),
        )
        .unwrap();
        assert!(enabled.inner.requests.metrics_enabled());
    }

    #[tokio::test]
    async fn test_internal_requests() {
        let core = core(Arc::new(MockServiceFactory::new()));

        let response = core
            .send(InternalRequest::AddNode {
                hostname: "10.0.0.1".into(),
            })
            .await
            .unwrap();
        assert!(matches!(
            response.payload,
            ResponsePayload::Node { ref hostname } if hostname == "10.0.0.1"
        ));

        let response = core
            .send(InternalRequest::AddService(AddServiceRequest {
                service_type: ServiceType::View,
                bucket: None,
                password: None,
                port: 8092,
                hostname: "10.0.0.1".into(),
            }))
            .await
            .unwrap();
        assert!(response.is_success());
        assert!(core
            .handler()
            .node("10.0.0.1")
            .unwrap()
            .has_service(ServiceType::View, None));

        let missing = core
            .send(InternalRequest::RemoveNode {
                hostname: "10.0.0.2".into(),
            })
            .await;
        assert!(matches!(missing, Err(CoreError::NodeNotFound(_))));

        let empty = core
            .send(InternalRequest::AddNode {
                hostname: String::new(),
            })
            .await;
        assert!(matches!(empty, Err(CoreError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_open_bucket_and_get() {
        let core = core(Arc::new(MockServiceFactory::new()));

        core.send(ClusterRequest::SeedNodes(vec!["a".into()]))
            .await
            .unwrap();
        core.send(ClusterRequest::OpenBucket {
            bucket: "default".into(),
            password: None,
        })
        .await
        .unwrap();

        let response = core.send(CoreRequest::get("default", "key")).await.unwrap();
        match response.payload {
            ResponsePayload::Document { content, .. } => assert_eq!(content, b"a".to_vec()),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_stops_core() {
        let core = core(Arc::new(MockServiceFactory::new()));

        assert!(core
            .send(ClusterRequest::Disconnect)
            .await
            .unwrap()
            .is_success());
        assert!(core.is_shut_down());

        let rejected = core.send(CoreRequest::get("default", "key")).await;
        assert!(matches!(rejected, Err(CoreError::Shutdown)));
        let rejected = core.send(ClusterRequest::SeedNodes(vec!["a".into()])).await;
        assert!(matches!(rejected, Err(CoreError::Shutdown)));
    }
}
