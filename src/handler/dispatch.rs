//! Request pipeline consumer.

use super::RequestHandler;
use crate::error::CoreError;
use crate::message::{PendingRequest, ServiceMessage};
use crate::node::Node;
use crate::pipeline::EventHandler;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Dispatches each request through the [`RequestHandler`] and flushes every node touched
/// by a batch once the batch ends.
pub struct RequestDispatcher {
    handler: Arc<RequestHandler>,
    touched: HashMap<String, Arc<Node>>,
    flushes: u64,
}

impl RequestDispatcher {
    pub fn new(handler: Arc<RequestHandler>) -> Self {
        Self {
            handler,
            touched: HashMap::new(),
            flushes: 0,
        }
    }

    /// Number of node flushes issued so far.
    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    fn flush(&mut self) {
        for (hostname, node) in self.touched.drain() {
            trace!(%hostname, "Flushing node");
            // Flush never fails at node level; per-service failures are logged there.
            let _ = node.send(ServiceMessage::Flush);
            self.flushes += 1;
        }
    }
}

impl EventHandler<Arc<PendingRequest>> for RequestDispatcher {
    fn on_event(&mut self, request: Arc<PendingRequest>, end_of_batch: bool) {
        for node in self.handler.dispatch(request) {
            self.touched
                .entry(node.hostname().to_string())
                .or_insert(node);
        }
        if end_of_batch {
            self.flush();
        }
    }

    fn on_cancel(&mut self, request: Arc<PendingRequest>) {
        request.completion.fail(CoreError::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterConfig, CoreConfig};
    use crate::message::CoreRequest;
    use crate::pipeline::ResponseSink;
    use crate::service::ServiceType;
    use crate::testing::{partitioned_bucket, MockServiceFactory};

    async fn dispatcher(factory: Arc<MockServiceFactory>) -> RequestDispatcher {
        let handler = Arc::new(RequestHandler::new(
            Arc::new(CoreConfig::development()),
            factory,
            ResponseSink::direct(),
        ));
        handler
            .reconfigure(Arc::new(
                ClusterConfig::new().with_bucket(partitioned_bucket("default", &["a", "b"], 4)),
            ))
            .await
            .unwrap();
        RequestDispatcher::new(handler)
    }

    #[tokio::test]
    async fn test_flush_once_per_batch() {
        let factory = Arc::new(MockServiceFactory::new());
        let mut dispatcher = dispatcher(factory.clone()).await;

        let (first, _a) = PendingRequest::new(1, CoreRequest::bucket_streaming("default"));
        let (second, _b) = PendingRequest::new(2, CoreRequest::bucket_streaming("default"));
        dispatcher.on_event(first, false);
        assert_eq!(dispatcher.flushes(), 0);
        dispatcher.on_event(second, true);

        // Both nodes were touched twice but flushed once each.
        assert_eq!(dispatcher.flushes(), 2);
        let config = factory.service("a", ServiceType::Config).unwrap();
        assert_eq!(config.received_ids(), vec![1, 2]);
        assert_eq!(config.flush_count(), 1);
    }

    #[tokio::test]
    async fn test_routing_miss_does_not_flush() {
        let mut dispatcher = dispatcher(Arc::new(MockServiceFactory::new())).await;

        let (request, rx) = PendingRequest::new(1, CoreRequest::get("travel", "key"));
        dispatcher.on_event(request, true);

        assert_eq!(dispatcher.flushes(), 0);
        assert!(!rx.await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_cancel_fails_with_shutdown() {
        let mut dispatcher = dispatcher(Arc::new(MockServiceFactory::new())).await;

        let (request, rx) = PendingRequest::new(1, CoreRequest::get("default", "key"));
        dispatcher.on_cancel(request);
        assert!(matches!(rx.await, Err(CoreError::Shutdown)));
    }
}
