//! Services: one logical connection to one service type on one node.
//!
//! The transport behind a service (socket handling, TLS, wire codecs) lives outside this
//! crate. The core only sees the [`Service`] trait and creates instances through a
//! [`ServiceFactory`].

mod registry;

pub use registry::ServiceRegistry;

use crate::config::CoreConfig;
use crate::error::Result;
use crate::message::{AddServiceRequest, ServiceMessage};
use crate::pipeline::ResponseSink;
use crate::state::LifecycleState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// The kinds of services a cluster node can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    /// Binary key/value protocol.
    Binary,
    /// Map/reduce views.
    View,
    /// Query language service.
    Query,
    /// Configuration streaming.
    Config,
}

/// How service instances map onto buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketServiceMapping {
    /// One instance per open bucket (authenticated per bucket).
    OnePerBucket,
    /// One instance shared by every bucket on the node.
    Shared,
}

impl ServiceType {
    pub fn mapping(&self) -> BucketServiceMapping {
        match self {
            ServiceType::Binary => BucketServiceMapping::OnePerBucket,
            ServiceType::View | ServiceType::Query | ServiceType::Config => {
                BucketServiceMapping::Shared
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Binary => "binary",
            ServiceType::View => "view",
            ServiceType::Query => "query",
            ServiceType::Config => "config",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A connection to one service on one node.
///
/// `send` is a non-blocking enqueue onto the transport. Responses are delivered
/// asynchronously through the [`ResponseSink`] the service was created with.
#[async_trait]
pub trait Service: Send + Sync {
    fn service_type(&self) -> ServiceType;

    fn hostname(&self) -> &str;

    /// Bucket this instance is bound to, `None` for shared services.
    fn bucket(&self) -> Option<&str>;

    /// Current lifecycle state.
    fn state(&self) -> LifecycleState;

    /// Feed of lifecycle state changes.
    fn states(&self) -> watch::Receiver<LifecycleState>;

    async fn connect(&self) -> LifecycleState;

    async fn disconnect(&self) -> LifecycleState;

    fn send(&self, message: ServiceMessage) -> Result<()>;
}

impl fmt::Debug for dyn Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("type", &self.service_type())
            .field("hostname", &self.hostname())
            .field("bucket", &self.bucket())
            .field("state", &self.state())
            .finish()
    }
}

/// Creates transport-backed services for a node.
pub trait ServiceFactory: Send + Sync {
    fn create(
        &self,
        request: &AddServiceRequest,
        config: &CoreConfig,
        responses: ResponseSink,
    ) -> Result<Arc<dyn Service>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_mapping() {
        assert_eq!(
            ServiceType::Binary.mapping(),
            BucketServiceMapping::OnePerBucket
        );
        assert_eq!(ServiceType::Config.mapping(), BucketServiceMapping::Shared);
        assert_eq!(ServiceType::Query.mapping(), BucketServiceMapping::Shared);
    }

    #[test]
    fn test_service_type_serde() {
        let json = serde_json::to_string(&ServiceType::Binary).unwrap();
        assert_eq!(json, "\"binary\"");
        let parsed: ServiceType = serde_json::from_str("\"view\"").unwrap();
        assert_eq!(parsed, ServiceType::View);
    }
}
