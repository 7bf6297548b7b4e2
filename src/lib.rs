//! kvcore - request routing and topology convergence for a clustered database driver.
//!
//! kvcore sits between a driver's public API and its per-connection endpoints. Callers
//! submit requests; kvcore routes each one to the right cluster node, and keeps the set of
//! live nodes and their services in line with the cluster configuration as it changes.
//!
//! # Features
//!
//! - **Bounded dispatch**: requests flow through a bounded pipeline and are rejected with
//!   backpressure instead of queueing without limit.
//! - **Partition-aware routing**: key/value requests go to the node owning the key's
//!   partition; view and query requests rotate across nodes; configuration requests
//!   fan out to every node.
//! - **Topology convergence**: each new cluster configuration adds missing nodes and
//!   services and prunes nodes no bucket references.
//! - **Pluggable transports**: services are created by a [`ServiceFactory`] supplied by
//!   the embedding driver.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Core::send                                                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Request pipeline ─▶ RequestHandler ─▶ Locators ─▶ Node     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Node ─▶ ServiceRegistry ─▶ Service (binary/view/query/cfg) │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Service ─▶ Response pipeline ─▶ caller's ResponseFuture    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ConfigurationProvider ─▶ watch feed ─▶ reconfigure         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use kvcore::config::{CoreConfig, DefaultConfigurationProvider};
//! use kvcore::message::{ClusterRequest, CoreRequest};
//! use kvcore::testing::{partitioned_bucket, InMemoryCluster, MockServiceFactory};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> kvcore::Result<()> {
//!     let cluster = InMemoryCluster::new()
//!         .with_host("10.0.0.1")
//!         .with_bucket(partitioned_bucket("default", &["10.0.0.1"], 64), None);
//!
//!     let core = kvcore::start(
//!         CoreConfig::development(),
//!         Arc::new(DefaultConfigurationProvider::new(cluster)),
//!         Arc::new(MockServiceFactory::new()),
//!     )?;
//!
//!     core.send(ClusterRequest::SeedNodes(vec!["10.0.0.1".into()])).await?;
//!     core.send(ClusterRequest::OpenBucket { bucket: "default".into(), password: None })
//!         .await?;
//!
//!     let response = core.send(CoreRequest::get("default", "user::1")).await?;
//!     println!("{:?}", response.status);
//!
//!     core.send(ClusterRequest::Disconnect).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod handler;
pub mod message;
pub mod node;
pub mod observability;
pub mod pipeline;
pub mod service;
pub mod shutdown;
pub mod state;
pub mod testing;

// Re-exports
pub use crate::core::Core;
pub use error::{ConfigurationError, CoreError, Result};
pub use message::{ClusterRequest, CoreRequest, CoreResponse, InternalRequest, ResponseStatus};
pub use service::{Service, ServiceFactory, ServiceType};
pub use state::LifecycleState;

use config::{ConfigurationProvider, CoreConfig};
use std::sync::Arc;
use tracing::{info, warn};

/// Initialize logging from `config` and start a [`Core`].
///
/// Logging setup is skipped with a warning if a global subscriber is already installed.
pub fn start(
    config: CoreConfig,
    provider: Arc<dyn ConfigurationProvider>,
    factory: Arc<dyn ServiceFactory>,
) -> Result<Core> {
    if let Err(e) = observability::init(&config.observability) {
        warn!(error = %e, "Logging already initialized");
    }

    if config.observability.metrics_enabled {
        info!("Metrics enabled; install a recorder to collect them");
    }

    Core::new(config, provider, factory)
}
