//! Error types for the kvcore dispatch engine.
//!
//! This module provides a unified error type [`CoreError`] for every operation the core
//! performs, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Admission**: [`CoreError::Backpressure`] when the request pipeline is full
//! - **Configuration**: [`ConfigurationError`] when a bucket cannot be opened
//! - **Topology**: unknown nodes or services, failed reconfiguration
//! - **Arguments**: malformed internal or control requests
//! - **Lifecycle**: canceled requests and shutdown
//!
//! Routing misses are not errors. A request with no live target node completes with a
//! response whose status is [`ResponseStatus::NotConnected`] or
//! [`ResponseStatus::BucketNotOpen`].
//!
//! # Example
//!
//! ```rust
//! use kvcore::error::{ConfigurationError, CoreError};
//!
//! fn handle_error(err: &CoreError) {
//!     if err.is_retryable() {
//!         println!("Retrying operation...");
//!     } else if err.is_configuration() {
//!         println!("Check bucket name and credentials: {}", err);
//!     }
//! }
//!
//! handle_error(&CoreError::BACKPRESSURE);
//! handle_error(&CoreError::Configuration(ConfigurationError::NoSeedHosts));
//! ```
//!
//! [`ResponseStatus::NotConnected`]: crate::message::ResponseStatus::NotConnected
//! [`ResponseStatus::BucketNotOpen`]: crate::message::ResponseStatus::BucketNotOpen

use crate::service::ServiceType;
use std::io;
use thiserror::Error;

/// Main error type for kvcore operations.
#[derive(Error, Debug)]
pub enum CoreError {
    // Admission control
    #[error("Request rejected: the dispatch pipeline is full")]
    Backpressure,

    // Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    // Topology errors
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Service {service_type} not found on node {hostname}")]
    ServiceNotFound {
        hostname: String,
        service_type: ServiceType,
    },

    #[error("Reconfiguration failed for buckets: {buckets:?}")]
    ReconfigurationFailed { buckets: Vec<String> },

    // Request errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Request canceled before a response was produced")]
    Canceled,

    #[error("Core is shut down")]
    Shutdown,

    // Network errors
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// The error every request rejected by a full pipeline is completed with.
    ///
    /// A unit value, so rejecting under overload never allocates.
    pub const BACKPRESSURE: CoreError = CoreError::Backpressure;

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Backpressure
                | CoreError::NodeNotFound(_)
                | CoreError::ServiceNotFound { .. }
                | CoreError::ConnectionFailed(_)
        )
    }

    /// Check if error belongs to the configuration class.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CoreError::Configuration(_) | CoreError::InvalidConfig { .. } | CoreError::Config(_)
        )
    }

    /// Check if error is the backpressure rejection.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, CoreError::Backpressure)
    }
}

/// Reasons a bucket could not be opened.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("No seed hosts have been set")]
    NoSeedHosts,

    #[error("The seed host list is empty")]
    EmptySeedList,

    #[error("Bucket does not exist: {0}")]
    BucketNotFound(String),

    #[error("Authentication failed for bucket: {0}")]
    AuthenticationFailure(String),

    #[error("No seed host could be reached: {0:?}")]
    SeedsUnreachable(Vec<String>),

    #[error("Invalid bucket configuration: {0}")]
    InvalidBucketConfig(String),

    #[error("Could not open bucket: {0}")]
    BucketNotOpened(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

/// Result type alias for kvcore operations.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backpressure_sentinel() {
        let err = CoreError::BACKPRESSURE;
        assert!(err.is_backpressure());
        assert!(err.is_retryable());
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_configuration_class() {
        let err: CoreError = ConfigurationError::BucketNotFound("travel".into()).into();
        assert!(err.is_configuration());
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "Configuration error: Bucket does not exist: travel"
        );
    }

    #[test]
    fn test_service_not_found_display() {
        let err = CoreError::ServiceNotFound {
            hostname: "10.0.0.1".into(),
            service_type: ServiceType::Binary,
        };
        assert_eq!(err.to_string(), "Service binary not found on node 10.0.0.1");
    }
}
