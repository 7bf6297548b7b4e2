//! Configuration for the kvcore engine.
//!
//! [`CoreConfig`] is the environment the core runs in: pipeline sizing, service
//! connection options and observability settings. It is built once, validated, and then
//! shared read-only as `Arc<CoreConfig>`.
//!
//! The cluster topology itself (buckets, nodes, partitions) lives in [`cluster`] and is
//! supplied at runtime by a [`ConfigurationProvider`].

mod cluster;
mod provider;

pub use cluster::{BucketConfig, ClusterConfig, NodeInfo, Partition};
pub use provider::{
    ConfigLoader, ConfigurationProvider, DefaultConfigurationProvider, LoadError,
};

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for a kvcore instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Request/response pipeline configuration.
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Service connection configuration.
    #[serde(default)]
    pub services: ServiceConfig,
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl CoreConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| CoreError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.dispatch.request_buffer_size == 0 {
            return Err(CoreError::InvalidConfig {
                field: "dispatch.request_buffer_size".to_string(),
                reason: "Request buffer must hold at least one request".to_string(),
            });
        }

        if self.dispatch.response_buffer_size == 0 {
            return Err(CoreError::InvalidConfig {
                field: "dispatch.response_buffer_size".to_string(),
                reason: "Response buffer must hold at least one response".to_string(),
            });
        }

        if self.dispatch.max_batch_size == 0 {
            return Err(CoreError::InvalidConfig {
                field: "dispatch.max_batch_size".to_string(),
                reason: "Batch size must be non-zero".to_string(),
            });
        }

        if self.services.query_enabled && self.services.query_port == 0 {
            return Err(CoreError::InvalidConfig {
                field: "services.query_port".to_string(),
                reason: "Query port is required when the query service is enabled".to_string(),
            });
        }

        if self.services.connect_timeout.is_zero() {
            return Err(CoreError::InvalidConfig {
                field: "services.connect_timeout".to_string(),
                reason: "Connect timeout must be non-zero".to_string(),
            });
        }

        Ok(())
    }

    /// Create a small configuration suited to local development and tests.
    pub fn development() -> Self {
        Self {
            dispatch: DispatchConfig {
                request_buffer_size: 1024,
                response_buffer_size: 1024,
                max_batch_size: 64,
            },
            services: ServiceConfig {
                ssl_enabled: false,
                query_enabled: false,
                query_port: DEFAULT_QUERY_PORT,
                connect_timeout: Duration::from_secs(1),
                disconnect_timeout: Duration::from_secs(1),
            },
            observability: ObservabilityConfig {
                log_level: "debug".to_string(),
                json_logs: false,
                metrics_enabled: false,
            },
        }
    }
}

/// Port synthesized for the query service when it is enabled but not advertised.
pub const DEFAULT_QUERY_PORT: u16 = 8093;

/// Pipeline sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Capacity of the request pipeline. Submissions beyond it fail with backpressure.
    pub request_buffer_size: usize,
    /// Capacity of the response pipeline.
    pub response_buffer_size: usize,
    /// Maximum number of events drained per batch.
    pub max_batch_size: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            request_buffer_size: 16 * 1024,
            response_buffer_size: 16 * 1024,
            max_batch_size: 256,
        }
    }
}

/// Service connection options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Connect services on their TLS ports.
    pub ssl_enabled: bool,
    /// Create a query service on every node, even when the node does not advertise one.
    pub query_enabled: bool,
    /// Port used for synthesized query services.
    pub query_port: u16,
    /// Time a service connect may take before it is reported as still connecting.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Time a service disconnect may take before it is reported as still disconnecting.
    #[serde(with = "humantime_serde")]
    pub disconnect_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            ssl_enabled: false,
            query_enabled: false,
            query_port: DEFAULT_QUERY_PORT,
            connect_timeout: Duration::from_secs(5),
            disconnect_timeout: Duration::from_secs(5),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level, overridden by `RUST_LOG`.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
    /// Record metrics through the installed `metrics` recorder.
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: true,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        // Longest suffixes first so "ms" is not read as minutes.
        let units: [(&str, u64); 4] = [("ms", 1), ("s", 1_000), ("m", 60_000), ("h", 3_600_000)];
        for (suffix, millis) in units {
            if let Some(value) = s.strip_suffix(suffix) {
                return value
                    .trim()
                    .parse::<u64>()
                    .map(|v| Duration::from_millis(v * millis))
                    .map_err(|e| format!("invalid duration '{}': {}", s, e));
            }
        }
        s.parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| format!("invalid duration '{}': {}", s, e))
    }
}
