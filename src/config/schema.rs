//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for a worker.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for a dispatch worker.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct WorkerConfig {
    /// Where listening sockets are obtained from.
    pub coordinator: CoordinatorConfig,

    /// Network loop settings.
    pub http: HttpConfig,

    /// Dispatch loop settings.
    pub dispatch: DispatchConfig,

    /// Startup and shutdown settings.
    pub lifecycle: LifecycleConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Configured listeners, ordered by id when queried through the catalog.
    pub listeners: Vec<ListenerEntry>,
}

/// Coordinator hand-off configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Path of the coordinator's Unix domain socket.
    pub socket_path: String,

    /// Base delay for connect retries in milliseconds.
    pub retry_base_delay_ms: u64,

    /// Maximum delay for connect retries in milliseconds.
    pub retry_max_delay_ms: u64,

    /// How often a blocked hand-off re-checks for reload/shutdown requests.
    pub poll_interval_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            socket_path: "/tmp/dispatch-coordinator.sock".to_string(),
            retry_base_delay_ms: 10,
            retry_max_delay_ms: 500,
            poll_interval_ms: 50,
        }
    }
}

/// Network loop configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Value of the `server` response header.
    pub server_name: String,

    /// Maximum request body size in bytes.
    pub max_body_size: usize,

    /// Idle connection timeout in seconds (HTTP/1 header read timeout).
    pub idle_timeout_secs: u64,

    /// HTTP/2 keep-alive ping interval in seconds.
    pub http2_keep_alive_secs: u64,

    /// Connect timeout for upstreams of proxied requests in seconds.
    pub upstream_connect_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            server_name: concat!("dispatch-worker/", env!("CARGO_PKG_VERSION")).to_string(),
            max_body_size: 2 * 1024 * 1024, // 2MB
            idle_timeout_secs: 60,
            http2_keep_alive_secs: 20,
            upstream_connect_timeout_secs: 5,
        }
    }
}

/// Dispatch loop configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Delay before retrying a reload whose catalog query found the store locked.
    pub reload_retry_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { reload_retry_ms: 100 }
    }
}

/// Lifecycle configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// How long shutdown waits for open connections to finish.
    pub drain_timeout_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self { drain_timeout_secs: 5 }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, for development.
    #[default]
    Pretty,
    /// One JSON object per line, for log shippers.
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive.
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// A configured listener row.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ListenerEntry {
    /// Logical listener id.
    pub id: i32,

    /// Address the coordinator binds for this listener (e.g., "127.0.0.1:8080").
    pub address: String,
}
