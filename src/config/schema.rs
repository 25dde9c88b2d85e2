//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from TOML, and compare
//! by value so a reload can tell which virtual clusters changed.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::cluster::{AddressingStrategy, HostPort};

/// Root configuration for the proxy.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Connection handling shared by every virtual cluster.
    pub network: NetworkConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Virtual cluster definitions.
    pub virtual_clusters: Vec<VirtualClusterConfig>,
}

/// Network configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Maximum concurrent client connections across all listeners (backpressure).
    pub max_connections: usize,

    /// Upstream connect timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// Time allowed for a client to send its TLS ClientHello and finish the handshake.
    pub tls_handshake_timeout_ms: u64,

    /// Largest frame accepted from either side, in bytes.
    pub max_frame_size: usize,

    /// Client requests a connection may have in the filter pipeline before reads pause.
    pub max_in_flight_frames: usize,

    /// How long shutdown waits for connections to drain.
    pub shutdown_grace_period_secs: u64,
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn tls_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.tls_handshake_timeout_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            connect_timeout_ms: 5_000,
            tls_handshake_timeout_ms: 10_000,
            max_frame_size: 100 * 1024 * 1024,
            max_in_flight_frames: 256,
            shutdown_grace_period_secs: 30,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive.
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// One virtual cluster.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VirtualClusterConfig {
    /// Unique name, used in logs.
    pub name: String,

    /// Bootstrap address of the upstream cluster.
    pub target_bootstrap: HostPort,

    /// TLS material for client connections. Required for SNI routing.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    pub addressing: AddressingStrategy,

    /// Filter chain, closest to the client first.
    #[serde(default)]
    pub filters: Vec<FilterDefinition>,
}

/// TLS configuration for client-facing listeners.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate chain (PEM).
    pub cert_path: PathBuf,

    /// Path to private key (PEM).
    pub key_path: PathBuf,
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::Table::new())
}

/// One entry of a filter chain.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FilterDefinition {
    /// Registered filter type, e.g. `request-logger`.
    #[serde(rename = "type")]
    pub filter_type: String,

    /// Filter-specific settings.
    #[serde(default = "empty_table")]
    pub config: toml::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: ProxyConfig = toml::from_str("").unwrap();
        assert_eq!(config, ProxyConfig::default());
        assert_eq!(config.network.max_in_flight_frames, 256);
        assert_eq!(config.observability.log_format, LogFormat::Pretty);
    }

    #[test]
    fn parses_virtual_clusters() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [network]
            connect_timeout_ms = 1000

            [[virtual_clusters]]
            name = "demo"
            target_bootstrap = "kafka.internal:9092"
            filters = [{ type = "request-logger" }]

            [virtual_clusters.addressing]
            type = "port-per-node"
            bootstrap = "localhost:9192"
            node_start_port = 9193
            node_count = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.network.connect_timeout(), Duration::from_secs(1));
        let cluster = &config.virtual_clusters[0];
        assert_eq!(cluster.target_bootstrap, HostPort::new("kafka.internal", 9092));
        assert!(cluster.tls.is_none());
        assert_eq!(cluster.filters[0].filter_type, "request-logger");
        assert_eq!(cluster.addressing.pre_bound_node_ids(), vec![0, 1, 2]);
    }
}
