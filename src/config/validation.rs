//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, limits > 0)
//! - Check virtual clusters: unique names, known filter types, TLS where SNI needs it
//! - Detect virtual clusters competing for the same endpoint and routing key
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Runs before config is accepted into the system

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use crate::cluster::RoutingKey;
use crate::config::schema::{ProxyConfig, VirtualClusterConfig};
use crate::filter::FilterFactoryRegistry;
use crate::net::endpoint::Endpoint;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate `config` against the filter types `filters` knows.
pub fn validate_config(config: &ProxyConfig, filters: &FilterFactoryRegistry) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let network = &config.network;
    for (field, value) in [
        ("network.max_connections", network.max_connections as u64),
        ("network.connect_timeout_ms", network.connect_timeout_ms),
        ("network.tls_handshake_timeout_ms", network.tls_handshake_timeout_ms),
        ("network.max_frame_size", network.max_frame_size as u64),
        ("network.max_in_flight_frames", network.max_in_flight_frames as u64),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than zero"));
        }
    }

    let observability = &config.observability;
    if observability.metrics_enabled && observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", observability.metrics_address),
        ));
    }

    let mut names = HashSet::new();
    for (index, cluster) in config.virtual_clusters.iter().enumerate() {
        let prefix = format!("virtual_clusters[{}]", index);
        if cluster.name.trim().is_empty() {
            errors.push(ValidationError::new(format!("{}.name", prefix), "must not be empty"));
        } else if !names.insert(cluster.name.as_str()) {
            errors.push(ValidationError::new(
                format!("{}.name", prefix),
                format!("duplicate virtual cluster name '{}'", cluster.name),
            ));
        }
        validate_cluster(&prefix, cluster, filters, &mut errors);
    }

    validate_shared_endpoints(&config.virtual_clusters, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_cluster(
    prefix: &str,
    cluster: &VirtualClusterConfig,
    filters: &FilterFactoryRegistry,
    errors: &mut Vec<ValidationError>,
) {
    if cluster.addressing.requires_tls() && cluster.tls.is_none() {
        errors.push(ValidationError::new(
            format!("{}.tls", prefix),
            "SNI routing requires TLS to be configured",
        ));
    }
    if let Err(e) = cluster.addressing.validate() {
        errors.push(ValidationError::new(format!("{}.addressing", prefix), e.to_string()));
    }
    for (position, definition) in cluster.filters.iter().enumerate() {
        if let Err(e) = filters.create(definition) {
            errors.push(ValidationError::new(
                format!("{}.filters[{}]", prefix, position),
                e.to_string(),
            ));
        }
    }
}

/// Every (endpoint, routing key) may be claimed by one virtual cluster only.
fn validate_shared_endpoints(clusters: &[VirtualClusterConfig], errors: &mut Vec<ValidationError>) {
    let mut claimed: HashMap<(Endpoint, RoutingKey), &str> = HashMap::new();
    let mut keyed: HashMap<Endpoint, bool> = HashMap::new();

    for cluster in clusters {
        let addressing = &cluster.addressing;
        let tls = cluster.tls.is_some() || addressing.requires_tls();
        let mut wanted = vec![(addressing.bootstrap_endpoint(tls), addressing.bootstrap_routing_key())];
        for node_id in addressing.pre_bound_node_ids() {
            if let Ok(endpoint) = addressing.node_endpoint(node_id, tls) {
                wanted.push((endpoint, addressing.node_routing_key(node_id)));
            }
        }

        for (endpoint, routing_key) in wanted {
            if *keyed.entry(endpoint.clone()).or_insert(routing_key.is_keyed()) != routing_key.is_keyed() {
                errors.push(ValidationError::new(
                    format!("virtual_clusters.{}", cluster.name),
                    format!("{} mixes SNI-routed and unrouted clusters", endpoint),
                ));
                continue;
            }
            match claimed.get(&(endpoint.clone(), routing_key.clone())) {
                Some(holder) if *holder != cluster.name => errors.push(ValidationError::new(
                    format!("virtual_clusters.{}", cluster.name),
                    format!("{} ({}) is already used by virtual cluster '{}'", endpoint, routing_key, holder),
                )),
                Some(_) => {}
                None => {
                    claimed.insert((endpoint, routing_key), &cluster.name);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> ProxyConfig {
        toml::from_str(toml).unwrap()
    }

    fn validate(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
        validate_config(config, &FilterFactoryRegistry::with_builtins())
    }

    #[test]
    fn default_config_is_valid() {
        assert!(validate(&ProxyConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let config = parse(
            r#"
            [network]
            max_connections = 0
            max_in_flight_frames = 0

            [[virtual_clusters]]
            name = "sni-without-tls"
            target_bootstrap = "kafka:9092"
            filters = [{ type = "no-such-filter" }]
            [virtual_clusters.addressing]
            type = "sni-routing"
            bootstrap = "bootstrap.example.com:9192"
            node_host_pattern = "broker.example.com"
            "#,
        );
        let errors = validate(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"network.max_connections"));
        assert!(fields.contains(&"network.max_in_flight_frames"));
        assert!(fields.contains(&"virtual_clusters[0].tls"));
        assert!(fields.contains(&"virtual_clusters[0].addressing"));
        assert!(fields.contains(&"virtual_clusters[0].filters[0]"));
    }

    #[test]
    fn plain_endpoints_cannot_be_shared() {
        let config = parse(
            r#"
            [[virtual_clusters]]
            name = "a"
            target_bootstrap = "kafka-a:9092"
            [virtual_clusters.addressing]
            type = "port-per-node"
            bootstrap = "localhost:9192"
            node_start_port = 9193
            node_count = 1

            [[virtual_clusters]]
            name = "b"
            target_bootstrap = "kafka-b:9092"
            [virtual_clusters.addressing]
            type = "port-per-node"
            bootstrap = "localhost:9192"
            node_start_port = 9293
            node_count = 1
            "#,
        );
        let errors = validate(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("'a'"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let config = parse(
            r#"
            [[virtual_clusters]]
            name = "twin"
            target_bootstrap = "kafka:9092"
            [virtual_clusters.addressing]
            type = "port-per-node"
            bootstrap = "localhost:9192"
            node_start_port = 9193
            node_count = 0

            [[virtual_clusters]]
            name = "twin"
            target_bootstrap = "kafka:9092"
            [virtual_clusters.addressing]
            type = "port-per-node"
            bootstrap = "localhost:9292"
            node_start_port = 9293
            node_count = 0
            "#,
        );
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("duplicate")));
    }
}
