//! How a virtual cluster exposes its bootstrap and per-node endpoints.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cluster::{AddressingError, HostPort};
use crate::net::endpoint::Endpoint;

/// Placeholder substituted with the node id in SNI host patterns.
pub const NODE_ID_PLACEHOLDER: &str = "$(nodeId)";

/// Discriminates virtual clusters sharing one listening socket.
///
/// Keyed by SNI hostname (always lower-cased) on SNI-routed TLS endpoints;
/// unkeyed everywhere else, which makes those endpoints unshareable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingKey(Option<String>);

impl RoutingKey {
    pub const UNKEYED: RoutingKey = RoutingKey(None);

    pub fn sni(host: &str) -> Self {
        RoutingKey(Some(host.to_ascii_lowercase()))
    }

    /// Key to look a connection up by, given the SNI it presented (if any).
    pub fn from_sni(host: Option<&str>) -> Self {
        host.map(Self::sni).unwrap_or(Self::UNKEYED)
    }

    pub fn is_keyed(&self) -> bool {
        self.0.is_some()
    }

    pub fn host(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(host) => f.write_str(host),
            None => f.write_str("<unkeyed>"),
        }
    }
}

fn default_node_count() -> u32 {
    3
}

/// Addressing scheme of a virtual cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AddressingStrategy {
    /// Bootstrap port plus one consecutive port per upstream node.
    PortPerNode {
        /// Advertised bootstrap host and the port it listens on.
        bootstrap: HostPort,
        #[serde(default)]
        bind_address: Option<String>,
        node_start_port: u16,
        #[serde(default)]
        lowest_node_id: u32,
        #[serde(default = "default_node_count")]
        node_count: u32,
    },
    /// One TLS port; bootstrap and nodes are told apart by SNI hostname.
    SniRouting {
        bootstrap: HostPort,
        #[serde(default)]
        bind_address: Option<String>,
        /// Node hostname with `$(nodeId)` in place of the node id.
        node_host_pattern: String,
        #[serde(default)]
        pre_bound_node_ids: Vec<u32>,
    },
}

impl AddressingStrategy {
    /// Whether endpoints of this scheme are TLS regardless of cluster settings.
    pub fn requires_tls(&self) -> bool {
        matches!(self, AddressingStrategy::SniRouting { .. })
    }

    pub fn bootstrap_endpoint(&self, tls: bool) -> Endpoint {
        match self {
            AddressingStrategy::PortPerNode {
                bootstrap, bind_address, ..
            } => Endpoint::new(bind_address.clone(), bootstrap.port, tls),
            AddressingStrategy::SniRouting {
                bootstrap, bind_address, ..
            } => Endpoint::new(bind_address.clone(), bootstrap.port, true),
        }
    }

    pub fn node_endpoint(&self, node_id: u32, tls: bool) -> Result<Endpoint, AddressingError> {
        match self {
            AddressingStrategy::PortPerNode {
                bind_address,
                node_start_port,
                lowest_node_id,
                node_count,
                ..
            } => {
                let offset = node_id
                    .checked_sub(*lowest_node_id)
                    .filter(|offset| offset < node_count)
                    .ok_or(AddressingError::NodeOutOfRange { node_id })?;
                let port = u32::from(*node_start_port) + offset;
                let port = u16::try_from(port).map_err(|_| AddressingError::NodeOutOfRange { node_id })?;
                Ok(Endpoint::new(bind_address.clone(), port, tls))
            }
            AddressingStrategy::SniRouting { .. } => Ok(self.bootstrap_endpoint(true)),
        }
    }

    pub fn bootstrap_routing_key(&self) -> RoutingKey {
        match self {
            AddressingStrategy::PortPerNode { .. } => RoutingKey::UNKEYED,
            AddressingStrategy::SniRouting { bootstrap, .. } => RoutingKey::sni(&bootstrap.host),
        }
    }

    pub fn node_routing_key(&self, node_id: u32) -> RoutingKey {
        match self {
            AddressingStrategy::PortPerNode { .. } => RoutingKey::UNKEYED,
            AddressingStrategy::SniRouting { node_host_pattern, .. } => {
                RoutingKey::sni(&node_host_pattern.replace(NODE_ID_PLACEHOLDER, &node_id.to_string()))
            }
        }
    }

    /// Node ids whose endpoints are bound at registration, before discovery.
    pub fn pre_bound_node_ids(&self) -> Vec<u32> {
        match self {
            AddressingStrategy::PortPerNode {
                lowest_node_id,
                node_count,
                ..
            } => (*lowest_node_id..lowest_node_id.saturating_add(*node_count)).collect(),
            AddressingStrategy::SniRouting { pre_bound_node_ids, .. } => pre_bound_node_ids.clone(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), AddressingError> {
        match self {
            AddressingStrategy::PortPerNode {
                node_start_port,
                node_count,
                ..
            } => {
                let last = u32::from(*node_start_port) + node_count.saturating_sub(1);
                if *node_count > 0 && last > u32::from(u16::MAX) {
                    return Err(AddressingError::PortRangeOverflow {
                        start: *node_start_port,
                        count: *node_count,
                    });
                }
                Ok(())
            }
            AddressingStrategy::SniRouting { node_host_pattern, .. } => {
                if !node_host_pattern.contains(NODE_ID_PLACEHOLDER) {
                    return Err(AddressingError::MissingNodeIdPlaceholder(node_host_pattern.clone()));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port_per_node() -> AddressingStrategy {
        AddressingStrategy::PortPerNode {
            bootstrap: "localhost:9192".parse().unwrap(),
            bind_address: None,
            node_start_port: 9193,
            lowest_node_id: 10,
            node_count: 3,
        }
    }

    fn sni() -> AddressingStrategy {
        AddressingStrategy::SniRouting {
            bootstrap: "Bootstrap.Example.com:9192".parse().unwrap(),
            bind_address: Some("127.0.0.1".to_string()),
            node_host_pattern: "broker-$(nodeId).example.com".to_string(),
            pre_bound_node_ids: vec![0, 1],
        }
    }

    #[test]
    fn port_per_node_maps_node_ids_onto_consecutive_ports() {
        let addressing = port_per_node();
        assert_eq!(addressing.bootstrap_endpoint(false), Endpoint::any(9192, false));
        assert_eq!(addressing.node_endpoint(10, false).unwrap(), Endpoint::any(9193, false));
        assert_eq!(addressing.node_endpoint(12, false).unwrap(), Endpoint::any(9195, false));
        assert!(matches!(
            addressing.node_endpoint(13, false),
            Err(AddressingError::NodeOutOfRange { node_id: 13 })
        ));
        assert!(addressing.node_endpoint(9, false).is_err());
        assert_eq!(addressing.pre_bound_node_ids(), vec![10, 11, 12]);
        assert!(!addressing.node_routing_key(10).is_keyed());
    }

    #[test]
    fn sni_routing_shares_one_tls_port() {
        let addressing = sni();
        let bootstrap = addressing.bootstrap_endpoint(false);
        assert!(bootstrap.tls);
        assert_eq!(addressing.node_endpoint(1, false).unwrap(), bootstrap);
        assert_eq!(addressing.bootstrap_routing_key(), RoutingKey::sni("bootstrap.example.com"));
        assert_eq!(addressing.node_routing_key(7).host(), Some("broker-7.example.com"));
    }

    #[test]
    fn sni_pattern_must_name_the_node() {
        let addressing = AddressingStrategy::SniRouting {
            bootstrap: "b.example.com:9192".parse().unwrap(),
            bind_address: None,
            node_host_pattern: "broker.example.com".to_string(),
            pre_bound_node_ids: Vec::new(),
        };
        assert!(matches!(addressing.validate(), Err(AddressingError::MissingNodeIdPlaceholder(_))));
    }

    #[test]
    fn deserializes_from_tagged_toml() {
        let addressing: AddressingStrategy = toml::from_str(
            r#"
            type = "sni-routing"
            bootstrap = "bootstrap.example.com:9192"
            node_host_pattern = "broker-$(nodeId).example.com"
            "#,
        )
        .unwrap();
        assert!(addressing.requires_tls());
        assert!(addressing.pre_bound_node_ids().is_empty());
    }
}
