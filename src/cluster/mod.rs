//! Virtual cluster subsystem.
//!
//! # Data Flow
//! ```text
//! VirtualClusterConfig
//!     → VirtualCluster::from_config (filters, TLS material, addressing validated)
//!     → addressing.rs: required bindings = bootstrap + pre-bound nodes
//!         (Endpoint, RoutingKey, VirtualClusterBinding)
//!     → registry binds the endpoints and files the bindings under their keys
//!     → inbound connection resolves to a VirtualClusterBinding (binding.rs)
//! ```
//!
//! # Design Decisions
//! - A cluster is immutable after construction; reload builds a new one
//! - Registry identity is the `ClusterId`, not the name, so a reloaded
//!   cluster with the same name is a different registration

pub mod addressing;
pub mod binding;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use uuid::Uuid;

use crate::config::schema::VirtualClusterConfig;
use crate::filter::{Filter, FilterError, FilterFactory, FilterFactoryRegistry};
use crate::filter::factory::FilterConfigError;
use crate::net::endpoint::Endpoint;
use crate::net::tls::load_tls_acceptor;

pub use addressing::{AddressingStrategy, RoutingKey};
pub use binding::VirtualClusterBinding;

/// Error type for virtual cluster addressing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressingError {
    #[error("invalid host:port '{0}'")]
    InvalidHostPort(String),

    #[error("node {node_id} is outside the cluster's addressable node range")]
    NodeOutOfRange { node_id: u32 },

    #[error("node port range starting at {start} with {count} nodes exceeds 65535")]
    PortRangeOverflow { start: u16, count: u32 },

    #[error("node host pattern '{0}' does not contain $(nodeId)")]
    MissingNodeIdPlaceholder(String),

    #[error("SNI routing requires TLS to be configured")]
    TlsRequired,

    #[error("bindings collide on {endpoint} with routing key {routing_key}")]
    Collision { endpoint: Endpoint, routing_key: RoutingKey },
}

/// Error type for building a virtual cluster from configuration.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("virtual cluster '{cluster}': {source}")]
    Addressing {
        cluster: String,
        #[source]
        source: AddressingError,
    },

    #[error("virtual cluster '{cluster}': {source}")]
    Filter {
        cluster: String,
        #[source]
        source: FilterConfigError,
    },

    #[error("virtual cluster '{cluster}': failed to load TLS material: {source}")]
    Tls {
        cluster: String,
        #[source]
        source: std::io::Error,
    },
}

/// A `host:port` pair; IPv6 hosts are written in brackets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for HostPort {
    type Err = AddressingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AddressingError::InvalidHostPort(s.to_string());
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
            (host, port)
        } else {
            s.rsplit_once(':').ok_or_else(invalid)?
        };
        if host.is_empty() || (!s.starts_with('[') && host.contains(':')) {
            return Err(invalid());
        }
        let port = port.parse().map_err(|_| invalid())?;
        Ok(HostPort::new(host, port))
    }
}

impl TryFrom<String> for HostPort {
    type Error = AddressingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HostPort> for String {
    fn from(value: HostPort) -> Self {
        value.to_string()
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Identity of one constructed virtual cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClusterId(Uuid);

impl ClusterId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One binding a cluster needs at registration time.
#[derive(Debug, Clone)]
pub struct RequiredBinding {
    pub endpoint: Endpoint,
    pub routing_key: RoutingKey,
    pub binding: VirtualClusterBinding,
}

/// A logical proxy front-end targeting one upstream cluster.
pub struct VirtualCluster {
    pub id: ClusterId,
    pub name: String,
    pub target_bootstrap: HostPort,
    pub addressing: AddressingStrategy,
    tls: Option<TlsAcceptor>,
    filters: Vec<Arc<dyn FilterFactory>>,
}

impl VirtualCluster {
    pub fn new(
        name: impl Into<String>,
        target_bootstrap: HostPort,
        addressing: AddressingStrategy,
    ) -> Result<Self, AddressingError> {
        addressing.validate()?;
        let cluster = Self {
            id: ClusterId::new(),
            name: name.into(),
            target_bootstrap,
            addressing,
            tls: None,
            filters: Vec::new(),
        };
        cluster.check_collisions()?;
        Ok(cluster)
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn with_filters(mut self, filters: Vec<Arc<dyn FilterFactory>>) -> Self {
        self.filters = filters;
        self
    }

    /// Build a cluster from its configuration, loading TLS material.
    pub async fn from_config(
        config: &VirtualClusterConfig,
        filters: &FilterFactoryRegistry,
    ) -> Result<Self, ClusterError> {
        let addressing_error = |source| ClusterError::Addressing {
            cluster: config.name.clone(),
            source,
        };
        if config.addressing.requires_tls() && config.tls.is_none() {
            return Err(addressing_error(AddressingError::TlsRequired));
        }

        let factories = filters.create_chain(&config.filters).map_err(|source| ClusterError::Filter {
            cluster: config.name.clone(),
            source,
        })?;
        let mut cluster = Self::new(&config.name, config.target_bootstrap.clone(), config.addressing.clone())
            .map_err(addressing_error)?
            .with_filters(factories);

        if let Some(tls) = &config.tls {
            let acceptor = load_tls_acceptor(&tls.cert_path, &tls.key_path)
                .await
                .map_err(|source| ClusterError::Tls {
                    cluster: config.name.clone(),
                    source,
                })?;
            cluster = cluster.with_tls(acceptor);
        }
        Ok(cluster)
    }

    /// Whether the cluster's endpoints are TLS.
    pub fn is_tls(&self) -> bool {
        self.tls.is_some() || self.addressing.requires_tls()
    }

    pub fn tls_acceptor(&self) -> Option<&TlsAcceptor> {
        self.tls.as_ref()
    }

    pub fn bootstrap_endpoint(&self) -> Endpoint {
        self.addressing.bootstrap_endpoint(self.is_tls())
    }

    pub fn node_endpoint(&self, node_id: u32) -> Result<Endpoint, AddressingError> {
        self.addressing.node_endpoint(node_id, self.is_tls())
    }

    /// Instantiate a fresh filter chain for one connection.
    pub fn create_filter_chain(&self) -> Result<Vec<Filter>, FilterError> {
        self.filters.iter().map(|factory| factory.create_filter()).collect()
    }

    pub fn filter_names(&self) -> Vec<&str> {
        self.filters.iter().map(|factory| factory.name()).collect()
    }

    /// Bootstrap binding plus one binding per pre-bound node.
    pub fn required_bindings(self: &Arc<Self>) -> Result<Vec<RequiredBinding>, AddressingError> {
        let mut required = vec![RequiredBinding {
            endpoint: self.bootstrap_endpoint(),
            routing_key: self.addressing.bootstrap_routing_key(),
            binding: VirtualClusterBinding::bootstrap(Arc::clone(self)),
        }];
        for node_id in self.addressing.pre_bound_node_ids() {
            required.push(self.node_binding(node_id)?);
        }
        Ok(required)
    }

    /// Binding for one upstream node.
    pub fn node_binding(self: &Arc<Self>, node_id: u32) -> Result<RequiredBinding, AddressingError> {
        Ok(RequiredBinding {
            endpoint: self.node_endpoint(node_id)?,
            routing_key: self.addressing.node_routing_key(node_id),
            binding: VirtualClusterBinding::node(Arc::clone(self), node_id),
        })
    }

    fn check_collisions(&self) -> Result<(), AddressingError> {
        let mut seen = std::collections::HashSet::new();
        let tls = self.is_tls();
        seen.insert((self.addressing.bootstrap_endpoint(tls), self.addressing.bootstrap_routing_key()));
        for node_id in self.addressing.pre_bound_node_ids() {
            let endpoint = self.addressing.node_endpoint(node_id, tls)?;
            let routing_key = self.addressing.node_routing_key(node_id);
            if !seen.insert((endpoint.clone(), routing_key.clone())) {
                return Err(AddressingError::Collision { endpoint, routing_key });
            }
        }
        Ok(())
    }
}

impl fmt::Debug for VirtualCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualCluster")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("target_bootstrap", &self.target_bootstrap)
            .field("addressing", &self.addressing)
            .field("tls", &self.tls.is_some())
            .field("filters", &self.filter_names())
            .finish()
    }
}
