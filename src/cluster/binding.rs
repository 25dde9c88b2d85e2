//! The resolved identity of an inbound connection.

use std::fmt;
use std::sync::Arc;

use crate::cluster::{HostPort, VirtualCluster};

/// A virtual cluster, optionally pinned to one upstream node.
#[derive(Debug, Clone)]
pub struct VirtualClusterBinding {
    pub cluster: Arc<VirtualCluster>,
    /// `None` for bootstrap connections.
    pub node_id: Option<u32>,
    /// Discovered address of the upstream node, when known.
    pub upstream: Option<HostPort>,
}

impl VirtualClusterBinding {
    pub fn bootstrap(cluster: Arc<VirtualCluster>) -> Self {
        Self {
            cluster,
            node_id: None,
            upstream: None,
        }
    }

    pub fn node(cluster: Arc<VirtualCluster>, node_id: u32) -> Self {
        Self {
            cluster,
            node_id: Some(node_id),
            upstream: None,
        }
    }

    pub fn with_upstream(mut self, upstream: HostPort) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn is_bootstrap(&self) -> bool {
        self.node_id.is_none()
    }

    /// Where a connection through this binding is forwarded to.
    ///
    /// Node bindings whose upstream address has not been discovered yet
    /// fall back to the cluster's bootstrap target.
    pub fn upstream_target(&self) -> &HostPort {
        self.upstream.as_ref().unwrap_or(&self.cluster.target_bootstrap)
    }

    pub fn belongs_to(&self, cluster: &VirtualCluster) -> bool {
        self.cluster.id == cluster.id
    }
}

impl fmt::Display for VirtualClusterBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node_id {
            Some(node_id) => write!(f, "{}/node-{}", self.cluster.name, node_id),
            None => write!(f, "{}/bootstrap", self.cluster.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::AddressingStrategy;

    #[test]
    fn node_without_discovered_address_targets_bootstrap() {
        let cluster = Arc::new(
            VirtualCluster::new(
                "demo",
                "upstream:9092".parse().unwrap(),
                AddressingStrategy::PortPerNode {
                    bootstrap: "localhost:9192".parse().unwrap(),
                    bind_address: None,
                    node_start_port: 9193,
                    lowest_node_id: 0,
                    node_count: 1,
                },
            )
            .unwrap(),
        );
        let pending = VirtualClusterBinding::node(Arc::clone(&cluster), 0);
        assert_eq!(pending.upstream_target().to_string(), "upstream:9092");
        assert_eq!(pending.to_string(), "demo/node-0");

        let known = pending.with_upstream("broker-0:9092".parse().unwrap());
        assert_eq!(known.upstream_target().to_string(), "broker-0:9092");
        assert!(known.belongs_to(&cluster));
    }
}
