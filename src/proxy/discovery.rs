//! Upstream node discovery.
//!
//! Every session's chain ends with a filter that reads the broker list out of
//! metadata responses and reconciles the cluster's node bindings with it, so
//! node endpoints forward to the node they name rather than the bootstrap
//! target. The response is held until the bindings are in place; a client
//! that connects to a node straight after reading metadata finds it bound.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::cluster::{HostPort, VirtualCluster};
use crate::filter::{Filter, FilterContext};
use crate::frame::metadata::{metadata_brokers, BrokerAddress};
use crate::frame::ApiKey;
use crate::registry::{RegistryError, WeakEndpointRegistry};

pub(crate) const BROKER_DISCOVERY: &str = "broker-discovery";

/// Build the discovery filter for one connection to `cluster`.
pub(crate) fn discovery_filter(registry: WeakEndpointRegistry, cluster: Arc<VirtualCluster>) -> Filter {
    // response bodies are versioned by the request that asked for them
    let versions: Arc<Mutex<HashMap<u32, i16>>> = Arc::default();
    let requested = Arc::clone(&versions);

    Filter::builder(BROKER_DISCOVERY)
        .on_request(ApiKey::Metadata, move |header, body, ctx: FilterContext| {
            requested
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(header.correlation_id, header.api_version);
            async move { ctx.forward_request(header, body) }
        })
        .on_response(ApiKey::Metadata, move |header, body, ctx: FilterContext| {
            let version = versions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&header.correlation_id);
            let registry = registry.clone();
            let cluster = Arc::clone(&cluster);
            async move {
                if let Some(version) = version {
                    match metadata_brokers(version, &body) {
                        Some(brokers) => reconcile(&registry, &cluster, brokers, &ctx).await,
                        None => tracing::debug!(
                            channel = %ctx.channel_descriptor(),
                            api_version = version,
                            "Metadata response without a readable broker list"
                        ),
                    }
                }
                ctx.forward_response(header, body)
            }
        })
        .build()
}

/// Node id to upstream address, skipping brokers no endpoint can represent.
fn upstream_nodes(brokers: Vec<BrokerAddress>) -> HashMap<u32, HostPort> {
    brokers
        .into_iter()
        .filter_map(|broker| {
            let node_id = u32::try_from(broker.node_id).ok()?;
            let port = u16::try_from(broker.port).ok()?;
            Some((node_id, HostPort::new(broker.host, port)))
        })
        .collect()
}

async fn reconcile(
    registry: &WeakEndpointRegistry,
    cluster: &Arc<VirtualCluster>,
    brokers: Vec<BrokerAddress>,
    ctx: &FilterContext,
) {
    let nodes = upstream_nodes(brokers);
    if nodes.is_empty() {
        return;
    }
    let Some(registry) = registry.upgrade() else {
        return;
    };
    match registry.reconcile(cluster, nodes).await {
        Ok(()) => {}
        // the cluster was reloaded or removed since this connection resolved
        Err(RegistryError::NotRegistered(_)) => {}
        Err(e) => tracing::warn!(
            channel = %ctx.channel_descriptor(),
            virtual_cluster = %cluster.name,
            error = %e,
            "Upstream node discovery failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brokers_outside_the_addressable_range_are_skipped() {
        let nodes = upstream_nodes(vec![
            BrokerAddress {
                node_id: 1,
                host: "kafka-1".to_string(),
                port: 9092,
            },
            BrokerAddress {
                node_id: -1,
                host: "controller".to_string(),
                port: 9092,
            },
            BrokerAddress {
                node_id: 2,
                host: "kafka-2".to_string(),
                port: 70000,
            },
        ]);
        assert_eq!(nodes, HashMap::from([(1, HostPort::new("kafka-1", 9092))]));
    }
}
