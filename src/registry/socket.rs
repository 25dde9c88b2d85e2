//! One physical listening socket and the bindings sharing it.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::cluster::{ClusterId, RoutingKey, VirtualClusterBinding};
use crate::net::endpoint::Endpoint;
use crate::registry::driver::SocketHandle;
use crate::registry::RegistryError;

struct Lifecycle {
    handle: Option<Box<dyn SocketHandle>>,
    closed: bool,
}

/// Why a binding could not be added.
#[derive(Debug)]
pub(crate) enum AddBindingError {
    /// The socket was unbound; bind a fresh one and retry.
    Closed,
    Conflict(RegistryError),
}

pub struct ListeningSocket {
    endpoint: Endpoint,
    local_addr: Option<SocketAddr>,
    bindings: DashMap<RoutingKey, VirtualClusterBinding>,
    /// Serializes binding-map mutations against the unbind decision.
    lifecycle: Mutex<Lifecycle>,
}

impl ListeningSocket {
    pub(crate) fn new(endpoint: Endpoint, handle: Box<dyn SocketHandle>) -> Self {
        Self {
            endpoint,
            local_addr: handle.local_addr(),
            bindings: DashMap::new(),
            lifecycle: Mutex::new(Lifecycle {
                handle: Some(handle),
                closed: false,
            }),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    /// Exact routing key first, then the unkeyed binding.
    pub fn lookup(&self, routing_key: &RoutingKey) -> Option<VirtualClusterBinding> {
        self.bindings
            .get(routing_key)
            .or_else(|| self.bindings.get(&RoutingKey::UNKEYED))
            .map(|entry| entry.value().clone())
    }

    /// Check whether `binding` could be filed under `routing_key`.
    ///
    /// A key held by the same cluster and node may be replaced, which is how
    /// discovered upstream addresses are updated.
    pub(crate) fn check_conflict(
        &self,
        routing_key: &RoutingKey,
        binding: &VirtualClusterBinding,
    ) -> Result<(), RegistryError> {
        if let Some(existing) = self.bindings.get(routing_key) {
            let existing = existing.value();
            if existing.belongs_to(&binding.cluster) && existing.node_id == binding.node_id {
                return Ok(());
            }
            return Err(if routing_key.is_keyed() {
                RegistryError::RoutingKeyCollision {
                    endpoint: self.endpoint.clone(),
                    routing_key: routing_key.clone(),
                    holder: existing.cluster.name.clone(),
                }
            } else {
                RegistryError::NonShareableEndpoint {
                    endpoint: self.endpoint.clone(),
                    holder: existing.cluster.name.clone(),
                }
            });
        }

        let mixed = self
            .bindings
            .iter()
            .find(|entry| entry.key().is_keyed() != routing_key.is_keyed());
        if let Some(other) = mixed {
            return Err(if routing_key.is_keyed() {
                RegistryError::NonShareableEndpoint {
                    endpoint: self.endpoint.clone(),
                    holder: other.value().cluster.name.clone(),
                }
            } else {
                RegistryError::MixedRouting {
                    endpoint: self.endpoint.clone(),
                    holder: other.value().cluster.name.clone(),
                }
            });
        }
        Ok(())
    }

    pub(crate) fn add_binding(
        &self,
        routing_key: RoutingKey,
        binding: VirtualClusterBinding,
    ) -> Result<(), AddBindingError> {
        let lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if lifecycle.closed {
            return Err(AddBindingError::Closed);
        }
        self.check_conflict(&routing_key, &binding)
            .map_err(AddBindingError::Conflict)?;
        tracing::debug!(endpoint = %self.endpoint, routing_key = %routing_key, binding = %binding, "Binding added");
        self.bindings.insert(routing_key, binding);
        Ok(())
    }

    /// Remove the binding under `routing_key` if `cluster` holds it.
    /// Returns whether the socket is left without bindings.
    pub(crate) fn remove_binding(&self, routing_key: &RoutingKey, cluster: ClusterId) -> bool {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        self.bindings
            .remove_if(routing_key, |_, binding| binding.cluster.id == cluster);
        self.bindings.is_empty()
    }

    /// Remove every binding of `cluster`. Returns whether the socket is left
    /// without bindings.
    pub(crate) fn remove_cluster(&self, cluster: ClusterId) -> bool {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        self.bindings.retain(|_, binding| binding.cluster.id != cluster);
        self.bindings.is_empty()
    }

    pub(crate) fn holds_cluster(&self, cluster: ClusterId) -> bool {
        self.bindings.iter().any(|entry| entry.value().cluster.id == cluster)
    }

    /// Mark the socket closed and hand out its handle, if nothing is bound.
    pub(crate) fn close_if_unused(&self) -> Option<Box<dyn SocketHandle>> {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if !self.bindings.is_empty() || lifecycle.closed {
            return None;
        }
        lifecycle.closed = true;
        lifecycle.handle.take()
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.lock().map(|l| l.closed).unwrap_or(true)
    }
}

impl std::fmt::Debug for ListeningSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListeningSocket")
            .field("endpoint", &self.endpoint)
            .field("local_addr", &self.local_addr)
            .field("bindings", &self.bindings.len())
            .finish()
    }
}
