//! Endpoint registry subsystem.
//!
//! # Data Flow
//! ```text
//! register(cluster)
//!     → required bindings (bootstrap + pre-bound nodes)
//!     → per Endpoint: get-or-create socket future ──► Bind op ──► driver.rs
//!     → socket.rs: file binding under its RoutingKey (conflicts rejected)
//!     → resolves to the bootstrap Endpoint
//!
//! deregister(cluster)
//!     → wait for registration → remove bindings from every held socket
//!     → empty socket ──► Unbind op ──► driver.rs re-checks, closes
//!
//! resolve(endpoint, sni) → socket → exact key, else unkeyed → binding
//! ```
//!
//! # Design Decisions
//! - Registration and deregistration are shared futures, so duplicate calls
//!   collapse onto one execution
//! - Socket lifecycle decisions are single-writer (the driver); binding lookups
//!   read a concurrent map and never block on it
//! - A failed bind is evicted from the socket table so a later attempt rebinds;
//!   successful binds of a partially registered cluster stay until deregistration

mod driver;
mod socket;

pub use driver::{SocketBinder, SocketHandle};
pub use socket::ListeningSocket;

use dashmap::DashMap;
use futures_util::future::{join_all, BoxFuture, Shared};
use futures_util::FutureExt;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tokio::sync::{mpsc, oneshot};

use crate::cluster::{AddressingError, ClusterId, HostPort, RequiredBinding, RoutingKey, VirtualCluster, VirtualClusterBinding};
use crate::net::endpoint::Endpoint;
use crate::observability::metrics;
use driver::{BindingDriver, NetworkBindingOperation};
use socket::AddBindingError;

/// Error type for registry operations. Cloneable because it is observed by
/// every caller sharing a registration.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Addressing(#[from] AddressingError),

    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: Endpoint,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("{endpoint} is already bound by virtual cluster '{holder}' and cannot be shared without SNI")]
    NonShareableEndpoint { endpoint: Endpoint, holder: String },

    #[error("{endpoint} routes by SNI for virtual cluster '{holder}' and cannot take an unkeyed binding")]
    MixedRouting { endpoint: Endpoint, holder: String },

    #[error("routing key {routing_key} on {endpoint} is already held by virtual cluster '{holder}'")]
    RoutingKeyCollision {
        endpoint: Endpoint,
        routing_key: RoutingKey,
        holder: String,
    },

    #[error("virtual cluster '{0}' is not registered")]
    NotRegistered(String),

    #[error("binding driver is not running")]
    DriverStopped,
}

/// Error type for mapping an inbound connection to a binding.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EndpointResolutionError {
    #[error("no listener on {0}")]
    UnknownEndpoint(Endpoint),

    #[error("no virtual cluster on {endpoint} for routing key {routing_key}")]
    UnknownRoutingKey { endpoint: Endpoint, routing_key: RoutingKey },

    #[error("listener on {endpoint} failed: {source}")]
    Socket {
        endpoint: Endpoint,
        #[source]
        source: RegistryError,
    },
}

pub type RegistrationFuture = Shared<BoxFuture<'static, Result<Endpoint, RegistryError>>>;
pub type DeregistrationFuture = Shared<BoxFuture<'static, Result<(), RegistryError>>>;
type SocketFuture = Shared<BoxFuture<'static, Result<Arc<ListeningSocket>, RegistryError>>>;

/// Sockets a cluster holds bindings on.
type HeldSockets = Arc<Mutex<HashMap<Endpoint, Arc<ListeningSocket>>>>;

struct ClusterRegistration {
    serial: u64,
    cluster: Arc<VirtualCluster>,
    registration: RegistrationFuture,
    deregistration: OnceLock<DeregistrationFuture>,
    held: HeldSockets,
    /// Upstream node addresses from the last reconcile.
    discovered: tokio::sync::Mutex<HashMap<u32, HostPort>>,
}

struct Inner {
    listening: DashMap<Endpoint, SocketFuture>,
    registered: DashMap<ClusterId, Arc<ClusterRegistration>>,
    operations: mpsc::UnboundedSender<NetworkBindingOperation>,
    next_serial: AtomicU64,
}

/// Maps virtual clusters onto shared listening sockets.
///
/// Cheap to clone; all clones share one socket table and one binding driver.
#[derive(Clone)]
pub struct EndpointRegistry {
    inner: Arc<Inner>,
}

impl EndpointRegistry {
    /// Create a registry and spawn its binding driver on the current runtime.
    pub fn new(binder: Arc<dyn SocketBinder>) -> Self {
        let (operations, queue) = mpsc::unbounded_channel();
        tokio::spawn(BindingDriver::new(binder, queue).run());
        Self {
            inner: Arc::new(Inner {
                listening: DashMap::new(),
                registered: DashMap::new(),
                operations,
                next_serial: AtomicU64::new(0),
            }),
        }
    }

    /// Bind everything `cluster` needs; resolves to its bootstrap endpoint.
    ///
    /// Repeated calls for the same cluster return the same future.
    pub fn register(&self, cluster: &Arc<VirtualCluster>) -> BoxFuture<'static, Result<Endpoint, RegistryError>> {
        let entry = self
            .inner
            .registered
            .entry(cluster.id)
            .or_insert_with(|| self.start_registration(cluster))
            .clone();

        match entry.deregistration.get() {
            None => entry.registration.clone().boxed(),
            Some(deregistration) => {
                // re-registering while a deregistration is in flight waits it out
                let deregistration = deregistration.clone();
                let registry = self.clone();
                let cluster = Arc::clone(cluster);
                async move {
                    let _ = deregistration.await;
                    registry.register(&cluster).await
                }
                .boxed()
            }
        }
    }

    fn start_registration(&self, cluster: &Arc<VirtualCluster>) -> Arc<ClusterRegistration> {
        let held: HeldSockets = Arc::default();
        let inner = Arc::clone(&self.inner);
        let registration = register_cluster(inner, Arc::clone(cluster), Arc::clone(&held))
            .boxed()
            .shared();
        tokio::spawn(registration.clone());

        tracing::info!(virtual_cluster = %cluster.name, cluster_id = %cluster.id, "Registering virtual cluster");
        Arc::new(ClusterRegistration {
            serial: self.inner.next_serial.fetch_add(1, Ordering::Relaxed),
            cluster: Arc::clone(cluster),
            registration,
            deregistration: OnceLock::new(),
            held,
            discovered: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Remove `cluster`'s bindings and unbind the sockets nobody uses any more.
    ///
    /// Repeated calls return the same future; unknown clusters complete at once.
    pub fn deregister(&self, cluster: &VirtualCluster) -> BoxFuture<'static, Result<(), RegistryError>> {
        let Some(registration) = self.inner.registered.get(&cluster.id).map(|r| Arc::clone(r.value())) else {
            return futures_util::future::ready(Ok(())).boxed();
        };
        let deregistration = registration
            .deregistration
            .get_or_init(|| {
                tracing::info!(virtual_cluster = %cluster.name, cluster_id = %cluster.id, "Deregistering virtual cluster");
                let future = deregister_cluster(Arc::clone(&self.inner), Arc::clone(&registration))
                    .boxed()
                    .shared();
                tokio::spawn(future.clone());
                future
            })
            .clone();
        deregistration.boxed()
    }

    /// Map an inbound connection to the binding it addresses.
    pub async fn resolve(
        &self,
        bind_address: Option<&str>,
        port: u16,
        tls: bool,
        sni_hostname: Option<&str>,
    ) -> Result<VirtualClusterBinding, EndpointResolutionError> {
        let endpoint = Endpoint::new(bind_address.map(str::to_string), port, tls);
        let result = self.resolve_endpoint(endpoint, RoutingKey::from_sni(sni_hostname)).await;
        if let Err(e) = &result {
            metrics::record_resolution_failure();
            tracing::debug!(error = %e, "Endpoint resolution failed");
        }
        result
    }

    async fn resolve_endpoint(
        &self,
        endpoint: Endpoint,
        routing_key: RoutingKey,
    ) -> Result<VirtualClusterBinding, EndpointResolutionError> {
        let Some(socket) = self.inner.listening.get(&endpoint).map(|f| f.value().clone()) else {
            return Err(EndpointResolutionError::UnknownEndpoint(endpoint));
        };
        let socket = match socket.await {
            Ok(socket) => socket,
            Err(source) => return Err(EndpointResolutionError::Socket { endpoint, source }),
        };
        socket
            .lookup(&routing_key)
            .ok_or(EndpointResolutionError::UnknownRoutingKey { endpoint, routing_key })
    }

    /// Apply discovered upstream node addresses to a registered cluster.
    ///
    /// New nodes get bindings (and listeners where needed); nodes that
    /// vanished lose theirs unless they are pre-bound, in which case they fall
    /// back to the bootstrap target.
    pub async fn reconcile(
        &self,
        cluster: &Arc<VirtualCluster>,
        upstream_nodes: HashMap<u32, HostPort>,
    ) -> Result<(), RegistryError> {
        let registration = self
            .inner
            .registered
            .get(&cluster.id)
            .map(|r| Arc::clone(r.value()))
            .filter(|r| r.deregistration.get().is_none())
            .ok_or_else(|| RegistryError::NotRegistered(cluster.name.clone()))?;
        registration.registration.clone().await?;

        let mut discovered = registration.discovered.lock().await;
        let pre_bound: HashSet<u32> = cluster.addressing.pre_bound_node_ids().into_iter().collect();

        for (&node_id, address) in &upstream_nodes {
            if discovered.get(&node_id) == Some(address) {
                continue;
            }
            let mut required = match cluster.node_binding(node_id) {
                Ok(required) => required,
                Err(e) => {
                    tracing::warn!(virtual_cluster = %cluster.name, node_id, error = %e, "Upstream node is not addressable");
                    continue;
                }
            };
            required.binding = required.binding.with_upstream(address.clone());
            bind_required(&self.inner, required, &registration.held).await?;
            tracing::debug!(virtual_cluster = %cluster.name, node_id, upstream = %address, "Upstream node bound");
        }

        let vanished: Vec<u32> = discovered
            .keys()
            .filter(|node_id| !upstream_nodes.contains_key(node_id))
            .copied()
            .collect();
        for node_id in vanished {
            let required = cluster.node_binding(node_id)?;
            if pre_bound.contains(&node_id) {
                bind_required(&self.inner, required, &registration.held).await?;
            } else {
                release_binding(&self.inner, cluster.id, &required, &registration.held).await?;
            }
            tracing::debug!(virtual_cluster = %cluster.name, node_id, "Upstream node gone");
        }

        *discovered = upstream_nodes;
        Ok(())
    }

    /// Deregister every registered cluster and wait for all of them.
    pub async fn shutdown(&self) -> Result<(), RegistryError> {
        let clusters: Vec<Arc<VirtualCluster>> = self
            .inner
            .registered
            .iter()
            .map(|entry| Arc::clone(&entry.value().cluster))
            .collect();
        tracing::info!(clusters = clusters.len(), "Deregistering all virtual clusters");
        let results = join_all(clusters.iter().map(|cluster| self.deregister(cluster))).await;
        results.into_iter().collect()
    }

    pub fn is_registered(&self, cluster: &VirtualCluster) -> bool {
        self.inner
            .registered
            .get(&cluster.id)
            .map_or(false, |r| r.deregistration.get().is_none())
    }

    /// Endpoints with a live listening socket, sorted.
    pub fn listening_endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = self
            .inner
            .listening
            .iter()
            .filter(|entry| matches!(entry.value().peek(), Some(Ok(socket)) if !socket.is_closed()))
            .map(|entry| entry.key().clone())
            .collect();
        endpoints.sort();
        endpoints
    }

    /// The live socket for `endpoint`, if bound.
    pub fn listening_socket(&self, endpoint: &Endpoint) -> Option<Arc<ListeningSocket>> {
        ready_socket(&self.inner, endpoint)
    }

    /// A handle that does not keep the registry, or its driver, alive.
    pub fn downgrade(&self) -> WeakEndpointRegistry {
        WeakEndpointRegistry {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Non-owning registry handle, for holders the registry itself reaches
/// (such as the connection acceptor behind its sockets).
#[derive(Clone)]
pub struct WeakEndpointRegistry {
    inner: Weak<Inner>,
}

impl WeakEndpointRegistry {
    pub fn upgrade(&self) -> Option<EndpointRegistry> {
        self.inner.upgrade().map(|inner| EndpointRegistry { inner })
    }
}

fn ready_socket(inner: &Inner, endpoint: &Endpoint) -> Option<Arc<ListeningSocket>> {
    inner
        .listening
        .get(endpoint)
        .and_then(|f| match f.value().peek() {
            Some(Ok(socket)) => Some(Arc::clone(socket)),
            _ => None,
        })
}

/// Get or create the socket for `endpoint`; only the first caller queues a bind.
async fn socket_for(inner: &Inner, endpoint: &Endpoint) -> Result<Arc<ListeningSocket>, RegistryError> {
    let future = inner
        .listening
        .entry(endpoint.clone())
        .or_insert_with(|| {
            let (reply, response) = oneshot::channel();
            let queued = inner
                .operations
                .send(NetworkBindingOperation::Bind {
                    endpoint: endpoint.clone(),
                    reply,
                })
                .is_ok();
            async move {
                if !queued {
                    return Err(RegistryError::DriverStopped);
                }
                response.await.map_err(|_| RegistryError::DriverStopped)?
            }
            .boxed()
            .shared()
        })
        .clone();

    let result = future.clone().await;
    if result.is_err() {
        inner.listening.remove_if(endpoint, |_, current| current.ptr_eq(&future));
    }
    result
}

fn forget_socket(inner: &Inner, socket: &Arc<ListeningSocket>) {
    inner.listening.remove_if(socket.endpoint(), |_, current| {
        matches!(current.peek(), Some(Ok(existing)) if Arc::ptr_eq(existing, socket))
    });
}

/// Bind one required binding, re-binding if the socket closed underneath us.
async fn bind_required(inner: &Inner, required: RequiredBinding, held: &HeldSockets) -> Result<(), RegistryError> {
    let RequiredBinding {
        endpoint,
        routing_key,
        binding,
    } = required;
    loop {
        let socket = socket_for(inner, &endpoint).await?;
        match socket.add_binding(routing_key.clone(), binding.clone()) {
            Ok(()) => {
                held.lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(endpoint.clone(), socket);
                return Ok(());
            }
            Err(AddBindingError::Closed) => forget_socket(inner, &socket),
            Err(AddBindingError::Conflict(e)) => return Err(e),
        }
    }
}

/// Queue an unbind for a socket that lost its last binding.
async fn unbind_socket(inner: &Inner, socket: Arc<ListeningSocket>) -> Result<(), RegistryError> {
    let (reply, response) = oneshot::channel();
    inner
        .operations
        .send(NetworkBindingOperation::Unbind {
            socket: Arc::clone(&socket),
            reply,
        })
        .map_err(|_| RegistryError::DriverStopped)?;
    if response.await.map_err(|_| RegistryError::DriverStopped)? {
        forget_socket(inner, &socket);
    }
    Ok(())
}

async fn release_binding(
    inner: &Inner,
    cluster: ClusterId,
    required: &RequiredBinding,
    held: &HeldSockets,
) -> Result<(), RegistryError> {
    let socket = held
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(&required.endpoint)
        .cloned();
    let Some(socket) = socket else {
        return Ok(());
    };
    let now_empty = socket.remove_binding(&required.routing_key, cluster);
    if !socket.holds_cluster(cluster) {
        held.lock().unwrap_or_else(|e| e.into_inner()).remove(&required.endpoint);
    }
    if now_empty {
        unbind_socket(inner, socket).await?;
    }
    Ok(())
}

async fn register_cluster(
    inner: Arc<Inner>,
    cluster: Arc<VirtualCluster>,
    held: HeldSockets,
) -> Result<Endpoint, RegistryError> {
    let required = cluster.required_bindings()?;

    // conflicts with sockets that already exist surface before any bind
    for r in &required {
        if let Some(socket) = ready_socket(&inner, &r.endpoint) {
            socket.check_conflict(&r.routing_key, &r.binding)?;
        }
    }

    let results = join_all(required.into_iter().map(|r| bind_required(&inner, r, &held))).await;
    if let Some(Err(e)) = results.into_iter().find(Result::is_err) {
        tracing::error!(virtual_cluster = %cluster.name, error = %e, "Virtual cluster registration failed");
        return Err(e);
    }

    let bootstrap = cluster.bootstrap_endpoint();
    tracing::info!(virtual_cluster = %cluster.name, bootstrap = %bootstrap, "Virtual cluster registered");
    Ok(bootstrap)
}

async fn deregister_cluster(inner: Arc<Inner>, registration: Arc<ClusterRegistration>) -> Result<(), RegistryError> {
    let cluster = &registration.cluster;
    // a failed registration still leaves bindings to clean up
    let _ = registration.registration.clone().await;

    let held: Vec<Arc<ListeningSocket>> = registration
        .held
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .drain()
        .map(|(_, socket)| socket)
        .collect();

    let mut outcome = Ok(());
    for socket in held {
        if socket.remove_cluster(cluster.id) {
            if let Err(e) = unbind_socket(&inner, socket).await {
                outcome = Err(e);
            }
        }
    }

    inner
        .registered
        .remove_if(&cluster.id, |_, current| current.serial == registration.serial);
    tracing::info!(virtual_cluster = %cluster.name, "Virtual cluster deregistered");
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::AddressingStrategy;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingBinder {
        binds: AtomicUsize,
    }

    struct NoopHandle;

    impl SocketHandle for NoopHandle {
        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }

        fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
            futures_util::future::ready(()).boxed()
        }
    }

    impl SocketBinder for CountingBinder {
        fn bind(&self, endpoint: &Endpoint) -> BoxFuture<'static, io::Result<Box<dyn SocketHandle>>> {
            self.binds.fetch_add(1, Ordering::SeqCst);
            let refuse = endpoint.port == 1;
            async move {
                if refuse {
                    return Err(io::Error::new(io::ErrorKind::PermissionDenied, "refused"));
                }
                Ok(Box::new(NoopHandle) as Box<dyn SocketHandle>)
            }
            .boxed()
        }
    }

    fn plain(name: &str, port: u16) -> Arc<VirtualCluster> {
        Arc::new(
            VirtualCluster::new(
                name,
                HostPort::new("upstream", 9092),
                AddressingStrategy::PortPerNode {
                    bootstrap: HostPort::new("localhost", port),
                    bind_address: None,
                    node_start_port: port + 1,
                    lowest_node_id: 0,
                    node_count: 2,
                },
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn port_per_node_binds_bootstrap_and_nodes() {
        let binder = Arc::new(CountingBinder::default());
        let registry = EndpointRegistry::new(binder.clone());
        let cluster = plain("demo", 19092);

        let bootstrap = registry.register(&cluster).await.unwrap();
        assert_eq!(bootstrap, Endpoint::any(19092, false));
        assert_eq!(binder.binds.load(Ordering::SeqCst), 3);

        let node = registry.resolve(None, 19094, false, None).await.unwrap();
        assert_eq!(node.node_id, Some(1));
        // plain endpoints ignore whatever SNI is presented
        let bootstrap = registry.resolve(None, 19092, false, Some("whatever")).await.unwrap();
        assert!(bootstrap.is_bootstrap());
    }

    #[tokio::test]
    async fn failed_bind_is_evicted_and_retried() {
        let binder = Arc::new(CountingBinder::default());
        let registry = EndpointRegistry::new(binder.clone());
        let cluster = Arc::new(
            VirtualCluster::new(
                "refused",
                HostPort::new("upstream", 9092),
                AddressingStrategy::PortPerNode {
                    bootstrap: HostPort::new("localhost", 1),
                    bind_address: None,
                    node_start_port: 2,
                    lowest_node_id: 0,
                    node_count: 0,
                },
            )
            .unwrap(),
        );

        assert!(matches!(registry.register(&cluster).await, Err(RegistryError::Bind { .. })));
        assert!(registry.listening_endpoints().is_empty());

        registry.deregister(&cluster).await.unwrap();
        assert!(registry.register(&cluster).await.is_err());
        assert_eq!(binder.binds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reconcile_tracks_discovered_nodes() {
        let registry = EndpointRegistry::new(Arc::new(CountingBinder::default()));
        let cluster = Arc::new(
            VirtualCluster::new(
                "sni",
                HostPort::new("upstream", 9092),
                AddressingStrategy::SniRouting {
                    bootstrap: HostPort::new("bootstrap.example.com", 29092),
                    bind_address: None,
                    node_host_pattern: "broker-$(nodeId).example.com".to_string(),
                    pre_bound_node_ids: vec![0],
                },
            )
            .unwrap(),
        );
        registry.register(&cluster).await.unwrap();
        assert!(registry
            .resolve(None, 29092, true, Some("broker-5.example.com"))
            .await
            .is_err());

        let nodes = HashMap::from([
            (0, HostPort::new("kafka-0", 9092)),
            (5, HostPort::new("kafka-5", 9092)),
        ]);
        registry.reconcile(&cluster, nodes).await.unwrap();
        let node5 = registry.resolve(None, 29092, true, Some("BROKER-5.example.com")).await.unwrap();
        assert_eq!(node5.upstream_target(), &HostPort::new("kafka-5", 9092));
        let node0 = registry.resolve(None, 29092, true, Some("broker-0.example.com")).await.unwrap();
        assert_eq!(node0.upstream_target(), &HostPort::new("kafka-0", 9092));

        registry.reconcile(&cluster, HashMap::new()).await.unwrap();
        assert!(registry
            .resolve(None, 29092, true, Some("broker-5.example.com"))
            .await
            .is_err());
        let node0 = registry.resolve(None, 29092, true, Some("broker-0.example.com")).await.unwrap();
        assert_eq!(node0.upstream_target(), &HostPort::new("upstream", 9092));
    }

    #[tokio::test]
    async fn reconcile_requires_registration() {
        let registry = EndpointRegistry::new(Arc::new(CountingBinder::default()));
        let cluster = plain("unregistered", 39092);
        assert!(matches!(
            registry.reconcile(&cluster, HashMap::new()).await,
            Err(RegistryError::NotRegistered(_))
        ));
    }
}
