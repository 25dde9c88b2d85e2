//! Proxy server: owns the registry, the virtual clusters and reloads.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::cluster::{ClusterError, VirtualCluster};
use crate::config::schema::{ProxyConfig, VirtualClusterConfig};
use crate::filter::FilterFactoryRegistry;
use crate::lifecycle::Shutdown;
use crate::net::connection::ConnectionTracker;
use crate::net::endpoint::Endpoint;
use crate::net::listener::TcpSocketBinder;
use crate::proxy::session::SessionAcceptor;
use crate::registry::{EndpointRegistry, RegistryError};

/// Error type for starting or reconfiguring the proxy.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

struct ClusterEntry {
    config: VirtualClusterConfig,
    cluster: Arc<VirtualCluster>,
}

/// A running proxy.
pub struct ProxyServer {
    config: Arc<ArcSwap<ProxyConfig>>,
    filters: Arc<FilterFactoryRegistry>,
    registry: EndpointRegistry,
    clusters: Mutex<HashMap<String, ClusterEntry>>,
    tracker: ConnectionTracker,
    shutdown: Shutdown,
}

impl ProxyServer {
    /// Build every configured virtual cluster and bind its endpoints.
    ///
    /// Nothing stays bound if any cluster fails.
    pub async fn start(config: ProxyConfig, filters: Arc<FilterFactoryRegistry>) -> Result<Self, ServerError> {
        let max_connections = config.network.max_connections;
        let config = Arc::new(ArcSwap::from_pointee(config));
        let tracker = ConnectionTracker::new();
        let shutdown = Shutdown::new();

        let acceptor = Arc::new(SessionAcceptor::new(Arc::clone(&config), tracker.clone(), shutdown.clone()));
        let binder = Arc::new(TcpSocketBinder::new(acceptor.clone(), max_connections));
        let registry = EndpointRegistry::new(binder);
        acceptor.attach(registry.downgrade());

        let server = Self {
            config,
            filters,
            registry,
            clusters: Mutex::new(HashMap::new()),
            tracker,
            shutdown,
        };

        let initial = server.config.load_full();
        for cluster_config in &initial.virtual_clusters {
            if let Err(e) = server.add_cluster(cluster_config).await {
                tracing::error!(virtual_cluster = %cluster_config.name, error = %e, "Failed to start virtual cluster");
                if let Err(e) = server.registry.shutdown().await {
                    tracing::warn!(error = %e, "Failed to release endpoints after startup failure");
                }
                return Err(e);
            }
        }

        tracing::info!(
            virtual_clusters = initial.virtual_clusters.len(),
            endpoints = server.registry.listening_endpoints().len(),
            "Proxy started"
        );
        Ok(server)
    }

    async fn add_cluster(&self, config: &VirtualClusterConfig) -> Result<(), ServerError> {
        let cluster = Arc::new(VirtualCluster::from_config(config, &self.filters).await?);
        let bootstrap = self.registry.register(&cluster).await?;
        tracing::info!(virtual_cluster = %cluster.name, bootstrap = %bootstrap, "Virtual cluster registered");
        self.clusters.lock().await.insert(
            config.name.clone(),
            ClusterEntry {
                config: config.clone(),
                cluster,
            },
        );
        Ok(())
    }

    /// Move the running proxy to `new`.
    ///
    /// Removed or changed clusters are deregistered first so their endpoints
    /// are free for the clusters that replace them. Every cluster is attempted;
    /// the first failure is returned.
    pub async fn apply_config(&self, new: ProxyConfig) -> Result<(), ServerError> {
        let mut first_error = None;

        let stale: Vec<ClusterEntry> = {
            let mut clusters = self.clusters.lock().await;
            let names: Vec<String> = clusters
                .iter()
                .filter(|(name, entry)| {
                    !new.virtual_clusters
                        .iter()
                        .any(|c| &c.name == *name && c == &entry.config)
                })
                .map(|(name, _)| name.clone())
                .collect();
            names.iter().filter_map(|name| clusters.remove(name)).collect()
        };
        for entry in stale {
            match self.registry.deregister(&entry.cluster).await {
                Ok(()) => tracing::info!(virtual_cluster = %entry.cluster.name, "Virtual cluster deregistered"),
                Err(e) => {
                    tracing::error!(virtual_cluster = %entry.cluster.name, error = %e, "Failed to deregister virtual cluster");
                    first_error.get_or_insert(ServerError::from(e));
                }
            }
        }

        for cluster_config in &new.virtual_clusters {
            if self.clusters.lock().await.contains_key(&cluster_config.name) {
                continue;
            }
            if let Err(e) = self.add_cluster(cluster_config).await {
                tracing::error!(virtual_cluster = %cluster_config.name, error = %e, "Failed to register virtual cluster");
                first_error.get_or_insert(e);
            }
        }

        if new.network.max_connections != self.config.load().network.max_connections {
            tracing::warn!("network.max_connections only takes effect on restart");
        }
        self.config.store(Arc::new(new));
        first_error.map_or(Ok(()), Err)
    }

    pub fn config(&self) -> Arc<ProxyConfig> {
        self.config.load_full()
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn listening_endpoints(&self) -> Vec<Endpoint> {
        self.registry.listening_endpoints()
    }

    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Names of the running virtual clusters, sorted.
    pub async fn cluster_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop accepting, signal every session, and wait up to `grace` for them
    /// to finish. Returns false if connections were still open at the deadline.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        tracing::info!(active_connections = self.tracker.active_count(), "Shutting down");
        self.shutdown.trigger();
        if let Err(e) = self.registry.shutdown().await {
            tracing::warn!(error = %e, "Failed to release every endpoint");
        }
        self.clusters.lock().await.clear();

        let drained = self.tracker.wait_idle(grace).await;
        if !drained {
            tracing::warn!(
                remaining = self.tracker.active_count(),
                "Shutdown grace period expired with connections open"
            );
        }
        drained
    }
}
