//! Protocol-aware proxy for virtual clusters.

pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod filter;
pub mod frame;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod proxy;
pub mod registry;

pub use cluster::{ClusterId, HostPort, VirtualCluster, VirtualClusterBinding};
pub use config::schema::ProxyConfig;
pub use filter::{Filter, FilterContext, FilterFactory, FilterFactoryRegistry};
pub use lifecycle::Shutdown;
pub use proxy::ProxyServer;
pub use registry::EndpointRegistry;
