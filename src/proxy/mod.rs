//! Proxy assembly.
//!
//! # Data Flow
//! ```text
//! ProxyConfig
//!     → VirtualCluster::from_config (per cluster)
//!     → EndpointRegistry::register → TcpSocketBinder (listeners)
//!
//! Accepted connection (session.rs):
//!     peek SNI (TLS endpoints) → registry.resolve → TLS handshake
//!     → connect upstream → codec pumps ⇄ FilterHandler
//!     → metadata responses (discovery.rs) → registry.reconcile
//!
//! Reload (server.rs):
//!     new ProxyConfig → deregister removed/changed → register added/changed
//! ```
//!
//! # Design Decisions
//! - The acceptor holds a weak registry handle; the registry owns the sockets
//!   that call the acceptor
//! - Sessions read the network settings current at accept time

mod discovery;
pub mod server;
pub mod session;

pub use server::{ProxyServer, ServerError};
pub use session::{SessionEnd, SessionError};
