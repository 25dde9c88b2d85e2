//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Registry Bind op
//!     → listener.rs (TcpSocketBinder: bind, accept loop, connection limit)
//!     → ConnectionAcceptor (proxy session)
//!         → sni.rs (peek ClientHello on TLS endpoints, nothing consumed)
//!         → tls.rs (terminate TLS with the cluster's acceptor)
//!         → connection.rs (identity, live-connection tracking)
//! ```
//!
//! # Design Decisions
//! - Bounded by one proxy-wide semaphore; a full proxy stops accepting
//! - SNI is read before the handshake so the cluster, and with it the
//!   certificate, can be chosen per connection

pub mod connection;
pub mod endpoint;
pub mod listener;
pub mod sni;
pub mod tls;

pub use endpoint::Endpoint;
pub use listener::{ConnectionAcceptor, ConnectionPermit, TcpSocketBinder};
