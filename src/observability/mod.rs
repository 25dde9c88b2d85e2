//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events with structured fields (logging.rs installs the subscriber)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Connection identity (`conn-N[cluster node=.. peer=..]`) is attached to
//!   every per-connection event
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
