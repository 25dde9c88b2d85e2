//! Filter chain dispatch subsystem.
//!
//! # Data Flow
//! ```text
//! Client RequestFrame
//!     → handler.rs: reserve response slot, run filters 0..n (concurrently across frames)
//!     → realized in arrival order (FuturesOrdered):
//!         Forward      → correlation.rs assigns upstream id → upstream
//!         ShortCircuit → response walks filters k-1..0 → sequencer.rs slot
//!         Drop         → slot released
//!
//! Upstream RawResponse
//!     → correlation.rs (upstream id → downstream id, api key, recipient)
//!     → handler.rs: run filters n-1..floor
//!     → client: sequencer.rs flushes contiguous ready slots
//!     → self-sent: completes the issuing filter's promise
//! ```
//!
//! # Design Decisions
//! - Ordering is of realization, not invocation: filter futures for later frames may
//!   run while an earlier one is pending, but writes happen strictly in arrival order
//! - Self-sent requests use their own ordered stream so an issuing filter awaiting its
//!   response never blocks on itself
//! - Any filter failure closes the connection; nothing is retried

mod correlation;
pub mod handler;
mod sequencer;

pub use handler::{CloseReason, DispatchError, DispatchSettings, FilterHandler, FrameChannels};
