//! Host ↔ view message bridge.
//!
//! A bidirectional, single-peer channel carrying the typed messages of
//! [`tether_types::message`]. Messages from one sender are delivered in send
//! order; requests are correlated to responses by a generated id.

pub mod endpoint;

use std::time::Duration;
use thiserror::Error;

pub use endpoint::{pair, BridgeEndpoint, Handler, HandlerResult};

/// Errors raised by bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The peer is not attached (never attached, or torn down).
    #[error("no peer attached")]
    NoPeer,

    /// The peer disconnected before the response arrived.
    #[error("peer disconnected before responding")]
    PeerGone,

    /// The peer did not respond within the request deadline.
    #[error("timed out waiting for peer response")]
    PeerTimeout,

    /// The peer's handler reported an error.
    #[error("handler error: {0}")]
    Handler(String),

    /// Payload (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BridgeError {
    /// Whether the failure is plausibly transient from the caller's side.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BridgeError::PeerTimeout | BridgeError::PeerGone)
    }
}

/// Bridge tuning knobs.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Deadline for `request` round-trips.
    pub request_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
        }
    }
}
