//! Error types for chansync wire frames.

use thiserror::Error;

/// Errors encoding or decoding push-transport frames.
#[derive(Debug, Error)]
pub enum WireError {
    /// JSON encoding failed.
    #[error("frame encoding failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// JSON decoding failed (malformed frame or unknown event).
    #[error("frame decoding failed: {0}")]
    Decode(#[source] serde_json::Error),
}
