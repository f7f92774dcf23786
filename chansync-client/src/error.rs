//! Client errors.

use chansync_core::PageError;
use chansync_types::{ChannelId, CorrelationId, MessageId, WireError};
use thiserror::Error;

use crate::config::ConfigError;
use crate::history::HistoryError;
use crate::persistence::PersistenceError;
use crate::transport::TransportError;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Frame encoding error.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Local state could not be read or written.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Configuration could not be loaded.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Not connected to the push transport.
    #[error("not connected")]
    NotConnected,

    /// Reconnect attempts are exhausted. Call `connect` to try again.
    #[error("push transport unavailable after {attempts} reconnect attempts")]
    Unavailable {
        /// Reconnect attempts made before giving up.
        attempts: u32,
    },

    /// A history page could not be fetched. The cursor was not advanced.
    #[error("failed to fetch page {page} of {channel}: {source}")]
    PageFetch {
        /// Channel being paged.
        channel: ChannelId,
        /// Page that failed.
        page: u32,
        /// Underlying pull-transport error.
        #[source]
        source: HistoryError,
    },

    /// Page bookkeeping was misused.
    #[error("pagination error: {0}")]
    Page(#[from] PageError),

    /// An attachment upload failed. The provisional message stays pending.
    #[error("upload for {correlation_id} failed: {source}")]
    Upload {
        /// Correlation id of the pending message.
        correlation_id: CorrelationId,
        /// Underlying pull-transport error.
        #[source]
        source: HistoryError,
    },

    /// No pending upload is known for this correlation id.
    #[error("no pending upload for {0}")]
    NoPendingUpload(CorrelationId),

    /// No provisional message is known for this correlation id.
    #[error("no provisional message for {0}")]
    NoProvisionalMessage(CorrelationId),

    /// The message is not loaded in any channel.
    #[error("message {0} is not loaded")]
    UnknownMessage(MessageId),
}
