//! # chansync-client
//!
//! Async chat timeline sync engine.
//!
//! This is the library a chat UI links against. It keeps one consistent view
//! per channel while messages arrive from three unordered write paths.
//!
//! ## Features
//!
//! - **Reconciliation**: correlation ids, server ids, then a time-windowed heuristic
//! - **Resilient Push Transport**: bounded backoff reconnect with channel rejoin
//! - **Paginated History**: stale pages from a previous channel are discarded
//! - **Transport Abstraction**: pluggable push and pull transports (mocks included)
//! - **Pure State Machines**: uses chansync-core for side-effect-free logic
//!
//! ## Example
//!
//! ```ignore
//! use chansync_client::{ChatEngine, Credential, EngineConfig};
//!
//! let config = EngineConfig::from_file("chansync.toml".as_ref())?;
//! let persistence = chansync_client::persistence::adapter_for(&config.persistence);
//! let engine = ChatEngine::new(me, config, transport, history, persistence);
//!
//! engine.connect(Credential::new(token));
//! if let Some(channel) = engine.restore().await? {
//!     engine.activate_channel(&channel).await?;
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod history;
pub mod persistence;
pub mod transport;

pub use config::{ConfigError, EngineConfig};
pub use connection::ConnectionManager;
pub use engine::{ChangeEvent, ChatEngine};
pub use error::ClientError;
pub use history::{HistoryApi, HistoryError, MockHistory};
pub use persistence::{
    FilePersistence, LocalState, MemoryPersistence, PersistenceAdapter, PersistenceError,
};
pub use transport::{Credential, MockTransport, PushTransport, TransportError};
