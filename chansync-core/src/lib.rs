//! # chansync-core
//!
//! Pure reconciliation logic for chansync (no I/O, instant tests).
//!
//! This crate decides what a client's view of its channels should be after
//! every local send, push event and history page, without touching a socket,
//! a clock or a disk. Time is passed in by the caller.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O is performed by `chansync-client`, which interprets the
//! actions produced by these state machines.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod membership;
pub mod reactions;
pub mod reconcile;
pub mod store;
pub mod subscriptions;
pub mod typing;

pub use connection::{
    Action, ConnectionEvent, ConnectionState, ConnectionStatus, Event, ReconnectPolicy,
};
pub use membership::{MembershipChange, MembershipTracker, NoticeKey, DEFAULT_NOTICE_WINDOW};
pub use reactions::{
    ReactionAggregator, ReactionDelta, ReactionOp, ReactionOutcome, DEFAULT_DELTA_RETENTION,
};
pub use reconcile::{
    merge_into, MatchKind, MessageReconciler, Placement, Reconciliation, DEFAULT_DEDUP_WINDOW,
};
pub use store::{
    ChannelMessageStore, ChannelTimeline, PageError, PageOutcome, PageRequest, PageSummary,
};
pub use subscriptions::SubscriptionSet;
pub use typing::{TypingAction, TypingIndicator, DEFAULT_TYPING_IDLE};
