//! # chansync-types
//!
//! Data model and wire types for chansync channel timelines.
//!
//! This crate provides the foundational types used across all chansync crates:
//! - [`ChannelId`], [`MessageId`], [`UserId`], [`CorrelationId`] - Identity types
//! - [`Message`], [`Channel`], [`ReactionMap`], [`SystemNotice`] - Data model
//! - [`ServerEvent`], [`ClientCommand`] - Push-transport frames
//! - [`MessagePage`], [`AttachmentUpload`] - Pull-transport payloads
//! - [`WireError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod channel;
mod error;
mod ids;
mod message;
mod protocol;
mod reactions;

pub use channel::{Channel, Member, NoticeKind, SystemNotice};
pub use error::WireError;
pub use ids::{ChannelId, CorrelationId, MessageId, UserId};
pub use message::{AttachmentDescriptor, Message, ReplyPreview, ReplyRef, UserRef};
pub use protocol::{
    AttachmentUpload, ChannelRef, ClientCommand, DeleteMessage, MembershipEvent, MessageDeleted,
    MessagePage, ReactionCommand, ReactionEvent, SendMessage, ServerEvent,
};
pub use reactions::ReactionMap;
