//! Push-transport frames and pull-transport payloads.
//!
//! Push frames are JSON objects of the form `{"event": "<name>", "data": {..}}`,
//! one per transport message. Field names are camelCase on the wire.

use serde::{Deserialize, Serialize};

use crate::{
    AttachmentDescriptor, ChannelId, CorrelationId, Message, MessageId, ReplyRef, UserId, UserRef,
    WireError,
};

/// Events pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// A message was created (including the echo of our own sends).
    NewMessage(Message),
    /// A message changed (edit, upload completion, reaction snapshot).
    MessageUpdate(Message),
    /// A message was deleted.
    MessageDeleted(MessageDeleted),
    /// A user reacted to a message.
    ReactionAdded(ReactionEvent),
    /// A user retracted a reaction.
    ReactionRemoved(ReactionEvent),
    /// A user joined a channel.
    UserJoinedChannel(MembershipEvent),
    /// A user left a channel.
    UserLeftChannel(MembershipEvent),
    /// Acknowledgement of a heartbeat. Informational only.
    HeartbeatAck,
}

impl ServerEvent {
    /// Encode as a JSON frame.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(WireError::Encode)
    }

    /// Decode a JSON frame.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(bytes).map_err(WireError::Decode)
    }
}

/// Payload of [`ServerEvent::MessageDeleted`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeleted {
    /// The deleted message.
    pub message_id: MessageId,
}

/// Payload of reaction add/remove events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionEvent {
    /// Message the reaction targets.
    pub message_id: MessageId,
    /// Emoji string.
    pub emoji: String,
    /// Reacting user.
    pub user_id: UserId,
}

/// Payload of join/leave events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipEvent {
    /// Channel whose membership changed.
    pub channel_id: ChannelId,
    /// The user who joined or left.
    pub user: UserRef,
}

/// Commands sent by the client over the push transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientCommand {
    /// Subscribe to a channel's events.
    JoinChannel(ChannelRef),
    /// Unsubscribe from a channel's events.
    LeaveChannel(ChannelRef),
    /// Submit a new message.
    SendMessage(SendMessage),
    /// React to a message.
    AddReaction(ReactionCommand),
    /// Retract a reaction.
    RemoveReaction(ReactionCommand),
    /// Delete one of our messages.
    DeleteMessage(DeleteMessage),
    /// The local user started typing.
    Typing(ChannelRef),
    /// The local user stopped typing.
    StopTyping(ChannelRef),
    /// Liveness signal.
    Heartbeat,
}

impl ClientCommand {
    /// Encode as a JSON frame.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(WireError::Encode)
    }

    /// Decode a JSON frame.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(bytes).map_err(WireError::Decode)
    }

    /// Wire name of the command, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::JoinChannel(_) => "joinChannel",
            ClientCommand::LeaveChannel(_) => "leaveChannel",
            ClientCommand::SendMessage(_) => "sendMessage",
            ClientCommand::AddReaction(_) => "addReaction",
            ClientCommand::RemoveReaction(_) => "removeReaction",
            ClientCommand::DeleteMessage(_) => "deleteMessage",
            ClientCommand::Typing(_) => "typing",
            ClientCommand::StopTyping(_) => "stopTyping",
            ClientCommand::Heartbeat => "heartbeat",
        }
    }

    /// Shorthand for a `joinChannel` command.
    pub fn join(channel_id: ChannelId) -> Self {
        ClientCommand::JoinChannel(ChannelRef { channel_id })
    }

    /// Shorthand for a `leaveChannel` command.
    pub fn leave(channel_id: ChannelId) -> Self {
        ClientCommand::LeaveChannel(ChannelRef { channel_id })
    }
}

/// Payload naming a single channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRef {
    /// The channel.
    pub channel_id: ChannelId,
}

/// Payload of [`ClientCommand::SendMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    /// Target channel.
    pub channel_id: ChannelId,
    /// Text content.
    pub content: String,
    /// Already-uploaded attachment, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentDescriptor>,
    /// Correlation id the server must echo back.
    pub client_correlation_id: CorrelationId,
    /// Parent message for replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyRef>,
}

impl SendMessage {
    /// Build the send command for a provisional message.
    ///
    /// Returns `None` if the message has no correlation id.
    pub fn from_provisional(message: &Message) -> Option<Self> {
        Some(Self {
            channel_id: message.channel_id.clone(),
            content: message.content.clone(),
            attachment: message.attachment.clone(),
            client_correlation_id: message.correlation_id.clone()?,
            reply_to: message.reply_to.clone(),
        })
    }
}

/// Payload of reaction add/remove commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionCommand {
    /// Message to react to.
    pub message_id: MessageId,
    /// Channel holding the message.
    pub channel_id: ChannelId,
    /// Emoji string.
    pub emoji: String,
}

/// Payload of [`ClientCommand::DeleteMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessage {
    /// Message to delete.
    pub message_id: MessageId,
    /// Channel holding the message.
    pub channel_id: ChannelId,
}

/// One page of channel history from the pull transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePage {
    /// Messages on this page.
    pub messages: Vec<Message>,
    /// Total number of messages in the channel.
    pub total: u64,
}

/// Multipart-style upload request for the pull transport.
#[derive(Clone, PartialEq, Eq)]
pub struct AttachmentUpload {
    /// Channel the message is posted to.
    pub channel_id: ChannelId,
    /// Correlation id of the provisional message; must be round-tripped.
    pub correlation_id: CorrelationId,
    /// Accompanying text, possibly empty.
    pub content: String,
    /// Metadata of the file being uploaded.
    pub attachment: AttachmentDescriptor,
    /// File bytes.
    pub data: Vec<u8>,
    /// Parent message for replies.
    pub reply_to: Option<ReplyRef>,
}

impl std::fmt::Debug for AttachmentUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentUpload")
            .field("channel_id", &self.channel_id)
            .field("correlation_id", &self.correlation_id)
            .field("attachment", &self.attachment)
            .field("data", &format!("[{} bytes]", self.data.len()))
            .finish()
    }
}
