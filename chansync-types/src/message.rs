//! Messages and the records they reference.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ChannelId, CorrelationId, MessageId, ReactionMap, UserId};

/// Reference to a user as embedded in messages and member lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    /// Server-assigned user id.
    pub id: UserId,
    /// Display name at the time the record was produced.
    pub username: String,
}

impl UserRef {
    /// Create a user reference.
    pub fn new(id: impl Into<UserId>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
        }
    }
}

/// Metadata of a file attached to a message.
///
/// Only metadata is tracked here. The bytes themselves travel through the
/// pull transport's upload call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentDescriptor {
    /// Stored filename assigned by the backend.
    pub filename: String,
    /// Filename as chosen by the uploader.
    pub original_name: String,
    /// MIME type, e.g. `image/png`.
    pub mime_type: String,
    /// Size in bytes.
    pub size: u64,
    /// Storage path or URL of the uploaded file.
    pub path: String,
    /// Known locally but not yet confirmed by upload completion.
    #[serde(default)]
    pub pending: bool,
}

impl AttachmentDescriptor {
    /// Describe a file that is about to be uploaded.
    ///
    /// The stored filename and path are unknown until the upload confirms,
    /// so both start out as the original name.
    pub fn awaiting_upload(
        original_name: impl Into<String>,
        mime_type: impl Into<String>,
        size: u64,
    ) -> Self {
        let original_name = original_name.into();
        Self {
            filename: original_name.clone(),
            original_name,
            mime_type: mime_type.into(),
            size,
            path: String::new(),
            pending: true,
        }
    }

    /// Whether two descriptors refer to the same user-chosen file.
    pub fn same_file(&self, other: &AttachmentDescriptor) -> bool {
        self.original_name == other.original_name
    }
}

/// Cached preview of a replied-to message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyPreview {
    /// Username of the parent message's sender.
    pub username: String,
    /// Excerpt of the parent message's text.
    pub content: String,
}

/// Reply reference from a message to its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyRef {
    /// Server id of the parent message.
    pub message_id: MessageId,
    /// Preview captured when the reply was composed or delivered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<ReplyPreview>,
}

/// A chat message as seen by any of the three write paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Server identifier, absent until confirmed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    /// Client-generated correlation id, stable for the message's lifetime.
    #[serde(
        default,
        rename = "clientCorrelationId",
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<CorrelationId>,
    /// Channel the message belongs to.
    pub channel_id: ChannelId,
    /// Author of the message.
    pub sender: UserRef,
    /// Text content; empty for attachment-only messages.
    #[serde(default)]
    pub content: String,
    /// Attached file, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentDescriptor>,
    /// Reactions keyed by emoji.
    #[serde(default)]
    pub reactions: ReactionMap,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Parent message, for replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyRef>,
    /// Local-only: the caller gave up on delivering this provisional message.
    #[serde(skip)]
    pub failed: bool,
}

impl Message {
    /// Build a provisional message for an optimistic local send.
    pub fn provisional(
        channel_id: ChannelId,
        sender: UserRef,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            correlation_id: Some(CorrelationId::generate()),
            channel_id,
            sender,
            content: content.into(),
            attachment: None,
            reactions: ReactionMap::new(),
            created_at,
            reply_to: None,
            failed: false,
        }
    }

    /// Attach a file descriptor.
    pub fn with_attachment(mut self, attachment: AttachmentDescriptor) -> Self {
        self.attachment = Some(attachment);
        self
    }

    /// Mark this message as a reply.
    pub fn with_reply_to(mut self, reply_to: ReplyRef) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    /// Whether the attachment is still awaiting upload confirmation.
    pub fn has_pending_attachment(&self) -> bool {
        self.attachment.as_ref().is_some_and(|a| a.pending)
    }

    /// A message is provisional until it has a server id and no pending upload.
    pub fn is_provisional(&self) -> bool {
        self.id.is_none() || self.has_pending_attachment()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        Message::provisional(
            ChannelId::from("c1"),
            UserRef::new("u1", "alice"),
            "hello",
            DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        )
    }

    #[test]
    fn provisional_messages_carry_a_correlation_id() {
        let msg = sample();
        assert!(msg.id.is_none());
        assert!(msg.correlation_id.is_some());
        assert!(msg.is_provisional());
    }

    #[test]
    fn pending_attachment_keeps_message_provisional() {
        let mut msg = sample().with_attachment(AttachmentDescriptor::awaiting_upload(
            "cat.png",
            "image/png",
            1024,
        ));
        msg.id = Some(MessageId::from("m1"));
        assert!(msg.is_provisional());

        msg.attachment.as_mut().unwrap().pending = false;
        assert!(!msg.is_provisional());
    }

    #[test]
    fn correlation_id_uses_wire_name() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!(json.get("clientCorrelationId").is_some());
        assert!(json.get("id").is_none());
        assert!(json.get("failed").is_none());
        assert_eq!(json["channelId"], "c1");
    }

    #[test]
    fn server_payload_without_optional_fields_parses() {
        let msg: Message = serde_json::from_str(
            r#"{
                "id": "m1",
                "channelId": "c1",
                "sender": {"id": "u1", "username": "alice"},
                "content": "hello",
                "createdAt": "2024-03-01T12:00:00Z",
                "attachment": null
            }"#,
        )
        .unwrap();
        assert_eq!(msg.id, Some(MessageId::from("m1")));
        assert!(msg.correlation_id.is_none());
        assert!(msg.attachment.is_none());
        assert!(msg.reactions.is_empty());
    }
}
