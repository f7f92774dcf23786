//! Channels, their members, and locally synthesized membership notices.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ChannelId, UserId, UserRef};

/// A channel member as delivered by the backend.
///
/// Depending on whether the backend populated the reference, a member is
/// either a full user reference or a bare id string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Member {
    /// Populated user reference.
    User(UserRef),
    /// Bare user id.
    Id(UserId),
}

impl Member {
    /// The member's user id, regardless of representation.
    pub fn id(&self) -> &UserId {
        match self {
            Member::User(user) => &user.id,
            Member::Id(id) => id,
        }
    }
}

impl From<UserRef> for Member {
    fn from(user: UserRef) -> Self {
        Member::User(user)
    }
}

/// A conversation channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    /// Server-assigned channel id.
    pub id: ChannelId,
    /// Display name.
    pub name: String,
    /// Optional topic line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Archived channels are read-only.
    #[serde(default)]
    pub archived: bool,
    /// Ordered member list, no duplicate ids.
    #[serde(default)]
    pub members: Vec<Member>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Channel {
    /// Whether `user` is a member of this channel.
    pub fn has_member(&self, user: &UserId) -> bool {
        self.members.iter().any(|m| m.id() == user)
    }

    /// Append a member unless one with the same id is already present.
    ///
    /// Returns `true` if the member list changed.
    pub fn add_member(&mut self, member: Member) -> bool {
        if self.has_member(member.id()) {
            return false;
        }
        self.members.push(member);
        true
    }

    /// Remove the member with the given id.
    ///
    /// Returns `true` if the member list changed.
    pub fn remove_member(&mut self, user: &UserId) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m.id() != user);
        self.members.len() != before
    }

    /// Drop duplicate member ids, keeping the first occurrence.
    pub fn dedup_members(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.members.retain(|m| seen.insert(m.id().clone()));
    }
}

/// Kind of membership change a notice records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    /// A user joined the channel.
    Join,
    /// A user left the channel.
    Leave,
}

/// Locally synthesized record of a membership event.
///
/// Never sent to or received from the server. Persisted per channel so the
/// timeline shows the same notices after a reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemNotice {
    /// Locally generated id.
    pub id: String,
    /// Join or leave.
    pub kind: NoticeKind,
    /// Username of the member who joined or left.
    pub username: String,
    /// Channel the event happened in.
    pub channel_id: ChannelId,
    /// When the event was observed.
    pub timestamp: DateTime<Utc>,
}

impl SystemNotice {
    /// Create a notice with a fresh local id.
    pub fn new(
        kind: NoticeKind,
        username: impl Into<String>,
        channel_id: ChannelId,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            username: username.into(),
            channel_id,
            timestamp,
        }
    }
}
