//! Channel directory, member lists and join/leave notices.
//!
//! A membership event may reach the client from more than one path and more
//! than once. Member lists are updated idempotently by user id. Notices are
//! keyed by `(kind, username, channel, coarse time bucket)` so that repeats
//! inside one bucket collapse to a single notice.

use std::collections::HashMap;
use std::time::Duration;

use chansync_types::{Channel, ChannelId, Member, NoticeKind, SystemNotice, UserRef};
use chrono::{DateTime, Utc};

/// Default notice dedup bucket.
pub const DEFAULT_NOTICE_WINDOW: Duration = Duration::from_secs(2);

/// Identity of a notice for dedup purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NoticeKey {
    kind: NoticeKind,
    username: String,
    channel_id: ChannelId,
    bucket: i64,
}

/// Result of applying a join or leave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    /// Whether the channel's member list changed.
    pub members_changed: bool,
    /// Newly recorded notice, or `None` if it duplicated a recent one.
    pub notice: Option<SystemNotice>,
}

/// Tracks channels, their members and the notices derived from membership events.
#[derive(Debug, Clone)]
pub struct MembershipTracker {
    window: Duration,
    channels: HashMap<ChannelId, Channel>,
    notices: HashMap<ChannelId, Vec<SystemNotice>>,
}

impl MembershipTracker {
    /// Create a tracker with the given notice bucket width.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            channels: HashMap::new(),
            notices: HashMap::new(),
        }
    }

    /// Insert or replace a channel record, dropping duplicate member ids.
    pub fn upsert_channel(&mut self, mut channel: Channel) {
        channel.dedup_members();
        self.channels.insert(channel.id.clone(), channel);
    }

    /// Look up a channel.
    pub fn channel(&self, channel_id: &ChannelId) -> Option<&Channel> {
        self.channels.get(channel_id)
    }

    /// All known channels, sorted by name.
    pub fn channels(&self) -> Vec<&Channel> {
        let mut channels: Vec<&Channel> = self.channels.values().collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name));
        channels
    }

    /// Apply a join event.
    pub fn apply_join(
        &mut self,
        channel_id: &ChannelId,
        user: UserRef,
        at: DateTime<Utc>,
    ) -> MembershipChange {
        let username = user.username.clone();
        let members_changed = self
            .channels
            .get_mut(channel_id)
            .is_some_and(|c| c.add_member(Member::from(user)));
        let notice = self.record_notice(NoticeKind::Join, username, channel_id, at);
        MembershipChange {
            members_changed,
            notice,
        }
    }

    /// Apply a leave event.
    pub fn apply_leave(
        &mut self,
        channel_id: &ChannelId,
        user: UserRef,
        at: DateTime<Utc>,
    ) -> MembershipChange {
        let members_changed = self
            .channels
            .get_mut(channel_id)
            .is_some_and(|c| c.remove_member(&user.id));
        let notice = self.record_notice(NoticeKind::Leave, user.username, channel_id, at);
        MembershipChange {
            members_changed,
            notice,
        }
    }

    /// Notices recorded for a channel, oldest first.
    pub fn notices(&self, channel_id: &ChannelId) -> &[SystemNotice] {
        self.notices
            .get(channel_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Merge previously persisted notices, skipping ids already present.
    pub fn load_notices(&mut self, channel_id: &ChannelId, loaded: Vec<SystemNotice>) {
        let notices = self.notices.entry(channel_id.clone()).or_default();
        for notice in loaded {
            if !notices.iter().any(|n| n.id == notice.id) {
                notices.push(notice);
            }
        }
        notices.sort_by_key(|n| n.timestamp);
    }

    /// Remove and return a channel's notices.
    pub fn clear_notices(&mut self, channel_id: &ChannelId) -> Vec<SystemNotice> {
        self.notices.remove(channel_id).unwrap_or_default()
    }

    /// Dedup key for a notice.
    pub fn key_of(&self, notice: &SystemNotice) -> NoticeKey {
        NoticeKey {
            kind: notice.kind,
            username: notice.username.clone(),
            channel_id: notice.channel_id.clone(),
            bucket: self.bucket(notice.timestamp),
        }
    }

    fn bucket(&self, at: DateTime<Utc>) -> i64 {
        let width = (self.window.as_millis() as i64).max(1);
        at.timestamp_millis().div_euclid(width)
    }

    fn record_notice(
        &mut self,
        kind: NoticeKind,
        username: String,
        channel_id: &ChannelId,
        at: DateTime<Utc>,
    ) -> Option<SystemNotice> {
        let notice = SystemNotice::new(kind, username, channel_id.clone(), at);
        let key = self.key_of(&notice);
        let duplicate = self
            .notices(channel_id)
            .iter()
            .any(|existing| self.key_of(existing) == key);
        if duplicate {
            return None;
        }
        self.notices
            .entry(channel_id.clone())
            .or_default()
            .push(notice.clone());
        Some(notice)
    }
}

impl Default for MembershipTracker {
    fn default() -> Self {
        Self::new(DEFAULT_NOTICE_WINDOW)
    }
}
