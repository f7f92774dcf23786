//! Channel subscriptions that must survive reconnects.

use std::collections::BTreeSet;

use chansync_types::ChannelId;

/// Set of channels the client has joined, plus the active channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    joined: BTreeSet<ChannelId>,
    active: Option<ChannelId>,
}

impl SubscriptionSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a join. Returns false if already joined.
    pub fn join(&mut self, channel_id: ChannelId) -> bool {
        self.joined.insert(channel_id)
    }

    /// Record a leave. Returns false if not joined.
    pub fn leave(&mut self, channel_id: &ChannelId) -> bool {
        if self.active.as_ref() == Some(channel_id) {
            self.active = None;
        }
        self.joined.remove(channel_id)
    }

    /// Set the channel currently in view.
    pub fn set_active(&mut self, channel_id: Option<ChannelId>) {
        self.active = channel_id;
    }

    /// The channel currently in view.
    pub fn active(&self) -> Option<&ChannelId> {
        self.active.as_ref()
    }

    /// Check if a channel is joined.
    pub fn is_joined(&self, channel_id: &ChannelId) -> bool {
        self.joined.contains(channel_id)
    }

    /// Joined channels in id order.
    pub fn joined(&self) -> impl Iterator<Item = &ChannelId> {
        self.joined.iter()
    }

    /// Channels to re-join after a reconnect, each exactly once.
    pub fn rejoin_plan(&self) -> Vec<ChannelId> {
        let mut plan = self.joined.clone();
        if let Some(active) = &self.active {
            plan.insert(active.clone());
        }
        plan.into_iter().collect()
    }
}
