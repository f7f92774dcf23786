//! Reaction aggregation.
//!
//! Reactions reach the client two ways: as per-user deltas (`reactionAdded`,
//! `reactionRemoved`) and as full snapshots inside `messageUpdate` payloads.
//! A snapshot may have been produced before a delta we already applied, so
//! recent deltas are journaled and replayed onto every incoming snapshot.

use std::collections::HashMap;
use std::time::Duration;

use chansync_types::{ChannelId, Message, MessageId, ReactionMap, UserId};
use chrono::{DateTime, Utc};

use crate::store::ChannelMessageStore;

/// Default retention of journaled deltas.
pub const DEFAULT_DELTA_RETENTION: Duration = Duration::from_secs(30);

/// Direction of a reaction delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionOp {
    /// User added the emoji.
    Add,
    /// User removed the emoji.
    Remove,
}

/// One user's reaction change on one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionDelta {
    /// Target message.
    pub message_id: MessageId,
    /// Emoji string.
    pub emoji: String,
    /// Reacting user.
    pub user_id: UserId,
    /// Add or remove.
    pub op: ReactionOp,
}

impl ReactionDelta {
    /// Apply to a reaction map. Returns true if the map changed.
    pub fn apply_to(&self, reactions: &mut ReactionMap) -> bool {
        match self.op {
            ReactionOp::Add => reactions.add(&self.emoji, self.user_id.clone()),
            ReactionOp::Remove => reactions.remove(&self.emoji, &self.user_id),
        }
    }
}

/// Result of applying a delta to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactionOutcome {
    /// The message's reactions changed.
    Applied {
        /// Channel holding the message.
        channel_id: ChannelId,
    },
    /// The message already reflected the delta.
    Unchanged {
        /// Channel holding the message.
        channel_id: ChannelId,
    },
    /// The message is not loaded. The delta is journaled for later snapshots.
    UnknownMessage,
}

/// Applies deltas and rebases snapshots on top of recent deltas.
#[derive(Debug, Clone)]
pub struct ReactionAggregator {
    retention: Duration,
    journal: HashMap<MessageId, Vec<(DateTime<Utc>, ReactionDelta)>>,
}

impl ReactionAggregator {
    /// Create an aggregator keeping deltas for `retention`.
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            journal: HashMap::new(),
        }
    }

    /// Apply a delta to the message it targets.
    pub fn apply_delta(
        &mut self,
        store: &mut ChannelMessageStore,
        delta: ReactionDelta,
        now: DateTime<Utc>,
    ) -> ReactionOutcome {
        self.prune(now);

        let outcome = match store.get_mut(&delta.message_id) {
            Some(message) => {
                let channel_id = message.channel_id.clone();
                if delta.apply_to(&mut message.reactions) {
                    ReactionOutcome::Applied { channel_id }
                } else {
                    ReactionOutcome::Unchanged { channel_id }
                }
            }
            None => ReactionOutcome::UnknownMessage,
        };

        self.journal
            .entry(delta.message_id.clone())
            .or_default()
            .push((now, delta));
        outcome
    }

    /// Replay journaled deltas onto a message carrying a full reaction snapshot.
    pub fn rebase(&mut self, message: &mut Message, now: DateTime<Utc>) {
        self.prune(now);
        let Some(id) = &message.id else {
            return;
        };
        if let Some(deltas) = self.journal.get(id) {
            for (_, delta) in deltas {
                delta.apply_to(&mut message.reactions);
            }
        }
    }

    /// Drop journaled deltas for a deleted message.
    pub fn forget(&mut self, message_id: &MessageId) {
        self.journal.remove(message_id);
    }

    /// Number of messages with journaled deltas.
    pub fn journaled(&self) -> usize {
        self.journal.len()
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            return;
        };
        let cutoff = now - retention;
        self.journal.retain(|_, deltas| {
            deltas.retain(|(at, _)| *at > cutoff);
            !deltas.is_empty()
        });
    }
}

impl Default for ReactionAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_DELTA_RETENTION)
    }
}
