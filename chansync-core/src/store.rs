//! Per-channel message collections with paginated history.
//!
//! Every channel owns an independent timeline. Exactly one channel is active
//! at a time, and pages that arrive for a channel that is no longer active, or
//! for a superseded load of the same channel, are discarded.

use std::collections::{HashMap, VecDeque};

use chansync_types::{ChannelId, CorrelationId, Message, MessageId};
use thiserror::Error;

use crate::reconcile::{MessageReconciler, Placement, Reconciliation};

/// Errors from page bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PageError {
    /// Page numbers start at 1.
    #[error("page numbers start at 1")]
    InvalidPage,

    /// The requested page skips ahead of the loaded cursor.
    #[error("page {requested} requested for {channel} but next page is {expected}")]
    OutOfOrder {
        /// Channel being paged.
        channel: ChannelId,
        /// The page that would continue the timeline.
        expected: u32,
        /// The page that was asked for.
        requested: u32,
    },
}

/// A ticket for one page fetch. Hand it back to [`ChannelMessageStore::append_page`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Channel being fetched.
    pub channel_id: ChannelId,
    /// 1-based page number.
    pub page: u32,
    /// Page size.
    pub limit: u32,
    generation: u64,
}

/// Counts of what a page did to the timeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageSummary {
    /// New messages.
    pub inserted: usize,
    /// Messages merged into existing entries.
    pub updated: usize,
    /// Duplicates dropped.
    pub discarded: usize,
}

impl PageSummary {
    fn record(&mut self, outcome: Reconciliation) {
        match outcome {
            Reconciliation::Inserted => self.inserted += 1,
            Reconciliation::Updated => self.updated += 1,
            Reconciliation::Discarded => self.discarded += 1,
        }
    }
}

/// Result of handing a fetched page back to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    /// The page was merged and the cursor advanced.
    Applied(PageSummary),
    /// The page belonged to an inactive channel, a superseded load, or was
    /// already applied. Nothing changed.
    Stale,
}

/// One channel's messages and pagination cursor.
#[derive(Debug, Clone, Default)]
pub struct ChannelTimeline {
    messages: VecDeque<Message>,
    page: u32,
    total: u64,
    generation: u64,
}

impl ChannelTimeline {
    /// Messages with the most recently inserted first.
    pub fn messages(&self) -> &VecDeque<Message> {
        &self.messages
    }

    /// Messages sorted oldest first by timestamp.
    pub fn chronological(&self) -> Vec<&Message> {
        let mut sorted: Vec<&Message> = self.messages.iter().collect();
        sorted.sort_by_key(|m| m.created_at);
        sorted
    }

    /// Last page successfully applied; 0 if none.
    pub fn page(&self) -> u32 {
        self.page
    }

    /// Server-reported total from the last page.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Whether older history may still be fetched.
    pub fn has_more(&self) -> bool {
        self.page == 0 || (self.confirmed_count() as u64) < self.total
    }

    /// Number of messages held.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Check if no messages are held.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Find a message by server id.
    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id.as_ref() == Some(id))
    }

    fn confirmed_count(&self) -> usize {
        self.messages.iter().filter(|m| m.id.is_some()).count()
    }

    fn reset(&mut self) {
        self.messages.retain(|m| m.id.is_none());
        self.page = 0;
        self.total = 0;
        self.generation += 1;
    }
}

/// All channel timelines plus the active-channel pointer.
#[derive(Debug, Default)]
pub struct ChannelMessageStore {
    reconciler: MessageReconciler,
    timelines: HashMap<ChannelId, ChannelTimeline>,
    active: Option<ChannelId>,
}

impl ChannelMessageStore {
    /// Create an empty store.
    pub fn new(reconciler: MessageReconciler) -> Self {
        Self {
            reconciler,
            timelines: HashMap::new(),
            active: None,
        }
    }

    /// The channel currently in view.
    pub fn active_channel(&self) -> Option<&ChannelId> {
        self.active.as_ref()
    }

    /// Make `channel_id` the active channel and return the previous one.
    ///
    /// The new channel's pagination is reset so its first page starts fresh.
    /// Other channels' timelines are untouched.
    pub fn switch_channel(&mut self, channel_id: ChannelId) -> Option<ChannelId> {
        self.timelines.entry(channel_id.clone()).or_default().reset();
        self.active.replace(channel_id)
    }

    /// Timeline of a channel, if any message or page was ever seen for it.
    pub fn timeline(&self, channel_id: &ChannelId) -> Option<&ChannelTimeline> {
        self.timelines.get(channel_id)
    }

    /// Messages of a channel, most recent first.
    pub fn get_messages(&self, channel_id: &ChannelId) -> Vec<&Message> {
        self.timelines
            .get(channel_id)
            .map(|t| t.messages.iter().collect())
            .unwrap_or_default()
    }

    /// Messages of a channel, oldest first.
    pub fn chronological(&self, channel_id: &ChannelId) -> Vec<&Message> {
        self.timelines
            .get(channel_id)
            .map(ChannelTimeline::chronological)
            .unwrap_or_default()
    }

    /// Whether older history may still be fetched for a channel.
    pub fn has_more(&self, channel_id: &ChannelId) -> bool {
        self.timelines
            .get(channel_id)
            .map_or(true, ChannelTimeline::has_more)
    }

    /// Start fetching `page` of a channel.
    ///
    /// Page 1 resets the channel's accumulated history (provisional messages
    /// are kept) and supersedes any in-flight fetch for it. Later pages must
    /// continue the loaded cursor.
    pub fn begin_page(
        &mut self,
        channel_id: &ChannelId,
        page: u32,
        limit: u32,
    ) -> Result<PageRequest, PageError> {
        if page == 0 {
            return Err(PageError::InvalidPage);
        }
        let timeline = self.timelines.entry(channel_id.clone()).or_default();
        if page == 1 {
            timeline.reset();
        } else if page != timeline.page + 1 {
            return Err(PageError::OutOfOrder {
                channel: channel_id.clone(),
                expected: timeline.page + 1,
                requested: page,
            });
        }
        Ok(PageRequest {
            channel_id: channel_id.clone(),
            page,
            limit,
            generation: timeline.generation,
        })
    }

    /// Start fetching the page after the loaded cursor.
    pub fn next_page(&mut self, channel_id: &ChannelId, limit: u32) -> PageRequest {
        let timeline = self.timelines.entry(channel_id.clone()).or_default();
        PageRequest {
            channel_id: channel_id.clone(),
            page: timeline.page + 1,
            limit,
            generation: timeline.generation,
        }
    }

    /// Merge a fetched page.
    ///
    /// Stale pages change nothing. Applying the same page twice is a no-op.
    /// The cursor only advances when the page is applied.
    pub fn append_page(
        &mut self,
        request: &PageRequest,
        messages: Vec<Message>,
        total: u64,
    ) -> PageOutcome {
        if self.active.as_ref() != Some(&request.channel_id) {
            return PageOutcome::Stale;
        }
        let Some(timeline) = self.timelines.get_mut(&request.channel_id) else {
            return PageOutcome::Stale;
        };
        if timeline.generation != request.generation || request.page != timeline.page + 1 {
            return PageOutcome::Stale;
        }

        let mut summary = PageSummary::default();
        for message in messages {
            let outcome = self
                .reconciler
                .reconcile(&mut timeline.messages, message, Placement::Back);
            summary.record(outcome);
        }
        timeline.page = request.page;
        timeline.total = total;
        PageOutcome::Applied(summary)
    }

    /// Reconcile a message from a local send or the push transport.
    pub fn upsert(&mut self, message: Message) -> Reconciliation {
        let timeline = self.timelines.entry(message.channel_id.clone()).or_default();
        self.reconciler
            .reconcile(&mut timeline.messages, message, Placement::Front)
    }

    /// Apply a full-message update.
    ///
    /// Unlike [`upsert`](Self::upsert), an update carrying an already-known
    /// server id is merged instead of discarded. Its reaction map replaces
    /// the stored one even when empty; callers rebase pending deltas first.
    pub fn apply_update(&mut self, message: Message) -> Reconciliation {
        let timeline = self.timelines.entry(message.channel_id.clone()).or_default();
        let existing = timeline.messages.iter_mut().find(|m| {
            (message.id.is_some() && m.id == message.id)
                || (message.correlation_id.is_some() && m.correlation_id == message.correlation_id)
        });
        match existing {
            Some(existing) => {
                let snapshot = message.id.is_some().then(|| message.reactions.clone());
                crate::reconcile::merge_into(existing, message);
                if let Some(reactions) = snapshot {
                    existing.reactions = reactions;
                }
                Reconciliation::Updated
            }
            None => self
                .reconciler
                .reconcile(&mut timeline.messages, message, Placement::Front),
        }
    }

    /// Remove a message by server id from one channel.
    ///
    /// Use [`locate`](Self::locate) first when only the id is known.
    pub fn remove(&mut self, channel_id: &ChannelId, message_id: &MessageId) -> Option<Message> {
        let timeline = self.timelines.get_mut(channel_id)?;
        let idx = timeline
            .messages
            .iter()
            .position(|m| m.id.as_ref() == Some(message_id))?;
        timeline.messages.remove(idx)
    }

    /// Find the channel holding a message.
    pub fn locate(&self, message_id: &MessageId) -> Option<&ChannelId> {
        self.timelines
            .iter()
            .find(|(_, t)| t.get(message_id).is_some())
            .map(|(channel_id, _)| channel_id)
    }

    /// Mutable access to a message by server id, in any channel.
    pub fn get_mut(&mut self, message_id: &MessageId) -> Option<&mut Message> {
        self.timelines.values_mut().find_map(|t| {
            t.messages
                .iter_mut()
                .find(|m| m.id.as_ref() == Some(message_id))
        })
    }

    /// Find a message by correlation id.
    pub fn by_correlation(
        &self,
        channel_id: &ChannelId,
        correlation_id: &CorrelationId,
    ) -> Option<&Message> {
        self.timelines
            .get(channel_id)?
            .messages
            .iter()
            .find(|m| m.correlation_id.as_ref() == Some(correlation_id))
    }

    /// Flag a provisional message as failed.
    ///
    /// The entry stays in place so the caller can retry. Returns false if the
    /// message is unknown or already confirmed.
    pub fn mark_failed(&mut self, channel_id: &ChannelId, correlation_id: &CorrelationId) -> bool {
        let Some(timeline) = self.timelines.get_mut(channel_id) else {
            return false;
        };
        match timeline
            .messages
            .iter_mut()
            .find(|m| m.correlation_id.as_ref() == Some(correlation_id))
        {
            Some(message) if message.is_provisional() => {
                message.failed = true;
                true
            }
            _ => false,
        }
    }

    /// Clear the failed flag ahead of a retry.
    pub fn clear_failed(&mut self, channel_id: &ChannelId, correlation_id: &CorrelationId) {
        if let Some(message) = self.timelines.get_mut(channel_id).and_then(|t| {
            t.messages
                .iter_mut()
                .find(|m| m.correlation_id.as_ref() == Some(correlation_id))
        }) {
            message.failed = false;
        }
    }
}
