//! Message reconciliation across the three write paths.
//!
//! A candidate message may come from an optimistic local send, from the push
//! transport, or from a pulled history page. None of these carry a global
//! sequence number, so identity is established by the strongest signal the
//! candidate carries:
//!
//! 1. client correlation id (update of a provisional entry)
//! 2. server id (duplicate from the other path, discarded)
//! 3. sender + content/attachment name + time window (heuristic match)
//!
//! The heuristic collapses two genuinely distinct messages that the same
//! sender posted with identical content inside the window. That is an accepted
//! limitation: it is silent and cannot be detected client-side.

use std::collections::VecDeque;
use std::time::Duration;

use chansync_types::Message;

/// Default window for the content-based duplicate test.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(5);

/// What reconciling a candidate did to the collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// The candidate was a new message and was inserted.
    Inserted,
    /// The candidate was merged into an existing entry.
    Updated,
    /// The candidate duplicated an existing entry and was dropped.
    Discarded,
}

/// Where a new message lands in the collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Head of the collection (latest). Used for sends and push events.
    Front,
    /// Tail of the collection. Used for older history pages.
    Back,
}

/// How a candidate relates to an existing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// Same client correlation id.
    Correlated(usize),
    /// Same server id.
    SameServerId(usize),
    /// Same sender and content within the time window.
    Heuristic(usize),
    /// No existing entry matches.
    New,
}

/// Decides insert / update / discard for candidate messages.
#[derive(Debug, Clone)]
pub struct MessageReconciler {
    window: Duration,
}

impl MessageReconciler {
    /// Create a reconciler with the given heuristic window.
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    /// The heuristic duplicate window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Classify `candidate` against `existing` without mutating anything.
    pub fn classify(&self, existing: &VecDeque<Message>, candidate: &Message) -> MatchKind {
        if let Some(corr) = &candidate.correlation_id {
            if let Some(idx) = existing
                .iter()
                .position(|m| m.correlation_id.as_ref() == Some(corr))
            {
                return MatchKind::Correlated(idx);
            }
        }

        if let Some(id) = &candidate.id {
            if let Some(idx) = existing.iter().position(|m| m.id.as_ref() == Some(id)) {
                return MatchKind::SameServerId(idx);
            }
        }

        existing
            .iter()
            .position(|m| self.looks_like_same(m, candidate))
            .map_or(MatchKind::New, MatchKind::Heuristic)
    }

    /// Reconcile `candidate` into `messages`.
    pub fn reconcile(
        &self,
        messages: &mut VecDeque<Message>,
        candidate: Message,
        placement: Placement,
    ) -> Reconciliation {
        match self.classify(messages, &candidate) {
            MatchKind::Correlated(idx) | MatchKind::Heuristic(idx) => {
                merge_into(&mut messages[idx], candidate);
                Reconciliation::Updated
            }
            MatchKind::SameServerId(_) => Reconciliation::Discarded,
            MatchKind::New => {
                match placement {
                    Placement::Front => messages.push_front(candidate),
                    Placement::Back => messages.push_back(candidate),
                }
                Reconciliation::Inserted
            }
        }
    }

    /// The heuristic duplicate test.
    ///
    /// Only a fallback for pairs with no stronger identity: two messages that
    /// both carry correlation ids, or both carry server ids, are distinct
    /// when those ids differ. Text only counts when it is non-empty, so two
    /// attachment-only messages are compared by attachment name alone.
    fn looks_like_same(&self, existing: &Message, candidate: &Message) -> bool {
        if existing.sender.id != candidate.sender.id {
            return false;
        }
        if let (Some(a), Some(b)) = (&existing.correlation_id, &candidate.correlation_id) {
            if a != b {
                return false;
            }
        }
        if let (Some(a), Some(b)) = (&existing.id, &candidate.id) {
            if a != b {
                return false;
            }
        }

        let same_text = !candidate.content.is_empty() && existing.content == candidate.content;
        let same_file = match (&existing.attachment, &candidate.attachment) {
            (Some(a), Some(b)) => a.same_file(b),
            _ => false,
        };
        if !same_text && !same_file {
            return false;
        }

        let delta = (existing.created_at - candidate.created_at).abs();
        match delta.to_std() {
            Ok(delta) => delta <= self.window,
            Err(_) => false,
        }
    }
}

impl Default for MessageReconciler {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}

/// Merge a confirming `candidate` into an `existing` entry.
///
/// - a server id, once set, is never replaced
/// - a confirmed attachment never regresses to pending
/// - empty candidate content or reactions do not erase existing ones
pub fn merge_into(existing: &mut Message, candidate: Message) {
    let was_unconfirmed = existing.id.is_none();
    let confirmed = candidate.id.is_some();

    if existing.id.is_none() {
        existing.id = candidate.id;
    }
    if existing.correlation_id.is_none() {
        existing.correlation_id = candidate.correlation_id;
    }
    if !candidate.content.is_empty() {
        existing.content = candidate.content;
    }

    existing.attachment = match (existing.attachment.take(), candidate.attachment) {
        (None, incoming) => incoming,
        (current, None) => current,
        (Some(current), Some(incoming)) => {
            if current.pending || !incoming.pending {
                Some(incoming)
            } else {
                Some(current)
            }
        }
    };

    if !candidate.reactions.is_empty() {
        existing.reactions = candidate.reactions;
    }
    if candidate.reply_to.is_some() {
        existing.reply_to = candidate.reply_to;
    }
    existing.sender = candidate.sender;

    // The server clock is authoritative once the message is confirmed.
    if was_unconfirmed && confirmed {
        existing.created_at = candidate.created_at;
    }
    if confirmed {
        existing.failed = false;
    }
}
