//! Per-message reaction state.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::UserId;

type RawReactions = BTreeMap<String, BTreeSet<UserId>>;

/// Mapping from emoji to the set of users who reacted with it.
///
/// Invariant: no emoji key maps to an empty set. Removing the last reactor
/// deletes the key, and empty sets are dropped on deserialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawReactions", into = "RawReactions")]
pub struct ReactionMap(RawReactions);

impl ReactionMap {
    /// Create an empty reaction map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `user` to the reactors of `emoji`.
    ///
    /// Returns `false` if the user had already reacted with that emoji.
    pub fn add(&mut self, emoji: &str, user: UserId) -> bool {
        self.0.entry(emoji.to_string()).or_default().insert(user)
    }

    /// Remove `user` from the reactors of `emoji`.
    ///
    /// Returns `false` if there was nothing to remove. Deletes the emoji key
    /// when its last reactor is removed.
    pub fn remove(&mut self, emoji: &str, user: &UserId) -> bool {
        let Some(users) = self.0.get_mut(emoji) else {
            return false;
        };
        let removed = users.remove(user);
        if users.is_empty() {
            self.0.remove(emoji);
        }
        removed
    }

    /// Users who reacted with `emoji`, if any.
    pub fn users(&self, emoji: &str) -> Option<&BTreeSet<UserId>> {
        self.0.get(emoji)
    }

    /// Number of users who reacted with `emoji`.
    pub fn count(&self, emoji: &str) -> usize {
        self.0.get(emoji).map_or(0, BTreeSet::len)
    }

    /// Whether `user` reacted with `emoji`.
    pub fn contains(&self, emoji: &str, user: &UserId) -> bool {
        self.0.get(emoji).is_some_and(|users| users.contains(user))
    }

    /// Number of distinct emoji on the message.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the message carries no reactions at all.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(emoji, reactors)` pairs in emoji order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeSet<UserId>)> {
        self.0.iter().map(|(emoji, users)| (emoji.as_str(), users))
    }
}

impl From<RawReactions> for ReactionMap {
    fn from(mut raw: RawReactions) -> Self {
        raw.retain(|_, users| !users.is_empty());
        Self(raw)
    }
}

impl From<ReactionMap> for RawReactions {
    fn from(map: ReactionMap) -> Self {
        map.0
    }
}
