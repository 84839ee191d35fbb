//! Reaction multimap: emoji → set of author handles.
//!
//! The set type makes duplicate authors impossible, and every constructor and
//! mutator drops emoji keys whose author set became empty.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

type RawReactions = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawReactions", into = "RawReactions")]
pub struct Reactions(BTreeMap<String, BTreeSet<String>>);

/// Outcome of [`Reactions::toggle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionChange {
    Added,
    Removed,
}

impl Reactions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `user` under `emoji`, or remove them if already present.
    pub fn toggle(&mut self, emoji: &str, user: &str) -> ReactionChange {
        if let Some(authors) = self.0.get_mut(emoji) {
            if authors.remove(user) {
                if authors.is_empty() {
                    self.0.remove(emoji);
                }
                return ReactionChange::Removed;
            }
            authors.insert(user.to_string());
            return ReactionChange::Added;
        }

        self.0
            .insert(emoji.to_string(), BTreeSet::from([user.to_string()]));
        ReactionChange::Added
    }

    pub fn contains(&self, emoji: &str, user: &str) -> bool {
        self.0.get(emoji).is_some_and(|authors| authors.contains(user))
    }

    pub fn authors(&self, emoji: &str) -> Option<&BTreeSet<String>> {
        self.0.get(emoji)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of distinct emoji carrying at least one author.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<String>)> {
        self.0.iter()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl From<RawReactions> for Reactions {
    fn from(raw: RawReactions) -> Self {
        let map = raw
            .into_iter()
            .map(|(emoji, authors)| (emoji, authors.into_iter().collect::<BTreeSet<_>>()))
            .filter(|(_, authors)| !authors.is_empty())
            .collect();
        Self(map)
    }
}

impl From<Reactions> for RawReactions {
    fn from(r: Reactions) -> Self {
        r.0.into_iter()
            .map(|(emoji, authors)| (emoji, authors.into_iter().collect()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_twice_restores_original() {
        let mut reactions = Reactions::new();
        reactions.toggle("👍", "bob");
        let before = reactions.clone();

        assert_eq!(reactions.toggle("👍", "alice"), ReactionChange::Added);
        assert_eq!(reactions.toggle("👍", "alice"), ReactionChange::Removed);
        assert_eq!(reactions, before);

        assert_eq!(reactions.toggle("🔥", "alice"), ReactionChange::Added);
        assert_eq!(reactions.toggle("🔥", "alice"), ReactionChange::Removed);
        assert_eq!(reactions, before);
    }

    #[test]
    fn removing_last_author_drops_the_emoji() {
        let mut reactions = Reactions::new();
        reactions.toggle("❤️", "alice");
        reactions.toggle("❤️", "alice");
        assert!(reactions.authors("❤️").is_none());
        assert!(reactions.is_empty());
    }

    #[test]
    fn deserialization_dedupes_and_drops_empty_sets() {
        let reactions =
            Reactions::from_json(r#"{"👍":["alice","bob","alice"],"😢":[]}"#).unwrap();
        assert_eq!(reactions.len(), 1);
        assert_eq!(reactions.authors("👍").unwrap().len(), 2);
        assert!(reactions.contains("👍", "bob"));
        assert_eq!(reactions.to_json(), r#"{"👍":["alice","bob"]}"#);
    }
}
