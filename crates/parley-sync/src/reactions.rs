use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use parley_db::ChangeFeed;
use parley_types::models::{GroupedReaction, Reaction};
use parley_types::query::{Collection, Mutation};
use serde_json::Map;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::error::{NotFoundExt, SyncResult, ValidationError};
use crate::messages::fetch_message;

/// Group reactions by emoji, in order of each emoji's first appearance.
/// A user is counted once per emoji even if the raw list repeats them.
pub fn group_reactions(reactions: &[Reaction]) -> Vec<GroupedReaction> {
    let mut groups: Vec<GroupedReaction> = Vec::new();
    for reaction in reactions {
        let idx = match groups.iter().position(|g| g.emoji == reaction.emoji) {
            Some(idx) => idx,
            None => {
                groups.push(GroupedReaction {
                    emoji: reaction.emoji.clone(),
                    count: 0,
                    user_ids: Vec::new(),
                });
                groups.len() - 1
            }
        };

        let group = &mut groups[idx];
        if !group.user_ids.contains(&reaction.user_id) {
            group.user_ids.push(reaction.user_id);
            group.count = group.user_ids.len();
        }
    }
    groups
}

/// Remove `user_id`'s `emoji` if present, otherwise append it stamped `now`.
/// Applying it twice with the same arguments restores the original list.
pub fn toggle_in(reactions: &[Reaction], user_id: Uuid, emoji: &str, now: DateTime<Utc>) -> Vec<Reaction> {
    let exists = reactions
        .iter()
        .any(|r| r.user_id == user_id && r.emoji == emoji);

    if exists {
        reactions
            .iter()
            .filter(|r| !(r.user_id == user_id && r.emoji == emoji))
            .cloned()
            .collect()
    } else {
        let mut out = reactions.to_vec();
        out.push(Reaction {
            user_id,
            emoji: emoji.to_string(),
            timestamp: now,
        });
        out
    }
}

struct MemoEntry {
    digest: String,
    groups: Vec<GroupedReaction>,
}

/// Memoizing front for [`group_reactions`].
///
/// Entries are keyed by message id and a digest of the serialized reaction
/// list; a message keeps at most one entry, so a changed list replaces it.
#[derive(Default)]
pub struct ReactionAggregator {
    memo: Mutex<HashMap<Uuid, MemoEntry>>,
}

impl ReactionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group(&self, reactions: &[Reaction], message_id: Uuid) -> Vec<GroupedReaction> {
        let Some(digest) = digest(reactions) else {
            return group_reactions(reactions);
        };

        let mut memo = self.memo.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = memo.get(&message_id) {
            if entry.digest == digest {
                return entry.groups.clone();
            }
        }

        let groups = group_reactions(reactions);
        memo.insert(
            message_id,
            MemoEntry {
                digest,
                groups: groups.clone(),
            },
        );
        groups
    }

    pub fn invalidate(&self, message_id: Uuid) {
        self.memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&message_id);
    }

    /// Drop entries for messages not in `live`, e.g. after a scope change.
    pub fn retain(&self, live: impl Fn(&Uuid) -> bool) {
        self.memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|id, _| live(id));
    }

    pub fn cached(&self) -> usize {
        self.memo.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Toggle one user's reaction on a message.
    ///
    /// Reads the current list, writes the whole toggled list back as one
    /// update, and only invalidates the memo once the store has accepted it.
    /// Returns the written list, or `None` if the message no longer exists.
    pub async fn toggle<F: ChangeFeed>(
        &self,
        feed: &F,
        message_id: Uuid,
        emoji: &str,
        user_id: Uuid,
    ) -> SyncResult<Option<Vec<Reaction>>> {
        let emoji = emoji.trim();
        if emoji.is_empty() {
            return Err(ValidationError::EmptyEmoji.into());
        }

        let Some(message) = fetch_message(feed, message_id).await? else {
            return Ok(None);
        };

        let reactions = toggle_in(&message.reactions, user_id, emoji, Utc::now());
        let mut fields = Map::new();
        fields.insert("reactions".into(), serde_json::to_value(&reactions)?);

        if feed
            .mutate(Mutation::update(Collection::Messages, message_id, fields))
            .await
            .found()?
            .is_none()
        {
            return Ok(None);
        }

        self.invalidate(message_id);
        debug!("Toggled {} by {} on message {}", emoji, user_id, message_id);
        Ok(Some(reactions))
    }
}

fn digest(reactions: &[Reaction]) -> Option<String> {
    let bytes = serde_json::to_vec(reactions).ok()?;
    Some(hex::encode(Sha256::digest(&bytes)))
}
