use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Directory entry for a user, as stored in the `users` collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub uid: Uuid,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub is_online: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_by: Uuid,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

/// Join row between a channel and a user. No row means no access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub user_id: Uuid,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub joined_at: DateTime<Utc>,
}

/// A single user's reaction. The message it belongs to is implied by the
/// list it lives in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub user_id: Uuid,
    pub emoji: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// Reactions folded by emoji. `count` always equals `user_ids.len()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupedReaction {
    pub emoji: String,
    pub count: usize,
    pub user_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub text: String,
    pub user_id: Uuid,
    /// Author name captured when the message was sent; may be stale.
    pub username: String,
    #[serde(default)]
    pub channel_id: Option<Uuid>,
    #[serde(default)]
    pub recipient_id: Option<Uuid>,
    #[serde(default)]
    pub thread_id: Option<Uuid>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default)]
    pub mentions: Vec<Uuid>,
    #[serde(default)]
    pub edited: bool,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub edited_at: Option<DateTime<Utc>>,
}

/// Where a message is delivered. Exactly one routing key is set on a
/// well-formed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Channel(Uuid),
    Direct(Uuid),
}

impl Message {
    /// Returns `None` when both or neither routing key is set.
    pub fn route(&self) -> Option<Route> {
        match (self.channel_id, self.recipient_id) {
            (Some(channel_id), None) => Some(Route::Channel(channel_id)),
            (None, Some(recipient_id)) => Some(Route::Direct(recipient_id)),
            _ => None,
        }
    }

    pub fn is_reply(&self) -> bool {
        self.thread_id.is_some()
    }

    /// Whether this message belongs to the direct conversation between `a` and `b`.
    pub fn is_between(&self, a: Uuid, b: Uuid) -> bool {
        match self.route() {
            Some(Route::Direct(recipient)) => {
                (self.user_id == a && recipient == b) || (self.user_id == b && recipient == a)
            }
            _ => false,
        }
    }
}

/// The view currently being looked at. Lives only in memory and is replaced
/// on every navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationScope {
    Channel(Uuid),
    /// Direct conversation with the given peer.
    DirectMessage(Uuid),
    /// Replies to the given root message.
    Thread(Uuid),
}
