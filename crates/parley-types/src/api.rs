use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Reaction;

// -- Messages --

/// Payload of a new `messages` document. The store assigns the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub text: String,
    pub user_id: Uuid,
    pub username: String,
    pub channel_id: Option<Uuid>,
    pub recipient_id: Option<Uuid>,
    pub thread_id: Option<Uuid>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub reactions: Vec<Reaction>,
    pub mentions: Vec<Uuid>,
}

// -- Channels --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewChannel {
    pub name: String,
    pub description: String,
    pub created_by: Uuid,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMembership {
    pub channel_id: Uuid,
    pub user_id: Uuid,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub joined_at: DateTime<Utc>,
}

// -- Users --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub uid: Uuid,
    pub username: String,
    pub email: String,
    pub avatar: Option<String>,
    pub is_online: bool,
}
