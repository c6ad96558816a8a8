use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use parley_db::{ChangeFeed, FeedError};
use parley_types::api::{NewChannel, NewMembership};
use parley_types::document::Document;
use parley_types::models::{Channel, Membership, User};
use parley_types::query::{Collection, Filter, Mutation, Query};
use serde::de::DeserializeOwned;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{NotFoundExt, SyncResult, ValidationError};

/// Who counts as a member of a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MembershipPolicy {
    /// Only `channelMembers` rows grant membership.
    #[default]
    Explicit,
    /// Authors of channel messages without a row are granted membership,
    /// and the missing rows are written.
    BackfillFromAuthorship,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown membership policy '{0}', expected 'explicit' or 'backfill'")]
pub struct UnknownPolicy(pub String);

impl FromStr for MembershipPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "explicit" => Ok(Self::Explicit),
            "backfill" => Ok(Self::BackfillFromAuthorship),
            _ => Err(UnknownPolicy(s.to_string())),
        }
    }
}

/// Channel and membership operations over a feed.
pub struct Channels<F: ChangeFeed> {
    feed: Arc<F>,
    policy: MembershipPolicy,
}

impl<F: ChangeFeed> Clone for Channels<F> {
    fn clone(&self) -> Self {
        Self {
            feed: self.feed.clone(),
            policy: self.policy,
        }
    }
}

impl<F: ChangeFeed> Channels<F> {
    pub fn new(feed: Arc<F>, policy: MembershipPolicy) -> Self {
        Self { feed, policy }
    }

    pub fn policy(&self) -> MembershipPolicy {
        self.policy
    }

    /// Create a channel and make `creator` its first member.
    pub async fn create_channel(&self, name: &str, description: &str, creator: &User) -> SyncResult<Channel> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::EmptyChannelName.into());
        }
        if self.find_channel_by_name(name).await?.is_some() {
            return Err(ValidationError::DuplicateChannelName(name.to_string()).into());
        }

        let new = NewChannel {
            name: name.to_string(),
            description: description.trim().to_string(),
            created_by: creator.uid,
            created_at: Utc::now(),
        };
        // The store's unique index catches a concurrent create that slipped
        // past the lookup above.
        let outcome = match self.feed.mutate(Mutation::insert(Collection::Channels, &new)?).await {
            Ok(outcome) => outcome,
            Err(FeedError::Rejected(_)) => {
                return Err(ValidationError::DuplicateChannelName(new.name).into());
            }
            Err(e) => return Err(e.into()),
        };

        let channel = Channel {
            id: outcome.id,
            name: new.name,
            description: new.description,
            created_by: new.created_by,
            created_at: new.created_at,
        };
        info!("Created channel #{} ({})", channel.name, channel.id);

        self.join_channel(channel.id, creator.uid).await?;
        Ok(channel)
    }

    pub async fn find_channel_by_name(&self, name: &str) -> SyncResult<Option<Channel>> {
        let query = Query::new(Collection::Channels)
            .filter(Filter::eq("name", name))
            .limit(1);
        Ok(decode_all(&self.feed.get(query).await?).into_iter().next())
    }

    pub async fn get_channel(&self, id: Uuid) -> SyncResult<Option<Channel>> {
        let query = Query::new(Collection::Channels).filter(Filter::eq("id", id));
        Ok(decode_all(&self.feed.get(query).await?).into_iter().next())
    }

    /// Every channel, alphabetical.
    pub async fn list_channels(&self) -> SyncResult<Vec<Channel>> {
        let query = Query::new(Collection::Channels).order_by("name");
        Ok(decode_all(&self.feed.get(query).await?))
    }

    /// Idempotent. Returns `None` if the channel doesn't exist.
    pub async fn join_channel(&self, channel_id: Uuid, user_id: Uuid) -> SyncResult<Option<Membership>> {
        if self.get_channel(channel_id).await?.is_none() {
            return Ok(None);
        }
        if let Some(existing) = self.membership(channel_id, user_id).await?.into_iter().next() {
            return Ok(Some(existing));
        }
        self.insert_membership(channel_id, user_id).await.map(Some)
    }

    /// Returns false if the user wasn't a member.
    pub async fn leave_channel(&self, channel_id: Uuid, user_id: Uuid) -> SyncResult<bool> {
        let mut left = false;
        for row in self.membership(channel_id, user_id).await? {
            let deleted = self
                .feed
                .mutate(Mutation::delete(Collection::ChannelMembers, row.id))
                .await
                .found()?;
            left |= deleted.is_some();
        }
        if left {
            info!("User {} left channel {}", user_id, channel_id);
        }
        Ok(left)
    }

    /// Channels `user_id` has a membership row for, alphabetical.
    pub async fn channels_for(&self, user_id: Uuid) -> SyncResult<Vec<Channel>> {
        let query = Query::new(Collection::ChannelMembers)
            .filter(Filter::eq("userId", user_id))
            .order_by("joinedAt");
        let rows: Vec<Membership> = decode_all(&self.feed.get(query).await?);

        let lookups = rows.iter().map(|row| self.get_channel(row.channel_id));
        let mut channels = Vec::with_capacity(rows.len());
        for found in join_all(lookups).await {
            if let Some(channel) = found? {
                if !channels.iter().any(|c: &Channel| c.id == channel.id) {
                    channels.push(channel);
                }
            }
        }
        channels.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(channels)
    }

    /// Whether `user_id` may read and post in the channel. Under
    /// `BackfillFromAuthorship` a past author counts, and gets a row.
    pub async fn is_member(&self, channel_id: Uuid, user_id: Uuid) -> SyncResult<bool> {
        if !self.membership(channel_id, user_id).await?.is_empty() {
            return Ok(true);
        }
        if self.policy == MembershipPolicy::Explicit {
            return Ok(false);
        }
        Ok(self.members(channel_id).await?.contains(&user_id))
    }

    /// Member ids under this instance's policy.
    pub async fn members(&self, channel_id: Uuid) -> SyncResult<Vec<Uuid>> {
        self.channel_members(channel_id, self.policy).await
    }

    /// Member ids in join order. Under `BackfillFromAuthorship`, authors
    /// without a row follow in order of their first message, and their
    /// rows are written.
    pub async fn channel_members(&self, channel_id: Uuid, policy: MembershipPolicy) -> SyncResult<Vec<Uuid>> {
        let query = Query::new(Collection::ChannelMembers)
            .filter(Filter::eq("channelId", channel_id))
            .order_by("joinedAt");
        let rows: Vec<Membership> = decode_all(&self.feed.get(query).await?);

        let mut members: Vec<Uuid> = Vec::with_capacity(rows.len());
        for row in rows {
            if !members.contains(&row.user_id) {
                members.push(row.user_id);
            }
        }

        if policy == MembershipPolicy::Explicit {
            return Ok(members);
        }

        let query = Query::new(Collection::Messages)
            .filter(Filter::eq("channelId", channel_id))
            .order_by("timestamp");
        let authors: Vec<Uuid> = self
            .feed
            .get(query)
            .await?
            .iter()
            .filter_map(|doc| doc.field("userId").as_str().and_then(|s| s.parse().ok()))
            .collect();

        for author in authors {
            if members.contains(&author) {
                continue;
            }
            self.insert_membership(channel_id, author).await?;
            info!("Backfilled membership of {} in channel {}", author, channel_id);
            members.push(author);
        }
        Ok(members)
    }

    async fn membership(&self, channel_id: Uuid, user_id: Uuid) -> SyncResult<Vec<Membership>> {
        let query = Query::new(Collection::ChannelMembers)
            .filter(Filter::eq("channelId", channel_id))
            .filter(Filter::eq("userId", user_id));
        Ok(decode_all(&self.feed.get(query).await?))
    }

    async fn insert_membership(&self, channel_id: Uuid, user_id: Uuid) -> SyncResult<Membership> {
        let new = NewMembership {
            channel_id,
            user_id,
            joined_at: Utc::now(),
        };
        let outcome = self
            .feed
            .mutate(Mutation::insert(Collection::ChannelMembers, &new)?)
            .await?;
        Ok(Membership {
            id: outcome.id,
            channel_id,
            user_id,
            joined_at: new.joined_at,
        })
    }
}

fn decode_all<T: DeserializeOwned>(docs: &[Document]) -> Vec<T> {
    docs.iter()
        .filter_map(|doc| match doc.decode::<T>() {
            Ok(model) => Some(model),
            Err(e) => {
                warn!("Skipping corrupt document {}: {}", doc.id, e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::ensure_user;
    use crate::error::SyncError;
    use crate::mentions::Draft;
    use crate::messages::post_message;
    use parley_db::Store;
    use parley_types::models::Route;

    fn channels(store: &Store) -> Channels<Store> {
        Channels::new(Arc::new(store.clone()), MembershipPolicy::Explicit)
    }

    #[test]
    fn policy_parses_from_config_values() {
        assert_eq!("explicit".parse(), Ok(MembershipPolicy::Explicit));
        assert_eq!(" Backfill ".parse(), Ok(MembershipPolicy::BackfillFromAuthorship));
        assert_eq!(
            "sometimes".parse::<MembershipPolicy>(),
            Err(UnknownPolicy("sometimes".into()))
        );
    }

    #[tokio::test]
    async fn create_validates_before_writing() {
        let store = Store::open_in_memory().unwrap();
        let ana = ensure_user(&store, "ana").await.unwrap();
        let channels = channels(&store);

        let err = channels.create_channel("  ", "", &ana).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(ValidationError::EmptyChannelName)));

        let general = channels.create_channel("general", "chat", &ana).await.unwrap();
        let err = channels.create_channel("general", "again", &ana).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Validation(ValidationError::DuplicateChannelName(ref name)) if name == "general"
        ));

        let listed: Vec<Uuid> = channels.list_channels().await.unwrap().iter().map(|c| c.id).collect();
        assert_eq!(listed, vec![general.id]);
        assert_eq!(channels.members(general.id).await.unwrap(), vec![ana.uid]);
    }

    #[tokio::test]
    async fn join_is_idempotent_and_leave_removes() {
        let store = Store::open_in_memory().unwrap();
        let ana = ensure_user(&store, "ana").await.unwrap();
        let bo = ensure_user(&store, "bo").await.unwrap();
        let channels = channels(&store);
        let general = channels.create_channel("general", "", &ana).await.unwrap();
        let random = channels.create_channel("random", "", &ana).await.unwrap();

        let first = channels.join_channel(general.id, bo.uid).await.unwrap().unwrap();
        let again = channels.join_channel(general.id, bo.uid).await.unwrap().unwrap();
        assert_eq!(first.id, again.id);
        assert!(channels.join_channel(Uuid::new_v4(), bo.uid).await.unwrap().is_none());

        channels.join_channel(random.id, bo.uid).await.unwrap();
        let names: Vec<String> = channels
            .channels_for(bo.uid)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["general", "random"]);

        assert!(channels.leave_channel(general.id, bo.uid).await.unwrap());
        assert!(!channels.leave_channel(general.id, bo.uid).await.unwrap());
        assert_eq!(channels.members(general.id).await.unwrap(), vec![ana.uid]);
    }

    #[tokio::test]
    async fn backfill_grants_membership_to_authors() {
        let store = Store::open_in_memory().unwrap();
        let ana = ensure_user(&store, "ana").await.unwrap();
        let cy = ensure_user(&store, "cy").await.unwrap();
        let channels = channels(&store);
        let general = channels.create_channel("general", "", &ana).await.unwrap();

        let draft = Draft {
            text: "hi".into(),
            mentions: vec![],
        };
        post_message(&store, &cy, Route::Channel(general.id), None, draft)
            .await
            .unwrap();

        let explicit = channels
            .channel_members(general.id, MembershipPolicy::Explicit)
            .await
            .unwrap();
        assert_eq!(explicit, vec![ana.uid]);

        let backfilled = channels
            .channel_members(general.id, MembershipPolicy::BackfillFromAuthorship)
            .await
            .unwrap();
        assert_eq!(backfilled, vec![ana.uid, cy.uid]);

        // The rows were written, so the explicit view now agrees.
        let mut explicit = channels
            .channel_members(general.id, MembershipPolicy::Explicit)
            .await
            .unwrap();
        let mut expected = vec![ana.uid, cy.uid];
        explicit.sort();
        expected.sort();
        assert_eq!(explicit, expected);
    }

    #[tokio::test]
    async fn membership_follows_the_policy() {
        let store = Store::open_in_memory().unwrap();
        let ana = ensure_user(&store, "ana").await.unwrap();
        let cy = ensure_user(&store, "cy").await.unwrap();
        let outsider = ensure_user(&store, "dee").await.unwrap();
        let explicit = channels(&store);
        let general = explicit.create_channel("general", "", &ana).await.unwrap();

        let draft = Draft {
            text: "old post".into(),
            mentions: vec![],
        };
        post_message(&store, &cy, Route::Channel(general.id), None, draft)
            .await
            .unwrap();

        assert!(explicit.is_member(general.id, ana.uid).await.unwrap());
        assert!(!explicit.is_member(general.id, cy.uid).await.unwrap());
        assert!(!explicit.is_member(general.id, outsider.uid).await.unwrap());

        let backfill = Channels::new(Arc::new(store.clone()), MembershipPolicy::BackfillFromAuthorship);
        assert!(backfill.is_member(general.id, cy.uid).await.unwrap());
        assert!(!backfill.is_member(general.id, outsider.uid).await.unwrap());
        // The author's row was written along the way.
        assert!(explicit.is_member(general.id, cy.uid).await.unwrap());
    }
}
