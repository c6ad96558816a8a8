use parley_db::ChangeFeed;
use parley_types::api::NewUser;
use parley_types::document::Document;
use parley_types::models::User;
use parley_types::query::{Collection, Filter, Mutation, Query};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::SyncResult;

/// Point-in-time snapshot of the `users` collection, used to resolve
/// mentions and author names.
#[derive(Debug, Clone, Default)]
pub struct UserDirectory {
    /// Longest username first, so greedy matching tries "Jane Doe" before "Jane".
    users: Vec<User>,
}

impl UserDirectory {
    pub fn new(mut users: Vec<User>) -> Self {
        users.sort_by(|a, b| {
            b.username
                .len()
                .cmp(&a.username.len())
                .then_with(|| a.username.cmp(&b.username))
        });
        Self { users }
    }

    pub async fn load<F: ChangeFeed>(feed: &F) -> SyncResult<Self> {
        let docs = feed.get(Query::new(Collection::Users).order_by("username")).await?;
        Ok(Self::new(decode_users(&docs)))
    }

    /// Server-side prefix search over usernames.
    pub async fn search<F: ChangeFeed>(feed: &F, prefix: &str, limit: usize) -> SyncResult<Vec<User>> {
        let query = Query::new(Collection::Users)
            .filter(Filter::prefix("username", prefix))
            .order_by("username")
            .limit(limit);
        Ok(decode_users(&feed.get(query).await?))
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn get(&self, uid: Uuid) -> Option<&User> {
        self.users.iter().find(|u| u.uid == uid)
    }

    /// Exact, case-sensitive lookup.
    pub fn by_name(&self, username: &str) -> Option<&User> {
        self.users.iter().find(|u| u.username == username)
    }

    /// Local prefix search, alphabetical.
    pub fn suggest(&self, prefix: &str) -> Vec<&User> {
        let mut out: Vec<&User> = self
            .users
            .iter()
            .filter(|u| u.username.starts_with(prefix))
            .collect();
        out.sort_by(|a, b| a.username.cmp(&b.username));
        out
    }

    /// Longest username that `rest` starts with and that ends on a word
    /// boundary (end of text or a non-alphanumeric character).
    pub fn longest_match(&self, rest: &str) -> Option<&User> {
        self.users.iter().find(|u| {
            !u.username.is_empty()
                && rest.starts_with(u.username.as_str())
                && rest[u.username.len()..]
                    .chars()
                    .next()
                    .is_none_or(|c| !c.is_alphanumeric())
        })
    }
}

fn decode_users(docs: &[Document]) -> Vec<User> {
    docs.iter()
        .filter_map(|doc| match doc.decode::<User>() {
            Ok(user) => Some(user),
            Err(e) => {
                warn!("Skipping corrupt user document {}: {}", doc.id, e);
                None
            }
        })
        .collect()
}

/// Look a user up by exact username, registering them if absent.
pub async fn ensure_user<F: ChangeFeed>(feed: &F, username: &str) -> SyncResult<User> {
    let query = Query::new(Collection::Users)
        .filter(Filter::eq("username", username))
        .limit(1);
    if let Some(user) = decode_users(&feed.get(query).await?).into_iter().next() {
        return Ok(user);
    }

    let user = NewUser {
        uid: Uuid::new_v4(),
        username: username.to_string(),
        email: String::new(),
        avatar: None,
        is_online: true,
    };
    feed.mutate(Mutation::insert(Collection::Users, &user)?).await?;
    info!("Registered user {} ({})", user.username, user.uid);

    Ok(User {
        uid: user.uid,
        username: user.username,
        email: user.email,
        avatar: user.avatar,
        is_online: user.is_online,
    })
}
