use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use parley_db::{ChangeFeed, FeedResult};
use parley_types::events::Snapshot;
use parley_types::models::{ConversationScope, GroupedReaction, Message, Reaction, Route, User};
use parley_types::query::Query;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::Channels;
use crate::directory::UserDirectory;
use crate::error::{SyncResult, ValidationError};
use crate::mentions::Draft;
use crate::messages::{self, decode_message, fetch_message};
use crate::options::SyncOptions;
use crate::reactions::ReactionAggregator;
use crate::scope::ScopeExt;
use crate::scoped::ScopedFeed;
use crate::threads;

/// Read-only snapshot of the active conversation, republished after every
/// applied delivery.
#[derive(Debug, Clone, Default)]
pub struct ConversationView {
    pub scope: Option<ConversationScope>,
    /// Ordered by (timestamp, id). Replies only appear under a thread scope.
    pub messages: Arc<Vec<Message>>,
    pub has_messages: bool,
    /// False until the primary feed has delivered once for this scope.
    pub loaded: bool,
    /// Reply count per root message, for roots with at least one reply.
    pub reply_counts: Arc<HashMap<Uuid, usize>>,
    /// The root message when the scope is a thread.
    pub thread_root: Option<Message>,
}

#[derive(Debug, Clone, Copy)]
enum FeedRole {
    Primary,
    Auxiliary,
}

#[derive(Default)]
struct SyncState {
    /// Bumped on every scope change. Deliveries tagged with an older epoch
    /// are dropped.
    epoch: u64,
    scope: Option<ConversationScope>,
    feeds: Vec<ScopedFeed>,
    cache: HashMap<Uuid, Message>,
    replies: HashMap<Uuid, Message>,
    root: Option<Message>,
    loaded: bool,
}

struct Shared {
    me: Uuid,
    state: Mutex<SyncState>,
    view: watch::Sender<ConversationView>,
    reactions: ReactionAggregator,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keeps an ordered, de-duplicated message cache for one conversation scope
/// at a time and publishes it on a watch channel.
pub struct ConversationSync<F: ChangeFeed> {
    feed: Arc<F>,
    me: User,
    options: SyncOptions,
    shared: Arc<Shared>,
}

impl<F: ChangeFeed> ConversationSync<F> {
    pub fn new(feed: Arc<F>, me: User, options: SyncOptions) -> Self {
        let (view, _) = watch::channel(ConversationView::default());
        let shared = Arc::new(Shared {
            me: me.uid,
            state: Mutex::new(SyncState::default()),
            view,
            reactions: ReactionAggregator::new(),
        });
        Self {
            feed,
            me,
            options,
            shared,
        }
    }

    pub fn me(&self) -> &User {
        &self.me
    }

    pub fn feed(&self) -> &Arc<F> {
        &self.feed
    }

    pub fn options(&self) -> SyncOptions {
        self.options
    }

    pub fn channels(&self) -> Channels<F> {
        Channels::new(self.feed.clone(), self.options.membership_policy)
    }

    pub fn scope(&self) -> Option<ConversationScope> {
        self.shared.lock().scope
    }

    pub fn watch(&self) -> watch::Receiver<ConversationView> {
        self.shared.view.subscribe()
    }

    pub fn view(&self) -> ConversationView {
        self.shared.view.borrow().clone()
    }

    /// Switch to `scope`. Feeds of the previous scope are released and the
    /// cache is emptied before the new feeds are opened; returns without
    /// waiting for the first delivery.
    pub fn set_scope(&self, scope: ConversationScope) {
        let mut state = self.shared.lock();
        reset(&mut state);
        state.scope = Some(scope);
        let epoch = state.epoch;

        let me = self.me.uid;
        state.feeds = vec![
            self.spawn(epoch, FeedRole::Primary, scope.primary_query(me)),
            self.spawn(epoch, FeedRole::Auxiliary, scope.auxiliary_query(me)),
        ];
        publish(&self.shared, &state);
        info!("Switched conversation scope to {:?} (epoch {})", scope, epoch);
    }

    /// Membership-checked form of `set_scope(Channel(channel_id))`.
    pub async fn enter_channel(&self, channel_id: Uuid) -> SyncResult<()> {
        if !self.channels().is_member(channel_id, self.me.uid).await? {
            return Err(ValidationError::NotAMember.into());
        }
        self.set_scope(ConversationScope::Channel(channel_id));
        Ok(())
    }

    pub fn clear_scope(&self) {
        let mut state = self.shared.lock();
        reset(&mut state);
        publish(&self.shared, &state);
        info!("Cleared conversation scope");
    }

    fn spawn(&self, epoch: u64, role: FeedRole, query: Query) -> ScopedFeed {
        let shared = Arc::downgrade(&self.shared);
        ScopedFeed::spawn(self.feed.as_ref(), query, move |item| {
            apply(&shared, epoch, role, item);
        })
    }

    /// Replies to `root_id` seen by the active scope.
    pub fn reply_count(&self, root_id: Uuid) -> usize {
        self.shared.view.borrow().reply_counts.get(&root_id).copied().unwrap_or(0)
    }

    /// Send `text` to the active scope. Replies in a thread inherit the
    /// root's routing. Resolves to `None` if the thread root is gone.
    /// Anything routed to a channel requires membership in it.
    pub async fn send_message(&self, text: &str, directory: &UserDirectory) -> SyncResult<Option<Message>> {
        let scope = self.scope().ok_or(ValidationError::NoActiveScope)?;
        let draft = Draft::new(text, directory)?;

        let (route, thread_id) = match scope {
            ConversationScope::Channel(channel_id) => (Route::Channel(channel_id), None),
            ConversationScope::DirectMessage(peer) => (Route::Direct(peer), None),
            ConversationScope::Thread(root_id) => {
                let cached = self.shared.lock().root.clone();
                let root = match cached {
                    Some(root) => Some(root),
                    None => fetch_message(self.feed.as_ref(), root_id).await?,
                };
                let Some(root) = root else {
                    return Ok(None);
                };
                let route = match root.route() {
                    // Replying to a DM sent to us goes back to its author.
                    Some(Route::Direct(recipient)) if recipient == self.me.uid => {
                        Route::Direct(root.user_id)
                    }
                    Some(route) => route,
                    None => return Ok(None),
                };
                (route, Some(root_id))
            }
        };

        if let Route::Channel(channel_id) = route {
            if !self.channels().is_member(channel_id, self.me.uid).await? {
                return Err(ValidationError::NotAMember.into());
            }
        }

        messages::post_message(self.feed.as_ref(), &self.me, route, thread_id, draft)
            .await
            .map(Some)
    }

    /// Replace the text of one of our own messages, re-resolving mentions.
    pub async fn edit_message(&self, id: Uuid, text: &str, directory: &UserDirectory) -> SyncResult<Option<Message>> {
        let draft = Draft::new(text, directory)?;
        messages::edit_message(self.feed.as_ref(), self.me.uid, id, draft).await
    }

    pub async fn delete_message(&self, id: Uuid) -> SyncResult<bool> {
        messages::delete_message(self.feed.as_ref(), self.me.uid, id).await
    }

    pub async fn toggle_reaction(&self, id: Uuid, emoji: &str) -> SyncResult<Option<Vec<Reaction>>> {
        self.shared
            .reactions
            .toggle(self.feed.as_ref(), id, emoji, self.me.uid)
            .await
    }

    pub fn grouped_reactions(&self, message: &Message) -> Vec<GroupedReaction> {
        self.shared.reactions.group(&message.reactions, message.id)
    }
}

impl<F: ChangeFeed> Drop for ConversationSync<F> {
    fn drop(&mut self) {
        reset(&mut self.shared.lock());
    }
}

/// Release the feeds and forget everything cached for the old scope.
fn reset(state: &mut SyncState) {
    state.feeds.clear();
    state.epoch += 1;
    state.scope = None;
    state.cache.clear();
    state.replies.clear();
    state.root = None;
    state.loaded = false;
}

fn apply(shared: &Weak<Shared>, epoch: u64, role: FeedRole, item: FeedResult<Snapshot>) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let mut state = shared.lock();
    if state.epoch != epoch {
        debug!("Discarding {:?} snapshot from epoch {} (now {})", role, epoch, state.epoch);
        return;
    }
    let Some(scope) = state.scope else {
        return;
    };

    let snapshot = match item {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!("{:?} feed for {:?} failed, keeping cached messages: {}", role, scope, e);
            return;
        }
    };

    let me = shared.me;
    match (role, scope) {
        (FeedRole::Primary, _) => {
            merge(&mut state.cache, &snapshot, |m| scope.admits(me, m));
            state.loaded = true;
        }
        (FeedRole::Auxiliary, ConversationScope::Thread(root_id)) => {
            state.root = snapshot
                .documents
                .iter()
                .filter_map(decode_message)
                .find(|m| m.id == root_id);
            if state.root.is_none() {
                info!("Thread root {} is not available", root_id);
            }
        }
        (FeedRole::Auxiliary, _) => {
            merge(&mut state.replies, &snapshot, |m| {
                m.is_reply() && scope.routes(me, m)
            });
        }
    }
    debug!(
        "Applied {:?} snapshot: {} documents, {} changes",
        role,
        snapshot.documents.len(),
        snapshot.changes.len()
    );

    let root_id = state.root.as_ref().map(|m| m.id);
    shared
        .reactions
        .retain(|id| state.cache.contains_key(id) || root_id == Some(*id));
    publish(&shared, &state);
}

/// Merge a delivery into `cache`: removals first, then every admitted
/// document replaces whatever was cached under its id.
fn merge(cache: &mut HashMap<Uuid, Message>, snapshot: &Snapshot, admit: impl Fn(&Message) -> bool) {
    for id in snapshot.removed() {
        cache.remove(&id);
    }
    for doc in &snapshot.documents {
        match decode_message(doc) {
            Some(message) if admit(&message) => {
                cache.insert(message.id, message);
            }
            _ => {
                cache.remove(&doc.id);
            }
        }
    }
}

fn publish(shared: &Shared, state: &SyncState) {
    let mut messages: Vec<Message> = state.cache.values().cloned().collect();
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

    let reply_counts = match state.scope {
        Some(ConversationScope::Thread(root_id)) => {
            let count = threads::reply_count(&messages, root_id);
            if count > 0 {
                HashMap::from([(root_id, count)])
            } else {
                HashMap::new()
            }
        }
        _ => {
            let replies: Vec<Message> = state.replies.values().cloned().collect();
            threads::reply_counts(&replies)
        }
    };

    shared.view.send_replace(ConversationView {
        scope: state.scope,
        has_messages: !messages.is_empty(),
        messages: Arc::new(messages),
        loaded: state.loaded,
        reply_counts: Arc::new(reply_counts),
        thread_root: state.root.clone(),
    });
}
