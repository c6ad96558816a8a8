use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use parley_db::{ChangeFeed, FeedResult};
use parley_types::events::Snapshot;
use parley_types::models::Message;
use parley_types::query::{Collection, Filter, Query};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::messages::decode_message;
use crate::scoped::ScopedFeed;

/// Replies to `parent_id`, in input order.
pub fn replies_of(messages: &[Message], parent_id: Uuid) -> Vec<&Message> {
    messages
        .iter()
        .filter(|m| m.thread_id == Some(parent_id))
        .collect()
}

pub fn reply_count(messages: &[Message], root_id: Uuid) -> usize {
    messages
        .iter()
        .filter(|m| m.thread_id == Some(root_id))
        .count()
}

/// Reply counts for every root that has at least one reply.
pub fn reply_counts(messages: &[Message]) -> HashMap<Uuid, usize> {
    let mut counts = HashMap::new();
    for root_id in messages.iter().filter_map(|m| m.thread_id) {
        *counts.entry(root_id).or_insert(0) += 1;
    }
    counts
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum ThreadState {
    #[default]
    Closed,
    /// Tearing down the previous root's feeds before loading another.
    Closing { root_id: Uuid },
    /// Feeds are open; the root has not arrived yet.
    Loading { root_id: Uuid },
    Open { root: Message, replies: Vec<Message> },
}

impl ThreadState {
    pub fn root_id(&self) -> Option<Uuid> {
        match self {
            Self::Closed => None,
            Self::Closing { root_id } | Self::Loading { root_id } => Some(*root_id),
            Self::Open { root, .. } => Some(root.id),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    pub fn replies(&self) -> &[Message] {
        match self {
            Self::Open { replies, .. } => replies,
            _ => &[],
        }
    }

    pub fn reply_count(&self) -> usize {
        match self {
            Self::Open { root, replies } => reply_count(replies, root.id),
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ThreadFeed {
    Root,
    Replies,
}

#[derive(Default)]
struct ThreadInner {
    epoch: u64,
    root_id: Option<Uuid>,
    root: Option<Message>,
    replies: HashMap<Uuid, Message>,
    feeds: Vec<ScopedFeed>,
}

struct ThreadShared {
    inner: Mutex<ThreadInner>,
    state: watch::Sender<ThreadState>,
}

impl ThreadShared {
    fn lock(&self) -> MutexGuard<'_, ThreadInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Follows one thread at a time: its root message and its replies.
///
/// Opening another root tears the current feeds down before the new ones
/// are issued, so two reply subscriptions never coexist.
pub struct ThreadResolver<F: ChangeFeed> {
    feed: Arc<F>,
    shared: Arc<ThreadShared>,
}

impl<F: ChangeFeed> ThreadResolver<F> {
    pub fn new(feed: Arc<F>) -> Self {
        let (state, _) = watch::channel(ThreadState::Closed);
        Self {
            feed,
            shared: Arc::new(ThreadShared {
                inner: Mutex::new(ThreadInner::default()),
                state,
            }),
        }
    }

    pub fn state(&self) -> ThreadState {
        self.shared.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ThreadState> {
        self.shared.state.subscribe()
    }

    /// Start following `root`. A no-op if it is already the current root.
    pub fn open(&self, root: &Message) {
        let mut inner = self.shared.lock();
        if inner.root_id == Some(root.id) {
            return;
        }

        if let Some(previous) = inner.root_id {
            self.shared.state.send_replace(ThreadState::Closing { root_id: previous });
            debug!("Closing thread {}", previous);
        }
        teardown(&mut inner);

        inner.root_id = Some(root.id);
        let epoch = inner.epoch;
        self.shared.state.send_replace(ThreadState::Loading { root_id: root.id });

        let root_query = Query::new(Collection::Messages).filter(Filter::eq("id", root.id));
        let replies_query = Query::new(Collection::Messages)
            .filter(Filter::eq("threadId", root.id))
            .order_by("timestamp");
        inner.feeds = vec![
            self.spawn(epoch, ThreadFeed::Root, root_query),
            self.spawn(epoch, ThreadFeed::Replies, replies_query),
        ];
        info!("Opened thread {}", root.id);
    }

    pub fn close(&self) {
        let mut inner = self.shared.lock();
        teardown(&mut inner);
        self.shared.state.send_replace(ThreadState::Closed);
    }

    fn spawn(&self, epoch: u64, role: ThreadFeed, query: Query) -> ScopedFeed {
        let shared = Arc::downgrade(&self.shared);
        ScopedFeed::spawn(self.feed.as_ref(), query, move |item| {
            apply(&shared, epoch, role, item);
        })
    }
}

impl<F: ChangeFeed> Drop for ThreadResolver<F> {
    fn drop(&mut self) {
        teardown(&mut self.shared.lock());
    }
}

/// Release feeds and forget the current root. Bumps the epoch so anything
/// already in flight is discarded.
fn teardown(inner: &mut ThreadInner) {
    inner.feeds.clear();
    inner.epoch += 1;
    inner.root_id = None;
    inner.root = None;
    inner.replies.clear();
}

fn apply(shared: &Weak<ThreadShared>, epoch: u64, role: ThreadFeed, item: FeedResult<Snapshot>) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let mut inner = shared.lock();
    if inner.epoch != epoch {
        debug!("Discarding stale thread snapshot");
        return;
    }
    let Some(root_id) = inner.root_id else {
        return;
    };

    let snapshot = match item {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!("Thread {} feed error, keeping last state: {}", root_id, e);
            return;
        }
    };

    match role {
        ThreadFeed::Root => match snapshot.documents.first().and_then(decode_message) {
            Some(root) => inner.root = Some(root),
            None => {
                info!("Thread root {} is gone, closing", root_id);
                teardown(&mut inner);
                shared.state.send_replace(ThreadState::Closed);
                return;
            }
        },
        ThreadFeed::Replies => {
            for id in snapshot.removed() {
                inner.replies.remove(&id);
            }
            for message in snapshot.documents.iter().filter_map(decode_message) {
                if message.thread_id == Some(root_id) {
                    inner.replies.insert(message.id, message);
                } else {
                    inner.replies.remove(&message.id);
                }
            }
        }
    }

    let state = match &inner.root {
        None => ThreadState::Loading { root_id },
        Some(root) => {
            let mut replies: Vec<Message> = inner.replies.values().cloned().collect();
            replies.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
            ThreadState::Open {
                root: root.clone(),
                replies,
            }
        }
    };
    shared.state.send_replace(state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn message(thread_id: Option<Uuid>, ms: i64) -> Message {
        Message {
            id: Uuid::new_v4(),
            text: "x".into(),
            user_id: Uuid::nil(),
            username: "u".into(),
            channel_id: Some(Uuid::nil()),
            recipient_id: None,
            thread_id,
            timestamp: Utc.timestamp_millis_opt(ms).unwrap(),
            reactions: vec![],
            mentions: vec![],
            edited: false,
            edited_at: None,
        }
    }

    #[test]
    fn replies_are_exactly_the_children() {
        let root = message(None, 1);
        let other = message(None, 2);
        let a = message(Some(root.id), 3);
        let b = message(Some(other.id), 4);
        let c = message(Some(root.id), 5);
        let all = vec![root.clone(), other.clone(), a.clone(), b.clone(), c.clone()];

        let ids: Vec<Uuid> = replies_of(&all, root.id).iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![a.id, c.id]);
        assert_eq!(reply_count(&all, root.id), 2);
        assert_eq!(reply_count(&all, a.id), 0);

        let counts = reply_counts(&all);
        assert_eq!(counts.get(&root.id), Some(&2));
        assert_eq!(counts.get(&other.id), Some(&1));
        assert_eq!(counts.len(), 2);
    }

    #[test]
    fn state_accessors() {
        let root = message(None, 1);
        let reply = message(Some(root.id), 2);
        let open = ThreadState::Open {
            root: root.clone(),
            replies: vec![reply],
        };
        assert_eq!(open.root_id(), Some(root.id));
        assert_eq!(open.reply_count(), 1);
        assert!(open.is_open());
        assert_eq!(ThreadState::Loading { root_id: root.id }.reply_count(), 0);
        assert!(ThreadState::Closed.replies().is_empty());
    }
}
