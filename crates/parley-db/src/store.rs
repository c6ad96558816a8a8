use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use parley_types::document::Document;
use parley_types::events::{ChangeKind, ChangeNotice, DocumentChange, Snapshot};
use parley_types::query::{Mutation, MutationOutcome, Query};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::Database;
use crate::feed::{ChangeFeed, FeedError, FeedResult, Subscription, SubscriptionSink};

/// SQLite-backed document store with live queries.
///
/// Every committed mutation is broadcast as a [`ChangeNotice`]; each live
/// subscription re-evaluates its query when a notice touches its
/// collection and delivers the diff.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    db: Database,

    /// Committed changes, fanned out to every live query.
    changes: broadcast::Sender<ChangeNotice>,
}

impl Store {
    pub fn new(db: Database) -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(StoreInner { db, changes }),
        }
    }

    pub fn open(path: &Path) -> anyhow::Result<Self> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    /// Run blocking database work off the async runtime.
    async fn blocking<F, T>(&self, f: F) -> FeedResult<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner.db))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                FeedError::Transient(e.to_string())
            })?
            .map_err(classify)
    }
}

/// Map database failures onto the feed taxonomy. Constraint violations are
/// the caller's problem; everything else is worth retrying.
fn classify(err: anyhow::Error) -> FeedError {
    match err.downcast_ref::<rusqlite::Error>() {
        Some(rusqlite::Error::SqliteFailure(e, msg))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            FeedError::Rejected(msg.clone().unwrap_or_else(|| e.to_string()))
        }
        _ => FeedError::Transient(format!("{:#}", err)),
    }
}

impl ChangeFeed for Store {
    fn subscribe(&self, query: Query) -> Subscription {
        let (sink, subscription) = Subscription::channel();
        // Subscribe before the first evaluation so no commit slips between them.
        let changes = self.inner.changes.subscribe();
        tokio::spawn(run_live_query(self.clone(), query, sink, changes));
        subscription
    }

    fn get(&self, query: Query) -> impl Future<Output = FeedResult<Vec<Document>>> + Send {
        let store = self.clone();
        async move { store.blocking(move |db| db.run_query(&query)).await }
    }

    fn mutate(&self, mutation: Mutation) -> impl Future<Output = FeedResult<MutationOutcome>> + Send {
        let store = self.clone();
        async move {
            let collection = mutation.collection();
            let target = match &mutation {
                Mutation::Update { id, .. } | Mutation::Delete { id, .. } => Some(*id),
                Mutation::Insert { .. } => None,
            };

            let notice = store.blocking(move |db| db.apply_mutation(&mutation)).await?;
            let Some(notice) = notice else {
                return Err(FeedError::NotFound {
                    collection,
                    id: target.unwrap_or_default(),
                });
            };

            // No receivers is fine: nobody is watching.
            let _ = store.inner.changes.send(notice);
            Ok(MutationOutcome { id: notice.id })
        }
    }
}

async fn run_live_query(
    store: Store,
    query: Query,
    sink: SubscriptionSink,
    mut changes: broadcast::Receiver<ChangeNotice>,
) {
    let mut previous: Option<HashMap<Uuid, Map<String, Value>>> = None;
    let mut dirty = true;

    loop {
        if dirty {
            dirty = false;
            let delivery = match store.get(query.clone()).await {
                Ok(documents) => {
                    let snapshot = match &previous {
                        None => Snapshot::initial(documents),
                        Some(prev) => diff(prev, documents),
                    };
                    let first = previous.is_none();
                    previous = Some(
                        snapshot
                            .documents
                            .iter()
                            .map(|d| (d.id, d.data.clone()))
                            .collect(),
                    );
                    (first || !snapshot.changes.is_empty()).then_some(Ok(snapshot))
                }
                Err(e) => {
                    warn!("Live query on {} failed: {}", query.collection, e);
                    Some(Err(e))
                }
            };

            if let Some(item) = delivery {
                if !sink.send(item) {
                    break;
                }
            }
        }

        tokio::select! {
            _ = sink.cancelled() => break,
            result = changes.recv() => match result {
                Ok(notice) => dirty = notice.concerns(&query),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Live query on {} lagged by {} changes, re-reading", query.collection, n);
                    dirty = true;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    debug!("Live query on {} closed", query.collection);
}

fn diff(previous: &HashMap<Uuid, Map<String, Value>>, documents: Vec<Document>) -> Snapshot {
    let mut changes = Vec::new();
    for doc in &documents {
        match previous.get(&doc.id) {
            None => changes.push(DocumentChange {
                kind: ChangeKind::Added,
                id: doc.id,
            }),
            Some(data) if *data != doc.data => changes.push(DocumentChange {
                kind: ChangeKind::Modified,
                id: doc.id,
            }),
            Some(_) => {}
        }
    }

    let current: HashSet<Uuid> = documents.iter().map(|d| d.id).collect();
    let mut removed: Vec<Uuid> = previous
        .keys()
        .filter(|id| !current.contains(id))
        .copied()
        .collect();
    removed.sort();
    changes.extend(removed.into_iter().map(|id| DocumentChange {
        kind: ChangeKind::Removed,
        id,
    }));

    Snapshot { documents, changes }
}
