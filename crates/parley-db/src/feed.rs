//! The change-feed contract the sync engine is written against.
//!
//! A feed answers one-shot queries, applies mutations, and runs live
//! subscriptions that deliver an initial snapshot followed by one snapshot
//! per change to the result set.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::stream::Stream;
use parley_types::document::Document;
use parley_types::events::Snapshot;
use parley_types::query::{Collection, Mutation, MutationOutcome, Query};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    /// Network or store hiccup. Callers keep whatever they last had.
    #[error("transient feed error: {0}")]
    Transient(String),

    #[error("{collection} document {id} not found")]
    NotFound { collection: Collection, id: Uuid },

    /// The store refused the write, e.g. a uniqueness constraint.
    #[error("mutation rejected: {0}")]
    Rejected(String),
}

pub type FeedResult<T> = Result<T, FeedError>;

pub trait ChangeFeed: Send + Sync + 'static {
    /// Open a live query. Returns immediately; snapshots arrive on the
    /// returned subscription until it is cancelled or dropped.
    fn subscribe(&self, query: Query) -> Subscription;

    fn get(&self, query: Query) -> impl Future<Output = FeedResult<Vec<Document>>> + Send;

    fn mutate(&self, mutation: Mutation) -> impl Future<Output = FeedResult<MutationOutcome>> + Send;
}

/// Receiving half of a live query. Dropping it cancels the producer.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<FeedResult<Snapshot>>,
    token: CancellationToken,
}

/// Producing half of a live query, held by the feed implementation.
pub struct SubscriptionSink {
    tx: mpsc::UnboundedSender<FeedResult<Snapshot>>,
    token: CancellationToken,
}

impl Subscription {
    pub fn channel() -> (SubscriptionSink, Subscription) {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        (
            SubscriptionSink {
                tx,
                token: token.clone(),
            },
            Subscription { rx, token },
        )
    }

    /// Next delivery, or `None` once the producer has finished.
    pub async fn recv(&mut self) -> Option<FeedResult<Snapshot>> {
        if self.token.is_cancelled() {
            return None;
        }
        self.rx.recv().await
    }

    /// Stop delivery. Does not wait for the producer to notice.
    pub fn cancel(&mut self) {
        self.token.cancel();
        self.rx.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Handle that cancels this subscription from outside the task reading it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl Stream for Subscription {
    type Item = FeedResult<Snapshot>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.token.is_cancelled() {
            return Poll::Ready(None);
        }
        this.rx.poll_recv(cx)
    }
}

impl SubscriptionSink {
    /// Deliver an item. Returns false once the subscriber is gone.
    pub fn send(&self, item: FeedResult<Snapshot>) -> bool {
        !self.token.is_cancelled() && self.tx.send(item).is_ok()
    }

    pub async fn cancelled(&self) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn dropping_the_subscription_cancels_the_sink() {
        let (sink, subscription) = Subscription::channel();
        assert!(sink.send(Ok(Snapshot::default())));
        drop(subscription);
        assert!(sink.is_cancelled());
        assert!(!sink.send(Ok(Snapshot::default())));
        sink.cancelled().await;
    }

    #[tokio::test]
    async fn cancel_token_reaches_the_sink() {
        let (sink, subscription) = Subscription::channel();
        subscription.cancel_token().cancel();
        assert!(subscription.is_cancelled());
        assert!(sink.is_cancelled());
        assert!(!sink.send(Ok(Snapshot::default())));
    }

    #[tokio::test]
    async fn cancel_discards_pending_deliveries() {
        let (sink, mut subscription) = Subscription::channel();
        sink.send(Err(FeedError::Transient("boom".into())));
        subscription.cancel();
        assert!(subscription.recv().await.is_none());
        assert!(subscription.next().await.is_none());
    }

    #[tokio::test]
    async fn deliveries_arrive_in_order() {
        let (sink, mut subscription) = Subscription::channel();
        sink.send(Err(FeedError::Transient("first".into())));
        sink.send(Ok(Snapshot::default()));
        drop(sink);

        assert_eq!(
            subscription.recv().await,
            Some(Err(FeedError::Transient("first".into())))
        );
        assert_eq!(subscription.next().await, Some(Ok(Snapshot::default())));
        assert!(subscription.recv().await.is_none());
    }
}
