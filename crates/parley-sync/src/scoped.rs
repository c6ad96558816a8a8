use parley_db::{ChangeFeed, FeedResult};
use parley_types::events::Snapshot;
use parley_types::query::Query;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A live query bound to a handler, released when the handle is dropped.
///
/// The handle shares the subscription's own cancellation token, so by the
/// time `drop` returns the feed already sees the subscription as cancelled;
/// the pump task is aborted without waiting on it. The handler is
/// synchronous, so it never observes a half-applied cancellation, but a
/// delivery may already be in flight: consumers that must reject those
/// should tag them (the sync manager uses a scope epoch).
pub struct ScopedFeed {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ScopedFeed {
    /// Must be called from within a tokio runtime.
    pub fn spawn<F, H>(feed: &F, query: Query, mut handler: H) -> Self
    where
        F: ChangeFeed,
        H: FnMut(FeedResult<Snapshot>) + Send + 'static,
    {
        let mut subscription = feed.subscribe(query);
        let token = subscription.cancel_token();
        let cancelled = token.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    item = subscription.recv() => match item {
                        Some(item) => handler(item),
                        None => break,
                    },
                }
            }
            subscription.cancel();
        });

        Self { token, task }
    }

    /// Explicit form of dropping the handle.
    pub fn release(self) {}
}

impl Drop for ScopedFeed {
    fn drop(&mut self) {
        self.token.cancel();
        self.task.abort();
    }
}
