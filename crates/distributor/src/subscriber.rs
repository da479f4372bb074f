//! Subscriber records: one per open streaming connection.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use faultline_policy::CompiledRuleSet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Opaque subscriber identifier.
pub type SubscriberId = Uuid;

/// The consumer half handed to the streaming endpoint: a bounded snapshot
/// feed plus a done-signal that fires on eviction or distributor shutdown.
pub struct Subscription {
    pub id: SubscriberId,
    pub rx: mpsc::Receiver<Arc<CompiledRuleSet>>,
    pub closed: CancellationToken,
}

/// The distributor-owned half of a subscriber.
pub(crate) struct SubscriberHandle {
    pub(crate) id: SubscriberId,
    pub(crate) tx: mpsc::Sender<Arc<CompiledRuleSet>>,
    /// Consecutive failed enqueues; any success resets it.
    pub(crate) misses: AtomicU32,
    pub(crate) closed: CancellationToken,
}

impl SubscriberHandle {
    pub(crate) fn new(buffer: usize) -> (Arc<Self>, Subscription) {
        let id = Uuid::now_v7();
        let (tx, rx) = mpsc::channel(buffer);
        let closed = CancellationToken::new();

        let handle = Arc::new(Self {
            id,
            tx,
            misses: AtomicU32::new(0),
            closed: closed.clone(),
        });
        let subscription = Subscription { id, rx, closed };
        (handle, subscription)
    }

    /// Records one failed enqueue; returns the consecutive-miss count.
    pub(crate) fn record_miss(&self) -> u32 {
        self.misses.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn reset_misses(&self) {
        self.misses.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_miss_counting() {
        let (handle, _subscription) = SubscriberHandle::new(4);
        assert_eq!(handle.record_miss(), 1);
        assert_eq!(handle.record_miss(), 2);
        handle.reset_misses();
        assert_eq!(handle.record_miss(), 1);
    }

    #[tokio::test]
    async fn test_handle_feeds_subscription() {
        let (handle, mut subscription) = SubscriberHandle::new(4);
        let snapshot = Arc::new(CompiledRuleSet::empty());
        handle.tx.try_send(snapshot.clone()).unwrap();

        let received = subscription.rx.recv().await.unwrap();
        assert_eq!(received.version, snapshot.version);
    }
}
