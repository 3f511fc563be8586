//! Bounded per-monitored-item notification queue.
//!
//! Each monitored item gets one queue, backed by a
//! [`tokio::sync::broadcast`] channel with a single receiver.  The producer
//! side ([`QueueSink`]) is owned by the transport and never blocks: when the
//! queue is full the oldest pending notification is overwritten, because
//! only the most recent boolean state of a point matters.  The consumer side
//! ([`NotificationQueue`]) is drained by the subscription engine and counts
//! what it missed.
//!
//! Capacity is rounded up to the next power of two by the channel.
//!
//! Dropping either side closes the queue.  The consumer still drains what is
//! already queued before [`NotificationQueue::recv`] returns `None`.

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use crate::transport::DataChange;

/// Create a queue holding at least `capacity` notifications (minimum 1).
pub fn monitored_queue(capacity: usize) -> (QueueSink, NotificationQueue) {
    let (tx, rx) = broadcast::channel(capacity.max(1));
    (QueueSink { tx }, NotificationQueue { rx, dropped: 0 })
}

/// Producer half, held by the transport.
pub struct QueueSink {
    tx: broadcast::Sender<DataChange>,
}

impl QueueSink {
    /// Enqueue `change`, overwriting the oldest entry on overflow.
    ///
    /// Returns `false` once the consumer has gone away.
    pub fn push(&self, change: DataChange) -> bool {
        self.tx.send(change).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.receiver_count() == 0
    }
}

/// Consumer half, drained by the subscription engine.
pub struct NotificationQueue {
    rx: broadcast::Receiver<DataChange>,
    dropped: u64,
}

impl NotificationQueue {
    /// Next notification, or `None` when the queue is closed and empty.
    pub async fn recv(&mut self) -> Option<DataChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) => return Some(change),
                Err(RecvError::Lagged(missed)) => {
                    debug!(missed, "monitored item queue overflowed");
                    self.dropped += missed;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Notifications discarded so far because the queue was full.  Updated
    /// as the consumer catches up.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gantry_types::NodeId;

    fn change(value: bool) -> DataChange {
        DataChange {
            node_id: NodeId::string(3, "I1"),
            value,
            source_timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn delivers_in_push_order() {
        let (sink, mut queue) = monitored_queue(4);
        assert!(sink.push(change(true)));
        assert!(sink.push(change(false)));
        assert_eq!(queue.len(), 2);
        assert!(queue.recv().await.unwrap().value);
        assert!(!queue.recv().await.unwrap().value);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn overflow_discards_oldest() {
        let (sink, mut queue) = monitored_queue(2);
        sink.push(change(true));
        sink.push(change(false));
        sink.push(change(true));

        // The first `true` was overwritten.
        assert!(!queue.recv().await.unwrap().value);
        assert_eq!(queue.dropped(), 1);
        assert!(queue.recv().await.unwrap().value);
    }

    #[tokio::test]
    async fn dropping_sink_drains_then_ends() {
        let (sink, mut queue) = monitored_queue(4);
        sink.push(change(true));
        drop(sink);
        assert!(queue.recv().await.is_some());
        assert!(queue.recv().await.is_none());
    }

    #[tokio::test]
    async fn recv_wakes_on_later_push() {
        let (sink, mut queue) = monitored_queue(4);
        let waiter = tokio::spawn(async move { queue.recv().await });
        tokio::task::yield_now().await;
        sink.push(change(true));
        let got = waiter.await.unwrap();
        assert_eq!(got.map(|c| c.value), Some(true));
    }

    #[test]
    fn push_after_consumer_dropped_is_refused() {
        let (sink, queue) = monitored_queue(1);
        drop(queue);
        assert!(sink.is_closed());
        assert!(!sink.push(change(true)));
    }
}
