//! Latest-value signal cache and bounded frame queue.
//!
//! # Frame queue
//!
//! Inbound frames pass through a [`FrameQueue`] built on a Tokio broadcast channel. Pushing
//! never blocks: when the consumer falls behind, the channel overwrites the oldest frames and
//! the consumer learns how many it lost through `RecvError::Lagged`. [`FrameReceiver`] adds
//! those losses to a shared counter so drops are always visible.
//!
//! Tokio rounds the channel capacity up to the next power of two.
//!
//! # Signal cache
//!
//! [`SignalCache`] maps `(message_id, signal)` to a [`SignalSample`]. Only the decoder worker
//! writes it; any number of readers (procedures, a UI, a reporter) get copied snapshots.

use super::{CanFrame, SignalRef, SignalSample};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

/// Shared map of the latest decoded value per signal.
#[derive(Debug, Default)]
pub struct SignalCache {
    values: RwLock<HashMap<u32, HashMap<String, SignalSample>>>,
}

impl SignalCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the decoded signals of one frame.
    pub fn update<I>(&self, message_id: u32, decoded: I, timestamp: DateTime<Utc>)
    where
        I: IntoIterator<Item = (String, f64)>,
    {
        let mut values = self.values.write();
        let message = values.entry(message_id).or_default();
        for (signal, value) in decoded {
            message.insert(signal, SignalSample { value, timestamp });
        }
    }

    /// Copy of the latest sample for one signal.
    pub fn get(&self, message_id: u32, signal: &str) -> Option<SignalSample> {
        self.values
            .read()
            .get(&message_id)
            .and_then(|m| m.get(signal))
            .copied()
    }

    /// Copy of every cached sample.
    pub fn snapshot(&self) -> Vec<(SignalRef, SignalSample)> {
        let values = self.values.read();
        let mut out: Vec<_> = values
            .iter()
            .flat_map(|(id, signals)| {
                signals
                    .iter()
                    .map(|(name, sample)| (SignalRef::new(*id, name.clone()), *sample))
            })
            .collect();
        out.sort_by(|a, b| {
            (a.0.message_id, &a.0.signal).cmp(&(b.0.message_id, &b.0.signal))
        });
        out
    }

    /// Forget every cached value.
    pub fn clear(&self) {
        self.values.write().clear();
    }
}

/// Bounded, drop-oldest queue of inbound frames.
#[derive(Debug, Clone)]
pub struct FrameQueue {
    tx: broadcast::Sender<CanFrame>,
    dropped: Arc<AtomicU64>,
    capacity: usize,
}

impl FrameQueue {
    /// Create a queue holding at least `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            capacity,
        }
    }

    /// Requested capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue a frame without blocking.
    ///
    /// A frame pushed while nobody is subscribed is counted as dropped.
    pub fn push(&self, frame: CanFrame) {
        if self.tx.send(frame).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Attach a consumer. Only frames pushed after this call are delivered.
    pub fn subscribe(&self) -> FrameReceiver {
        FrameReceiver {
            rx: self.tx.subscribe(),
            dropped: Arc::clone(&self.dropped),
        }
    }

    /// Total frames lost to overflow so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer side of a [`FrameQueue`].
#[derive(Debug)]
pub struct FrameReceiver {
    rx: broadcast::Receiver<CanFrame>,
    dropped: Arc<AtomicU64>,
}

impl FrameReceiver {
    /// Next frame, or `None` once every producer is gone.
    pub async fn recv(&mut self) -> Option<CanFrame> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    let total = self.dropped.fetch_add(n, Ordering::Relaxed) + n;
                    warn!(
                        dropped = n,
                        total_dropped = total,
                        "Frame queue overflow, oldest frames discarded"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u32, byte: u8) -> CanFrame {
        CanFrame::new(id, vec![byte]).unwrap()
    }

    #[test]
    fn cache_returns_copies() {
        let cache = SignalCache::new();
        let t0 = Utc::now();
        cache.update(0x10, vec![("Relay".to_string(), 1.0)], t0);
        let before = cache.get(0x10, "Relay").unwrap();

        cache.update(0x10, vec![("Relay".to_string(), 0.0)], Utc::now());
        assert_eq!(before.value, 1.0);
        assert_eq!(before.timestamp, t0);
        assert_eq!(cache.get(0x10, "Relay").unwrap().value, 0.0);
        assert!(cache.get(0x11, "Relay").is_none());
    }

    #[test]
    fn snapshot_is_sorted() {
        let cache = SignalCache::new();
        let now = Utc::now();
        cache.update(0x20, vec![("B".to_string(), 2.0)], now);
        cache.update(
            0x10,
            vec![("Z".to_string(), 1.0), ("A".to_string(), 0.5)],
            now,
        );
        let names: Vec<_> = cache
            .snapshot()
            .into_iter()
            .map(|(r, _)| r.to_string())
            .collect();
        assert_eq!(names, vec!["0x10:A", "0x10:Z", "0x20:B"]);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let queue = FrameQueue::new(4);
        let mut rx = queue.subscribe();

        for i in 0..10u8 {
            queue.push(frame(0x10, i));
        }

        // The six oldest are gone; the newest four survive in order.
        let mut received = Vec::new();
        for _ in 0..4 {
            received.push(rx.recv().await.unwrap().data[0]);
        }
        assert_eq!(received, vec![6, 7, 8, 9]);
        assert_eq!(queue.dropped(), 6);
    }

    #[tokio::test]
    async fn closes_when_queue_dropped() {
        let queue = FrameQueue::new(8);
        let mut rx = queue.subscribe();
        queue.push(frame(0x1, 0));
        drop(queue);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn push_without_consumer_is_counted() {
        let queue = FrameQueue::new(8);
        queue.push(frame(0x1, 0));
        assert_eq!(queue.dropped(), 1);
    }
}
