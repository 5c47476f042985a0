//! Bounded hand-off between the scan path and the dispatch task.
//!
//! Enqueueing never blocks: when the queue is full the newest alert is
//! dropped and counted.

use crate::event::ThreatEvent;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

#[derive(Debug, Default)]
struct QueueStats {
    enqueued: AtomicU64,
    dropped: AtomicU64,
}

/// Producer side. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AlertQueue {
    tx: mpsc::Sender<Arc<ThreatEvent>>,
    stats: Arc<QueueStats>,
    capacity: usize,
}

/// Consumer side, owned by whoever dispatches.
#[derive(Debug)]
pub struct AlertQueueReceiver {
    rx: mpsc::Receiver<Arc<ThreatEvent>>,
}

pub fn alert_queue(capacity: usize) -> (AlertQueue, AlertQueueReceiver) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    (
        AlertQueue {
            tx,
            stats: Arc::new(QueueStats::default()),
            capacity,
        },
        AlertQueueReceiver { rx },
    )
}

impl AlertQueue {
    /// Returns false when the alert was dropped.
    pub fn try_enqueue(&self, event: Arc<ThreatEvent>) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(event)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(threat_id = %event.id, "Alert queue full, dropping alert");
                false
            }
            Err(TrySendError::Closed(event)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(threat_id = %event.id, "Alert queue closed, dropping alert");
                false
            }
        }
    }

    pub fn enqueued(&self) -> u64 {
        self.stats.enqueued.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    /// Alerts currently waiting.
    pub fn pending(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl AlertQueueReceiver {
    pub async fn recv(&mut self) -> Option<Arc<ThreatEvent>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<ThreatEvent>> {
        self.rx.try_recv().ok()
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
    use crate::event::{ThreatSeverity, ThreatSignal, ThreatType};
    use chrono::Utc;

    fn event(id: &str) -> Arc<ThreatEvent> {
        let signal = ThreatSignal::new(ThreatType::AUTH_FAILURE, ThreatSeverity::Low, "1.1.1.1", Utc::now());
        Arc::new(ThreatEvent::from_signal(id.into(), signal))
    }

    #[test]
    fn test_full_queue_drops_newest() {
        let (queue, mut rx) = alert_queue(2);
        assert!(queue.try_enqueue(event("a")));
        assert!(queue.try_enqueue(event("b")));
        assert!(!queue.try_enqueue(event("c")));

        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.enqueued(), 2);
        assert_eq!(queue.pending(), 2);
        assert_eq!(rx.try_recv().unwrap().id, "a");
        assert_eq!(rx.try_recv().unwrap().id, "b");
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_clones_share_counters() {
        let (queue, mut rx) = alert_queue(4);
        let other = queue.clone();
        other.try_enqueue(event("x"));
        assert_eq!(queue.enqueued(), 1);
        assert_eq!(rx.recv().await.unwrap().id, "x");
        assert_eq!(queue.pending(), 0);
    }
}
