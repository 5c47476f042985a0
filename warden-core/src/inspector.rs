//! Push-based script inspection.
//!
//! Hosts hand newly seen executable content to a [`ScriptInspector`]; the
//! runtime's inspection task scans each submission.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptSubmission {
    pub content: String,
    pub origin: String,
    pub received_at: DateTime<Utc>,
}

/// Cloneable submission handle. Never blocks the caller.
#[derive(Debug, Clone)]
pub struct ScriptInspector {
    tx: mpsc::Sender<ScriptSubmission>,
    dropped: Arc<AtomicU64>,
}

pub fn script_channel(capacity: usize) -> (ScriptInspector, mpsc::Receiver<ScriptSubmission>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ScriptInspector {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

impl ScriptInspector {
    /// Queue `content` for scanning. Returns false if the queue was full.
    pub fn submit(&self, content: impl Into<String>, origin: impl Into<String>) -> bool {
        let submission = ScriptSubmission {
            content: content.into(),
            origin: origin.into(),
            received_at: Utc::now(),
        };
        match self.tx.try_send(submission) {
            Ok(()) => true,
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "Script submission dropped");
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
