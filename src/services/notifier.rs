//! Completion events for finished uploads.
//!
//! Producers never wait on the consumer: events go through a bounded channel
//! with `try_send`, and an event that does not fit is dropped and counted.

use crate::models::upload::{Metadata, Upload};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tokio::sync::mpsc::{self, Receiver, Sender, error::TrySendError};
use tracing::{debug, info, warn};

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct CompletedUpload {
    pub id: String,
    pub size: u64,
    pub metadata: Metadata,
    pub completed_at: DateTime<Utc>,
}

impl From<&Upload> for CompletedUpload {
    fn from(upload: &Upload) -> Self {
        Self {
            id: upload.id.clone(),
            size: upload.size.unwrap_or(upload.offset),
            metadata: upload.metadata.clone(),
            completed_at: upload.completed_at.unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Clone)]
pub struct CompletionNotifier {
    tx: Sender<CompletedUpload>,
    dropped: Arc<AtomicU64>,
}

impl CompletionNotifier {
    /// Create a notifier and the receiving end of its channel.
    ///
    /// A capacity of zero is bumped to one; tokio channels need room for at
    /// least one event.
    pub fn channel(capacity: usize) -> (Self, Receiver<CompletedUpload>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn notify(&self, event: CompletedUpload) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    upload_id = %event.id,
                    dropped_total = total,
                    "completion buffer full, dropping event"
                );
            }
            Err(TrySendError::Closed(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(upload_id = %event.id, "no completion consumer, dropping event");
            }
        }
    }

    /// Events discarded because the buffer was full or nobody was listening.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Log every completed upload until all notifiers are gone.
pub async fn drain(mut rx: Receiver<CompletedUpload>) {
    while let Some(event) = rx.recv().await {
        info!(
            upload_id = %event.id,
            size = event.size,
            completed_at = %event.completed_at,
            "successfully uploaded a file"
        );
    }
    debug!("completion channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str) -> CompletedUpload {
        CompletedUpload {
            id: id.into(),
            size: 1,
            metadata: Metadata::new(),
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn delivers_in_order() {
        let (notifier, mut rx) = CompletionNotifier::channel(4);
        notifier.notify(event("a"));
        notifier.notify(event("b"));
        assert_eq!(rx.recv().await.unwrap().id, "a");
        assert_eq!(rx.recv().await.unwrap().id, "b");
        assert_eq!(notifier.dropped(), 0);
    }

    #[tokio::test]
    async fn full_buffer_drops_instead_of_blocking() {
        let (notifier, mut rx) = CompletionNotifier::channel(2);
        for id in ["a", "b", "c", "d"] {
            notifier.notify(event(id));
        }
        assert_eq!(notifier.dropped(), 2);
        assert_eq!(rx.recv().await.unwrap().id, "a");
        assert_eq!(rx.recv().await.unwrap().id, "b");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_receiver_counts_as_dropped() {
        let (notifier, rx) = CompletionNotifier::channel(1);
        drop(rx);
        notifier.notify(event("a"));
        assert_eq!(notifier.dropped(), 1);
    }

    #[tokio::test]
    async fn drain_returns_when_senders_are_gone() {
        let (notifier, rx) = CompletionNotifier::channel(1);
        notifier.notify(event("a"));
        drop(notifier);
        drain(rx).await;
    }
}
