//! Status reporting: every decision the runtime makes, including "no
//! action", is published as a categorized update with a human-readable
//! message.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// One status update.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StatusUpdate {
    /// Stable category ("trigger", "order", "reconcile", "safety", ...).
    pub category: String,
    /// Complete sentence a human can read without the payload.
    pub message: String,
    /// Structured detail for machine consumers.
    pub payload: Value,
    pub at: DateTime<Utc>,
}

/// Destination for status updates. Implementations may write to a
/// database, a websocket, or a log; the runtime does not care.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish(&self, update: StatusUpdate);
}

/// Sink that just logs.
pub struct LogStatusSink;

#[async_trait]
impl StatusSink for LogStatusSink {
    async fn publish(&self, update: StatusUpdate) {
        tracing::info!(category = %update.category, "{}", update.message);
    }
}

/// Bounded fire-and-forget bridge between the runtime and a sink. The
/// runtime never awaits the sink; a full queue drops the update with a
/// warning rather than stalling evaluation.
#[derive(Clone)]
pub struct StatusForwarder {
    tx: mpsc::Sender<StatusUpdate>,
}

impl StatusForwarder {
    /// Spawns the drain task for `sink`.
    pub fn spawn(sink: std::sync::Arc<dyn StatusSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<StatusUpdate>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                sink.publish(update).await;
            }
        });
        (Self { tx }, handle)
    }

    /// Enqueues an update without waiting.
    pub fn report(&self, category: &str, payload: Value, message: impl Into<String>) {
        let update = StatusUpdate {
            category: category.to_string(),
            message: message.into(),
            payload,
            at: Utc::now(),
        };
        if let Err(err) = self.tx.try_send(update) {
            warn!(category, error = %err, "status update dropped");
        }
    }
}
