use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Closed set of engine-level event variants. Every event carries the
/// upload id and a timestamp at minimum; the wire-facing names these map
/// to are incidental, subscribers always receive typed payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    Enqueued {
        upload_id: String,
        timestamp: i64,
    },
    HashingProgress {
        upload_id: String,
        timestamp: i64,
        fraction: f64,
    },
    Probed {
        upload_id: String,
        timestamp: i64,
        already_exists: bool,
    },
    ChunkSucceeded {
        upload_id: String,
        timestamp: i64,
        chunk_index: u32,
    },
    ChunkRetried {
        upload_id: String,
        timestamp: i64,
        chunk_index: u32,
        attempt: u32,
        delay_ms: u64,
    },
    ChunkFailed {
        upload_id: String,
        timestamp: i64,
        chunk_index: u32,
        error_kind: String,
        message: String,
    },
    UploadProgress {
        upload_id: String,
        timestamp: i64,
        uploaded_bytes: u64,
        total_bytes: u64,
        completed_chunks: u32,
        total_chunks: u32,
    },
    UploadCompleted {
        upload_id: String,
        timestamp: i64,
        url: String,
    },
    UploadFailed {
        upload_id: String,
        timestamp: i64,
        chunk_index: Option<u32>,
        error_kind: String,
        message: String,
    },
    UploadPaused {
        upload_id: String,
        timestamp: i64,
    },
    UploadResumed {
        upload_id: String,
        timestamp: i64,
    },
    UploadCancelled {
        upload_id: String,
        timestamp: i64,
    },
    QueueStatusChanged {
        timestamp: i64,
        queued: usize,
        active: usize,
    },
}

/// Typed event bus backed by a broadcast channel. Lagging subscribers
/// drop the oldest events rather than blocking the engine; that is
/// acceptable here because the persisted record is always the source of
/// truth and a subscriber can reconcile via `status(id)`.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<Event>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: Event) {
        match self.sender.send(event.clone()) {
            Ok(count) => {
                trace!(subscribers = count, event = ?event, "emitted engine event");
            }
            Err(_) => {
                debug!("emitted event with no active subscribers");
            }
        }
    }
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
