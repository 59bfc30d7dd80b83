//! Top-level orchestrator: accepts `enqueue(file)`, owns the persistent
//! queue and a global concurrency gate, drives one scheduler per active
//! upload, and emits progress/state events.

use crate::config::EngineConfig;
use crate::error::CoreError;
use crate::events::{now, Event, EventBus};
use crate::gate::ConcurrencyGate;
use crate::host::FileSource;
use crate::protocol::{ProtocolClient, ProtocolConfig};
use crate::queue::{UploadQueueDb, UploadRecord, UploadStatus};
use crate::retry::RetryPolicy;
use crate::scheduler::UploadScheduler;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

pub struct EnqueueOptions {
    pub priority: i32,
    pub content_type: Option<String>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            content_type: None,
        }
    }
}

/// Single top-level object consumers construct and drive. Workers run
/// under a semaphore-backed global concurrency gate; each active upload
/// gets its own [`UploadScheduler`] instance, tracked in a concurrent map
/// so `pause`/`resume`/`cancel` can reach it without a central lock.
pub struct Engine {
    config: EngineConfig,
    host: Arc<dyn FileSource>,
    queue: Arc<UploadQueueDb>,
    gate: Arc<ConcurrencyGate>,
    retry: Arc<RetryPolicy>,
    protocol: Arc<ProtocolClient>,
    events: EventBus,
    active: Arc<DashMap<String, Arc<UploadScheduler>>>,
    active_count: Arc<AtomicUsize>,
    shutting_down: Arc<std::sync::atomic::AtomicBool>,
    upload_permits: Arc<Semaphore>,
}

impl Engine {
    pub fn new(config: EngineConfig, host: Arc<dyn FileSource>, queue: Arc<UploadQueueDb>) -> Result<Self, CoreError> {
        config.validate()?;

        let protocol = Arc::new(ProtocolClient::new(ProtocolConfig {
            base_url: config.base_url.clone(),
            request_timeout: config.request.timeout,
            commit_timeout: config.request.commit_timeout,
        })?);

        let gate = ConcurrencyGate::new(crate::gate::GateConfig {
            min_parallelism: config.gate.min_parallelism,
            max_parallelism: config.gate.max_parallelism,
            initial_parallelism: config.gate.initial_parallelism,
            adaptive: config.gate.adaptive,
            sample_window: config.gate.sample_window,
        });

        let upload_permits = Arc::new(Semaphore::new(config.max_concurrent_uploads.max(1)));

        Ok(Self {
            retry: Arc::new(RetryPolicy::new(config.retry.clone())),
            protocol,
            gate,
            config,
            host,
            queue,
            events: EventBus::new(256),
            active: Arc::new(DashMap::new()),
            active_count: Arc::new(AtomicUsize::new(0)),
            shutting_down: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            upload_permits,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Enqueues a new upload. Rejects past `max_queue_length` with
    /// `QueueFull`-shaped `InvalidArgument`; callers should treat any
    /// `Err` from this call as synchronous back-pressure.
    pub async fn enqueue(
        &self,
        source_path: PathBuf,
        options: EnqueueOptions,
    ) -> Result<String, CoreError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(CoreError::InvalidArgument("engine is shutting down".into()));
        }

        let queued = self
            .queue
            .list_by_status(&[
                UploadStatus::Queued,
                UploadStatus::Hashing,
                UploadStatus::Probing,
                UploadStatus::Uploading,
                UploadStatus::Committing,
            ])
            .map_err(|e| CoreError::Other(e))?;
        if queued.len() >= self.config.max_queue_length {
            return Err(CoreError::InvalidArgument("QueueFull".into()));
        }

        let info = self.host.file_info(&source_path).await?;
        let id = Uuid::new_v4().to_string();
        let sequence = self.queue.next_sequence().map_err(CoreError::Other)?;

        let mut record = UploadRecord::new(
            id.clone(),
            info.name,
            source_path.to_string_lossy().to_string(),
            info.size as i64,
            options.content_type.unwrap_or(info.content_type),
            self.config.chunk_size as i64,
            options.priority,
            sequence,
        );
        record.seal();
        self.queue.put(&record).map_err(CoreError::Other)?;

        self.events.emit(Event::Enqueued {
            upload_id: id.clone(),
            timestamp: now(),
        });

        self.spawn_scheduler(source_path, record);
        self.emit_queue_status();
        Ok(id)
    }

    fn emit_queue_status(&self) {
        let active = self.active_count.load(Ordering::SeqCst);
        let queued = self
            .queue
            .list_by_status(&[UploadStatus::Queued])
            .map(|r| r.len())
            .unwrap_or(0);
        self.events.emit(Event::QueueStatusChanged {
            timestamp: now(),
            queued,
            active,
        });
    }

    fn spawn_scheduler(&self, source_path: PathBuf, record: UploadRecord) {
        let id = record.id.clone();
        let scheduler = UploadScheduler::new(
            source_path,
            self.host.clone(),
            self.protocol.clone(),
            self.queue.clone(),
            self.gate.clone(),
            self.retry.clone(),
            self.events.clone(),
            self.config.clone(),
            record,
            self.upload_permits.clone(),
        );

        self.active.insert(id.clone(), scheduler.clone());
        self.active_count.fetch_add(1, Ordering::SeqCst);

        let active = self.active.clone();
        let active_count = self.active_count.clone();
        let events = self.events.clone();
        let queue = self.queue.clone();
        tokio::spawn(async move {
            if let Err(err) = scheduler.run().await {
                warn!(upload_id = %id, error = %err, "upload scheduler exited with error");
            }
            active.remove(&id);
            let remaining = active_count.fetch_sub(1, Ordering::SeqCst) - 1;
            let queued = queue
                .list_by_status(&[UploadStatus::Queued])
                .map(|r| r.len())
                .unwrap_or(0);
            events.emit(Event::QueueStatusChanged {
                timestamp: now(),
                queued,
                active: remaining,
            });
        });
    }

    /// Resumes uploads left in a non-terminal state from a previous run;
    /// call once after constructing the engine against an existing queue.
    pub fn resume_incomplete(&self) -> Result<usize, CoreError> {
        let records = self
            .queue
            .list_by_status(&[
                UploadStatus::Queued,
                UploadStatus::Hashing,
                UploadStatus::Probing,
                UploadStatus::Uploading,
                UploadStatus::Committing,
            ])
            .map_err(CoreError::Other)?;

        let count = records.len();
        for record in records {
            let path = PathBuf::from(record.file_path.clone());
            info!(upload_id = %record.id, "resuming incomplete upload from persistent queue");
            self.spawn_scheduler(path, record);
        }
        Ok(count)
    }

    pub async fn pause(&self, id: &str) -> Result<(), CoreError> {
        match self.active.get(id) {
            Some(scheduler) => {
                scheduler.pause().await;
                Ok(())
            }
            None => Err(CoreError::InvalidArgument(format!("no active upload {id}"))),
        }
    }

    pub async fn resume(&self, id: &str) -> Result<(), CoreError> {
        if let Some(scheduler) = self.active.get(id) {
            scheduler.resume().await;
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                if let Err(err) = scheduler.run().await {
                    warn!(error = %err, "resumed scheduler exited with error");
                }
            });
            return Ok(());
        }

        let record = self
            .queue
            .get(id)
            .map_err(CoreError::Other)?
            .ok_or_else(|| CoreError::InvalidArgument(format!("no such upload {id}")))?;
        let path = PathBuf::from(record.file_path.clone());
        self.spawn_scheduler(path, record);
        Ok(())
    }

    pub async fn cancel(&self, id: &str) -> Result<(), CoreError> {
        match self.active.get(id) {
            Some(scheduler) => {
                scheduler.cancel_upload().await;
                Ok(())
            }
            None => Err(CoreError::InvalidArgument(format!("no active upload {id}"))),
        }
    }

    pub async fn status(&self, id: &str) -> Result<Option<UploadRecord>, CoreError> {
        if let Some(scheduler) = self.active.get(id) {
            return Ok(Some(scheduler.snapshot().await));
        }
        self.queue.get(id).map_err(CoreError::Other)
    }

    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::SeqCst)
    }

    pub fn run_eviction(&self) -> Result<usize, CoreError> {
        self.queue
            .evict(self.config.queue.max_items, self.config.queue.retention.as_secs() as i64)
            .map_err(CoreError::Other)
    }

    /// Stops accepting new enqueues, pauses every active scheduler, and
    /// leaves the persistent queue in a resumable state. Does not wait for
    /// in-flight chunk requests to fully drain beyond their next
    /// suspension point.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let ids: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some(scheduler) = self.active.get(&id) {
                scheduler.pause().await;
            }
        }
        self.gate.shutdown();
        info!("engine shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::LocalFileSource;

    fn test_config(base_url: String) -> EngineConfig {
        let mut config = EngineConfig::new(base_url);
        config.chunk_size = 4;
        config.max_queue_length = 2;
        config
    }

    #[tokio::test]
    async fn enqueue_past_watermark_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(UploadQueueDb::with_path(dir.path().join("q.db")).unwrap());
        let host: Arc<dyn FileSource> = Arc::new(LocalFileSource);
        let engine = Engine::new(test_config("http://127.0.0.1:1".into()), host, queue).unwrap();

        for i in 0..2 {
            let file_path = dir.path().join(format!("f{i}.bin"));
            std::fs::write(&file_path, b"abcd").unwrap();
            engine.enqueue(file_path, EnqueueOptions::default()).await.unwrap();
        }

        let file_path = dir.path().join("f_overflow.bin");
        std::fs::write(&file_path, b"abcd").unwrap();
        let result = engine.enqueue(file_path, EnqueueOptions::default()).await;
        assert!(result.is_err());
    }
}
