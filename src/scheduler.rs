//! Drives a single Upload Record from `Hashing` to a terminal state by
//! orchestrating the digest service, concurrency gate, retry policy,
//! protocol client, and persistent queue.

use crate::config::EngineConfig;
use crate::digest::{digest_file, DigestProgressSink};
use crate::error::CoreError;
use crate::events::{now, Event, EventBus};
use crate::gate::ConcurrencyGate;
use crate::host::FileSource;
use crate::plan::ChunkPlan;
use crate::protocol::{ProbeOutcome, ProtocolClient};
use crate::queue::{UploadQueueDb, UploadRecord, UploadStatus};
use crate::retry::RetryPolicy;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::error;

struct SchedulerProgressSink {
    upload_id: String,
    events: EventBus,
}

impl DigestProgressSink for SchedulerProgressSink {
    fn on_progress(&self, fraction: f64) {
        self.events.emit(Event::HashingProgress {
            upload_id: self.upload_id.clone(),
            timestamp: now(),
            fraction,
        });
    }
}

/// Cooperative signal checked by chunk workers at I/O suspension points.
/// Distinct from cancellation: pausing preserves `uploaded_indices`.
#[derive(Clone, Default)]
pub struct PauseSignal(Arc<AtomicBool>);

impl PauseSignal {
    pub fn is_paused(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, paused: bool) {
        self.0.store(paused, Ordering::SeqCst);
    }
}

pub struct UploadScheduler {
    upload_id: String,
    source_path: PathBuf,
    host: Arc<dyn FileSource>,
    protocol: Arc<ProtocolClient>,
    queue: Arc<UploadQueueDb>,
    gate: Arc<ConcurrencyGate>,
    retry: Arc<RetryPolicy>,
    events: EventBus,
    config: EngineConfig,
    record: Mutex<UploadRecord>,
    cancel: CancellationToken,
    pause: PauseSignal,
    /// Global per-upload budget, distinct from the per-chunk `gate`: bounds
    /// how many uploads run their chunk loop at once, independent of how
    /// many individual chunk requests the gate admits concurrently.
    upload_permits: Arc<Semaphore>,
}

impl UploadScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_path: PathBuf,
        host: Arc<dyn FileSource>,
        protocol: Arc<ProtocolClient>,
        queue: Arc<UploadQueueDb>,
        gate: Arc<ConcurrencyGate>,
        retry: Arc<RetryPolicy>,
        events: EventBus,
        config: EngineConfig,
        record: UploadRecord,
        upload_permits: Arc<Semaphore>,
    ) -> Arc<Self> {
        let upload_id = record.id.clone();
        Arc::new(Self {
            upload_id,
            source_path,
            host,
            protocol,
            queue,
            gate,
            retry,
            events,
            config,
            record: Mutex::new(record),
            cancel: CancellationToken::new(),
            pause: PauseSignal::default(),
            upload_permits,
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn pause_signal(&self) -> PauseSignal {
        self.pause.clone()
    }

    pub async fn snapshot(&self) -> UploadRecord {
        self.record.lock().await.clone()
    }

    /// Runs the record through Hashing → Probing → Uploading → Committing,
    /// or exits early on a terminal status. Intended to be driven once per
    /// `run`/`resume` call by the engine; pause/cancel are observed
    /// cooperatively at each suspension point.
    pub async fn run(self: Arc<Self>) -> Result<(), CoreError> {
        loop {
            let status = self.record.lock().await.status;
            match status {
                UploadStatus::Queued | UploadStatus::Hashing => self.run_hashing().await?,
                UploadStatus::Probing => self.run_probing().await?,
                UploadStatus::Uploading => self.run_uploading().await?,
                UploadStatus::Committing => self.run_committing().await?,
                UploadStatus::Completed
                | UploadStatus::Failed
                | UploadStatus::Cancelled
                | UploadStatus::Paused => return Ok(()),
            }

            let status = self.record.lock().await.status;
            if status.is_terminal() || status == UploadStatus::Paused {
                return Ok(());
            }
        }
    }

    async fn persist(&self, record: &UploadRecord) {
        if let Err(err) = self.queue.put(record) {
            error!(upload_id = %self.upload_id, error = %err, "failed to persist upload record");
        }
    }

    async fn run_hashing(&self) -> Result<(), CoreError> {
        {
            let mut record = self.record.lock().await;
            record.set_status(UploadStatus::Hashing);
            self.persist(&record).await;
        }

        let (file_size, file_name) = {
            let record = self.record.lock().await;
            (record.file_size as u64, record.file_name.clone())
        };

        let sink = SchedulerProgressSink {
            upload_id: self.upload_id.clone(),
            events: self.events.clone(),
        };

        let fingerprint = digest_file(&self.host, &self.source_path, file_size, &sink, &self.cancel).await?;

        let mut record = self.record.lock().await;
        record.fingerprint = fingerprint;
        record.set_status(UploadStatus::Probing);
        self.persist(&record).await;
        let _ = file_name;
        Ok(())
    }

    async fn run_probing(&self) -> Result<(), CoreError> {
        let (fingerprint, file_name, file_size, content_type) = {
            let record = self.record.lock().await;
            (
                record.fingerprint.clone(),
                record.file_name.clone(),
                record.file_size as u64,
                record.content_type.clone(),
            )
        };

        if !self.config.probe_enabled {
            let mut record = self.record.lock().await;
            record.set_status(UploadStatus::Uploading);
            self.persist(&record).await;
            return Ok(());
        }

        let outcome = self
            .protocol
            .probe(&fingerprint, &file_name, file_size, &content_type, &self.cancel)
            .await;

        match outcome {
            ProbeOutcome::Done { url } => {
                let mut record = self.record.lock().await;
                record.result_url = Some(url.clone());
                record.set_status(UploadStatus::Completed);
                self.persist(&record).await;
                self.events.emit(Event::Probed {
                    upload_id: self.upload_id.clone(),
                    timestamp: now(),
                    already_exists: true,
                });
                self.events.emit(Event::UploadCompleted {
                    upload_id: self.upload_id.clone(),
                    timestamp: now(),
                    url,
                });
            }
            ProbeOutcome::Partial { uploaded_chunks } => {
                let mut record = self.record.lock().await;
                record.uploaded_indices = BTreeSet::from_iter(uploaded_chunks);
                record.set_status(UploadStatus::Uploading);
                self.persist(&record).await;
                self.events.emit(Event::Probed {
                    upload_id: self.upload_id.clone(),
                    timestamp: now(),
                    already_exists: false,
                });
            }
        }
        Ok(())
    }

    async fn run_uploading(self: &Arc<Self>) -> Result<(), CoreError> {
        // Global budget: one permit per upload in its chunk loop, held for
        // the whole loop and released on every exit path via normal scope
        // drop. Independent of `gate`, which bounds concurrent chunk POSTs
        // across all uploads.
        let _permit = self
            .upload_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CoreError::Cancelled)?;

        let (plan, fingerprint, uploaded, base_priority) = {
            let record = self.record.lock().await;
            let plan = ChunkPlan::new(record.file_size as u64, record.chunk_size as u64)?;
            (
                plan,
                record.fingerprint.clone(),
                record.uploaded_indices.clone(),
                record.priority,
            )
        };

        let remaining = plan.remaining(&uploaded);
        if remaining.is_empty() {
            let mut record = self.record.lock().await;
            record.set_status(UploadStatus::Committing);
            self.persist(&record).await;
            return Ok(());
        }

        let total = plan.total_chunks;
        let mut drivers = Vec::with_capacity(remaining.len());
        for descriptor in remaining {
            let this = self.clone();
            let fingerprint = fingerprint.clone();
            drivers.push(this.drive_chunk(
                descriptor.index,
                descriptor.start,
                descriptor.end,
                fingerprint,
                total,
                base_priority,
            ));
        }

        for result in futures::future::join_all(drivers).await {
            if let Err(err) = result {
                if err.is_cancelled() {
                    return Err(err);
                }
                // A chunk exhausted its retries: surface it and stop.
                // Sibling drivers already in flight run to completion
                // independently but no more chunks are submitted this round.
                let mut record = self.record.lock().await;
                record.set_status(UploadStatus::Failed);
                self.persist(&record).await;
                self.events.emit(Event::UploadFailed {
                    upload_id: self.upload_id.clone(),
                    timestamp: now(),
                    chunk_index: None,
                    error_kind: err.kind().to_string(),
                    message: err.to_string(),
                });
                return Err(err);
            }
        }

        let mut record = self.record.lock().await;
        if record.is_fully_uploaded() {
            record.set_status(UploadStatus::Committing);
            self.persist(&record).await;
        }
        Ok(())
    }

    /// Drives a single chunk to success or terminal failure, resubmitting a
    /// fresh gate task per attempt rather than holding one gate slot across
    /// the whole retry loop. Each attempt's outcome is recorded by the gate
    /// individually, and retries climb in priority (`base_priority +
    /// attempt - 1`) so they drain ahead of chunks still on their first try.
    async fn drive_chunk(
        self: Arc<Self>,
        index: u32,
        start: u64,
        end: u64,
        fingerprint: String,
        total: u32,
        base_priority: i32,
    ) -> Result<(), CoreError> {
        loop {
            if self.pause.is_paused() {
                return Ok(());
            }
            if self.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }

            let attempt = {
                let mut record = self.record.lock().await;
                record.record_chunk_attempt(index)
            };

            let this = self.clone();
            let chunk_fingerprint = fingerprint.clone();
            let priority = base_priority.saturating_add(attempt as i32 - 1);
            let handle = self.gate.submit(priority, async move {
                this.upload_chunk_attempt(index, start, end, chunk_fingerprint, total).await
            });

            match handle.await {
                Ok(()) => {
                    let mut record = self.record.lock().await;
                    record.record_chunk_success(index);
                    self.persist(&record).await;
                    self.events.emit(Event::ChunkSucceeded {
                        upload_id: self.upload_id.clone(),
                        timestamp: now(),
                        chunk_index: index,
                    });
                    drop(record);
                    self.emit_progress().await;
                    return Ok(());
                }
                Err(err) => match self.retry.next_delay(&err, attempt) {
                    Some(delay) => {
                        self.events.emit(Event::ChunkRetried {
                            upload_id: self.upload_id.clone(),
                            timestamp: now(),
                            chunk_index: index,
                            attempt: attempt + 1,
                            delay_ms: delay.as_millis() as u64,
                        });
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = self.cancel.cancelled() => return Err(CoreError::Cancelled),
                        }
                    }
                    None => {
                        let mut record = self.record.lock().await;
                        record.record_error(err.kind(), err.to_string());
                        self.persist(&record).await;
                        self.events.emit(Event::ChunkFailed {
                            upload_id: self.upload_id.clone(),
                            timestamp: now(),
                            chunk_index: index,
                            error_kind: err.kind().to_string(),
                            message: err.to_string(),
                        });
                        return Err(err);
                    }
                },
            }
        }
    }

    /// A single read-and-POST attempt for one chunk. No retry logic here;
    /// callers (`drive_chunk`) decide whether to resubmit.
    async fn upload_chunk_attempt(
        self: Arc<Self>,
        index: u32,
        start: u64,
        end: u64,
        fingerprint: String,
        total: u32,
    ) -> Result<(), CoreError> {
        if self.cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let bytes = crate::host::read_range(&self.source_path, start, end).await?;
        self.protocol
            .upload_chunk(&fingerprint, index, total, bytes, &self.cancel)
            .await
    }

    /// Emits exact `uploaded_bytes` by summing descriptor lengths for
    /// indices already recorded, rather than approximating from the chunk
    /// count (the final chunk is usually shorter than the rest).
    async fn emit_progress(&self) {
        let (plan, uploaded_indices) = {
            let record = self.record.lock().await;
            match ChunkPlan::new(record.file_size as u64, record.chunk_size as u64) {
                Ok(plan) => (plan, record.uploaded_indices.clone()),
                Err(_) => return,
            }
        };

        let uploaded_bytes: u64 = plan
            .descriptors
            .iter()
            .filter(|d| uploaded_indices.contains(&d.index))
            .map(|d| d.length())
            .sum();

        self.events.emit(Event::UploadProgress {
            upload_id: self.upload_id.clone(),
            timestamp: now(),
            uploaded_bytes,
            total_bytes: plan.file_size,
            completed_chunks: uploaded_indices.len() as u32,
            total_chunks: plan.total_chunks,
        });
    }

    /// Commit keeps its own attempt counter independent of the per-chunk
    /// one: a chunk exhausting its retries does not count against commit,
    /// and vice versa.
    async fn run_committing(&self) -> Result<(), CoreError> {
        let (fingerprint, file_name, total_chunks) = {
            let record = self.record.lock().await;
            let plan = ChunkPlan::new(record.file_size as u64, record.chunk_size as u64)?;
            (record.fingerprint.clone(), record.file_name.clone(), plan.total_chunks)
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.protocol.commit(&fingerprint, &file_name, total_chunks, &self.cancel).await {
                Ok(url) => {
                    let mut record = self.record.lock().await;
                    record.result_url = Some(url.clone());
                    record.set_status(UploadStatus::Completed);
                    self.persist(&record).await;
                    let _ = self.queue.record_completion(true);
                    self.events.emit(Event::UploadCompleted {
                        upload_id: self.upload_id.clone(),
                        timestamp: now(),
                        url,
                    });
                    return Ok(());
                }
                Err(err) => match self.retry.next_delay(&err, attempt) {
                    Some(delay) => {
                        tracing::debug!(
                            upload_id = %self.upload_id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "retrying commit"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = self.cancel.cancelled() => return Err(CoreError::Cancelled),
                        }
                    }
                    None => {
                        let mut record = self.record.lock().await;
                        record.record_error(err.kind(), err.to_string());
                        record.set_status(UploadStatus::Failed);
                        self.persist(&record).await;
                        let _ = self.queue.record_completion(false);
                        self.events.emit(Event::UploadFailed {
                            upload_id: self.upload_id.clone(),
                            timestamp: now(),
                            chunk_index: None,
                            error_kind: err.kind().to_string(),
                            message: err.to_string(),
                        });
                        return Err(err);
                    }
                },
            }
        }
    }

    pub async fn pause(&self) {
        self.pause.set(true);
        let mut record = self.record.lock().await;
        if !record.status.is_terminal() {
            record.set_status(UploadStatus::Paused);
            self.persist(&record).await;
            self.events.emit(Event::UploadPaused {
                upload_id: self.upload_id.clone(),
                timestamp: now(),
            });
        }
    }

    pub async fn resume(&self) {
        self.pause.set(false);
        let mut record = self.record.lock().await;
        if record.status == UploadStatus::Paused {
            record.set_status(UploadStatus::Probing);
            self.persist(&record).await;
            self.events.emit(Event::UploadResumed {
                upload_id: self.upload_id.clone(),
                timestamp: now(),
            });
        }
    }

    pub async fn cancel_upload(&self) {
        self.cancel.cancel();
        let fingerprint = {
            let mut record = self.record.lock().await;
            if !record.status.is_terminal() {
                record.set_status(UploadStatus::Cancelled);
                self.persist(&record).await;
                self.events.emit(Event::UploadCancelled {
                    upload_id: self.upload_id.clone(),
                    timestamp: now(),
                });
            }
            record.fingerprint.clone()
        };
        self.protocol.abort(&fingerprint).await;
    }
}

