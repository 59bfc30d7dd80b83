use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

pub const SCHEMA_VERSION: i32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UploadStatus {
    Queued,
    Hashing,
    Probing,
    Uploading,
    Paused,
    Committing,
    Completed,
    Failed,
    Cancelled,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Queued => "queued",
            UploadStatus::Hashing => "hashing",
            UploadStatus::Probing => "probing",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Paused => "paused",
            UploadStatus::Committing => "committing",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
            UploadStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(UploadStatus::Queued),
            "hashing" => Some(UploadStatus::Hashing),
            "probing" => Some(UploadStatus::Probing),
            "uploading" => Some(UploadStatus::Uploading),
            "paused" => Some(UploadStatus::Paused),
            "committing" => Some(UploadStatus::Committing),
            "completed" => Some(UploadStatus::Completed),
            "failed" => Some(UploadStatus::Failed),
            "cancelled" => Some(UploadStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::Failed | UploadStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastError {
    pub kind: String,
    pub message: String,
    pub at: i64,
}

/// In-memory/persisted view of a single file's progress through the engine.
/// Mirrors the upload_records table column-for-column; `checksum` covers
/// every other field and is recomputed on every mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: String,
    pub fingerprint: String,
    pub file_name: String,
    pub file_path: String,
    pub file_size: i64,
    pub content_type: String,
    pub chunk_size: i64,
    pub status: UploadStatus,
    pub uploaded_indices: BTreeSet<u32>,
    pub attempt_counts: BTreeMap<u32, u32>,
    pub priority: i32,
    pub sequence: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_error: Option<LastError>,
    pub result_url: Option<String>,
    pub version: i32,
    pub checksum: String,
}

impl UploadRecord {
    pub fn new(
        id: impl Into<String>,
        file_name: impl Into<String>,
        file_path: impl Into<String>,
        file_size: i64,
        content_type: impl Into<String>,
        chunk_size: i64,
        priority: i32,
        sequence: i64,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        let mut record = Self {
            id: id.into(),
            fingerprint: String::new(),
            file_name: file_name.into(),
            file_path: file_path.into(),
            file_size,
            content_type: content_type.into(),
            chunk_size,
            status: UploadStatus::Queued,
            uploaded_indices: BTreeSet::new(),
            attempt_counts: BTreeMap::new(),
            priority,
            sequence,
            created_at: now,
            updated_at: now,
            last_error: None,
            result_url: None,
            version: SCHEMA_VERSION,
            checksum: String::new(),
        };
        record.seal();
        record
    }

    pub fn total_chunks(&self) -> u32 {
        crate::plan::ChunkPlan::new(self.file_size as u64, self.chunk_size as u64)
            .map(|p| p.total_chunks)
            .unwrap_or(0)
    }

    pub fn is_fully_uploaded(&self) -> bool {
        self.uploaded_indices.len() as u32 >= self.total_chunks()
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().timestamp();
        self.seal();
    }

    pub fn set_status(&mut self, status: UploadStatus) {
        self.status = status;
        self.touch();
    }

    pub fn record_chunk_success(&mut self, index: u32) {
        self.uploaded_indices.insert(index);
        self.attempt_counts.remove(&index);
        self.touch();
    }

    pub fn record_chunk_attempt(&mut self, index: u32) -> u32 {
        let entry = self.attempt_counts.entry(index).or_insert(0);
        *entry += 1;
        let attempts = *entry;
        self.touch();
        attempts
    }

    pub fn record_error(&mut self, kind: impl Into<String>, message: impl Into<String>) {
        self.last_error = Some(LastError {
            kind: kind.into(),
            message: message.into(),
            at: chrono::Utc::now().timestamp(),
        });
        self.touch();
    }

    /// Hash of every field except `checksum` itself. Detects corruption of
    /// the persisted row, not tampering; callers never need to verify it
    /// against anything but a freshly-loaded copy of the same record.
    pub fn compute_checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update(self.fingerprint.as_bytes());
        hasher.update(self.file_name.as_bytes());
        hasher.update(self.file_path.as_bytes());
        hasher.update(self.file_size.to_le_bytes());
        hasher.update(self.content_type.as_bytes());
        hasher.update(self.chunk_size.to_le_bytes());
        hasher.update(self.status.as_str().as_bytes());
        for idx in &self.uploaded_indices {
            hasher.update(idx.to_le_bytes());
        }
        for (idx, attempts) in &self.attempt_counts {
            hasher.update(idx.to_le_bytes());
            hasher.update(attempts.to_le_bytes());
        }
        hasher.update(self.priority.to_le_bytes());
        hasher.update(self.sequence.to_le_bytes());
        hasher.update(self.created_at.to_le_bytes());
        hasher.update(self.updated_at.to_le_bytes());
        if let Some(err) = &self.last_error {
            hasher.update(err.kind.as_bytes());
            hasher.update(err.message.as_bytes());
            hasher.update(err.at.to_le_bytes());
        }
        if let Some(url) = &self.result_url {
            hasher.update(url.as_bytes());
        }
        hasher.update(self.version.to_le_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    pub fn verify_checksum(&self) -> bool {
        self.checksum == self.compute_checksum()
    }
}

#[derive(Debug, Clone)]
pub struct QueueMeta {
    pub created_at: i64,
    pub total_processed: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub schema_version: i32,
    pub next_sequence: i64,
}

impl Default for QueueMeta {
    fn default() -> Self {
        Self {
            created_at: chrono::Utc::now().timestamp(),
            total_processed: 0,
            success_count: 0,
            failure_count: 0,
            schema_version: SCHEMA_VERSION,
            next_sequence: 0,
        }
    }
}
