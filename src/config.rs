//! Engine-wide configuration, composed from each subsystem's own
//! independently-constructible, `Default`-implementing config struct.

use crate::gate::GateConfig;
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_CHUNK_SIZE: u64 = 2 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub max_items: usize,
    pub retention: Duration,
    pub persist_file_bytes: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_items: 10_000,
            retention: Duration::from_secs(7 * 24 * 3600),
            persist_file_bytes: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    pub timeout: Duration,
    pub commit_timeout: Duration,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            commit_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub base_url: String,
    pub chunk_size: u64,
    pub max_concurrent_uploads: usize,
    pub max_queue_length: usize,
    pub probe_enabled: bool,
    pub key_prefix: String,
    pub gate: GateConfig,
    pub retry: RetryConfig,
    pub request: RequestConfig,
    pub queue: QueueConfig,
}

impl EngineConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), crate::error::CoreError> {
        if self.chunk_size == 0 {
            return Err(crate::error::CoreError::InvalidArgument(
                "chunk_size must be greater than zero".into(),
            ));
        }
        if self.max_concurrent_uploads == 0 {
            return Err(crate::error::CoreError::InvalidArgument(
                "max_concurrent_uploads must be at least 1".into(),
            ));
        }
        if self.gate.min_parallelism == 0 {
            return Err(crate::error::CoreError::InvalidArgument(
                "gate.min_parallelism must be at least 1".into(),
            ));
        }
        if self.gate.max_parallelism < self.gate.min_parallelism {
            return Err(crate::error::CoreError::InvalidArgument(
                "gate.max_parallelism must be >= gate.min_parallelism".into(),
            ));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent_uploads: 4,
            max_queue_length: 256,
            probe_enabled: true,
            key_prefix: "filechunk-pro:".to_string(),
            gate: GateConfig::default(),
            retry: RetryConfig::default(),
            request: RequestConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}
