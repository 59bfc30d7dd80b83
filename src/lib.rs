//! Resumable, chunked file-upload engine core: deterministic chunk
//! planning, adaptive bounded-concurrency scheduling, a three-phase
//! resumption protocol, and a durable per-file upload queue.

pub mod config;
pub mod digest;
pub mod engine;
pub mod error;
pub mod events;
pub mod gate;
pub mod host;
pub mod logging;
pub mod plan;
pub mod protocol;
pub mod queue;
pub mod retry;
pub mod scheduler;

pub use config::EngineConfig;
pub use engine::{Engine, EnqueueOptions};
pub use error::{CoreError, CoreResult};
pub use events::Event;
pub use plan::{ChunkDescriptor, ChunkPlan};
pub use queue::{UploadQueueDb, UploadRecord, UploadStatus};
