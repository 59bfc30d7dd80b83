//! Durable per-file upload records that survive process restart.

pub mod db;
pub mod models;
pub mod schema;

pub use db::UploadQueueDb;
pub use models::{LastError, QueueMeta, UploadRecord, UploadStatus, SCHEMA_VERSION};
