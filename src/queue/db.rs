use super::models::{LastError, QueueMeta, UploadRecord, UploadStatus};
use super::schema::{queue_meta, upload_records};
use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use diesel::OptionalExtension;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations/core");

/// SQLite-backed durable store for [`UploadRecord`]s. A thin cache-free
/// wrapper: callers keep their own in-memory copy and treat this as the
/// persistence substrate, matching the queue contract's `get/put/delete/
/// list` shape.
pub struct UploadQueueDb {
    pool: Arc<Pool<ConnectionManager<SqliteConnection>>>,
}

impl UploadQueueDb {
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_db_path()?)
    }

    pub fn with_path(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create queue db parent dir {}", parent.display()))?;
        }

        let database_url = path
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("invalid queue database path"))?;

        run_migrations(&database_url)?;

        let manager = ConnectionManager::<SqliteConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .context("failed to build queue database connection pool")?;

        let db = Self {
            pool: Arc::new(pool),
        };
        db.ensure_meta_row()?;
        Ok(db)
    }

    fn default_db_path() -> Result<PathBuf> {
        let base = dirs::data_local_dir().ok_or_else(|| anyhow!("unable to determine local data dir"))?;
        Ok(base.join("filechunk-pro").join("queue.db"))
    }

    fn connection(&self) -> Result<PooledConnection<ConnectionManager<SqliteConnection>>> {
        self.pool.get().context("failed to get connection from queue pool")
    }

    fn ensure_meta_row(&self) -> Result<()> {
        let mut conn = self.connection()?;
        let existing: Option<i32> = queue_meta::table
            .select(queue_meta::id)
            .first(&mut conn)
            .optional()
            .context("failed to query queue meta")?;

        if existing.is_none() {
            let meta = QueueMeta::default();
            let row = NewQueueMetaRow::from(&meta);
            diesel::insert_into(queue_meta::table)
                .values(&row)
                .execute(&mut conn)
                .context("failed to seed queue meta row")?;
        }
        Ok(())
    }

    /// Persist a record. Checksum is recomputed by the caller before this
    /// is invoked (`UploadRecord::seal`); we upsert by primary key.
    pub fn put(&self, record: &UploadRecord) -> Result<()> {
        let mut conn = self.connection()?;
        let row = UploadRecordRow::try_from(record)?;

        diesel::insert_into(upload_records::table)
            .values(&row)
            .on_conflict(upload_records::id)
            .do_update()
            .set(&row)
            .execute(&mut conn)
            .context("failed to upsert upload record")?;
        Ok(())
    }

    /// Load a single record. A checksum mismatch drops the row with a
    /// warning and returns `Ok(None)` rather than surfacing an error: the
    /// engine treats a corrupted record the same as a missing one.
    pub fn get(&self, id: &str) -> Result<Option<UploadRecord>> {
        let mut conn = self.connection()?;
        let row: Option<UploadRecordRow> = upload_records::table
            .filter(upload_records::id.eq(id))
            .first(&mut conn)
            .optional()
            .context("failed to query upload record")?;

        match row {
            Some(row) => Ok(Self::decode_row(row)),
            None => Ok(None),
        }
    }

    /// List all records ordered by the engine's scheduling order:
    /// descending priority, then ascending sequence.
    pub fn list(&self) -> Result<Vec<UploadRecord>> {
        let mut conn = self.connection()?;
        let rows: Vec<UploadRecordRow> = upload_records::table
            .order((upload_records::priority.desc(), upload_records::sequence.asc()))
            .load(&mut conn)
            .context("failed to list upload records")?;

        Ok(rows.into_iter().filter_map(Self::decode_row).collect())
    }

    pub fn list_by_status(&self, statuses: &[UploadStatus]) -> Result<Vec<UploadRecord>> {
        let values: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let mut conn = self.connection()?;
        let rows: Vec<UploadRecordRow> = upload_records::table
            .filter(upload_records::status.eq_any(values))
            .order((upload_records::priority.desc(), upload_records::sequence.asc()))
            .load(&mut conn)
            .context("failed to list upload records by status")?;

        Ok(rows.into_iter().filter_map(Self::decode_row).collect())
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let mut conn = self.connection()?;
        diesel::delete(upload_records::table.filter(upload_records::id.eq(id)))
            .execute(&mut conn)
            .context("failed to delete upload record")?;
        Ok(())
    }

    fn decode_row(row: UploadRecordRow) -> Option<UploadRecord> {
        let id = row.id.clone();
        match UploadRecord::try_from(row) {
            Ok(record) if record.verify_checksum() => Some(record),
            Ok(_) => {
                warn!(upload_id = %id, "dropping upload record: checksum mismatch");
                None
            }
            Err(err) => {
                warn!(upload_id = %id, error = %err, "dropping upload record: decode failure");
                None
            }
        }
    }

    pub fn meta(&self) -> Result<QueueMeta> {
        let mut conn = self.connection()?;
        let row: QueueMetaRow = queue_meta::table
            .first(&mut conn)
            .context("failed to load queue meta")?;
        Ok(row.into())
    }

    pub fn record_completion(&self, success: bool) -> Result<()> {
        let mut conn = self.connection()?;
        if success {
            diesel::update(queue_meta::table)
                .set((
                    queue_meta::total_processed.eq(queue_meta::total_processed + 1),
                    queue_meta::success_count.eq(queue_meta::success_count + 1),
                ))
                .execute(&mut conn)
        } else {
            diesel::update(queue_meta::table)
                .set((
                    queue_meta::total_processed.eq(queue_meta::total_processed + 1),
                    queue_meta::failure_count.eq(queue_meta::failure_count + 1),
                ))
                .execute(&mut conn)
        }
        .context("failed to update queue meta counters")?;
        Ok(())
    }

    pub fn next_sequence(&self) -> Result<i64> {
        let mut conn = self.connection()?;
        let seq: i64 = queue_meta::table
            .select(queue_meta::next_sequence)
            .first(&mut conn)
            .context("failed to read next sequence")?;

        diesel::update(queue_meta::table)
            .set(queue_meta::next_sequence.eq(seq + 1))
            .execute(&mut conn)
            .context("failed to advance next sequence")?;
        Ok(seq)
    }

    /// Delete terminal records older than `retention_secs`, oldest first,
    /// once the total record count exceeds `max_items`. Active records are
    /// never touched regardless of age.
    pub fn evict(&self, max_items: usize, retention_secs: i64) -> Result<usize> {
        let mut conn = self.connection()?;
        let total: i64 = upload_records::table
            .count()
            .get_result(&mut conn)
            .context("failed to count upload records")?;

        if (total as usize) <= max_items {
            return Ok(0);
        }

        let cutoff = Utc::now().timestamp() - retention_secs;
        let terminal = [
            UploadStatus::Completed.as_str(),
            UploadStatus::Failed.as_str(),
            UploadStatus::Cancelled.as_str(),
        ];

        let victims: Vec<String> = upload_records::table
            .filter(upload_records::status.eq_any(terminal))
            .filter(upload_records::created_at.lt(cutoff))
            .order(upload_records::created_at.asc())
            .limit((total as usize - max_items) as i64)
            .select(upload_records::id)
            .load(&mut conn)
            .context("failed to select eviction candidates")?;

        if victims.is_empty() {
            return Ok(0);
        }

        diesel::delete(upload_records::table.filter(upload_records::id.eq_any(&victims)))
            .execute(&mut conn)
            .context("failed to evict upload records")?;
        Ok(victims.len())
    }
}

fn run_migrations(database_url: &str) -> Result<()> {
    let mut conn = SqliteConnection::establish(database_url)
        .with_context(|| format!("failed to open queue database at {}", database_url))?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|err| anyhow!("failed to run queue database migrations: {err}"))?;
    Ok(())
}

#[derive(Queryable, Insertable, AsChangeset)]
#[diesel(table_name = upload_records)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct UploadRecordRow {
    id: String,
    fingerprint: String,
    file_name: String,
    file_path: String,
    file_size: i64,
    content_type: String,
    chunk_size: i64,
    status: String,
    uploaded_indices: String,
    attempt_counts: String,
    priority: i32,
    sequence: i64,
    created_at: i64,
    updated_at: i64,
    last_error_kind: Option<String>,
    last_error_message: Option<String>,
    last_error_at: Option<i64>,
    result_url: Option<String>,
    version: i32,
    checksum: String,
}

impl TryFrom<&UploadRecord> for UploadRecordRow {
    type Error = anyhow::Error;

    fn try_from(record: &UploadRecord) -> Result<Self> {
        let uploaded_indices = serde_json::to_string(&record.uploaded_indices)
            .context("failed to serialize uploaded_indices")?;
        let attempt_counts = serde_json::to_string(&record.attempt_counts)
            .context("failed to serialize attempt_counts")?;

        Ok(Self {
            id: record.id.clone(),
            fingerprint: record.fingerprint.clone(),
            file_name: record.file_name.clone(),
            file_path: record.file_path.clone(),
            file_size: record.file_size,
            content_type: record.content_type.clone(),
            chunk_size: record.chunk_size,
            status: record.status.as_str().to_string(),
            uploaded_indices,
            attempt_counts,
            priority: record.priority,
            sequence: record.sequence,
            created_at: record.created_at,
            updated_at: record.updated_at,
            last_error_kind: record.last_error.as_ref().map(|e| e.kind.clone()),
            last_error_message: record.last_error.as_ref().map(|e| e.message.clone()),
            last_error_at: record.last_error.as_ref().map(|e| e.at),
            result_url: record.result_url.clone(),
            version: record.version,
            checksum: record.checksum.clone(),
        })
    }
}

impl TryFrom<UploadRecordRow> for UploadRecord {
    type Error = anyhow::Error;

    fn try_from(row: UploadRecordRow) -> Result<Self> {
        if row.version > super::models::SCHEMA_VERSION {
            return Err(anyhow!(
                "upload record {} has schema version {} newer than supported {}",
                row.id,
                row.version,
                super::models::SCHEMA_VERSION
            ));
        }

        let status = UploadStatus::from_str(&row.status)
            .ok_or_else(|| anyhow!("unknown upload status value {}", row.status))?;
        let uploaded_indices: BTreeSet<u32> = serde_json::from_str(&row.uploaded_indices)
            .context("failed to deserialize uploaded_indices")?;
        let attempt_counts: BTreeMap<u32, u32> = serde_json::from_str(&row.attempt_counts)
            .context("failed to deserialize attempt_counts")?;

        let last_error = match (row.last_error_kind, row.last_error_message, row.last_error_at) {
            (Some(kind), Some(message), Some(at)) => Some(LastError { kind, message, at }),
            _ => None,
        };

        Ok(UploadRecord {
            id: row.id,
            fingerprint: row.fingerprint,
            file_name: row.file_name,
            file_path: row.file_path,
            file_size: row.file_size,
            content_type: row.content_type,
            chunk_size: row.chunk_size,
            status,
            uploaded_indices,
            attempt_counts,
            priority: row.priority,
            sequence: row.sequence,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_error,
            result_url: row.result_url,
            version: row.version,
            checksum: row.checksum,
        })
    }
}

#[derive(Queryable)]
struct QueueMetaRow {
    id: i32,
    created_at: i64,
    total_processed: i64,
    success_count: i64,
    failure_count: i64,
    schema_version: i32,
    next_sequence: i64,
}

impl From<QueueMetaRow> for QueueMeta {
    fn from(row: QueueMetaRow) -> Self {
        let _ = row.id;
        Self {
            created_at: row.created_at,
            total_processed: row.total_processed,
            success_count: row.success_count,
            failure_count: row.failure_count,
            schema_version: row.schema_version,
            next_sequence: row.next_sequence,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = queue_meta)]
struct NewQueueMetaRow {
    id: i32,
    created_at: i64,
    total_processed: i64,
    success_count: i64,
    failure_count: i64,
    schema_version: i32,
    next_sequence: i64,
}

impl From<&QueueMeta> for NewQueueMetaRow {
    fn from(meta: &QueueMeta) -> Self {
        Self {
            id: 0,
            created_at: meta.created_at,
            total_processed: meta.total_processed,
            success_count: meta.success_count,
            failure_count: meta.failure_count,
            schema_version: meta.schema_version,
            next_sequence: meta.next_sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> (UploadQueueDb, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = UploadQueueDb::with_path(dir.path().join("queue.db")).unwrap();
        (db, dir)
    }

    #[test]
    fn roundtrip_preserves_record() {
        let (db, _dir) = temp_db();
        let mut record = UploadRecord::new("id-1", "a.bin", "/tmp/a.bin", 12, "application/octet-stream", 4, 0, 0);
        record.fingerprint = "deadbeef".into();
        record.record_chunk_success(0);
        record.seal();

        db.put(&record).unwrap();
        let loaded = db.get("id-1").unwrap().expect("record present");
        assert_eq!(loaded.uploaded_indices, record.uploaded_indices);
        assert_eq!(loaded.checksum, record.checksum);
    }

    #[test]
    fn corrupted_checksum_is_dropped_not_errored() {
        let (db, _dir) = temp_db();
        let mut record = UploadRecord::new("id-2", "b.bin", "/tmp/b.bin", 8, "application/octet-stream", 4, 0, 1);
        record.seal();
        db.put(&record).unwrap();

        // Tamper with a field directly via a fresh row without re-sealing.
        let mut conn = db.connection().unwrap();
        diesel::update(upload_records::table.filter(upload_records::id.eq("id-2")))
            .set(upload_records::file_size.eq(999))
            .execute(&mut conn)
            .unwrap();

        assert!(db.get("id-2").unwrap().is_none());
    }

    #[test]
    fn sequence_allocation_is_monotonic() {
        let (db, _dir) = temp_db();
        let a = db.next_sequence().unwrap();
        let b = db.next_sequence().unwrap();
        assert!(b > a);
    }

    #[test]
    fn eviction_leaves_active_records_alone() {
        let (db, _dir) = temp_db();
        for i in 0..5 {
            let mut record = UploadRecord::new(
                format!("id-{i}"),
                "f.bin",
                "/tmp/f.bin",
                4,
                "application/octet-stream",
                4,
                0,
                i,
            );
            record.status = UploadStatus::Completed;
            record.created_at = 0;
            record.seal();
            db.put(&record).unwrap();
        }
        let mut active = UploadRecord::new("active", "g.bin", "/tmp/g.bin", 4, "application/octet-stream", 4, 0, 5);
        active.seal();
        db.put(&active).unwrap();

        let evicted = db.evict(2, 0).unwrap();
        assert!(evicted > 0);
        assert!(db.get("active").unwrap().is_some());
    }
}
