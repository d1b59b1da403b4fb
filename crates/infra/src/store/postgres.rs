//! Postgres-backed batch and job store.
//!
//! Shared coordination point for many worker processes. Per-batch mutual
//! exclusion uses transaction-scoped advisory locks
//! (`pg_advisory_xact_lock`), so a lock is released whenever its
//! transaction ends: commit, rollback, or a dropped connection.
//!
//! ## Error Mapping
//!
//! | PostgreSQL Error Code | BatchError | Scenario |
//! |----------------------|------------|----------|
//! | `55P03` lock_not_available | `LockUnavailable` | advisory lock wait exceeded `lock_timeout` |
//! | `40001` serialization_failure | `ConcurrentModification` | conflicting transaction |
//! | `40P01` deadlock_detected | `ConcurrentModification` | conflicting transaction |
//! | `23505` unique_violation | `ConcurrentModification` | duplicate insert |
//! | `42703` undefined_column | `CapabilityMissing` | schema not yet migrated |
//! | any other / pool errors | `Storage` | |
//!
//! ## Capabilities
//!
//! [`PostgresBatchStore::connect`] inspects the schema once. Without the
//! `callbacks_finished_at` column every read substitutes a typed NULL, and
//! the callbacks-finished stamp reports `CapabilityMissing`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{info, instrument, warn};

use convoy_core::{
    BatchError, BatchId, BatchRecord, BatchResult, BatchTimestamp, CallbackConfig, JobId,
    Properties,
};

use super::{BatchQuery, BatchStore, BatchTransaction, JobStore, StoreCapabilities};
use crate::jobs::{Job, JobKind, NewJob};

/// Prefix of advisory lock keys, so batch locks never collide with other
/// users of the same database.
const LOCK_NAMESPACE: &str = "convoy_batches";

/// Name of the index that marks a cleanup-ready schema.
pub const CLEANUP_INDEX: &str = "convoy_batches_for_cleanup";

const BATCH_COLUMNS: &str = "id, created_at, description, enqueued_at, discarded_at, \
     finished_at, callbacks_finished_at, callback_queue_name, callback_priority, \
     on_success, on_discard, on_finish, properties";

const LEGACY_BATCH_COLUMNS: &str = "id, created_at, description, enqueued_at, discarded_at, \
     finished_at, NULL::timestamptz AS callbacks_finished_at, callback_queue_name, \
     callback_priority, on_success, on_discard, on_finish, properties";

const JOB_COLUMNS: &str = "id, kind, handler, args, queue_name, priority, batch_id, \
     batch_callback_id, attempts, created_at, scheduled_at, performed_at, finished_at, error";

fn batch_columns(capabilities: StoreCapabilities) -> &'static str {
    if capabilities.callbacks_finished_at {
        BATCH_COLUMNS
    } else {
        LEGACY_BATCH_COLUMNS
    }
}

/// Postgres store.
///
/// Cheap to clone; all clones share one pool and one capability set.
#[derive(Debug, Clone)]
pub struct PostgresBatchStore {
    pool: Arc<PgPool>,
    capabilities: StoreCapabilities,
    lock_timeout: Duration,
}

impl PostgresBatchStore {
    /// Open the store, detecting schema capabilities once.
    #[instrument(skip(pool), err)]
    pub async fn connect(pool: PgPool, lock_timeout: Duration) -> BatchResult<Self> {
        let capabilities = detect_capabilities(&pool).await?;
        if capabilities.callbacks_finished_at && !capabilities.cleanup_index {
            warn!(
                index = CLEANUP_INDEX,
                "cleanup index missing; run pending migrations"
            );
        }
        if !capabilities.callbacks_finished_at {
            warn!("callbacks_finished_at column missing; callbacks-finished tracking disabled");
        }
        info!(?capabilities, "batch store connected");
        Ok(Self::with_capabilities(pool, capabilities, lock_timeout))
    }

    /// Open the store with known capabilities, skipping detection.
    pub fn with_capabilities(
        pool: PgPool,
        capabilities: StoreCapabilities,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            pool: Arc::new(pool),
            capabilities,
            lock_timeout,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_jobs(&self, column: &str, batch_id: BatchId) -> BatchResult<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM convoy_jobs WHERE {column} = $1 ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(batch_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_jobs", e))?;
        rows.iter().map(job_from_row).collect()
    }
}

async fn detect_capabilities(pool: &PgPool) -> BatchResult<StoreCapabilities> {
    let callbacks_finished_at: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM information_schema.columns
            WHERE table_schema = current_schema()
              AND table_name = 'convoy_batches'
              AND column_name = 'callbacks_finished_at'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .map_err(|e| map_sqlx_error("detect_column", e))?;

    let cleanup_index: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM pg_indexes
            WHERE schemaname = current_schema()
              AND tablename = 'convoy_batches'
              AND indexname = $1
        )
        "#,
    )
    .bind(CLEANUP_INDEX)
    .fetch_one(pool)
    .await
    .map_err(|e| map_sqlx_error("detect_index", e))?;

    Ok(StoreCapabilities {
        callbacks_finished_at,
        cleanup_index,
    })
}

#[async_trait]
impl BatchStore for PostgresBatchStore {
    type Tx = PostgresTransaction;

    async fn begin(&self) -> BatchResult<Self::Tx> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PostgresTransaction {
            tx,
            capabilities: self.capabilities,
            lock_timeout: self.lock_timeout,
            locked: HashSet::new(),
            lock_timeout_set: false,
        })
    }

    fn capabilities(&self) -> StoreCapabilities {
        self.capabilities
    }

    #[instrument(skip(self), fields(batch_id = %id), err)]
    async fn get_batch(&self, id: BatchId) -> BatchResult<Option<BatchRecord>> {
        let sql = format!(
            "SELECT {} FROM convoy_batches WHERE id = $1",
            batch_columns(self.capabilities)
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_batch", e))?;
        row.as_ref().map(batch_from_row).transpose()
    }

    #[instrument(skip(self), fields(limit = query.limit), err)]
    async fn list_batches(&self, query: &BatchQuery) -> BatchResult<Vec<BatchRecord>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM convoy_batches
            WHERE ($1::timestamptz IS NULL
                   OR ($2::uuid IS NULL AND created_at < $1)
                   OR ($2::uuid IS NOT NULL AND (created_at, id) < ($1, $2)))
              AND ($3::boolean IS NULL OR (finished_at IS NOT NULL) = $3)
              AND ($4::boolean IS NULL OR (discarded_at IS NOT NULL) = $4)
            ORDER BY created_at DESC, id DESC
            LIMIT $5
            "#,
            batch_columns(self.capabilities)
        );
        let rows = sqlx::query(&sql)
            .bind(query.cursor.map(|c| c.created_at))
            .bind(query.cursor.and_then(|c| c.id).map(uuid::Uuid::from))
            .bind(query.filter.finished)
            .bind(query.filter.discarded)
            .bind(sql_limit(query.limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_batches", e))?;
        rows.iter().map(batch_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn finished_before(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> BatchResult<Vec<BatchRecord>> {
        let column = self.capabilities.completion_timestamp().column();
        let sql = format!(
            "SELECT {} FROM convoy_batches WHERE {column} IS NOT NULL AND {column} <= $1 \
             ORDER BY {column} ASC, id ASC LIMIT $2",
            batch_columns(self.capabilities)
        );
        let rows = sqlx::query(&sql)
            .bind(before)
            .bind(sql_limit(limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("finished_before", e))?;
        rows.iter().map(batch_from_row).collect()
    }

    #[instrument(skip(self, after), err)]
    async fn pending_batches(
        &self,
        after: Option<(DateTime<Utc>, BatchId)>,
        limit: usize,
    ) -> BatchResult<Vec<BatchRecord>> {
        let callbacks_ready = if self.capabilities.callbacks_finished_at {
            "OR (b.finished_at IS NOT NULL AND b.callbacks_finished_at IS NULL \
                 AND NOT EXISTS (SELECT 1 FROM convoy_jobs j \
                                 WHERE j.batch_callback_id = b.id AND j.finished_at IS NULL))"
        } else {
            ""
        };
        let sql = format!(
            r#"
            SELECT {}
            FROM convoy_batches b
            WHERE b.enqueued_at IS NOT NULL
              AND ($1::timestamptz IS NULL OR (b.created_at, b.id) > ($1, $2::uuid))
              AND ((b.finished_at IS NULL
                    AND (NOT EXISTS (SELECT 1 FROM convoy_jobs j
                                     WHERE j.batch_id = b.id AND j.finished_at IS NULL)
                         OR (b.discarded_at IS NULL
                             AND EXISTS (SELECT 1 FROM convoy_jobs j
                                         WHERE j.batch_id = b.id
                                           AND j.finished_at IS NOT NULL
                                           AND j.error IS NOT NULL))))
                   {callbacks_ready})
            ORDER BY b.created_at ASC, b.id ASC
            LIMIT $3
            "#,
            batch_columns(self.capabilities)
        );
        let rows = sqlx::query(&sql)
            .bind(after.map(|(created_at, _)| created_at))
            .bind(after.map(|(_, id)| uuid::Uuid::from(id)))
            .bind(sql_limit(limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("pending_batches", e))?;
        rows.iter().map(batch_from_row).collect()
    }
}

#[async_trait]
impl JobStore for PostgresBatchStore {
    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get_job(&self, id: JobId) -> BatchResult<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM convoy_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn claim_next(&self, queues: &[String], lease: Duration) -> BatchResult<Option<Job>> {
        let sql = format!(
            r#"
            UPDATE convoy_jobs
            SET performed_at = NOW(), attempts = attempts + 1
            WHERE id = (
                SELECT id FROM convoy_jobs
                WHERE finished_at IS NULL
                  AND (performed_at IS NULL
                       OR performed_at < NOW() - $2::bigint * INTERVAL '1 millisecond')
                  AND scheduled_at <= NOW()
                  AND (cardinality($1::text[]) = 0 OR queue_name = ANY($1::text[]))
                ORDER BY priority ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(queues)
            .bind(i64::try_from(lease.as_millis()).unwrap_or(i64::MAX))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn finish_job(&self, id: JobId, error: Option<String>) -> BatchResult<Job> {
        let sql = format!(
            "UPDATE convoy_jobs SET finished_at = NOW(), error = $2 \
             WHERE id = $1 AND finished_at IS NULL RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(error)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("finish_job", e))?;
        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.missing_or_finished(id).await),
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn reschedule_job(
        &self,
        id: JobId,
        at: DateTime<Utc>,
        error: Option<String>,
    ) -> BatchResult<Job> {
        let sql = format!(
            "UPDATE convoy_jobs SET performed_at = NULL, scheduled_at = $2, error = $3 \
             WHERE id = $1 AND finished_at IS NULL RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(at)
            .bind(error)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("reschedule_job", e))?;
        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.missing_or_finished(id).await),
        }
    }

    async fn batch_jobs(&self, batch_id: BatchId) -> BatchResult<Vec<Job>> {
        self.fetch_jobs("batch_id", batch_id).await
    }

    async fn callback_jobs(&self, batch_id: BatchId) -> BatchResult<Vec<Job>> {
        self.fetch_jobs("batch_callback_id", batch_id).await
    }
}

impl PostgresBatchStore {
    async fn missing_or_finished(&self, id: JobId) -> BatchError {
        match self.get_job(id).await {
            Ok(Some(_)) => BatchError::invalid_argument(format!("job {id} already finished")),
            Ok(None) => BatchError::not_found(format!("job {id}")),
            Err(e) => e,
        }
    }
}

/// One Postgres transaction plus the advisory locks it holds.
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
    capabilities: StoreCapabilities,
    lock_timeout: Duration,
    locked: HashSet<BatchId>,
    lock_timeout_set: bool,
}

impl std::fmt::Debug for PostgresTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresTransaction")
            .field("capabilities", &self.capabilities)
            .field("locked", &self.locked)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BatchTransaction for PostgresTransaction {
    #[instrument(skip(self), fields(batch_id = %id), err)]
    async fn lock_batch(&mut self, id: BatchId) -> BatchResult<()> {
        if self.locked.contains(&id) {
            return Ok(());
        }
        if !self.lock_timeout_set {
            sqlx::query("SELECT set_config('lock_timeout', $1, true)")
                .bind(format!("{}ms", self.lock_timeout.as_millis()))
                .execute(&mut *self.tx)
                .await
                .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;
            self.lock_timeout_set = true;
        }
        sqlx::query("SELECT pg_advisory_xact_lock(('x' || substr(md5($1), 1, 16))::bit(64)::bigint)")
            .bind(format!("{LOCK_NAMESPACE}-{id}"))
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("advisory_lock", e))?;
        self.locked.insert(id);
        Ok(())
    }

    fn holds_lock(&self, id: BatchId) -> bool {
        self.locked.contains(&id)
    }

    #[instrument(skip(self, batch), fields(batch_id = %batch.id), err)]
    async fn insert_batch(&mut self, batch: &BatchRecord) -> BatchResult<()> {
        let properties = batch.properties.to_json()?;
        sqlx::query(
            r#"
            INSERT INTO convoy_batches (
                id,
                created_at,
                description,
                callback_queue_name,
                callback_priority,
                on_success,
                on_discard,
                on_finish,
                properties
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(batch.id.as_uuid())
        .bind(batch.created_at)
        .bind(&batch.description)
        .bind(&batch.callbacks.queue_name)
        .bind(batch.callbacks.priority)
        .bind(&batch.callbacks.on_success)
        .bind(&batch.callbacks.on_discard)
        .bind(&batch.callbacks.on_finish)
        .bind(properties)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_batch", e))?;
        Ok(())
    }

    async fn load_batch(&mut self, id: BatchId) -> BatchResult<BatchRecord> {
        let sql = format!(
            "SELECT {} FROM convoy_batches WHERE id = $1",
            batch_columns(self.capabilities)
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_batch", e))?
            .ok_or_else(|| BatchError::not_found(format!("batch {id}")))?;
        batch_from_row(&row)
    }

    #[instrument(skip(self), fields(batch_id = %id, field = field.column()), err)]
    async fn stamp(
        &mut self,
        id: BatchId,
        field: BatchTimestamp,
        at: DateTime<Utc>,
    ) -> BatchResult<bool> {
        if field == BatchTimestamp::CallbacksFinished && !self.capabilities.callbacks_finished_at {
            return Err(BatchError::capability_missing(field.column()));
        }

        let column = field.column();
        let sql = format!(
            "UPDATE convoy_batches SET {column} = $2 WHERE id = $1 AND {column} IS NULL"
        );

        // A column dropped after detection must not poison the transaction.
        let guarded = field == BatchTimestamp::CallbacksFinished;
        if guarded {
            self.execute_raw("SAVEPOINT convoy_stamp").await?;
        }

        let result = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(at)
            .execute(&mut *self.tx)
            .await;

        match result {
            Ok(done) => {
                if guarded {
                    self.execute_raw("RELEASE SAVEPOINT convoy_stamp").await?;
                }
                Ok(done.rows_affected() == 1)
            }
            Err(e) => {
                if guarded {
                    self.execute_raw("ROLLBACK TO SAVEPOINT convoy_stamp").await?;
                }
                Err(map_sqlx_error("stamp", e))
            }
        }
    }

    async fn write_properties(&mut self, id: BatchId, properties: &Properties) -> BatchResult<()> {
        let done = sqlx::query("UPDATE convoy_batches SET properties = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(properties.to_json()?)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("write_properties", e))?;
        if done.rows_affected() == 0 {
            return Err(BatchError::not_found(format!("batch {id}")));
        }
        Ok(())
    }

    async fn count_unfinished_jobs(&mut self, id: BatchId) -> BatchResult<u64> {
        self.count_jobs("batch_id", id, "finished_at IS NULL").await
    }

    async fn count_unfinished_callback_jobs(&mut self, id: BatchId) -> BatchResult<u64> {
        self.count_jobs("batch_callback_id", id, "finished_at IS NULL").await
    }

    async fn count_errored_jobs(&mut self, id: BatchId) -> BatchResult<u64> {
        self.count_jobs("batch_id", id, "finished_at IS NOT NULL AND error IS NOT NULL")
            .await
    }

    async fn enqueue_job(&mut self, job: NewJob) -> BatchResult<JobId> {
        let job = job.into_job()?;
        sqlx::query(
            r#"
            INSERT INTO convoy_jobs (
                id,
                kind,
                handler,
                args,
                queue_name,
                priority,
                batch_id,
                batch_callback_id,
                attempts,
                created_at,
                scheduled_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, $9, $10)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.kind.type_name())
        .bind(job.kind.handler_name())
        .bind(&job.args)
        .bind(&job.queue_name)
        .bind(job.priority)
        .bind(job.batch_id.map(uuid::Uuid::from))
        .bind(job.batch_callback_id.map(uuid::Uuid::from))
        .bind(job.created_at)
        .bind(job.scheduled_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("enqueue_job", e))?;
        Ok(job.id)
    }

    async fn commit(self) -> BatchResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }
}

impl PostgresTransaction {
    async fn execute_raw(&mut self, sql: &'static str) -> BatchResult<()> {
        sqlx::query(sql)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("savepoint", e))?;
        Ok(())
    }

    async fn count_jobs(
        &mut self,
        column: &'static str,
        id: BatchId,
        condition: &'static str,
    ) -> BatchResult<u64> {
        let sql = format!("SELECT COUNT(*) FROM convoy_jobs WHERE {column} = $1 AND {condition}");
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(id.as_uuid())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("count_jobs", e))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Map sqlx errors to `BatchError` (see module docs for the table).
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> BatchError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("55P03") => BatchError::LockUnavailable(msg),
                Some("40001") | Some("40P01") | Some("23505") => {
                    BatchError::ConcurrentModification(msg)
                }
                Some("42703") => BatchError::CapabilityMissing(msg),
                _ => BatchError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            BatchError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            BatchError::Storage(format!("connection pool timed out in {}", operation))
        }
        _ => BatchError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

fn batch_from_row(row: &sqlx::postgres::PgRow) -> BatchResult<BatchRecord> {
    BatchRow::try_from_row(row)
        .map_err(|e| BatchError::storage(format!("failed to decode batch row: {}", e)))?
        .try_into()
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> BatchResult<Job> {
    JobRow::try_from_row(row)
        .map_err(|e| BatchError::storage(format!("failed to decode job row: {}", e)))?
        .try_into()
}

#[derive(Debug)]
struct BatchRow {
    id: uuid::Uuid,
    created_at: DateTime<Utc>,
    description: Option<String>,
    enqueued_at: Option<DateTime<Utc>>,
    discarded_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    callbacks_finished_at: Option<DateTime<Utc>>,
    callback_queue_name: String,
    callback_priority: i32,
    on_success: Option<String>,
    on_discard: Option<String>,
    on_finish: Option<String>,
    properties: serde_json::Value,
}

impl BatchRow {
    fn try_from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(BatchRow {
            id: row.try_get("id")?,
            created_at: row.try_get("created_at")?,
            description: row.try_get("description")?,
            enqueued_at: row.try_get("enqueued_at")?,
            discarded_at: row.try_get("discarded_at")?,
            finished_at: row.try_get("finished_at")?,
            callbacks_finished_at: row.try_get("callbacks_finished_at")?,
            callback_queue_name: row.try_get("callback_queue_name")?,
            callback_priority: row.try_get("callback_priority")?,
            on_success: row.try_get("on_success")?,
            on_discard: row.try_get("on_discard")?,
            on_finish: row.try_get("on_finish")?,
            properties: row.try_get("properties")?,
        })
    }
}

impl TryFrom<BatchRow> for BatchRecord {
    type Error = BatchError;

    fn try_from(row: BatchRow) -> Result<Self, Self::Error> {
        Ok(BatchRecord {
            id: BatchId::from_uuid(row.id),
            created_at: row.created_at,
            description: row.description,
            enqueued_at: row.enqueued_at,
            discarded_at: row.discarded_at,
            finished_at: row.finished_at,
            callbacks_finished_at: row.callbacks_finished_at,
            callbacks: CallbackConfig {
                queue_name: row.callback_queue_name,
                priority: row.callback_priority,
                on_success: row.on_success,
                on_discard: row.on_discard,
                on_finish: row.on_finish,
            },
            properties: Properties::from_json(&row.properties)?,
        })
    }
}

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    kind: String,
    handler: String,
    args: serde_json::Value,
    queue_name: String,
    priority: i32,
    batch_id: Option<uuid::Uuid>,
    batch_callback_id: Option<uuid::Uuid>,
    attempts: i32,
    created_at: DateTime<Utc>,
    scheduled_at: DateTime<Utc>,
    performed_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl JobRow {
    fn try_from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            handler: row.try_get("handler")?,
            args: row.try_get("args")?,
            queue_name: row.try_get("queue_name")?,
            priority: row.try_get("priority")?,
            batch_id: row.try_get("batch_id")?,
            batch_callback_id: row.try_get("batch_callback_id")?,
            attempts: row.try_get("attempts")?,
            created_at: row.try_get("created_at")?,
            scheduled_at: row.try_get("scheduled_at")?,
            performed_at: row.try_get("performed_at")?,
            finished_at: row.try_get("finished_at")?,
            error: row.try_get("error")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = BatchError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let kind = JobKind::from_parts(&row.kind, row.handler).ok_or_else(|| {
            BatchError::storage(format!("job {}: unknown kind '{}'", row.id, row.kind))
        })?;
        Ok(Job {
            id: JobId::from_uuid(row.id),
            kind,
            args: row.args,
            queue_name: row.queue_name,
            priority: row.priority,
            batch_id: row.batch_id.map(BatchId::from_uuid),
            batch_callback_id: row.batch_callback_id.map(BatchId::from_uuid),
            attempts: row.attempts.max(0) as u32,
            created_at: row.created_at,
            scheduled_at: row.scheduled_at,
            performed_at: row.performed_at,
            finished_at: row.finished_at,
            error: row.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_columns_select_a_typed_null() {
        assert!(batch_columns(StoreCapabilities::legacy())
            .contains("NULL::timestamptz AS callbacks_finished_at"));
        assert!(!batch_columns(StoreCapabilities::full()).contains("NULL::"));
    }

    #[test]
    fn oversized_limits_saturate() {
        assert_eq!(sql_limit(25), 25);
        assert_eq!(sql_limit(usize::MAX), i64::MAX);
    }

    #[test]
    fn pool_errors_map_to_storage() {
        let err = map_sqlx_error("get_batch", sqlx::Error::PoolClosed);
        assert!(matches!(err, BatchError::Storage(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn row_with_unknown_kind_is_rejected() {
        let row = JobRow {
            id: uuid::Uuid::now_v7(),
            kind: "cron".into(),
            handler: "Tick".into(),
            args: serde_json::Value::Null,
            queue_name: "default".into(),
            priority: 0,
            batch_id: None,
            batch_callback_id: None,
            attempts: 0,
            created_at: Utc::now(),
            scheduled_at: Utc::now(),
            performed_at: None,
            finished_at: None,
            error: None,
        };
        assert!(matches!(Job::try_from(row), Err(BatchError::Storage(_))));
    }
}
