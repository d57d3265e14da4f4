//! PostgreSQL storage backend
//!
//! Admission goes through the `enqueue_refresh_batch` function so the
//! staleness check and the insert share one statement. Claims use
//! `FOR UPDATE SKIP LOCKED`; completion and failure each run in a single
//! transaction guarded on `status = 'processing'`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use refreshq_common::{DataType, EntityKey};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use uuid::Uuid;

use super::{
    validate_identifier, JobHealthStore, QueueStore, QuotaStore, RecordSink, RefreshStateStore,
    RegistrySource, TrackingStore,
};
use crate::refresh::error::{RefreshError, RefreshResult};
use crate::refresh::registry::RegistryEntry;
use crate::refresh::staleness::check_source_timestamp;
use crate::refresh::types::{
    BatchOutcome, EnqueueOutcome, EnqueueRequest, JobCompletion, JobFailure, JobHealthRecord,
    JobStatus, QueueJob, RefreshState, StoredRecord, TrackedEntity,
};

const JOB_COLUMNS: &str = "id, entity_key, data_type, status, priority, created_at, available_at, \
     claimed_at, worker_id, attempt_count, last_error, completed_at, wire_bytes, retry_of";

fn data_type(raw: &str) -> RefreshResult<DataType> {
    raw.parse()
        .map_err(|e| RefreshError::Storage(format!("corrupt data type in storage: {}", e)))
}

fn entity_key(raw: &str) -> RefreshResult<EntityKey> {
    EntityKey::new(raw)
        .map_err(|e| RefreshError::Storage(format!("corrupt entity key in storage: {}", e)))
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    entity_key: String,
    data_type: String,
    status: String,
    priority: i32,
    created_at: DateTime<Utc>,
    available_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    worker_id: Option<Uuid>,
    attempt_count: i32,
    last_error: Option<String>,
    completed_at: Option<DateTime<Utc>>,
    wire_bytes: Option<i64>,
    retry_of: Option<Uuid>,
}

impl TryFrom<JobRow> for QueueJob {
    type Error = RefreshError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(QueueJob {
            id: row.id,
            entity_key: entity_key(&row.entity_key)?,
            data_type: data_type(&row.data_type)?,
            status: row.status.parse()?,
            priority: row.priority,
            created_at: row.created_at,
            available_at: row.available_at,
            claimed_at: row.claimed_at,
            worker_id: row.worker_id,
            attempt_count: row.attempt_count,
            last_error: row.last_error,
            completed_at: row.completed_at,
            wire_bytes: row.wire_bytes,
            retry_of: row.retry_of,
        })
    }
}

fn jobs_from_rows(rows: Vec<JobRow>) -> RefreshResult<Vec<QueueJob>> {
    rows.into_iter().map(QueueJob::try_from).collect()
}

#[derive(Debug, sqlx::FromRow)]
struct OutcomeRow {
    out_data_type: String,
    out_outcome: String,
    out_job_id: Option<Uuid>,
}

impl TryFrom<OutcomeRow> for BatchOutcome {
    type Error = RefreshError;

    fn try_from(row: OutcomeRow) -> Result<Self, Self::Error> {
        let outcome = match (row.out_outcome.as_str(), row.out_job_id) {
            ("admitted", Some(id)) => EnqueueOutcome::Admitted(id),
            ("already_fresh", _) => EnqueueOutcome::AlreadyFresh,
            ("already_queued", _) => EnqueueOutcome::AlreadyQueued,
            (other, _) => {
                return Err(RefreshError::Storage(format!("unexpected enqueue outcome '{}'", other)))
            }
        };
        Ok(BatchOutcome {
            data_type: data_type(&row.out_data_type)?,
            outcome,
        })
    }
}

/// Store backed by the shared PostgreSQL database
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Lock a job row and check it is still processing.
    async fn lock_processing(
        tx: &mut Transaction<'_, Postgres>,
        job_id: Uuid,
        to: &'static str,
    ) -> RefreshResult<QueueJob> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM refresh_jobs WHERE id = $1 FOR UPDATE",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&mut **tx)
        .await?;

        let job = QueueJob::try_from(row.ok_or(RefreshError::JobNotFound(job_id))?)?;
        if job.status != JobStatus::Processing {
            return Err(RefreshError::InvalidTransition {
                job_id,
                from: job.status.to_string(),
                to,
            });
        }
        Ok(job)
    }
}

#[async_trait]
impl QueueStore for PgStore {
    async fn enqueue_batch(
        &self,
        entity_key: &EntityKey,
        requests: &[EnqueueRequest],
        priority: i32,
        now: DateTime<Utc>,
    ) -> RefreshResult<Vec<BatchOutcome>> {
        let data_types: Vec<&str> = requests.iter().map(|r| r.data_type.as_str()).collect();
        let ttls: Vec<i64> = requests.iter().map(|r| r.ttl_minutes).collect();
        let ids: Vec<Uuid> = requests.iter().map(|_| Uuid::new_v4()).collect();

        let rows: Vec<OutcomeRow> = sqlx::query_as(
            "SELECT out_data_type, out_outcome, out_job_id \
             FROM enqueue_refresh_batch($1, $2, $3, $4, $5, $6)",
        )
        .bind(entity_key.as_str())
        .bind(&data_types)
        .bind(&ttls)
        .bind(&ids)
        .bind(priority)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BatchOutcome::try_from).collect()
    }

    async fn claim_next(
        &self,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> RefreshResult<Option<QueueJob>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            UPDATE refresh_jobs
            SET status = 'processing', claimed_at = $2, worker_id = $1
            WHERE id = (
                SELECT id FROM refresh_jobs
                WHERE status = 'pending' AND available_at <= $2
                ORDER BY priority DESC, created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(QueueJob::try_from).transpose()
    }

    async fn complete_job(&self, completion: &JobCompletion) -> RefreshResult<QueueJob> {
        let mut tx = self.pool.begin().await?;
        let job =
            Self::lock_processing(&mut tx, completion.job_id, JobStatus::Complete.as_str()).await?;

        if completion.requires_source_timestamp && completion.source_timestamp.is_none() {
            return Err(RefreshError::validation(
                job.data_type,
                "source timestamp required but missing",
            ));
        }

        let stored: Option<(Option<DateTime<Utc>>,)> = sqlx::query_as(
            "SELECT source_timestamp FROM refresh_state \
             WHERE entity_key = $1 AND data_type = $2 FOR UPDATE",
        )
        .bind(job.entity_key.as_str())
        .bind(job.data_type.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        if let (Some(incoming), Some((Some(stored),))) = (completion.source_timestamp, stored) {
            check_source_timestamp(&job.entity_key, job.data_type, incoming, stored)?;
        }

        let wire_bytes = i64::try_from(completion.wire_bytes).unwrap_or(i64::MAX);

        let row: JobRow = sqlx::query_as(&format!(
            "UPDATE refresh_jobs SET status = 'complete', completed_at = $2, wire_bytes = $3 \
             WHERE id = $1 RETURNING {}",
            JOB_COLUMNS
        ))
        .bind(job.id)
        .bind(completion.completed_at)
        .bind(wire_bytes)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO refresh_state (entity_key, data_type, last_fetched_at, source_timestamp)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (entity_key, data_type) DO UPDATE
            SET last_fetched_at = EXCLUDED.last_fetched_at,
                source_timestamp = COALESCE(
                    EXCLUDED.source_timestamp,
                    refresh_state.source_timestamp
                )
            "#,
        )
        .bind(job.entity_key.as_str())
        .bind(job.data_type.as_str())
        .bind(completion.completed_at)
        .bind(completion.source_timestamp)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO quota_usage (usage_date, total_bytes, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (usage_date) DO UPDATE
            SET total_bytes = quota_usage.total_bytes + EXCLUDED.total_bytes,
                updated_at = NOW()
            "#,
        )
        .bind(completion.completed_at.date_naive())
        .bind(wire_bytes)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        QueueJob::try_from(row)
    }

    async fn fail_job(&self, failure: &JobFailure) -> RefreshResult<Option<QueueJob>> {
        let mut tx = self.pool.begin().await?;
        let job =
            Self::lock_processing(&mut tx, failure.job_id, JobStatus::Failed.as_str()).await?;

        sqlx::query(
            "UPDATE refresh_jobs SET status = 'failed', last_error = $2, completed_at = $3 \
             WHERE id = $1",
        )
        .bind(job.id)
        .bind(&failure.error)
        .bind(failure.failed_at)
        .execute(&mut *tx)
        .await?;

        let retry = match failure.retry_at {
            Some(at) if job.attempt_count < failure.max_attempts => {
                let next = job.retry(at, failure.failed_at);
                let row: Option<JobRow> = sqlx::query_as(&format!(
                    r#"
                    INSERT INTO refresh_jobs
                        (id, entity_key, data_type, status, priority, created_at, available_at,
                         attempt_count, retry_of)
                    VALUES ($1, $2, $3, 'pending', $4, $5, $6, $7, $8)
                    ON CONFLICT (entity_key, data_type)
                        WHERE status IN ('pending', 'processing') DO NOTHING
                    RETURNING {}
                    "#,
                    JOB_COLUMNS
                ))
                .bind(next.id)
                .bind(next.entity_key.as_str())
                .bind(next.data_type.as_str())
                .bind(next.priority)
                .bind(next.created_at)
                .bind(next.available_at)
                .bind(next.attempt_count)
                .bind(next.retry_of)
                .fetch_optional(&mut *tx)
                .await?;
                row.map(QueueJob::try_from).transpose()?
            }
            _ => None,
        };

        tx.commit().await?;
        Ok(retry)
    }

    async fn expired_leases(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> RefreshResult<Vec<QueueJob>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM refresh_jobs \
             WHERE status = 'processing' AND claimed_at < $1 ORDER BY claimed_at",
            JOB_COLUMNS
        ))
        .bind(claimed_before)
        .fetch_all(&self.pool)
        .await?;

        jobs_from_rows(rows)
    }

    async fn get_job(&self, job_id: Uuid) -> RefreshResult<Option<QueueJob>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM refresh_jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(QueueJob::try_from).transpose()
    }

    async fn list_jobs(
        &self,
        entity_key: Option<&EntityKey>,
        data_type: Option<DataType>,
    ) -> RefreshResult<Vec<QueueJob>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM refresh_jobs
            WHERE ($1::TEXT IS NULL OR entity_key = $1)
              AND ($2::TEXT IS NULL OR data_type = $2)
            ORDER BY created_at
            "#,
            JOB_COLUMNS
        ))
        .bind(entity_key.map(EntityKey::as_str))
        .bind(data_type.map(|dt| dt.as_str()))
        .fetch_all(&self.pool)
        .await?;

        jobs_from_rows(rows)
    }
}

#[async_trait]
impl QuotaStore for PgStore {
    async fn usage(&self, date: NaiveDate) -> RefreshResult<i64> {
        let total: Option<i64> =
            sqlx::query_scalar("SELECT total_bytes FROM quota_usage WHERE usage_date = $1")
                .bind(date)
                .fetch_optional(&self.pool)
                .await?;
        Ok(total.unwrap_or(0))
    }

    async fn add_usage(&self, date: NaiveDate, bytes: i64) -> RefreshResult<i64> {
        let total: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO quota_usage (usage_date, total_bytes, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (usage_date) DO UPDATE
            SET total_bytes = quota_usage.total_bytes + EXCLUDED.total_bytes,
                updated_at = NOW()
            RETURNING total_bytes
            "#,
        )
        .bind(date)
        .bind(bytes.max(0))
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }
}

#[async_trait]
impl RefreshStateStore for PgStore {
    async fn refresh_state(
        &self,
        entity_key: &EntityKey,
        data_type: DataType,
    ) -> RefreshResult<Option<RefreshState>> {
        let row: Option<(DateTime<Utc>, Option<DateTime<Utc>>)> = sqlx::query_as(
            "SELECT last_fetched_at, source_timestamp FROM refresh_state \
             WHERE entity_key = $1 AND data_type = $2",
        )
        .bind(entity_key.as_str())
        .bind(data_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(last_fetched_at, source_timestamp)| RefreshState {
            entity_key: entity_key.clone(),
            data_type,
            last_fetched_at,
            source_timestamp,
        }))
    }
}

#[async_trait]
impl JobHealthStore for PgStore {
    async fn record_run(&self, record: &JobHealthRecord) -> RefreshResult<()> {
        sqlx::query(
            r#"
            INSERT INTO job_health (job_name, last_run, expected_interval_minutes)
            VALUES ($1, $2, $3)
            ON CONFLICT (job_name) DO UPDATE
            SET last_run = EXCLUDED.last_run,
                expected_interval_minutes = EXCLUDED.expected_interval_minutes
            "#,
        )
        .bind(&record.job_name)
        .bind(record.last_run)
        .bind(record.expected_interval_minutes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn job_health(&self, job_names: &[String]) -> RefreshResult<Vec<JobHealthRecord>> {
        let rows: Vec<(String, Option<DateTime<Utc>>, i64)> = sqlx::query_as(
            "SELECT job_name, last_run, expected_interval_minutes FROM job_health \
             WHERE job_name = ANY($1)",
        )
        .bind(job_names)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(job_name, last_run, expected_interval_minutes)| JobHealthRecord {
                job_name,
                last_run,
                expected_interval_minutes,
            })
            .collect())
    }
}

#[async_trait]
impl TrackingStore for PgStore {
    async fn track(
        &self,
        entity_key: &EntityKey,
        data_types: &[DataType],
        at: DateTime<Utc>,
    ) -> RefreshResult<()> {
        let types: Vec<&str> = data_types.iter().map(|dt| dt.as_str()).collect();
        sqlx::query(
            r#"
            INSERT INTO tracked_entities (entity_key, data_types, last_subscribed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (entity_key) DO UPDATE
            SET data_types = ARRAY(
                    SELECT DISTINCT t
                    FROM unnest(tracked_entities.data_types || EXCLUDED.data_types) AS t
                    ORDER BY t
                ),
                last_subscribed_at = GREATEST(
                    tracked_entities.last_subscribed_at,
                    EXCLUDED.last_subscribed_at
                )
            "#,
        )
        .bind(entity_key.as_str())
        .bind(&types)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn active_entities(&self, since: DateTime<Utc>) -> RefreshResult<Vec<TrackedEntity>> {
        let rows: Vec<(String, Vec<String>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT entity_key, data_types, last_subscribed_at FROM tracked_entities \
             WHERE last_subscribed_at >= $1 ORDER BY entity_key",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(key, types, last_subscribed_at)| {
                let mut data_types = types
                    .iter()
                    .map(|raw| data_type(raw))
                    .collect::<RefreshResult<Vec<_>>>()?;
                data_types.sort();
                Ok(TrackedEntity {
                    entity_key: entity_key(&key)?,
                    data_types,
                    last_subscribed_at,
                })
            })
            .collect()
    }
}

#[async_trait]
impl RecordSink for PgStore {
    async fn upsert(
        &self,
        table: &str,
        records: &[StoredRecord],
        conflict_key: &str,
    ) -> RefreshResult<u64> {
        if !validate_identifier(table) || !validate_identifier(conflict_key) {
            return Err(RefreshError::Storage(format!(
                "invalid upsert target {}({})",
                table, conflict_key
            )));
        }
        if records.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} (entity_key, payload, source_timestamp, fetched_at) ",
            table
        ));
        builder.push_values(records, |mut row, record| {
            row.push_bind(record.entity_key.as_str())
                .push_bind(&record.payload)
                .push_bind(record.source_timestamp)
                .push_bind(record.fetched_at);
        });
        builder.push(format!(
            " ON CONFLICT ({key}) DO UPDATE SET payload = EXCLUDED.payload, \
             source_timestamp = EXCLUDED.source_timestamp, fetched_at = EXCLUDED.fetched_at \
             WHERE {table}.source_timestamp IS NULL \
             OR EXCLUDED.source_timestamp > {table}.source_timestamp",
            key = conflict_key,
            table = table
        ));

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RegistrySource for PgStore {
    async fn load_entries(&self) -> RefreshResult<Vec<RegistryEntry>> {
        let rows: Vec<(String, String, String, Option<String>, i64)> = sqlx::query_as(
            "SELECT data_type, storage_target, freshness_column, source_timestamp_field, \
             ttl_minutes FROM refresh_registry ORDER BY data_type",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(
                |(dt, storage_target, freshness_column, source_timestamp_field, ttl_minutes)| {
                    Ok(RegistryEntry {
                        data_type: data_type(&dt)?,
                        storage_target,
                        freshness_column,
                        source_timestamp_field,
                        ttl_minutes,
                    })
                },
            )
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_row_mapping() {
        let id = Uuid::new_v4();
        let admitted = BatchOutcome::try_from(OutcomeRow {
            out_data_type: "quote".into(),
            out_outcome: "admitted".into(),
            out_job_id: Some(id),
        })
        .unwrap();
        assert_eq!(admitted.outcome, EnqueueOutcome::Admitted(id));

        let unknown = BatchOutcome::try_from(OutcomeRow {
            out_data_type: "quote".into(),
            out_outcome: "dropped".into(),
            out_job_id: None,
        });
        assert!(unknown.is_err());
    }

    #[test]
    fn test_job_row_rejects_unknown_status() {
        let now = Utc::now();
        let row = JobRow {
            id: Uuid::new_v4(),
            entity_key: "AAPL".into(),
            data_type: "quote".into(),
            status: "paused".into(),
            priority: 0,
            created_at: now,
            available_at: now,
            claimed_at: None,
            worker_id: None,
            attempt_count: 1,
            last_error: None,
            completed_at: None,
            wire_bytes: None,
            retry_of: None,
        };
        assert!(QueueJob::try_from(row).is_err());
    }
}
