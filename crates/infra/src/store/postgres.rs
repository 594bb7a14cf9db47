//! Postgres-backed job store.
//!
//! Records are kept as a JSONB body next to the columns the store filters on
//! (`logical_name`, `status`, `settled`, `created_at`, `version`).
//!
//! ## Atomic reservations
//!
//! `reserve` and `commit` take a transaction-scoped advisory lock keyed on the
//! logical name, so the "is anything active?" check and the reservation insert
//! cannot interleave with another dispatcher doing the same.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` / `Conflict` |
//! | Database (connection exception) | `08xxx` | `Unavailable` |
//! | Database (admin shutdown etc.) | `57Pxx` | `Unavailable` |
//! | Io, Tls, PoolTimedOut, PoolClosed | N/A | `Unavailable` |
//! | Other | Any other | `Storage` |
//!
//! ## Runtime bridging
//!
//! The `JobStore` trait is synchronous. Calls made from a tokio worker thread
//! run through `block_in_place`; calls from plain threads (the reconciler)
//! block on the runtime handle captured at construction.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::future::Future;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use jobctl_core::{ErrorLogEntry, ExpectedVersion, JobId, JobRecord, JobStatus};

use super::{JobStats, JobStore, Reservation, StoreError, RESERVATION_TTL};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS job_records (
    id UUID PRIMARY KEY,
    logical_name TEXT NOT NULL,
    status TEXT NOT NULL,
    settled BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL,
    version BIGINT NOT NULL,
    body JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS job_records_name_status ON job_records (logical_name, status);
CREATE INDEX IF NOT EXISTS job_records_created ON job_records (created_at);

CREATE TABLE IF NOT EXISTS job_reservations (
    logical_name TEXT PRIMARY KEY,
    token UUID NOT NULL,
    supersedes UUID NULL,
    reserved_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS job_errors (
    id UUID PRIMARY KEY,
    job_id UUID NOT NULL,
    recorded_at TIMESTAMPTZ NOT NULL,
    body JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS job_errors_job ON job_errors (job_id, recorded_at);
"#;

const ACTIVE_STATUSES: [&str; 3] = ["queued", "preparing", "running"];

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    runtime: tokio::runtime::Handle,
}

impl PostgresJobStore {
    /// Wrap an existing pool. Must be called from within a tokio runtime.
    pub fn new(pool: PgPool) -> Result<Self, StoreError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            StoreError::Storage(
                "PostgresJobStore requires a tokio runtime; construct it from within one".to_string(),
            )
        })?;
        Ok(Self {
            pool: Arc::new(pool),
            runtime,
        })
    }

    /// Connect and make sure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool)?;
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Create tables and indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    fn block<F, T>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(_) => tokio::task::block_in_place(|| self.runtime.block_on(fut)),
            Err(_) => self.runtime.block_on(fut),
        }
    }

    #[instrument(skip(self), err)]
    pub async fn reserve_async(
        &self,
        logical_name: &str,
        supersedes: Option<JobId>,
        now: DateTime<Utc>,
    ) -> Result<Reservation, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        lock_name(&mut tx, logical_name).await?;

        let active = sqlx::query(
            r#"
            SELECT id
            FROM job_records
            WHERE logical_name = $1
                AND (status = ANY($2) OR body->'settlement'->>'kind' = 'retry_scheduled')
                AND ($3::uuid IS NULL OR id <> $3)
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(logical_name)
        .bind(&ACTIVE_STATUSES[..])
        .bind(supersedes.map(|id| *id.as_uuid()))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("find_active", e))?;

        if let Some(row) = active {
            let id: Uuid = row
                .try_get("id")
                .map_err(|e| StoreError::Storage(format!("failed to read id: {e}")))?;
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::ActiveJob {
                logical_name: logical_name.to_string(),
                conflicting: Some(JobId::from_uuid(id)),
            });
        }

        let cutoff = now - RESERVATION_TTL;
        sqlx::query("DELETE FROM job_reservations WHERE logical_name = $1 AND reserved_at <= $2")
            .bind(logical_name)
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("expire_reservation", e))?;

        let reservation = Reservation::new(logical_name, supersedes, now);
        let inserted = sqlx::query(
            r#"
            INSERT INTO job_reservations (logical_name, token, supersedes, reserved_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (logical_name) DO NOTHING
            "#,
        )
        .bind(&reservation.logical_name)
        .bind(reservation.token)
        .bind(supersedes.map(|id| *id.as_uuid()))
        .bind(reservation.reserved_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_reservation", e))?;

        if inserted.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::ActiveJob {
                logical_name: logical_name.to_string(),
                conflicting: None,
            });
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(reservation)
    }

    #[instrument(
        skip(self, reservation, record),
        fields(logical_name = %reservation.logical_name, job_id = %record.id),
        err
    )]
    pub async fn commit_async(
        &self,
        reservation: &Reservation,
        mut record: JobRecord,
    ) -> Result<JobRecord, StoreError> {
        if record.logical_name != reservation.logical_name {
            return Err(StoreError::Storage(format!(
                "record for '{}' committed against reservation for '{}'",
                record.logical_name, reservation.logical_name
            )));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        lock_name(&mut tx, &reservation.logical_name).await?;

        let released = sqlx::query("DELETE FROM job_reservations WHERE logical_name = $1 AND token = $2")
            .bind(&reservation.logical_name)
            .bind(reservation.token)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("take_reservation", e))?;
        if released.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::ReservationLost(reservation.logical_name.clone()));
        }

        record.version = 1;
        insert_record(&mut tx, &record).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(record)
    }

    #[instrument(skip(self, record), fields(job_id = %record.id, version = record.version), err)]
    pub async fn update_async(
        &self,
        record: &JobRecord,
        expected: ExpectedVersion,
    ) -> Result<JobRecord, StoreError> {
        let expected_version = match expected {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(v as i64),
        };

        let mut next = record.clone();
        let row = sqlx::query(
            r#"
            UPDATE job_records
            SET status = $2, settled = $3, version = version + 1, body = $4
            WHERE id = $1 AND ($5::bigint IS NULL OR version = $5)
            RETURNING version
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.status.as_str())
        .bind(record.is_settled())
        .bind(to_body(record)?)
        .bind(expected_version)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_record", e))?;

        match row {
            Some(row) => {
                let version: i64 = row
                    .try_get("version")
                    .map_err(|e| StoreError::Storage(format!("failed to read version: {e}")))?;
                next.version = version as u64;
                Ok(next)
            }
            None => match self.get_async(record.id).await? {
                Some(current) => Err(StoreError::Conflict(format!(
                    "job {}: expected {:?}, found version {}",
                    record.id, expected, current.version
                ))),
                None => Err(StoreError::NotFound(record.id)),
            },
        }
    }

    #[instrument(skip(self), err)]
    pub async fn get_async(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query("SELECT body, version FROM job_records WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_record", e))?;
        row.map(|r| record_from_row(&r)).transpose()
    }

    async fn select_records(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(record_from_row).collect()
    }
}

impl JobStore for PostgresJobStore {
    fn reserve(
        &self,
        logical_name: &str,
        supersedes: Option<JobId>,
        now: DateTime<Utc>,
    ) -> Result<Reservation, StoreError> {
        self.block(self.reserve_async(logical_name, supersedes, now))
    }

    fn commit(&self, reservation: &Reservation, record: JobRecord) -> Result<JobRecord, StoreError> {
        self.block(self.commit_async(reservation, record))
    }

    fn release(&self, reservation: &Reservation) -> Result<(), StoreError> {
        self.block(async {
            sqlx::query("DELETE FROM job_reservations WHERE logical_name = $1 AND token = $2")
                .bind(&reservation.logical_name)
                .bind(reservation.token)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("release_reservation", e))?;
            Ok(())
        })
    }

    fn insert(&self, mut record: JobRecord) -> Result<JobRecord, StoreError> {
        self.block(async {
            record.version = 1;
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin_transaction", e))?;
            insert_record(&mut tx, &record).await?;
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;
            Ok(record)
        })
    }

    fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        self.block(self.get_async(job_id))
    }

    fn update(&self, record: &JobRecord, expected: ExpectedVersion) -> Result<JobRecord, StoreError> {
        self.block(self.update_async(record, expected))
    }

    fn list_active(&self) -> Result<Vec<JobRecord>, StoreError> {
        self.block(self.select_records(
            "list_active",
            sqlx::query(
                r#"
                SELECT body, version FROM job_records
                WHERE status = ANY($1)
                ORDER BY created_at ASC, id ASC
                "#,
            )
            .bind(&ACTIVE_STATUSES[..]),
        ))
    }

    fn list_unsettled(&self) -> Result<Vec<JobRecord>, StoreError> {
        self.block(self.select_records(
            "list_unsettled",
            sqlx::query(
                r#"
                SELECT body, version FROM job_records
                WHERE NOT (status = ANY($1)) AND settled = FALSE
                ORDER BY created_at ASC, id ASC
                "#,
            )
            .bind(&ACTIVE_STATUSES[..]),
        ))
    }

    fn history(
        &self,
        logical_name: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<JobRecord>, StoreError> {
        self.block(self.select_records(
            "history",
            sqlx::query(
                r#"
                SELECT body, version FROM job_records
                WHERE logical_name = $1
                    AND ($2::timestamptz IS NULL OR created_at >= $2)
                ORDER BY created_at ASC, id ASC
                "#,
            )
            .bind(logical_name)
            .bind(since),
        ))
    }

    fn append_errors(&self, entries: &[ErrorLogEntry]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.block(async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin_transaction", e))?;
            for entry in entries {
                let body = serde_json::to_value(entry)
                    .map_err(|e| StoreError::Storage(format!("failed to encode error entry: {e}")))?;
                sqlx::query(
                    r#"
                    INSERT INTO job_errors (id, job_id, recorded_at, body)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (id) DO NOTHING
                    "#,
                )
                .bind(entry.id.as_uuid())
                .bind(entry.job_id.as_uuid())
                .bind(entry.recorded_at)
                .bind(body)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("insert_error", e))?;
            }
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;
            Ok(())
        })
    }

    fn errors(&self, job_id: JobId) -> Result<Vec<ErrorLogEntry>, StoreError> {
        self.block(async {
            let rows = sqlx::query(
                "SELECT body FROM job_errors WHERE job_id = $1 ORDER BY recorded_at ASC, id ASC",
            )
            .bind(job_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_errors", e))?;

            rows.iter()
                .map(|row| {
                    let body: serde_json::Value = row
                        .try_get("body")
                        .map_err(|e| StoreError::Storage(format!("failed to read body: {e}")))?;
                    serde_json::from_value(body)
                        .map_err(|e| StoreError::Storage(format!("failed to decode error entry: {e}")))
                })
                .collect()
        })
    }

    fn stats(&self) -> Result<JobStats, StoreError> {
        self.block(async {
            let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM job_records GROUP BY status")
                .fetch_all(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("stats", e))?;

            let mut stats = JobStats::default();
            for row in rows {
                let status: String = row
                    .try_get("status")
                    .map_err(|e| StoreError::Storage(format!("failed to read status: {e}")))?;
                let n: i64 = row
                    .try_get("n")
                    .map_err(|e| StoreError::Storage(format!("failed to read count: {e}")))?;
                let status: JobStatus = status.parse()?;
                for _ in 0..n {
                    stats.count(status);
                }
            }
            Ok(stats)
        })
    }
}

/// Serialize reservations for one logical name until the transaction ends.
async fn lock_name(tx: &mut Transaction<'_, Postgres>, logical_name: &str) -> Result<(), StoreError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(logical_name)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("advisory_lock", e))?;
    Ok(())
}

async fn insert_record(tx: &mut Transaction<'_, Postgres>, record: &JobRecord) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO job_records (id, logical_name, status, settled, created_at, version, body)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(record.id.as_uuid())
    .bind(&record.logical_name)
    .bind(record.status.as_str())
    .bind(record.is_settled())
    .bind(record.created_at)
    .bind(record.version as i64)
    .bind(to_body(record)?)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::AlreadyExists(record.id)
        } else {
            map_sqlx_error("insert_record", e)
        }
    })?;
    Ok(())
}

fn to_body(record: &JobRecord) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(record)
        .map_err(|e| StoreError::Storage(format!("failed to encode job record: {e}")))
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<JobRecord, StoreError> {
    let body: serde_json::Value = row
        .try_get("body")
        .map_err(|e| StoreError::Storage(format!("failed to read body: {e}")))?;
    let version: i64 = row
        .try_get("version")
        .map_err(|e| StoreError::Storage(format!("failed to read version: {e}")))?;
    let mut record: JobRecord = serde_json::from_value(body)
        .map_err(|e| StoreError::Storage(format!("failed to decode job record: {e}")))?;
    record.version = version as u64;
    Ok(record)
}

/// Map SQLx errors to StoreError. Anything that means "cannot reach the
/// database" becomes `Unavailable` so callers fail closed.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some(code) if code.starts_with("08") || code.starts_with("57P") => {
                    StoreError::Unavailable(msg)
                }
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => StoreError::Unavailable(format!("tls error in {operation}: {e}")),
        sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_fail_closed() {
        assert!(matches!(
            map_sqlx_error("reserve", sqlx::Error::PoolTimedOut),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            map_sqlx_error("reserve", sqlx::Error::PoolClosed),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            map_sqlx_error("get_record", sqlx::Error::RowNotFound),
            StoreError::Storage(_)
        ));
    }
}
