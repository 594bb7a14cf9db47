//! Job Record Store: the single source of truth for job metadata.
//!
//! ## Design
//!
//! - Records are never deleted here
//! - Writes to one record are serialized with a version check (`ExpectedVersion`)
//! - Launch slots are handed out through reservations, so the check for an
//!   active job and the record insert are one atomic step per logical name
//!
//! Implementations:
//! - `InMemoryJobStore`: tests/dev
//! - `PostgresJobStore`: durable, shared between processes

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use jobctl_core::{DomainError, ErrorLogEntry, ExpectedVersion, JobId, JobRecord, JobStatus};

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

/// How long an uncommitted reservation blocks its logical name.
pub const RESERVATION_TTL: Duration = Duration::seconds(60);

/// Attempts `modify` makes before giving up on a contended record.
pub const MAX_MODIFY_ATTEMPTS: usize = 5;

/// Exclusive right to create the next record for a logical job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub token: Uuid,
    pub logical_name: String,
    /// Failed record this launch continues, exempt from the active check.
    pub supersedes: Option<JobId>,
    pub reserved_at: DateTime<Utc>,
}

impl Reservation {
    pub fn new(logical_name: impl Into<String>, supersedes: Option<JobId>, now: DateTime<Utc>) -> Self {
        Self {
            token: Uuid::now_v7(),
            logical_name: logical_name.into(),
            supersedes,
            reserved_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.reserved_at >= RESERVATION_TTL
    }
}

/// Record counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub preparing: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub aborted: usize,
    pub total: usize,
}

impl JobStats {
    pub fn count(&mut self, status: JobStatus) {
        match status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Preparing => self.preparing += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Aborted => self.aborted += 1,
        }
        self.total += 1;
    }

    pub fn active(&self) -> usize {
        self.queued + self.preparing + self.running
    }
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Persistence layer unreachable. Callers fail closed.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A record (or an in-flight reservation, when `conflicting` is `None`)
    /// already holds the logical name.
    #[error("logical job '{logical_name}' is already active")]
    ActiveJob {
        logical_name: String,
        conflicting: Option<JobId>,
    },
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    /// Optimistic concurrency check failed.
    #[error("concurrent modification: {0}")]
    Conflict(String),
    #[error("reservation for '{0}' is no longer held")]
    ReservationLost(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job store abstraction.
///
/// Methods are synchronous; all of them may block briefly on IO.
pub trait JobStore: Send + Sync {
    /// Atomically check that `logical_name` has no record holding the slot
    /// (active, or failed with a retry pending) other than `supersedes` and no
    /// live reservation, then reserve it.
    fn reserve(
        &self,
        logical_name: &str,
        supersedes: Option<JobId>,
        now: DateTime<Utc>,
    ) -> Result<Reservation, StoreError>;

    /// Insert the launched record and drop its reservation in one step.
    /// Returns the record as stored (version 1).
    fn commit(&self, reservation: &Reservation, record: JobRecord) -> Result<JobRecord, StoreError>;

    /// Drop a reservation whose launch did not happen.
    fn release(&self, reservation: &Reservation) -> Result<(), StoreError>;

    /// Insert a record that never went through a launch (e.g. a refused chain link).
    fn insert(&self, record: JobRecord) -> Result<JobRecord, StoreError>;

    fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Replace a record if its stored version matches `expected`.
    /// Returns the record with its new version.
    fn update(&self, record: &JobRecord, expected: ExpectedVersion) -> Result<JobRecord, StoreError>;

    /// Records in Queued, Preparing or Running, oldest first.
    fn list_active(&self) -> Result<Vec<JobRecord>, StoreError>;

    /// Terminal records whose follow-up is not finished, oldest first.
    fn list_unsettled(&self) -> Result<Vec<JobRecord>, StoreError>;

    /// Records of one logical job created at or after `since`, oldest first.
    fn history(
        &self,
        logical_name: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<JobRecord>, StoreError>;

    fn append_errors(&self, entries: &[ErrorLogEntry]) -> Result<(), StoreError>;

    /// Error log of one job, in recording order.
    fn errors(&self, job_id: JobId) -> Result<Vec<ErrorLogEntry>, StoreError>;

    fn stats(&self) -> Result<JobStats, StoreError>;
}

impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    fn reserve(
        &self,
        logical_name: &str,
        supersedes: Option<JobId>,
        now: DateTime<Utc>,
    ) -> Result<Reservation, StoreError> {
        (**self).reserve(logical_name, supersedes, now)
    }

    fn commit(&self, reservation: &Reservation, record: JobRecord) -> Result<JobRecord, StoreError> {
        (**self).commit(reservation, record)
    }

    fn release(&self, reservation: &Reservation) -> Result<(), StoreError> {
        (**self).release(reservation)
    }

    fn insert(&self, record: JobRecord) -> Result<JobRecord, StoreError> {
        (**self).insert(record)
    }

    fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        (**self).get(job_id)
    }

    fn update(&self, record: &JobRecord, expected: ExpectedVersion) -> Result<JobRecord, StoreError> {
        (**self).update(record, expected)
    }

    fn list_active(&self) -> Result<Vec<JobRecord>, StoreError> {
        (**self).list_active()
    }

    fn list_unsettled(&self) -> Result<Vec<JobRecord>, StoreError> {
        (**self).list_unsettled()
    }

    fn history(
        &self,
        logical_name: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<JobRecord>, StoreError> {
        (**self).history(logical_name, since)
    }

    fn append_errors(&self, entries: &[ErrorLogEntry]) -> Result<(), StoreError> {
        (**self).append_errors(entries)
    }

    fn errors(&self, job_id: JobId) -> Result<Vec<ErrorLogEntry>, StoreError> {
        (**self).errors(job_id)
    }

    fn stats(&self) -> Result<JobStats, StoreError> {
        (**self).stats()
    }
}

/// Read-modify-write a record under optimistic concurrency.
///
/// `f` returns whether it changed the record; unchanged records are not
/// written. On a version conflict the record is re-read and `f` re-applied, up
/// to `MAX_MODIFY_ATTEMPTS` times.
pub fn modify<S, F>(store: &S, job_id: JobId, mut f: F) -> Result<JobRecord, StoreError>
where
    S: JobStore + ?Sized,
    F: FnMut(&mut JobRecord) -> Result<bool, StoreError>,
{
    let mut last_conflict = None;
    for _ in 0..MAX_MODIFY_ATTEMPTS {
        let current = store.get(job_id)?.ok_or(StoreError::NotFound(job_id))?;
        let mut next = current.clone();
        if !f(&mut next)? {
            return Ok(current);
        }
        match store.update(&next, ExpectedVersion::Exact(current.version)) {
            Ok(stored) => return Ok(stored),
            Err(StoreError::Conflict(msg)) => {
                tracing::debug!(job_id = %job_id, "record changed underneath, re-applying");
                last_conflict = Some(msg);
            }
            Err(e) => return Err(e),
        }
    }
    Err(StoreError::Conflict(last_conflict.unwrap_or_else(|| {
        format!("job {job_id} kept changing during update")
    })))
}

/// Number of links from the chain root down to `job_id` (a root has depth 1).
///
/// Walks `parent_job_id` back-references; stops after `ceiling + 1` steps so a
/// damaged lineage cannot loop forever.
pub fn lineage_depth<S>(store: &S, job_id: JobId, ceiling: usize) -> Result<usize, StoreError>
where
    S: JobStore + ?Sized,
{
    let mut depth = 0;
    let mut cursor = Some(job_id);
    while let Some(id) = cursor {
        depth += 1;
        if depth > ceiling {
            break;
        }
        cursor = store.get(id)?.and_then(|r| r.parent_job_id);
    }
    Ok(depth)
}
