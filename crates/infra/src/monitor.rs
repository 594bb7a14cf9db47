//! Monitoring Dashboard Service.
//!
//! Read side over the Job Record Store, plus `cancel`, the single write path
//! back into the engine.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, instrument};

use jobctl_core::{
    ErrorLogEntry, ExecutionMode, FailureKind, JobContext, JobId, JobRecord, JobStatus, Settlement,
};

use crate::engine::{BudgetUsage, ExecutionEngine};
use crate::store::{JobStats, JobStore, StoreError, modify};

#[derive(Debug, Clone, thiserror::Error)]
pub enum MonitorError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Dashboard view of one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub logical_name: String,
    pub mode: ExecutionMode,
    pub status: JobStatus,
    pub items_total: Option<u64>,
    pub items_processed: u64,
    pub error_count: u64,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Projected completion, from the average rate so far.
    pub eta: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub parent_job_id: Option<JobId>,
    pub reason: Option<String>,
    pub failure: Option<FailureKind>,
    pub settlement: Option<Settlement>,
    pub context: JobContext,
    /// Engine that launched the unit.
    pub engine: Option<String>,
}

impl JobSummary {
    pub fn from_record(record: &JobRecord, now: DateTime<Utc>) -> Self {
        Self {
            id: record.id,
            logical_name: record.logical_name.clone(),
            mode: record.mode,
            status: record.status,
            items_total: record.items_total,
            items_processed: record.items_processed,
            error_count: record.error_count,
            progress: record.progress(),
            created_at: record.created_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
            eta: eta(record, now),
            retry_count: record.retry_count,
            max_retries: record.max_retries,
            parent_job_id: record.parent_job_id,
            reason: record.status_reason.clone(),
            failure: record.failure,
            settlement: record.settlement.clone(),
            context: record.context.clone(),
            engine: record.engine.clone(),
        }
    }
}

/// `now + elapsed / processed * remaining` for running records with a known
/// total and some progress.
fn eta(record: &JobRecord, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if record.status != JobStatus::Running || record.items_processed == 0 {
        return None;
    }
    let total = record.items_total?;
    let started = record.started_at?;
    let remaining = total.saturating_sub(record.items_processed);
    if remaining == 0 {
        return Some(now);
    }
    let elapsed_ms = (now - started).num_milliseconds().max(0) as f64;
    let per_item_ms = elapsed_ms / record.items_processed as f64;
    let remaining_ms = (per_item_ms * remaining as f64).min(i64::MAX as f64 / 2.0);
    Some(now + Duration::milliseconds(remaining_ms as i64))
}

/// Aggregate counters for the dashboard header.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardStats {
    pub jobs: JobStats,
    pub budget: BudgetUsage,
}

#[derive(Clone)]
pub struct MonitoringService {
    store: Arc<dyn JobStore>,
    engine: Arc<dyn ExecutionEngine>,
}

impl MonitoringService {
    pub fn new(store: Arc<dyn JobStore>, engine: Arc<dyn ExecutionEngine>) -> Self {
        Self { store, engine }
    }

    pub fn list_active(&self) -> Result<Vec<JobSummary>, MonitorError> {
        let now = Utc::now();
        Ok(self
            .store
            .list_active()?
            .iter()
            .map(|r| JobSummary::from_record(r, now))
            .collect())
    }

    /// `items_processed / items_total`, 0 while the total is unknown.
    pub fn progress(&self, job_id: JobId) -> Result<f64, MonitorError> {
        Ok(self.record(job_id)?.progress())
    }

    pub fn job(&self, job_id: JobId) -> Result<JobSummary, MonitorError> {
        Ok(JobSummary::from_record(&self.record(job_id)?, Utc::now()))
    }

    pub fn errors(&self, job_id: JobId) -> Result<Vec<ErrorLogEntry>, MonitorError> {
        self.record(job_id)?;
        Ok(self.store.errors(job_id)?)
    }

    pub fn history(
        &self,
        logical_name: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<JobSummary>, MonitorError> {
        let now = Utc::now();
        Ok(self
            .store
            .history(logical_name, since)?
            .iter()
            .map(|r| JobSummary::from_record(r, now))
            .collect())
    }

    pub fn stats(&self) -> Result<DashboardStats, MonitorError> {
        Ok(DashboardStats {
            jobs: self.store.stats()?,
            budget: self.engine.usage(),
        })
    }

    /// Request cancellation.
    ///
    /// `false` for terminal or unknown-to-engine jobs and for repeated
    /// requests. On acceptance the record is optimistically marked Aborted;
    /// reconciliation may later restore the engine's own terminal status.
    ///
    /// A job launched by another process's engine is marked Aborted here and
    /// the owner's reconciler delivers the cancel on its next tick.
    #[instrument(skip(self))]
    pub fn cancel(&self, job_id: JobId) -> Result<bool, MonitorError> {
        let record = self.record(job_id)?;
        if record.is_terminal() {
            return Ok(false);
        }
        let reason = if record.is_owned_by(self.engine.name()) {
            if !self.engine.cancel(job_id) {
                return Ok(false);
            }
            "cancelled by operator".to_string()
        } else {
            // The owner's reconciler passes the request to its engine.
            format!(
                "cancelled by operator, awaiting engine {}",
                record.engine.as_deref().unwrap_or("unknown")
            )
        };

        let accepted_at = Utc::now();
        let mut aborted = false;
        modify(self.store.as_ref(), job_id, |r| {
            aborted = false;
            if r.is_terminal() {
                return Ok(false);
            }
            r.abort(accepted_at, reason.clone())?;
            aborted = true;
            Ok(true)
        })?;
        if aborted {
            info!(logical_name = %record.logical_name, "cancel accepted, job marked aborted");
        }
        Ok(aborted)
    }

    fn record(&self, job_id: JobId) -> Result<JobRecord, MonitorError> {
        self.store.get(job_id)?.ok_or(MonitorError::NotFound(job_id))
    }
}
