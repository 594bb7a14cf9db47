//! Execution Engine Adapter.
//!
//! Abstracts the platform's job runner. The engine owns the truth about a
//! running unit (status, counters, context); the reconciler pulls snapshots
//! from it into the Job Record Store.

pub mod budget;
pub mod local;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use jobctl_core::{ExecutionMode, ItemError, JobContext, JobId, JobStatus, LaunchConfig, UnitFailure};

use crate::registry::UnitWork;

pub use budget::{BudgetPermit, BudgetUsage, ConcurrencyBudget};
pub use local::LocalEngine;

/// Engine-side failures at launch time.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// The concurrent-job ceiling is reached. Callers queue or reject.
    #[error("concurrency limit of {ceiling} active units reached")]
    ConcurrencyLimitExceeded { ceiling: usize },
    /// The unit or its launch options were refused; retrying will not help.
    #[error("unit rejected: {0}")]
    Rejected(String),
    #[error("engine failure: {0}")]
    Internal(String),
}

/// The engine's own view of one job.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub job_id: JobId,
    pub status: JobStatus,
    pub items_total: Option<u64>,
    pub items_processed: u64,
    /// Every per-item error so far, in the order they were reported.
    pub item_errors: Vec<ItemError>,
    pub failure: Option<UnitFailure>,
    /// Latest context returned by the unit.
    pub context: JobContext,
    pub slices_executed: u64,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl EngineSnapshot {
    pub fn new(job_id: JobId, context: JobContext, at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            status: JobStatus::Queued,
            items_total: None,
            items_processed: 0,
            item_errors: Vec::new(),
            failure: None,
            context,
            slices_executed: 0,
            updated_at: at,
            finished_at: None,
        }
    }

    pub fn error_count(&self) -> u64 {
        self.item_errors.len() as u64
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Platform job runner.
///
/// `launch` and `cancel` return immediately; nothing here blocks for the
/// duration of a unit.
pub trait ExecutionEngine: Send + Sync {
    /// Stable name stamped on every record this engine launches. Processes
    /// sharing a store must use distinct names.
    fn name(&self) -> &str;

    /// Start `work` and return the engine-assigned id.
    fn launch(
        &self,
        work: UnitWork,
        mode: ExecutionMode,
        config: &LaunchConfig,
        context: JobContext,
    ) -> Result<JobId, EngineError>;

    /// Request cooperative cancellation. `true` if the request was accepted;
    /// the unit stops at its next checkpoint.
    fn cancel(&self, job_id: JobId) -> bool;

    fn status(&self, job_id: JobId) -> Option<EngineSnapshot>;

    /// Forget a finished job once its final state has been recorded.
    fn release(&self, job_id: JobId);

    fn usage(&self) -> BudgetUsage;
}

impl<E: ExecutionEngine + ?Sized> ExecutionEngine for Arc<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn launch(
        &self,
        work: UnitWork,
        mode: ExecutionMode,
        config: &LaunchConfig,
        context: JobContext,
    ) -> Result<JobId, EngineError> {
        (**self).launch(work, mode, config, context)
    }

    fn cancel(&self, job_id: JobId) -> bool {
        (**self).cancel(job_id)
    }

    fn status(&self, job_id: JobId) -> Option<EngineSnapshot> {
        (**self).status(job_id)
    }

    fn release(&self, job_id: JobId) {
        (**self).release(job_id)
    }

    fn usage(&self) -> BudgetUsage {
        (**self).usage()
    }
}
