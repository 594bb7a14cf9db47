//! Job records: one per launched unit of work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::JobContext;
use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::mode::{ExecutionMode, LaunchConfig};
use crate::status::JobStatus;
use crate::unit::{FailureKind, UnitFailure};

/// Position of a record inside a named chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainLink {
    pub chain: String,
    pub stage: usize,
}

impl ChainLink {
    pub fn new(chain: impl Into<String>, stage: usize) -> Self {
        Self {
            chain: chain.into(),
            stage,
        }
    }

    pub fn next(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            stage: self.stage + 1,
        }
    }
}

/// What happened after a record reached a terminal state.
///
/// This is archival bookkeeping written once the follow-up (chain, retry,
/// notification) is handled; it is the only field a terminal record still
/// accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Settlement {
    /// The next chain stage was dispatched.
    Chained { successor: JobId },
    /// The chain stopped at this record.
    ChainHalted { reason: String },
    /// A retry is due at `due_at`; not yet dispatched.
    RetryScheduled { due_at: DateTime<Utc>, retry_count: u32 },
    /// The retry was dispatched.
    Retried { successor: JobId },
    /// No further retries.
    GaveUp { reason: String },
    /// Nothing further to do.
    Closed,
}

impl Settlement {
    /// A final settlement needs no more reconciliation work.
    pub fn is_final(&self) -> bool {
        !matches!(self, Settlement::RetryScheduled { .. })
    }
}

/// Metadata of one launched unit of work.
///
/// Created by the dispatcher at launch, advanced by reconciliation from engine
/// snapshots, and settled by the chaining/retry follow-up. Never deleted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Kind of work; shared by every retry and firing of the same logical job.
    pub logical_name: String,
    pub mode: ExecutionMode,
    pub status: JobStatus,
    /// Unknown until the engine has opened the input.
    pub items_total: Option<u64>,
    pub items_processed: u64,
    pub error_count: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub context: JobContext,
    /// Record that enqueued this one (chain lineage). Lookup only.
    pub parent_job_id: Option<JobId>,
    /// Failed record this retry continues.
    pub supersedes: Option<JobId>,
    pub chain: Option<ChainLink>,
    pub config: LaunchConfig,
    /// Human-readable reason; always set for Failed and Aborted.
    pub status_reason: Option<String>,
    pub failure: Option<FailureKind>,
    /// Name of the engine that launched the unit. Only that engine's
    /// snapshots may advance or fail the record.
    #[serde(default)]
    pub engine: Option<String>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub settlement: Option<Settlement>,
    pub settled_at: Option<DateTime<Utc>>,
    /// Store-managed optimistic concurrency version (0 before first insert).
    pub version: u64,
}

impl JobRecord {
    /// A freshly launched record in `Queued`.
    pub fn queued(
        id: JobId,
        logical_name: impl Into<String>,
        mode: ExecutionMode,
        config: LaunchConfig,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            logical_name: logical_name.into(),
            mode,
            status: JobStatus::Queued,
            items_total: None,
            items_processed: 0,
            error_count: 0,
            created_at,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: 0,
            context: JobContext::new(),
            parent_job_id: None,
            supersedes: None,
            chain: None,
            config,
            status_reason: None,
            failure: None,
            engine: None,
            cancel_requested_at: None,
            settlement: None,
            settled_at: None,
            version: 0,
        }
    }

    pub fn with_context(mut self, context: JobContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = Some(engine.into());
        self
    }

    pub fn with_parent(mut self, parent: Option<JobId>) -> Self {
        self.parent_job_id = parent;
        self
    }

    pub fn with_chain(mut self, chain: Option<ChainLink>) -> Self {
        self.chain = chain;
        self
    }

    pub fn with_retries(mut self, retry_count: u32, max_retries: u32, supersedes: Option<JobId>) -> Self {
        self.retry_count = retry_count;
        self.max_retries = max_retries;
        self.supersedes = supersedes;
        self
    }

    /// Check construction-time invariants.
    pub fn validate(&self) -> DomainResult<()> {
        if self.logical_name.trim().is_empty() {
            return Err(DomainError::validation("logical_name must not be empty"));
        }
        if self.retry_count > self.max_retries {
            return Err(DomainError::invariant(format!(
                "retry_count {} exceeds max_retries {}",
                self.retry_count, self.max_retries
            )));
        }
        if let Some(total) = self.items_total {
            if self.items_processed > total {
                return Err(DomainError::invariant(format!(
                    "items_processed {} exceeds items_total {total}",
                    self.items_processed
                )));
            }
        }
        self.config.validate()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Records without an owner predate engine tracking and belong to anyone.
    pub fn is_owned_by(&self, engine: &str) -> bool {
        self.engine.as_deref().is_none_or(|owner| owner == engine)
    }

    /// Whether the record keeps its logical name taken: while active, and
    /// while a failed run waits for its scheduled retry.
    pub fn holds_slot(&self) -> bool {
        self.status.is_active() || matches!(self.settlement, Some(Settlement::RetryScheduled { .. }))
    }

    pub fn retries_remaining(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }

    /// Apply a single state machine transition.
    ///
    /// Failed and Aborted require a non-empty reason so the dashboard can
    /// always explain them.
    pub fn transition(
        &mut self,
        next: JobStatus,
        at: DateTime<Utc>,
        reason: Option<String>,
    ) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        let reason = reason.filter(|r| !r.trim().is_empty());
        if matches!(next, JobStatus::Failed | JobStatus::Aborted) && reason.is_none() {
            return Err(DomainError::validation(format!(
                "a reason is required to move a job to {next}"
            )));
        }

        self.status = next;
        if next == JobStatus::Running {
            self.started_at.get_or_insert(at);
        }
        if next.is_terminal() {
            self.completed_at = Some(at);
        }
        if reason.is_some() {
            self.status_reason = reason;
        }
        Ok(())
    }

    /// Walk forward through every intermediate state up to `target`.
    ///
    /// `reason` is attached to the final step only.
    pub fn advance_to(
        &mut self,
        target: JobStatus,
        at: DateTime<Utc>,
        reason: Option<String>,
    ) -> DomainResult<()> {
        let path = self.status.path_to(target).ok_or(DomainError::InvalidTransition {
            from: self.status,
            to: target,
        })?;
        let last = path.len().saturating_sub(1);
        for (idx, step) in path.into_iter().enumerate() {
            let step_reason = if idx == last { reason.clone() } else { None };
            self.transition(step, at, step_reason)?;
        }
        Ok(())
    }

    /// Move to Failed with a classified failure.
    pub fn fail(&mut self, failure: &UnitFailure, at: DateTime<Utc>) -> DomainResult<()> {
        self.advance_to(JobStatus::Failed, at, Some(failure.message.clone()))?;
        self.failure = Some(failure.kind);
        Ok(())
    }

    /// Record progress reported by the engine.
    ///
    /// Counters never go backwards and the total, once known, never changes.
    /// Returns whether anything changed.
    pub fn record_progress(
        &mut self,
        items_total: Option<u64>,
        items_processed: u64,
        error_count: u64,
    ) -> DomainResult<bool> {
        if self.is_terminal() {
            return Err(DomainError::invariant(format!(
                "job {} is {} and no longer accepts progress",
                self.id, self.status
            )));
        }
        if items_processed < self.items_processed {
            return Err(DomainError::invariant(format!(
                "items_processed went backwards ({} -> {items_processed})",
                self.items_processed
            )));
        }
        if error_count < self.error_count {
            return Err(DomainError::invariant(format!(
                "error_count went backwards ({} -> {error_count})",
                self.error_count
            )));
        }
        let total = match (self.items_total, items_total) {
            (Some(known), Some(reported)) if known != reported => {
                return Err(DomainError::invariant(format!(
                    "items_total changed after it was known ({known} -> {reported})"
                )));
            }
            (Some(known), _) => Some(known),
            (None, reported) => reported,
        };
        if let Some(total) = total {
            if items_processed > total {
                return Err(DomainError::invariant(format!(
                    "items_processed {items_processed} exceeds items_total {total}"
                )));
            }
        }

        let changed = total != self.items_total
            || items_processed != self.items_processed
            || error_count != self.error_count;
        self.items_total = total;
        self.items_processed = items_processed;
        self.error_count = error_count;
        Ok(changed)
    }

    /// Fraction of items processed, in `[0, 1]`. Zero while the total is unknown.
    pub fn progress(&self) -> f64 {
        match self.items_total {
            None => 0.0,
            Some(0) if self.status == JobStatus::Completed => 1.0,
            Some(0) => 0.0,
            Some(total) => (self.items_processed as f64 / total as f64).clamp(0.0, 1.0),
        }
    }

    /// Optimistically abort on an accepted cancel request.
    pub fn abort(&mut self, at: DateTime<Utc>, reason: impl Into<String>) -> DomainResult<()> {
        self.transition(JobStatus::Aborted, at, Some(reason.into()))?;
        self.cancel_requested_at = Some(at);
        Ok(())
    }

    /// Resolve an optimistic `Aborted` against the engine's final word.
    ///
    /// The engine's Completed/Failed wins when it finished no later than the
    /// cancel was accepted. Returns whether the record changed.
    pub fn reconcile_terminal(
        &mut self,
        engine_status: JobStatus,
        engine_finished_at: DateTime<Utc>,
        engine_reason: Option<String>,
        failure: Option<FailureKind>,
    ) -> bool {
        if self.status != JobStatus::Aborted
            || !matches!(engine_status, JobStatus::Completed | JobStatus::Failed)
        {
            return false;
        }
        let Some(cancel_at) = self.cancel_requested_at else {
            return false;
        };
        if engine_finished_at > cancel_at {
            return false;
        }

        self.status = engine_status;
        self.completed_at = Some(engine_finished_at);
        self.failure = failure;
        self.status_reason = match engine_status {
            JobStatus::Failed => Some(
                engine_reason
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or_else(|| "unit failed before cancellation took effect".to_string()),
            ),
            _ => None,
        };
        true
    }

    /// Adopt the engine's last counters once the record is terminal.
    ///
    /// Used after an optimistic abort, when the engine kept counting until it
    /// reached its checkpoint. Counters only grow.
    pub fn absorb_final_counts(
        &mut self,
        items_total: Option<u64>,
        items_processed: u64,
        error_count: u64,
    ) {
        if self.items_total.is_none() {
            self.items_total = items_total;
        }
        self.items_processed = self.items_processed.max(items_processed);
        if let Some(total) = self.items_total {
            self.items_processed = self.items_processed.min(total);
        }
        self.error_count = self.error_count.max(error_count);
    }

    /// Attach the follow-up outcome to a terminal record.
    pub fn settle(&mut self, settlement: Settlement, at: DateTime<Utc>) -> DomainResult<()> {
        if !self.is_terminal() {
            return Err(DomainError::invariant(format!(
                "job {} is {} and cannot be settled",
                self.id, self.status
            )));
        }
        if self.settlement.as_ref().is_some_and(Settlement::is_final) {
            return Err(DomainError::conflict(format!("job {} is already settled", self.id)));
        }
        self.settlement = Some(settlement);
        self.settled_at = Some(at);
        Ok(())
    }

    pub fn is_settled(&self) -> bool {
        self.settlement.as_ref().is_some_and(Settlement::is_final)
    }

    /// One-line description used for notifications and logs.
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{} [{}] {}: {}/{} items, {} errors",
            self.logical_name,
            self.mode,
            self.status,
            self.items_processed,
            self.items_total
                .map(|t| t.to_string())
                .unwrap_or_else(|| "?".to_string()),
            self.error_count,
        );
        if self.retry_count > 0 {
            line.push_str(&format!(", retry {}/{}", self.retry_count, self.max_retries));
        }
        if let Some(reason) = &self.status_reason {
            line.push_str(&format!(" ({reason})"));
        }
        line
    }
}
