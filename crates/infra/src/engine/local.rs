//! In-process execution engine: one worker thread per launched unit.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use jobctl_core::{
    ExecutionMode, FailureKind, ItemError, JobContext, JobId, JobStatus, LaunchConfig, UnitFailure,
};

use super::{BudgetUsage, ConcurrencyBudget, EngineError, EngineSnapshot, ExecutionEngine};
use crate::registry::UnitWork;

/// Slice size used when a chunked launch does not name one.
pub const DEFAULT_CHUNK_SIZE: usize = 200;

#[derive(Debug)]
struct Slot {
    snapshot: Mutex<EngineSnapshot>,
    cancel_requested: AtomicBool,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, EngineSnapshot> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut EngineSnapshot)) {
        let mut snapshot = self.lock();
        f(&mut snapshot);
        snapshot.updated_at = Utc::now();
    }

    fn finish(&self, status: JobStatus, failure: Option<UnitFailure>) {
        self.update(|s| {
            s.status = status;
            s.failure = failure;
            s.finished_at = Some(Utc::now());
        });
    }

    fn cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy)]
struct RunPlan {
    slice_size: usize,
    /// SingleShot/Recurring bodies run exactly once, even with no input.
    single_invocation: bool,
    timeout: Option<Duration>,
}

/// Engine that runs units on dedicated threads inside this process.
///
/// Launches draw a permit from the `ConcurrencyBudget`; the permit is held by
/// the worker thread and returned when the unit finishes.
#[derive(Debug, Clone)]
pub struct LocalEngine {
    name: String,
    budget: ConcurrencyBudget,
    default_chunk_size: usize,
    slots: Arc<Mutex<HashMap<JobId, Arc<Slot>>>>,
}

impl LocalEngine {
    pub fn new(budget: ConcurrencyBudget) -> Self {
        Self {
            name: "jobctl-engine".to_string(),
            budget,
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_default_chunk_size(mut self, size: usize) -> Self {
        self.default_chunk_size = size.max(1);
        self
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<JobId, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, job_id: JobId) -> Option<Arc<Slot>> {
        self.slots().get(&job_id).cloned()
    }
}

impl ExecutionEngine for LocalEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn launch(
        &self,
        work: UnitWork,
        mode: ExecutionMode,
        config: &LaunchConfig,
        context: JobContext,
    ) -> Result<JobId, EngineError> {
        config
            .validate()
            .map_err(|e| EngineError::Rejected(e.to_string()))?;
        if work.requires_external_calls() && !config.allow_external_calls {
            return Err(EngineError::Rejected(
                "unit makes external calls but allow_external_calls is off".to_string(),
            ));
        }

        let permit = self
            .budget
            .try_acquire()
            .ok_or(EngineError::ConcurrencyLimitExceeded {
                ceiling: self.budget.ceiling(),
            })?;

        let job_id = JobId::new();
        let slot = Arc::new(Slot {
            snapshot: Mutex::new(EngineSnapshot::new(job_id, context.clone(), Utc::now())),
            cancel_requested: AtomicBool::new(false),
        });
        self.slots().insert(job_id, slot.clone());

        let plan = RunPlan {
            slice_size: config.slice_size(mode, self.default_chunk_size).max(1),
            single_invocation: mode != ExecutionMode::Chunked,
            timeout: config.timeout(),
        };

        let engine = self.name.clone();
        let spawned = thread::Builder::new()
            .name(format!("{engine}-unit"))
            .spawn(move || {
                let _permit = permit;
                debug!(engine = %engine, job_id = %job_id, mode = %mode, "unit started");
                run_unit(&slot, &work, plan, context);
                debug!(engine = %engine, job_id = %job_id, status = ?slot.lock().status, "unit finished");
            });

        if let Err(e) = spawned {
            self.slots().remove(&job_id);
            return Err(EngineError::Internal(format!("failed to spawn unit thread: {e}")));
        }

        info!(engine = %self.name, job_id = %job_id, mode = %mode, "unit launched");
        Ok(job_id)
    }

    fn cancel(&self, job_id: JobId) -> bool {
        let Some(slot) = self.slot(job_id) else {
            return false;
        };
        if slot.lock().is_terminal() {
            return false;
        }
        let accepted = !slot.cancel_requested.swap(true, Ordering::SeqCst);
        if accepted {
            info!(engine = %self.name, job_id = %job_id, "cancellation requested");
        }
        accepted
    }

    fn status(&self, job_id: JobId) -> Option<EngineSnapshot> {
        self.slot(job_id).map(|slot| slot.lock().clone())
    }

    fn release(&self, job_id: JobId) {
        let mut slots = self.slots();
        if slots.get(&job_id).is_some_and(|slot| slot.lock().is_terminal()) {
            slots.remove(&job_id);
        }
    }

    fn usage(&self) -> BudgetUsage {
        self.budget.usage()
    }
}

fn run_unit(slot: &Slot, work: &UnitWork, plan: RunPlan, mut context: JobContext) {
    let started = Instant::now();
    slot.update(|s| s.status = JobStatus::Preparing);

    if slot.cancelled() {
        slot.finish(JobStatus::Aborted, None);
        return;
    }

    let mut cursor = match work.source.open(&context) {
        Ok(cursor) => cursor,
        Err(e) => {
            slot.finish(JobStatus::Failed, Some(UnitFailure::from(&e)));
            return;
        }
    };
    let declared_total = cursor.total();
    slot.update(|s| s.items_total = declared_total);

    let mut offset: u64 = 0;
    let mut first = true;
    loop {
        let slice = cursor.next_slice(plan.slice_size);
        if first {
            slot.update(|s| s.status = JobStatus::Running);
        }
        if slice.is_empty() && !(first && plan.single_invocation) {
            break;
        }
        first = false;

        // Checkpoint: cancellation and time budget are honoured between slices.
        if slot.cancelled() {
            slot.finish(JobStatus::Aborted, None);
            return;
        }
        if let Some(limit) = plan.timeout {
            if started.elapsed() > limit {
                slot.finish(
                    JobStatus::Failed,
                    Some(UnitFailure::new(
                        FailureKind::Timeout,
                        format!("exceeded timeout of {}s after {offset} items", limit.as_secs()),
                    )),
                );
                return;
            }
        }

        let len = slice.len() as u64;
        if declared_total.is_some_and(|total| offset + len > total) {
            slot.finish(
                JobStatus::Failed,
                Some(UnitFailure::new(
                    FailureKind::Engine,
                    "record source yielded more records than it declared",
                )),
            );
            return;
        }

        let result = panic::catch_unwind(AssertUnwindSafe(|| work.unit.execute(&slice, &context)));
        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                slot.finish(JobStatus::Failed, Some(UnitFailure::from(&e)));
                return;
            }
            Err(_) => {
                warn!(job_id = %slot.lock().job_id, "unit panicked");
                slot.finish(
                    JobStatus::Failed,
                    Some(UnitFailure::new(FailureKind::Engine, "unit panicked")),
                );
                return;
            }
        };

        let processed = outcome.items_processed.min(len);
        let errors: Vec<ItemError> = outcome
            .errors
            .into_iter()
            .map(|e| ItemError {
                item_index: e.item_index.map(|i| offset + i),
                message: e.message,
            })
            .collect();
        if let Some(updated) = outcome.updated_context {
            context = updated;
        }
        let context_now = context.clone();
        slot.update(|s| {
            s.items_processed += processed;
            s.item_errors.extend(errors);
            s.context = context_now;
            s.slices_executed += 1;
        });
        offset += len;

        if plan.single_invocation {
            break;
        }
    }

    slot.update(|s| {
        if s.items_total.is_none() {
            s.items_total = Some(offset);
        }
    });
    slot.finish(JobStatus::Completed, None);
}
