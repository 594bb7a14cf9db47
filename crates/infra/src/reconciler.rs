//! Reconciliation loop.
//!
//! There is no completion callback from the engine: the reconciler polls.
//! Each tick:
//!
//! ```text
//! (a) active records   <- engine snapshots   (status, progress, error log, context)
//! (b) terminal records -> settlement         (chain / retry schedule / close, notify)
//! (c) due retries      -> Job Dispatcher
//! (d) due recurring    -> Job Dispatcher
//! ```
//!
//! Every step is idempotent against re-observing the same terminal state:
//! a record's settlement is written once, and follow-up dispatches are looked
//! up before they are repeated.
//!
//! Several processes may share one store. Each reconciler only touches the
//! records its own engine launched; the others are left to their owners.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use jobctl_core::{
    ErrorLogEntry, FailureKind, JobId, JobRecord, JobStatus, Settlement, UnitFailure,
};

use crate::chaining::{ChainDecision, ChainingController};
use crate::dispatcher::{DispatchError, DispatchRequest, JobDispatcher};
use crate::engine::{EngineSnapshot, ExecutionEngine};
use crate::notify::{Notification, Notifier};
use crate::retry::{RetryDecision, RetryHandler};
use crate::schedule::RecurringScheduler;
use crate::store::{JobStore, StoreError, modify};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Active records updated from a snapshot.
    pub synced: usize,
    /// Records given a final settlement.
    pub settled: usize,
    pub chained: usize,
    pub retries_scheduled: usize,
    pub retries_dispatched: usize,
    pub recurring_fired: usize,
    /// Follow-ups left for a later tick (engine at capacity, store down,
    /// engine still stopping a cancelled unit).
    pub deferred: usize,
    pub errors: usize,
}

impl TickReport {
    fn absorb(&mut self, other: &TickReport) {
        self.synced += other.synced;
        self.settled += other.settled;
        self.chained += other.chained;
        self.retries_scheduled += other.retries_scheduled;
        self.retries_dispatched += other.retries_dispatched;
        self.recurring_fired += other.recurring_fired;
        self.deferred += other.deferred;
        self.errors += other.errors;
    }
}

/// Runtime statistics of a spawned reconciler.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcilerStats {
    pub ticks: u64,
    pub failed_ticks: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub totals: TickReport,
    pub uptime_secs: u64,
}

/// Handle to a reconciler running on a background thread.
#[derive(Debug)]
pub struct ReconcilerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ReconcilerStats>>,
}

impl ReconcilerHandle {
    /// Stop after the current tick and wait for the thread.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> ReconcilerStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

enum FollowUp {
    Settle(Settlement),
    Defer(String),
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn JobStore>,
    engine: Arc<dyn ExecutionEngine>,
    dispatcher: JobDispatcher,
    chaining: Arc<ChainingController>,
    retry: RetryHandler,
    notifier: Arc<dyn Notifier>,
    scheduler: Arc<RecurringScheduler>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn JobStore>,
        engine: Arc<dyn ExecutionEngine>,
        dispatcher: JobDispatcher,
        chaining: Arc<ChainingController>,
        retry: RetryHandler,
        notifier: Arc<dyn Notifier>,
        scheduler: Arc<RecurringScheduler>,
    ) -> Self {
        Self {
            store,
            engine,
            dispatcher,
            chaining,
            retry,
            notifier,
            scheduler,
        }
    }

    /// Run one reconciliation pass as of `now`.
    ///
    /// Fails only when the store cannot be listed; per-record problems are
    /// logged, counted and retried on the next tick.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, StoreError> {
        let mut report = TickReport::default();
        self.sync_active(now, &mut report)?;
        self.settle_terminal(now, &mut report)?;
        self.fire_due_retries(now, &mut report)?;
        self.fire_recurring(now, &mut report);
        if report != TickReport::default() {
            debug!(?report, "reconciliation tick");
        }
        Ok(report)
    }

    /// Run `tick` every `interval` on a background thread.
    pub fn spawn(self, interval: Duration) -> std::io::Result<ReconcilerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(ReconcilerStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name("jobctl-reconciler".to_string())
            .spawn(move || reconcile_loop(self, interval, shutdown_rx, stats_clone))?;

        Ok(ReconcilerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }

    fn owns(&self, record: &JobRecord) -> bool {
        record.is_owned_by(self.engine.name())
    }

    // (a)

    fn sync_active(&self, now: DateTime<Utc>, report: &mut TickReport) -> Result<(), StoreError> {
        for record in self.store.list_active()? {
            if !self.owns(&record) {
                continue;
            }
            match self.sync_record(&record, now) {
                Ok(true) => report.synced += 1,
                Ok(false) => {}
                Err(e) => {
                    report.errors += 1;
                    warn!(job_id = %record.id, error = %e, "failed to sync job from engine");
                }
            }
        }
        Ok(())
    }

    fn sync_record(&self, record: &JobRecord, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let snapshot = self.engine.status(record.id);
        let mut entries = Vec::new();
        let mut wrote = false;

        let stored = modify(self.store.as_ref(), record.id, |r| {
            entries.clear();
            wrote = false;
            if r.is_terminal() {
                return Ok(false);
            }
            let before = r.clone();
            match &snapshot {
                Some(snap) => apply_snapshot(r, snap, now, &mut entries)?,
                None => {
                    let failure = UnitFailure::new(FailureKind::Engine, "engine has no record of this job");
                    r.fail(&failure, now)?;
                    entries.push(ErrorLogEntry::unit_failure(r.id, failure.kind, failure.message, now));
                }
            }
            wrote = *r != before;
            Ok(wrote)
        })?;

        if !wrote {
            return Ok(false);
        }
        if stored.status != record.status {
            info!(
                job_id = %stored.id,
                logical_name = %stored.logical_name,
                from = %record.status,
                to = %stored.status,
                items_processed = stored.items_processed,
                error_count = stored.error_count,
                "job status changed"
            );
        }
        self.append_errors(stored.id, &entries);
        Ok(true)
    }

    fn append_errors(&self, job_id: JobId, entries: &[ErrorLogEntry]) {
        if entries.is_empty() {
            return;
        }
        if let Err(e) = self.store.append_errors(entries) {
            warn!(job_id = %job_id, count = entries.len(), error = %e, "failed to append error log entries");
        }
    }

    // (b)

    fn settle_terminal(&self, now: DateTime<Utc>, report: &mut TickReport) -> Result<(), StoreError> {
        for record in self.store.list_unsettled()? {
            let pending_retry = matches!(record.settlement, Some(Settlement::RetryScheduled { .. }));
            if pending_retry || !self.owns(&record) {
                continue;
            }
            if let Err(e) = self.settle_record(record.clone(), now, report) {
                report.errors += 1;
                warn!(job_id = %record.id, error = %e, "failed to settle job");
            }
        }
        Ok(())
    }

    fn settle_record(
        &self,
        record: JobRecord,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), StoreError> {
        let record = if record.status == JobStatus::Aborted && record.cancel_requested_at.is_some() {
            match self.resolve_cancel(record, now)? {
                Some(record) => record,
                None => {
                    report.deferred += 1;
                    return Ok(());
                }
            }
        } else {
            record
        };

        let follow_up = match record.status {
            JobStatus::Completed => self.chain_follow_up(&record, now, report)?,
            JobStatus::Failed => {
                let failure = UnitFailure::new(
                    record.failure.unwrap_or(FailureKind::Runtime),
                    record
                        .status_reason
                        .clone()
                        .unwrap_or_else(|| "unit failed".to_string()),
                );
                match self.retry.on_unit_failed(&record, &failure) {
                    RetryDecision::Retry { delay, retry_count } => {
                        report.retries_scheduled += 1;
                        let delay = chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::weeks(52));
                        FollowUp::Settle(Settlement::RetryScheduled {
                            due_at: now.checked_add_signed(delay).unwrap_or(now),
                            retry_count,
                        })
                    }
                    RetryDecision::GiveUp { reason } => FollowUp::Settle(Settlement::GaveUp { reason }),
                }
            }
            JobStatus::Aborted => FollowUp::Settle(Settlement::Closed),
            active => {
                return Err(StoreError::Storage(format!(
                    "job {} listed as terminal while {active}",
                    record.id
                )));
            }
        };

        match follow_up {
            FollowUp::Settle(settlement) => self.apply_settlement(&record, settlement, now, report),
            FollowUp::Defer(why) => {
                report.deferred += 1;
                debug!(job_id = %record.id, reason = %why, "settlement deferred");
                Ok(())
            }
        }
    }

    /// Settle an optimistic abort against the engine's final word.
    ///
    /// `None` while the engine is still stopping the unit. A cancel accepted
    /// by another process only reaches the engine here, so it is passed on.
    fn resolve_cancel(&self, record: JobRecord, now: DateTime<Utc>) -> Result<Option<JobRecord>, StoreError> {
        let Some(snap) = self.engine.status(record.id) else {
            return Ok(Some(record));
        };
        if !snap.is_terminal() {
            if self.engine.cancel(record.id) {
                info!(job_id = %record.id, logical_name = %record.logical_name, "forwarded cancel to engine");
            }
            return Ok(None);
        }

        let mut entries = Vec::new();
        let stored = modify(self.store.as_ref(), record.id, |r| {
            entries.clear();
            let before = r.clone();
            let seen = r.error_count as usize;
            let restored = r.reconcile_terminal(
                snap.status,
                snap.finished_at.unwrap_or(snap.updated_at),
                snap.failure.as_ref().map(|f| f.message.clone()),
                snap.failure.as_ref().map(|f| f.kind),
            );
            r.absorb_final_counts(snap.items_total, snap.items_processed, snap.error_count());
            if restored && r.status == JobStatus::Completed {
                r.context = snap.context.clone();
            }
            entries.extend(
                snap.item_errors
                    .iter()
                    .skip(seen)
                    .map(|e| ErrorLogEntry::item_failure(r.id, e, now)),
            );
            if restored {
                if let (JobStatus::Failed, Some(failure)) = (r.status, &snap.failure) {
                    entries.push(ErrorLogEntry::unit_failure(r.id, failure.kind, failure.message.clone(), now));
                }
            }
            Ok(*r != before)
        })?;

        if stored.status != JobStatus::Aborted {
            info!(
                job_id = %stored.id,
                logical_name = %stored.logical_name,
                status = %stored.status,
                "engine finished before the cancel landed, keeping its status"
            );
        }
        self.append_errors(stored.id, &entries);
        Ok(Some(stored))
    }

    fn chain_follow_up(
        &self,
        record: &JobRecord,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<FollowUp, StoreError> {
        let request = match self.chaining.on_unit_complete(record) {
            ChainDecision::NotChained | ChainDecision::Finished => {
                return Ok(FollowUp::Settle(Settlement::Closed));
            }
            ChainDecision::Halted { reason } => {
                return Ok(FollowUp::Settle(Settlement::ChainHalted { reason }));
            }
            ChainDecision::Proceed(request) => request,
        };

        if let Some(existing) =
            self.find_follow_up(&request.logical_name, record, |r| r.parent_job_id == Some(record.id))?
        {
            return Ok(FollowUp::Settle(Settlement::Chained { successor: existing }));
        }

        match self.dispatcher.submit(request.clone()) {
            Ok(successor) => {
                report.chained += 1;
                info!(
                    job_id = %record.id,
                    successor = %successor.id,
                    logical_name = %successor.logical_name,
                    "next chain stage dispatched"
                );
                Ok(FollowUp::Settle(Settlement::Chained {
                    successor: successor.id,
                }))
            }
            Err(e @ DispatchError::ChainDepthExceeded { .. }) => {
                let reason = e.to_string();
                self.chaining
                    .record_refused_link(self.store.as_ref(), &request, &reason, now)?;
                Ok(FollowUp::Settle(Settlement::ChainHalted { reason }))
            }
            Err(e) if e.is_transient() => Ok(FollowUp::Defer(e.to_string())),
            Err(e) => {
                warn!(job_id = %record.id, error = %e, "next chain stage could not be dispatched");
                Ok(FollowUp::Settle(Settlement::ChainHalted {
                    reason: format!("next stage not dispatched: {e}"),
                }))
            }
        }
    }

    /// A record of `logical_name` created since `record` that satisfies `pred`.
    fn find_follow_up(
        &self,
        logical_name: &str,
        record: &JobRecord,
        pred: impl Fn(&JobRecord) -> bool,
    ) -> Result<Option<JobId>, StoreError> {
        Ok(self
            .store
            .history(logical_name, Some(record.created_at))?
            .into_iter()
            .find(|r| r.id != record.id && pred(r))
            .map(|r| r.id))
    }

    fn apply_settlement(
        &self,
        record: &JobRecord,
        settlement: Settlement,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), StoreError> {
        let mut applied = false;
        let stored = modify(self.store.as_ref(), record.id, |r| {
            applied = false;
            if r.is_settled() {
                return Ok(false);
            }
            r.settle(settlement.clone(), now)?;
            applied = true;
            Ok(true)
        })?;
        if !applied {
            return Ok(());
        }

        self.engine.release(stored.id);
        if settlement.is_final() {
            report.settled += 1;
            info!(
                job_id = %stored.id,
                logical_name = %stored.logical_name,
                status = %stored.status,
                settlement = ?settlement,
                "job settled"
            );
            if let Err(e) = self.notifier.notify(&Notification::for_record(&stored)) {
                warn!(job_id = %stored.id, error = %e, "notification failed");
            }
        }
        Ok(())
    }

    // (c)

    fn fire_due_retries(&self, now: DateTime<Utc>, report: &mut TickReport) -> Result<(), StoreError> {
        for record in self.store.list_unsettled()? {
            let Some(Settlement::RetryScheduled { due_at, .. }) = record.settlement else {
                continue;
            };
            if due_at > now || !self.owns(&record) {
                continue;
            }
            if let Err(e) = self.fire_retry(&record, now, report) {
                report.errors += 1;
                warn!(job_id = %record.id, error = %e, "failed to fire retry");
            }
        }
        Ok(())
    }

    fn fire_retry(
        &self,
        record: &JobRecord,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), StoreError> {
        if let Some(existing) =
            self.find_follow_up(&record.logical_name, record, |r| r.supersedes == Some(record.id))?
        {
            return self.apply_settlement(record, Settlement::Retried { successor: existing }, now, report);
        }

        let settlement = match self.dispatcher.submit(DispatchRequest::retry_of(record)) {
            Ok(retry) => {
                report.retries_dispatched += 1;
                info!(
                    job_id = %record.id,
                    successor = %retry.id,
                    logical_name = %retry.logical_name,
                    retry_count = retry.retry_count,
                    "retry dispatched"
                );
                Settlement::Retried { successor: retry.id }
            }
            Err(e) if e.is_transient() => {
                report.deferred += 1;
                debug!(job_id = %record.id, error = %e, "retry deferred");
                return Ok(());
            }
            Err(e) => {
                warn!(job_id = %record.id, error = %e, "retry could not be dispatched");
                Settlement::GaveUp {
                    reason: format!("retry could not be dispatched: {e}"),
                }
            }
        };
        self.apply_settlement(record, settlement, now, report)
    }

    // (d)

    fn fire_recurring(&self, now: DateTime<Utc>, report: &mut TickReport) {
        for schedule in self.scheduler.due(now) {
            match self.dispatcher.submit(schedule.request()) {
                Ok(record) => {
                    report.recurring_fired += 1;
                    info!(
                        job_id = %record.id,
                        logical_name = %record.logical_name,
                        "recurring job fired"
                    );
                }
                Err(e) if e.is_transient() => {
                    report.deferred += 1;
                    debug!(logical_name = %schedule.logical_name, error = %e, "recurring firing deferred");
                    continue;
                }
                Err(DispatchError::Duplicate { conflicting, .. }) => {
                    info!(
                        logical_name = %schedule.logical_name,
                        conflicting = ?conflicting,
                        "previous firing still active, skipping"
                    );
                }
                Err(e) => {
                    report.errors += 1;
                    warn!(logical_name = %schedule.logical_name, error = %e, "recurring firing failed");
                }
            }
            self.scheduler.mark_fired(&schedule.logical_name, now);
        }
    }
}

/// Walk `r` forward to match an engine snapshot.
fn apply_snapshot(
    r: &mut JobRecord,
    snap: &EngineSnapshot,
    now: DateTime<Utc>,
    entries: &mut Vec<ErrorLogEntry>,
) -> Result<(), StoreError> {
    let seen = r.error_count as usize;
    let finished_at = snap.finished_at.unwrap_or(snap.updated_at);

    match snap.status {
        JobStatus::Queued | JobStatus::Preparing | JobStatus::Running => {
            catch_up(r, snap.status, snap.updated_at)?;
            take_progress(r, snap);
        }
        JobStatus::Completed => {
            catch_up(r, JobStatus::Running, snap.updated_at)?;
            take_progress(r, snap);
            r.context = snap.context.clone();
            r.advance_to(JobStatus::Completed, finished_at, None)?;
        }
        JobStatus::Failed => {
            take_progress(r, snap);
            let failure = match &snap.failure {
                Some(f) if !f.message.trim().is_empty() => f.clone(),
                Some(f) => UnitFailure::new(f.kind, "unit failed without a message"),
                None => UnitFailure::new(FailureKind::Engine, "engine reported a failure without a reason"),
            };
            r.fail(&failure, finished_at)?;
        }
        JobStatus::Aborted => {
            take_progress(r, snap);
            r.abort(finished_at, "cancelled in the engine")?;
        }
    }

    entries.extend(
        snap.item_errors
            .iter()
            .skip(seen)
            .map(|e| ErrorLogEntry::item_failure(r.id, e, now)),
    );
    if r.status == JobStatus::Failed {
        if let Some(kind) = r.failure {
            let message = r.status_reason.clone().unwrap_or_default();
            entries.push(ErrorLogEntry::unit_failure(r.id, kind, message, now));
        }
    }
    Ok(())
}

fn catch_up(r: &mut JobRecord, target: JobStatus, at: DateTime<Utc>) -> Result<(), StoreError> {
    if r.status != target && r.status.path_to(target).is_some() {
        r.advance_to(target, at, None)?;
    }
    Ok(())
}

fn take_progress(r: &mut JobRecord, snap: &EngineSnapshot) {
    if let Err(e) = r.record_progress(snap.items_total, snap.items_processed, snap.error_count()) {
        warn!(job_id = %r.id, error = %e, "engine reported inconsistent progress, ignored");
    }
}

fn reconcile_loop(
    reconciler: Reconciler,
    interval: Duration,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<ReconcilerStats>>,
) {
    info!(interval_ms = interval.as_millis() as u64, "reconciler started");
    let start_time = Instant::now();

    loop {
        let now = Utc::now();
        let result = reconciler.tick(now);
        {
            let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
            s.ticks += 1;
            s.last_tick_at = Some(now);
            s.uptime_secs = start_time.elapsed().as_secs();
            match &result {
                Ok(report) => s.totals.absorb(report),
                Err(_) => s.failed_ticks += 1,
            }
        }
        if let Err(e) = result {
            warn!(error = %e, "reconciliation tick failed");
        }

        match shutdown_rx.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => continue,
        }
    }

    info!("reconciler stopped");
}
