//! In-memory job store for tests/dev.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use jobctl_core::{ErrorLogEntry, ExpectedVersion, JobId, JobRecord};

use super::{JobStats, JobStore, Reservation, StoreError};

#[derive(Debug, Default)]
struct Tables {
    records: HashMap<JobId, JobRecord>,
    reservations: HashMap<String, Reservation>,
    errors: HashMap<JobId, Vec<ErrorLogEntry>>,
}

impl Tables {
    fn active_for(&self, logical_name: &str, exempt: Option<JobId>) -> Option<&JobRecord> {
        self.records
            .values()
            .filter(|r| r.logical_name == logical_name && r.holds_slot())
            .filter(|r| Some(r.id) != exempt)
            .min_by_key(|r| r.created_at)
    }
}

/// In-memory job store.
///
/// One lock guards records and reservations together, which is what makes
/// `reserve` atomic. `set_available(false)` simulates an outage.
#[derive(Debug)]
pub struct InMemoryJobStore {
    tables: RwLock<Tables>,
    available: AtomicBool,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            available: AtomicBool::new(true),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Toggle simulated availability. While unavailable every call fails with
    /// `StoreError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store switched off".to_string()))
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.check_available()?;
        self.tables
            .read()
            .map_err(|_| StoreError::Storage("job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.check_available()?;
        self.tables
            .write()
            .map_err(|_| StoreError::Storage("job store lock poisoned".to_string()))
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted(mut records: Vec<JobRecord>) -> Vec<JobRecord> {
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    records
}

impl JobStore for InMemoryJobStore {
    fn reserve(
        &self,
        logical_name: &str,
        supersedes: Option<JobId>,
        now: DateTime<Utc>,
    ) -> Result<Reservation, StoreError> {
        let mut tables = self.write()?;

        if let Some(active) = tables.active_for(logical_name, supersedes) {
            return Err(StoreError::ActiveJob {
                logical_name: logical_name.to_string(),
                conflicting: Some(active.id),
            });
        }

        if let Some(existing) = tables.reservations.get(logical_name) {
            if !existing.is_expired(now) {
                return Err(StoreError::ActiveJob {
                    logical_name: logical_name.to_string(),
                    conflicting: None,
                });
            }
        }

        let reservation = Reservation::new(logical_name, supersedes, now);
        tables
            .reservations
            .insert(logical_name.to_string(), reservation.clone());
        Ok(reservation)
    }

    fn commit(&self, reservation: &Reservation, mut record: JobRecord) -> Result<JobRecord, StoreError> {
        let mut tables = self.write()?;

        let held = tables
            .reservations
            .get(&reservation.logical_name)
            .is_some_and(|r| r.token == reservation.token);
        if !held {
            return Err(StoreError::ReservationLost(reservation.logical_name.clone()));
        }
        if record.logical_name != reservation.logical_name {
            return Err(StoreError::Storage(format!(
                "record for '{}' committed against reservation for '{}'",
                record.logical_name, reservation.logical_name
            )));
        }
        if tables.records.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }

        tables.reservations.remove(&reservation.logical_name);
        record.version = 1;
        tables.records.insert(record.id, record.clone());
        Ok(record)
    }

    fn release(&self, reservation: &Reservation) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let held = tables
            .reservations
            .get(&reservation.logical_name)
            .is_some_and(|r| r.token == reservation.token);
        if held {
            tables.reservations.remove(&reservation.logical_name);
        }
        Ok(())
    }

    fn insert(&self, mut record: JobRecord) -> Result<JobRecord, StoreError> {
        let mut tables = self.write()?;
        if tables.records.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }
        record.version = 1;
        tables.records.insert(record.id, record.clone());
        Ok(record)
    }

    fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.read()?.records.get(&job_id).cloned())
    }

    fn update(&self, record: &JobRecord, expected: ExpectedVersion) -> Result<JobRecord, StoreError> {
        let mut tables = self.write()?;
        let stored = tables
            .records
            .get_mut(&record.id)
            .ok_or(StoreError::NotFound(record.id))?;

        if !expected.matches(stored.version) {
            return Err(StoreError::Conflict(format!(
                "job {}: expected {:?}, found version {}",
                record.id, expected, stored.version
            )));
        }

        let mut next = record.clone();
        next.version = stored.version + 1;
        *stored = next.clone();
        Ok(next)
    }

    fn list_active(&self) -> Result<Vec<JobRecord>, StoreError> {
        let tables = self.read()?;
        Ok(sorted(
            tables
                .records
                .values()
                .filter(|r| r.status.is_active())
                .cloned()
                .collect(),
        ))
    }

    fn list_unsettled(&self) -> Result<Vec<JobRecord>, StoreError> {
        let tables = self.read()?;
        Ok(sorted(
            tables
                .records
                .values()
                .filter(|r| r.is_terminal() && !r.is_settled())
                .cloned()
                .collect(),
        ))
    }

    fn history(
        &self,
        logical_name: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let tables = self.read()?;
        Ok(sorted(
            tables
                .records
                .values()
                .filter(|r| r.logical_name == logical_name)
                .filter(|r| since.is_none_or(|s| r.created_at >= s))
                .cloned()
                .collect(),
        ))
    }

    fn append_errors(&self, entries: &[ErrorLogEntry]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut tables = self.write()?;
        for entry in entries {
            tables
                .errors
                .entry(entry.job_id)
                .or_default()
                .push(entry.clone());
        }
        Ok(())
    }

    fn errors(&self, job_id: JobId) -> Result<Vec<ErrorLogEntry>, StoreError> {
        Ok(self
            .read()?
            .errors
            .get(&job_id)
            .cloned()
            .unwrap_or_default())
    }

    fn stats(&self) -> Result<JobStats, StoreError> {
        let tables = self.read()?;
        let mut stats = JobStats::default();
        for record in tables.records.values() {
            stats.count(record.status);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{lineage_depth, modify, RESERVATION_TTL};
    use jobctl_core::{ExecutionMode, JobStatus, LaunchConfig};

    fn queued(name: &str) -> JobRecord {
        JobRecord::queued(
            JobId::new(),
            name,
            ExecutionMode::SingleShot,
            LaunchConfig::default(),
            Utc::now(),
        )
    }

    fn launch(store: &InMemoryJobStore, name: &str) -> JobRecord {
        let reservation = store.reserve(name, None, Utc::now()).unwrap();
        store.commit(&reservation, queued(name)).unwrap()
    }

    #[test]
    fn reserve_blocks_while_a_record_is_active() {
        let store = InMemoryJobStore::new();
        let first = launch(&store, "nightly-sync");
        assert_eq!(first.version, 1);

        match store.reserve("nightly-sync", None, Utc::now()) {
            Err(StoreError::ActiveJob { conflicting, .. }) => assert_eq!(conflicting, Some(first.id)),
            other => panic!("expected ActiveJob, got {other:?}"),
        }

        // Other logical names are unaffected.
        assert!(store.reserve("weekly-report", None, Utc::now()).is_ok());
    }

    #[test]
    fn reserve_blocks_while_a_reservation_is_in_flight() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let held = store.reserve("nightly-sync", None, now).unwrap();

        assert!(matches!(
            store.reserve("nightly-sync", None, now),
            Err(StoreError::ActiveJob { conflicting: None, .. })
        ));

        store.release(&held).unwrap();
        assert!(store.reserve("nightly-sync", None, now).is_ok());
    }

    #[test]
    fn expired_reservations_are_replaced() {
        let store = InMemoryJobStore::new();
        let then = Utc::now();
        let stale = store.reserve("nightly-sync", None, then).unwrap();

        let later = then + RESERVATION_TTL;
        let fresh = store.reserve("nightly-sync", None, later).unwrap();
        assert_ne!(stale.token, fresh.token);

        // The stale holder can no longer commit.
        assert!(matches!(
            store.commit(&stale, queued("nightly-sync")),
            Err(StoreError::ReservationLost(_))
        ));
        assert!(store.commit(&fresh, queued("nightly-sync")).is_ok());
    }

    #[test]
    fn superseded_record_is_exempt() {
        let store = InMemoryJobStore::new();
        let first = launch(&store, "nightly-sync");
        assert!(store.reserve("nightly-sync", Some(first.id), Utc::now()).is_ok());
    }

    #[test]
    fn failed_record_awaiting_retry_keeps_the_slot() {
        let store = InMemoryJobStore::new();
        let first = launch(&store, "nightly-sync");
        let now = Utc::now();
        modify(&store, first.id, |r| {
            r.fail(&jobctl_core::UnitFailure::new(jobctl_core::FailureKind::Runtime, "boom"), now)?;
            r.settle(jobctl_core::Settlement::RetryScheduled { due_at: now, retry_count: 1 }, now)?;
            Ok(true)
        })
        .unwrap();

        match store.reserve("nightly-sync", None, now) {
            Err(StoreError::ActiveJob { conflicting, .. }) => assert_eq!(conflicting, Some(first.id)),
            other => panic!("expected ActiveJob, got {other:?}"),
        }
        // The retry itself continues the failed run.
        assert!(store.reserve("nightly-sync", Some(first.id), now).is_ok());
        // Pending retries are not active jobs.
        assert!(store.list_active().unwrap().is_empty());
    }

    #[test]
    fn stale_update_is_rejected() {
        let store = InMemoryJobStore::new();
        let record = launch(&store, "nightly-sync");

        let mut a = record.clone();
        a.advance_to(JobStatus::Running, Utc::now(), None).unwrap();
        store.update(&a, ExpectedVersion::Exact(1)).unwrap();

        let mut b = record;
        b.abort(Utc::now(), "cancelled").unwrap();
        assert!(matches!(
            store.update(&b, ExpectedVersion::Exact(1)),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn modify_reapplies_on_fresh_state() {
        let store = InMemoryJobStore::new();
        let record = launch(&store, "nightly-sync");

        let updated = modify(&store, record.id, |r| {
            r.advance_to(JobStatus::Running, Utc::now(), None)?;
            Ok(true)
        })
        .unwrap();
        assert_eq!(updated.status, JobStatus::Running);
        assert_eq!(updated.version, 2);

        let unchanged = modify(&store, record.id, |_| Ok(false)).unwrap();
        assert_eq!(unchanged.version, 2);
    }

    #[test]
    fn unavailable_store_fails_every_call() {
        let store = InMemoryJobStore::new();
        store.set_available(false);
        assert!(matches!(
            store.reserve("nightly-sync", None, Utc::now()),
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(store.list_active(), Err(StoreError::Unavailable(_))));
    }

    #[test]
    fn history_filters_by_name_and_time() {
        let store = InMemoryJobStore::new();
        let first = launch(&store, "nightly-sync");
        modify(&store, first.id, |r| {
            r.advance_to(JobStatus::Completed, Utc::now(), None)?;
            Ok(true)
        })
        .unwrap();
        let cutoff = Utc::now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        launch(&store, "nightly-sync");
        launch(&store, "weekly-report");

        assert_eq!(store.history("nightly-sync", None).unwrap().len(), 2);
        assert_eq!(store.history("nightly-sync", Some(cutoff)).unwrap().len(), 1);
        assert_eq!(store.stats().unwrap().total, 3);
        assert_eq!(store.stats().unwrap().active(), 2);
    }

    #[test]
    fn lineage_depth_follows_parents() {
        let store = InMemoryJobStore::new();
        let root = store.insert(queued("stage-0")).unwrap();
        let child = store.insert(queued("stage-1").with_parent(Some(root.id))).unwrap();
        let grandchild = store.insert(queued("stage-2").with_parent(Some(child.id))).unwrap();

        assert_eq!(lineage_depth(&store, root.id, 10).unwrap(), 1);
        assert_eq!(lineage_depth(&store, grandchild.id, 10).unwrap(), 3);
        assert_eq!(lineage_depth(&store, grandchild.id, 2).unwrap(), 3);
    }
}
