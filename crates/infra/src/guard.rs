//! Duplicate Guard: at most one active record per logical job.
//!
//! The guard does not check-then-act. It asks the store for a reservation,
//! which the store grants atomically. The dispatcher later turns the
//! reservation into the record (`JobStore::commit`) or gives it back.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use jobctl_core::JobId;

use crate::store::{JobStore, Reservation, StoreError};

/// Outcome of an acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    Granted(Reservation),
    /// Another instance holds the logical name. `conflicting` is `None` when
    /// the holder is a launch still in flight.
    Denied { conflicting: Option<JobId> },
}

impl Acquisition {
    pub fn is_granted(&self) -> bool {
        matches!(self, Acquisition::Granted(_))
    }
}

/// Gate in front of every launch.
#[derive(Clone)]
pub struct DuplicateGuard {
    store: Arc<dyn JobStore>,
}

impl DuplicateGuard {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Try to take the launch slot for `logical_name`.
    ///
    /// `supersedes` names the failed record a retry continues; that record
    /// never counts as a conflict. Store errors are returned as-is so the
    /// caller can fail closed.
    pub fn try_acquire(
        &self,
        logical_name: &str,
        supersedes: Option<JobId>,
    ) -> Result<Acquisition, StoreError> {
        match self.store.reserve(logical_name, supersedes, Utc::now()) {
            Ok(reservation) => {
                debug!(logical_name = %logical_name, "launch slot reserved");
                Ok(Acquisition::Granted(reservation))
            }
            Err(StoreError::ActiveJob { conflicting, .. }) => {
                debug!(
                    logical_name = %logical_name,
                    conflicting = ?conflicting,
                    "launch slot denied"
                );
                Ok(Acquisition::Denied { conflicting })
            }
            Err(e) => Err(e),
        }
    }

    /// Give back a slot whose launch did not happen.
    pub fn release(&self, reservation: &Reservation) {
        if let Err(e) = self.store.release(reservation) {
            // The reservation expires on its own; nothing else to do.
            warn!(
                logical_name = %reservation.logical_name,
                error = %e,
                "failed to release launch slot"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryJobStore;
    use jobctl_core::{ExecutionMode, JobRecord, LaunchConfig};

    #[test]
    fn second_acquisition_is_denied_until_release() {
        let store = InMemoryJobStore::arc();
        let guard = DuplicateGuard::new(store.clone());

        let Acquisition::Granted(first) = guard.try_acquire("nightly-sync", None).unwrap() else {
            panic!("first acquisition must be granted");
        };
        assert_eq!(
            guard.try_acquire("nightly-sync", None).unwrap(),
            Acquisition::Denied { conflicting: None }
        );

        guard.release(&first);
        assert!(guard.try_acquire("nightly-sync", None).unwrap().is_granted());
    }

    #[test]
    fn denial_names_the_active_record() {
        let store = InMemoryJobStore::arc();
        let guard = DuplicateGuard::new(store.clone());

        let Acquisition::Granted(reservation) = guard.try_acquire("nightly-sync", None).unwrap() else {
            panic!("first acquisition must be granted");
        };
        let record = JobRecord::queued(
            JobId::new(),
            "nightly-sync",
            ExecutionMode::Chunked,
            LaunchConfig::default(),
            Utc::now(),
        );
        let record = store.commit(&reservation, record).unwrap();

        assert_eq!(
            guard.try_acquire("nightly-sync", None).unwrap(),
            Acquisition::Denied {
                conflicting: Some(record.id)
            }
        );
    }

    #[test]
    fn store_outage_is_an_error_not_a_grant() {
        let store = InMemoryJobStore::arc();
        store.set_available(false);
        let guard = DuplicateGuard::new(store);
        assert!(matches!(
            guard.try_acquire("nightly-sync", None),
            Err(StoreError::Unavailable(_))
        ));
    }

    #[test]
    fn concurrent_acquisitions_grant_exactly_one() {
        let store = InMemoryJobStore::arc();
        let guard = DuplicateGuard::new(store);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let guard = guard.clone();
                std::thread::spawn(move || guard.try_acquire("nightly-sync", None).unwrap())
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(Acquisition::is_granted)
            .count();
        assert_eq!(granted, 1);
    }
}
