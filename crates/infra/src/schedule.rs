//! Recurring schedules.
//!
//! A recurring logical job fires every `interval`. Each firing is an ordinary
//! dispatch in `Recurring` mode, so a firing whose predecessor is still active
//! is refused by the Duplicate Guard like any other duplicate.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use jobctl_core::{ExecutionMode, JobContext, LaunchConfig};

use crate::dispatcher::{DispatchError, DispatchRequest};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecurringSchedule {
    pub logical_name: String,
    pub interval_seconds: u64,
    pub config: LaunchConfig,
    pub context: JobContext,
    pub next_due: DateTime<Utc>,
    pub last_fired: Option<DateTime<Utc>>,
}

impl RecurringSchedule {
    pub fn interval(&self) -> Duration {
        Duration::seconds(self.interval_seconds as i64)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_due <= now
    }

    pub fn request(&self) -> DispatchRequest {
        DispatchRequest::new(self.logical_name.clone(), ExecutionMode::Recurring)
            .with_config(self.config.clone())
            .with_context(self.context.clone())
    }
}

/// In-process table of recurring schedules.
#[derive(Debug, Default)]
pub struct RecurringScheduler {
    schedules: Mutex<HashMap<String, RecurringSchedule>>,
}

impl RecurringScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, RecurringSchedule>> {
        self.schedules.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add or replace the schedule for `logical_name`. The first firing is
    /// due immediately.
    pub fn schedule(
        &self,
        logical_name: &str,
        interval: std::time::Duration,
        config: LaunchConfig,
        context: JobContext,
        now: DateTime<Utc>,
    ) -> Result<RecurringSchedule, DispatchError> {
        if logical_name.trim().is_empty() {
            return Err(DispatchError::InvalidRequest(
                "logical_name must not be empty".to_string(),
            ));
        }
        if interval.as_secs() == 0 {
            return Err(DispatchError::InvalidRequest(
                "recurring interval must be at least one second".to_string(),
            ));
        }
        config.validate()?;

        let schedule = RecurringSchedule {
            logical_name: logical_name.to_string(),
            interval_seconds: interval.as_secs(),
            config,
            context,
            next_due: now,
            last_fired: None,
        };
        self.table().insert(logical_name.to_string(), schedule.clone());
        tracing::info!(
            logical_name = %logical_name,
            interval_seconds = interval.as_secs(),
            "recurring schedule registered"
        );
        Ok(schedule)
    }

    pub fn unschedule(&self, logical_name: &str) -> bool {
        self.table().remove(logical_name).is_some()
    }

    /// Schedules due at `now`, oldest due first.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<RecurringSchedule> {
        let mut due: Vec<_> = self.table().values().filter(|s| s.is_due(now)).cloned().collect();
        due.sort_by(|a, b| a.next_due.cmp(&b.next_due).then_with(|| a.logical_name.cmp(&b.logical_name)));
        due
    }

    /// Advance a schedule past a handled firing (launched or skipped).
    ///
    /// Missed intervals are not replayed: the next firing is one interval
    /// from `now`.
    pub fn mark_fired(&self, logical_name: &str, now: DateTime<Utc>) {
        if let Some(schedule) = self.table().get_mut(logical_name) {
            schedule.last_fired = Some(now);
            schedule.next_due = now + schedule.interval();
        }
    }

    pub fn list(&self) -> Vec<RecurringSchedule> {
        let mut all: Vec<_> = self.table().values().cloned().collect();
        all.sort_by(|a, b| a.logical_name.cmp(&b.logical_name));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[test]
    fn first_firing_is_due_immediately_then_every_interval() {
        let scheduler = RecurringScheduler::new();
        let now = Utc::now();
        scheduler
            .schedule(
                "heartbeat",
                StdDuration::from_secs(60),
                LaunchConfig::default(),
                JobContext::new(),
                now,
            )
            .unwrap();

        let due = scheduler.due(now);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].request().mode, ExecutionMode::Recurring);

        scheduler.mark_fired("heartbeat", now);
        assert!(scheduler.due(now + Duration::seconds(59)).is_empty());
        assert_eq!(scheduler.due(now + Duration::seconds(60)).len(), 1);
    }

    #[test]
    fn zero_interval_and_bad_config_are_rejected() {
        let scheduler = RecurringScheduler::new();
        let now = Utc::now();
        assert!(
            scheduler
                .schedule("heartbeat", StdDuration::ZERO, LaunchConfig::default(), JobContext::new(), now)
                .is_err()
        );
        assert!(
            scheduler
                .schedule(
                    "heartbeat",
                    StdDuration::from_secs(5),
                    LaunchConfig::chunked(0),
                    JobContext::new(),
                    now
                )
                .is_err()
        );
        assert!(scheduler.list().is_empty());
    }

    #[test]
    fn unschedule_removes_the_entry() {
        let scheduler = RecurringScheduler::new();
        let now = Utc::now();
        scheduler
            .schedule("heartbeat", StdDuration::from_secs(5), LaunchConfig::default(), JobContext::new(), now)
            .unwrap();
        assert!(scheduler.unschedule("heartbeat"));
        assert!(!scheduler.unschedule("heartbeat"));
        assert!(scheduler.due(now).is_empty());
    }
}
