//! Notification collaborator.
//!
//! Invoked once a terminal record's follow-up is settled. Delivery is
//! fire-and-forget: a failed notification is logged and never touches the
//! record.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::info;

use jobctl_core::{JobId, JobRecord, JobStatus};

#[derive(Debug, Clone, thiserror::Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// What a notifier receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub job_id: JobId,
    pub logical_name: String,
    pub status: JobStatus,
    pub summary: String,
}

impl Notification {
    pub fn for_record(record: &JobRecord) -> Self {
        Self {
            job_id: record.id,
            logical_name: record.logical_name.clone(),
            status: record.status,
            summary: record.summary(),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

impl<N: Notifier + ?Sized> Notifier for Arc<N> {
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        (**self).notify(notification)
    }
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            job_id = %notification.job_id,
            logical_name = %notification.logical_name,
            status = %notification.status,
            summary = %notification.summary,
            "job finished"
        );
        Ok(())
    }
}

/// Keeps notifications in memory (tests/dev). Can be told to fail.
#[derive(Debug, Default)]
pub struct InMemoryNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: Mutex<bool>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn all(&self) -> Vec<Notification> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn for_job(&self, job_id: JobId) -> Vec<Notification> {
        self.all().into_iter().filter(|n| n.job_id == job_id).collect()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap_or_else(PoisonError::into_inner) = failing;
    }
}

impl Notifier for InMemoryNotifier {
    fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        if *self.failing.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(NotifyError::Delivery("notifier switched off".to_string()));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification.clone());
        Ok(())
    }
}
