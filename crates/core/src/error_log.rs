//! Write-once error log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{ErrorEntryId, JobId};
use crate::unit::{FailureKind, ItemError};

/// What an error log entry is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum ErrorScope {
    /// The whole unit failed.
    Unit { kind: FailureKind },
    /// One item failed inside a slice.
    Item { item_index: Option<u64> },
}

/// One failure, owned by the job that produced it. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub id: ErrorEntryId,
    pub job_id: JobId,
    pub scope: ErrorScope,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

impl ErrorLogEntry {
    pub fn unit_failure(
        job_id: JobId,
        kind: FailureKind,
        message: impl Into<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ErrorEntryId::new(),
            job_id,
            scope: ErrorScope::Unit { kind },
            message: message.into(),
            recorded_at,
        }
    }

    pub fn item_failure(job_id: JobId, error: &ItemError, recorded_at: DateTime<Utc>) -> Self {
        Self {
            id: ErrorEntryId::new(),
            job_id,
            scope: ErrorScope::Item {
                item_index: error.item_index,
            },
            message: error.message.clone(),
            recorded_at,
        }
    }

    pub fn is_unit_failure(&self) -> bool {
        matches!(self.scope, ErrorScope::Unit { .. })
    }
}
