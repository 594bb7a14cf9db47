use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobctl_core::JobId;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    /// Only runs created at or after this instant (RFC 3339).
    pub since: Option<DateTime<Utc>>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct ProgressResponse {
    pub job_id: JobId,
    pub progress: f64,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: JobId,
    pub cancelled: bool,
}
