//! The unit-of-work contract invoked by the execution engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::JobContext;

/// One input record supplied by a record source.
pub type Record = serde_json::Value;

/// An independently dispatchable piece of work.
///
/// `execute` must be a pure function of `(slice, context)`: the engine may
/// re-invoke it with the same slice (chunk retries, job retries), so any side
/// effects must be idempotent.
pub trait Unit: Send + Sync + 'static {
    fn execute(&self, slice: &[Record], context: &JobContext) -> Result<UnitOutcome, UnitError>;

    /// Units that call external systems must be launched with
    /// `allow_external_calls`; the engine refuses them otherwise.
    fn requires_external_calls(&self) -> bool {
        false
    }
}

impl<F> Unit for F
where
    F: Fn(&[Record], &JobContext) -> Result<UnitOutcome, UnitError> + Send + Sync + 'static,
{
    fn execute(&self, slice: &[Record], context: &JobContext) -> Result<UnitOutcome, UnitError> {
        self(slice, context)
    }
}

/// Result of one slice invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitOutcome {
    pub items_processed: u64,
    pub errors: Vec<ItemError>,
    /// Replacement context; `None` keeps the current one.
    pub updated_context: Option<JobContext>,
}

impl UnitOutcome {
    pub fn processed(items_processed: u64) -> Self {
        Self {
            items_processed,
            ..Default::default()
        }
    }

    pub fn with_error(mut self, error: ItemError) -> Self {
        self.errors.push(error);
        self
    }

    pub fn with_context(mut self, context: JobContext) -> Self {
        self.updated_context = Some(context);
        self
    }
}

/// Failure of a single item inside an otherwise successful slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    /// Position of the item in the job's input, when known.
    pub item_index: Option<u64>,
    pub message: String,
}

impl ItemError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            item_index: None,
            message: message.into(),
        }
    }

    pub fn at(item_index: u64, message: impl Into<String>) -> Self {
        Self {
            item_index: Some(item_index),
            message: message.into(),
        }
    }
}

/// Failure of a whole unit invocation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UnitError {
    /// The unit rejected its own input (including stale context references).
    #[error("unit validation error: {0}")]
    Validation(String),

    /// Transient failure during execution.
    #[error("unit runtime error: {0}")]
    Runtime(String),

    /// The unit exceeded its time budget.
    #[error("unit timed out: {0}")]
    Timeout(String),

    /// A downstream system signalled rate limiting.
    #[error("rate limited: {0}")]
    RateLimited(String),
}

impl UnitError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            UnitError::Validation(_) => FailureKind::Validation,
            UnitError::Runtime(_) => FailureKind::Runtime,
            UnitError::Timeout(_) => FailureKind::Timeout,
            UnitError::RateLimited(_) => FailureKind::RateLimited,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub fn message(&self) -> &str {
        match self {
            UnitError::Validation(m)
            | UnitError::Runtime(m)
            | UnitError::Timeout(m)
            | UnitError::RateLimited(m) => m,
        }
    }
}

/// Classification of a terminal failure, persisted on the job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Runtime,
    Timeout,
    RateLimited,
    /// The engine lost track of the job or crashed running it.
    Engine,
    /// The job was refused before launch (e.g. chain depth ceiling).
    Rejected,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureKind::Runtime | FailureKind::Timeout | FailureKind::RateLimited | FailureKind::Engine
        )
    }
}

/// Kind and message of a failed unit, as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl UnitFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&UnitError> for UnitFailure {
    fn from(value: &UnitError) -> Self {
        Self::new(value.kind(), value.message())
    }
}
