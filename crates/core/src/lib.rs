//! `jobctl-core`: domain building blocks for the job control plane.
//!
//! This crate contains **pure domain** types: job records, the status state
//! machine, the unit-of-work contract and the input-source contract. It performs
//! no IO; stores, engines and schedulers live in `jobctl-infra`.

pub mod context;
pub mod error;
pub mod error_log;
pub mod id;
pub mod mode;
pub mod record;
pub mod source;
pub mod status;
pub mod unit;
pub mod version;

pub use context::JobContext;
pub use error::{DomainError, DomainResult};
pub use error_log::{ErrorLogEntry, ErrorScope};
pub use id::{ErrorEntryId, JobId};
pub use mode::{ExecutionMode, LaunchConfig, MAX_CHUNK_SIZE};
pub use record::{ChainLink, JobRecord, Settlement};
pub use source::{RecordCursor, RecordSource, StaticSource};
pub use status::JobStatus;
pub use unit::{FailureKind, ItemError, Record, Unit, UnitError, UnitFailure, UnitOutcome};
pub use version::ExpectedVersion;
