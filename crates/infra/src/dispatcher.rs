//! Job Dispatcher: the only way work reaches the engine.
//!
//! ## Dispatch flow
//!
//! ```text
//! DispatchRequest
//!   ↓
//! 1. Validate request, resolve effective launch config
//!   ↓
//! 2. Chain depth check (parent lineage)
//!   ↓
//! 3. Resolve the unit (given by the caller, else from the registry)
//!   ↓
//! 4. Duplicate Guard reservation (fails closed on store errors)
//!   ↓
//! 5. Engine launch (reservation released on refusal)
//!   ↓
//! 6. Commit the Queued record (engine job cancelled if the commit fails)
//!   ↓
//! 7. Register a caller-given unit for later retries
//! ```
//!
//! Retries, chain stages and recurring firings all come through `submit`, so
//! every launch is backed by exactly one record.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use jobctl_core::{
    ChainLink, DomainError, ExecutionMode, JobContext, JobId, JobRecord, LaunchConfig,
};

use crate::config::ControlConfig;
use crate::engine::{EngineError, ExecutionEngine};
use crate::guard::{Acquisition, DuplicateGuard};
use crate::registry::{UnitRegistry, UnitWork};
use crate::store::{JobStore, StoreError, lineage_depth};

/// Errors surfaced synchronously to the caller of a dispatch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    /// Another instance of the logical job is active. `conflicting` is `None`
    /// when the holder is a launch still in flight.
    #[error("logical job '{logical_name}' is already active (conflicting job: {conflicting:?})")]
    Duplicate {
        logical_name: String,
        conflicting: Option<JobId>,
    },
    #[error("engine concurrency limit of {ceiling} reached")]
    ConcurrencyLimitExceeded { ceiling: usize },
    #[error("chain depth {depth} exceeds the limit of {limit}")]
    ChainDepthExceeded { depth: usize, limit: usize },
    /// The store could not be consulted; nothing was launched.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    /// The unit or its launch options were refused; retrying will not help.
    #[error("unit validation failed: {0}")]
    UnitValidation(String),
    #[error("no unit registered for '{0}'")]
    UnknownUnit(String),
    #[error("invalid dispatch request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Store(StoreError),
}

impl DispatchError {
    /// Whether the same request may succeed later without any change.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DispatchError::ConcurrencyLimitExceeded { .. } | DispatchError::StoreUnavailable(_)
        )
    }
}

impl From<StoreError> for DispatchError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Unavailable(msg) => DispatchError::StoreUnavailable(msg),
            StoreError::ActiveJob {
                logical_name,
                conflicting,
            } => DispatchError::Duplicate {
                logical_name,
                conflicting,
            },
            StoreError::Domain(e) => e.into(),
            other => DispatchError::Store(other),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        DispatchError::InvalidRequest(value.to_string())
    }
}

impl From<EngineError> for DispatchError {
    fn from(value: EngineError) -> Self {
        match value {
            EngineError::ConcurrencyLimitExceeded { ceiling } => {
                DispatchError::ConcurrencyLimitExceeded { ceiling }
            }
            EngineError::Rejected(msg) => DispatchError::UnitValidation(msg),
            EngineError::Internal(msg) => DispatchError::Store(StoreError::Storage(format!(
                "engine failure: {msg}"
            ))),
        }
    }
}

/// Everything the dispatcher needs to launch one record.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub logical_name: String,
    pub mode: ExecutionMode,
    /// Unset fields fall back to the configured defaults.
    pub config: LaunchConfig,
    pub context: JobContext,
    /// `None` uses the configured default.
    pub max_retries: Option<u32>,
    pub retry_count: u32,
    pub supersedes: Option<JobId>,
    pub parent_job_id: Option<JobId>,
    pub chain: Option<ChainLink>,
}

impl DispatchRequest {
    pub fn new(logical_name: impl Into<String>, mode: ExecutionMode) -> Self {
        Self {
            logical_name: logical_name.into(),
            mode,
            config: LaunchConfig::default(),
            context: JobContext::new(),
            max_retries: None,
            retry_count: 0,
            supersedes: None,
            parent_job_id: None,
            chain: None,
        }
    }

    pub fn with_config(mut self, config: LaunchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_context(mut self, context: JobContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Next link of a chain, enqueued by `parent`.
    pub fn child_of(mut self, parent: JobId, link: ChainLink) -> Self {
        self.parent_job_id = Some(parent);
        self.chain = Some(link);
        self
    }

    /// Continuation of a failed record: same logical job, config and context,
    /// one more retry, exempt from the duplicate check against `failed`.
    pub fn retry_of(failed: &JobRecord) -> Self {
        Self {
            logical_name: failed.logical_name.clone(),
            mode: failed.mode,
            config: failed.config.clone(),
            context: failed.context.clone(),
            max_retries: Some(failed.max_retries),
            retry_count: failed.retry_count + 1,
            supersedes: Some(failed.id),
            parent_job_id: failed.parent_job_id,
            chain: failed.chain.clone(),
        }
    }
}

/// Launches units behind the Duplicate Guard and records them.
#[derive(Clone)]
pub struct JobDispatcher {
    store: Arc<dyn JobStore>,
    engine: Arc<dyn ExecutionEngine>,
    registry: Arc<UnitRegistry>,
    guard: DuplicateGuard,
    defaults: ControlConfig,
}

impl JobDispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        engine: Arc<dyn ExecutionEngine>,
        registry: Arc<UnitRegistry>,
        defaults: ControlConfig,
    ) -> Self {
        let guard = DuplicateGuard::new(store.clone());
        Self {
            store,
            engine,
            registry,
            guard,
            defaults,
        }
    }

    pub fn registry(&self) -> &Arc<UnitRegistry> {
        &self.registry
    }

    pub fn defaults(&self) -> &ControlConfig {
        &self.defaults
    }

    /// Launch `unit` under `logical_name` and, once the record is committed,
    /// register it so retries and recurring firings run the same unit.
    ///
    /// On success exactly one record exists for the launch and is returned in
    /// `Queued`. A refused dispatch leaves the registry untouched.
    pub fn dispatch(
        &self,
        logical_name: &str,
        unit: UnitWork,
        mode: ExecutionMode,
        config: LaunchConfig,
    ) -> Result<JobRecord, DispatchError> {
        if logical_name.trim().is_empty() {
            return Err(DispatchError::InvalidRequest(
                "logical_name must not be empty".to_string(),
            ));
        }
        let stored = self.launch(
            DispatchRequest::new(logical_name, mode).with_config(config),
            Some(unit.clone()),
        )?;
        self.registry.register(logical_name, unit);
        Ok(stored)
    }

    /// Launch a registered unit.
    pub fn submit(&self, request: DispatchRequest) -> Result<JobRecord, DispatchError> {
        self.launch(request, None)
    }

    fn launch(
        &self,
        request: DispatchRequest,
        unit: Option<UnitWork>,
    ) -> Result<JobRecord, DispatchError> {
        let config = self.effective_config(&request.config);
        let max_retries = request.max_retries.unwrap_or(self.defaults.max_retries);

        let record = JobRecord::queued(
            JobId::new(),
            request.logical_name.clone(),
            request.mode,
            config.clone(),
            Utc::now(),
        )
        .with_context(request.context.clone())
        .with_parent(request.parent_job_id)
        .with_chain(request.chain.clone())
        .with_retries(request.retry_count, max_retries, request.supersedes);
        record.validate()?;

        if let Some(parent) = request.parent_job_id {
            let limit = self.defaults.chain_depth_limit;
            let depth = lineage_depth(self.store.as_ref(), parent, limit)? + 1;
            if depth > limit {
                warn!(
                    logical_name = %request.logical_name,
                    parent_job_id = %parent,
                    depth,
                    limit,
                    "chain depth exceeded"
                );
                return Err(DispatchError::ChainDepthExceeded { depth, limit });
            }
        }

        let work = match unit {
            Some(work) => work,
            None => self
                .registry
                .resolve(&request.logical_name)
                .ok_or_else(|| DispatchError::UnknownUnit(request.logical_name.clone()))?,
        };

        let reservation = match self
            .guard
            .try_acquire(&request.logical_name, request.supersedes)?
        {
            Acquisition::Granted(reservation) => reservation,
            Acquisition::Denied { conflicting } => {
                info!(
                    logical_name = %request.logical_name,
                    conflicting = ?conflicting,
                    "dispatch denied, logical job already active"
                );
                return Err(DispatchError::Duplicate {
                    logical_name: request.logical_name,
                    conflicting,
                });
            }
        };

        let job_id = match self
            .engine
            .launch(work, request.mode, &config, request.context.clone())
        {
            Ok(id) => id,
            Err(e) => {
                self.guard.release(&reservation);
                warn!(
                    logical_name = %request.logical_name,
                    error = %e,
                    "engine refused launch"
                );
                return Err(e.into());
            }
        };

        let record = JobRecord { id: job_id, ..record }.with_engine(self.engine.name());
        match self.store.commit(&reservation, record) {
            Ok(stored) => {
                info!(
                    job_id = %stored.id,
                    logical_name = %stored.logical_name,
                    mode = %stored.mode,
                    retry_count = stored.retry_count,
                    parent_job_id = ?stored.parent_job_id,
                    "job dispatched"
                );
                Ok(stored)
            }
            Err(e) => {
                // No record, so the run must not continue unobserved.
                self.engine.cancel(job_id);
                self.guard.release(&reservation);
                warn!(
                    job_id = %job_id,
                    logical_name = %request.logical_name,
                    error = %e,
                    "record commit failed, launch cancelled"
                );
                Err(e.into())
            }
        }
    }

    fn effective_config(&self, requested: &LaunchConfig) -> LaunchConfig {
        let defaults = self.defaults.launch_defaults();
        LaunchConfig {
            chunk_size: requested.chunk_size.or(defaults.chunk_size),
            timeout_seconds: requested.timeout_seconds.or(defaults.timeout_seconds),
            allow_external_calls: requested.allow_external_calls || defaults.allow_external_calls,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ConcurrencyBudget, LocalEngine};
    use crate::store::InMemoryJobStore;
    use jobctl_core::{JobStatus, Record, StaticSource, UnitError, UnitOutcome};
    use std::sync::mpsc;
    use std::sync::Mutex;

    fn count_all() -> UnitWork {
        UnitWork::new(
            |slice: &[Record], _: &JobContext| -> Result<UnitOutcome, UnitError> {
                Ok(UnitOutcome::processed(slice.len() as u64))
            },
            StaticSource::sequence(10),
        )
    }

    /// A unit that blocks until the returned sender fires (or is dropped).
    fn blocking() -> (UnitWork, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel::<()>();
        let rx = Mutex::new(rx);
        let work = UnitWork::standalone(
            move |_: &[Record], _: &JobContext| -> Result<UnitOutcome, UnitError> {
                if let Ok(rx) = rx.lock() {
                    let _ = rx.recv();
                }
                Ok(UnitOutcome::processed(0))
            },
        );
        (work, tx)
    }

    fn setup(ceiling: usize) -> (Arc<InMemoryJobStore>, JobDispatcher) {
        let store = InMemoryJobStore::arc();
        let engine = Arc::new(LocalEngine::new(ConcurrencyBudget::new(ceiling)));
        let dispatcher = JobDispatcher::new(
            store.clone(),
            engine,
            Arc::new(UnitRegistry::new()),
            ControlConfig::default(),
        );
        (store, dispatcher)
    }

    #[test]
    fn dispatch_persists_a_queued_record() {
        let (store, dispatcher) = setup(2);
        let record = dispatcher
            .dispatch(
                "nightly-sync",
                count_all(),
                ExecutionMode::Chunked,
                LaunchConfig::chunked(5),
            )
            .unwrap();

        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.version, 1);
        assert_eq!(record.max_retries, 3);
        assert_eq!(record.config.chunk_size, Some(5));
        assert_eq!(store.get(record.id).unwrap().unwrap().id, record.id);
    }

    #[test]
    fn defaults_fill_unset_launch_options() {
        let (_store, dispatcher) = setup(2);
        let record = dispatcher
            .dispatch(
                "nightly-sync",
                count_all(),
                ExecutionMode::Chunked,
                LaunchConfig::default(),
            )
            .unwrap();
        assert_eq!(record.config.chunk_size, Some(200));
        assert!(!record.config.allow_external_calls);
    }

    #[test]
    fn duplicate_dispatch_names_the_active_job() {
        let (store, dispatcher) = setup(4);
        let (work, release) = blocking();
        let first = dispatcher
            .dispatch("nightly-sync", work, ExecutionMode::SingleShot, LaunchConfig::default())
            .unwrap();

        let err = dispatcher
            .submit(DispatchRequest::new("nightly-sync", ExecutionMode::SingleShot))
            .unwrap_err();
        match err {
            DispatchError::Duplicate { conflicting, .. } => assert_eq!(conflicting, Some(first.id)),
            other => panic!("expected duplicate, got {other:?}"),
        }
        assert_eq!(store.history("nightly-sync", None).unwrap().len(), 1);
        let _ = release.send(());
    }

    #[test]
    fn refused_dispatch_keeps_the_registered_unit() {
        let (_store, dispatcher) = setup(4);
        let (work, release) = blocking();
        dispatcher
            .dispatch("nightly-sync", work, ExecutionMode::SingleShot, LaunchConfig::default())
            .unwrap();
        let before = dispatcher.registry().resolve("nightly-sync").unwrap();

        let replacement = UnitWork::new(
            |_: &[Record], _: &JobContext| -> Result<UnitOutcome, UnitError> {
                Ok(UnitOutcome::processed(99))
            },
            StaticSource::sequence(3),
        );
        let err = dispatcher
            .dispatch("nightly-sync", replacement.clone(), ExecutionMode::Chunked, LaunchConfig::default())
            .unwrap_err();
        assert!(matches!(err, DispatchError::Duplicate { .. }));

        let after = dispatcher.registry().resolve("nightly-sync").unwrap();
        assert!(Arc::ptr_eq(&after.unit, &before.unit));
        assert!(!Arc::ptr_eq(&after.unit, &replacement.unit));
        let _ = release.send(());
    }

    #[test]
    fn records_name_the_launching_engine() {
        let store = InMemoryJobStore::arc();
        let engine = Arc::new(LocalEngine::new(ConcurrencyBudget::new(2)).with_name("worker-a"));
        let dispatcher =
            JobDispatcher::new(store.clone(), engine, Arc::new(UnitRegistry::new()), ControlConfig::default());
        let record = dispatcher
            .dispatch("nightly-sync", count_all(), ExecutionMode::Chunked, LaunchConfig::default())
            .unwrap();
        assert_eq!(record.engine.as_deref(), Some("worker-a"));
        assert_eq!(store.get(record.id).unwrap().unwrap().engine.as_deref(), Some("worker-a"));
    }

    #[test]
    fn unknown_units_are_refused() {
        let (_store, dispatcher) = setup(2);
        let err = dispatcher
            .submit(DispatchRequest::new("never-registered", ExecutionMode::SingleShot))
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownUnit(name) if name == "never-registered"));
    }

    #[test]
    fn capacity_refusal_releases_the_reservation() {
        let (store, dispatcher) = setup(1);
        let (work, release) = blocking();
        dispatcher
            .dispatch("holder", work, ExecutionMode::SingleShot, LaunchConfig::default())
            .unwrap();

        let err = dispatcher
            .dispatch("nightly-sync", count_all(), ExecutionMode::Chunked, LaunchConfig::default())
            .unwrap_err();
        assert!(matches!(err, DispatchError::ConcurrencyLimitExceeded { ceiling: 1 }));
        assert!(err.is_transient());
        assert!(store.history("nightly-sync", None).unwrap().is_empty());
        // The slot was given back, so only capacity stands in the way now.
        assert!(store.reserve("nightly-sync", None, Utc::now()).is_ok());
        let _ = release.send(());
    }

    #[test]
    fn store_outage_fails_closed() {
        let (store, dispatcher) = setup(2);
        store.set_available(false);
        let err = dispatcher
            .dispatch("nightly-sync", count_all(), ExecutionMode::Chunked, LaunchConfig::default())
            .unwrap_err();
        assert!(matches!(err, DispatchError::StoreUnavailable(_)));
        store.set_available(true);
        assert!(store.list_active().unwrap().is_empty());
    }

    #[test]
    fn invalid_requests_never_reach_the_engine() {
        let (_store, dispatcher) = setup(2);
        dispatcher.registry().register("nightly-sync", count_all());
        let err = dispatcher
            .submit(
                DispatchRequest::new("nightly-sync", ExecutionMode::Chunked)
                    .with_config(LaunchConfig::chunked(0)),
            )
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidRequest(_)));

        let mut request = DispatchRequest::new("nightly-sync", ExecutionMode::Chunked)
            .with_max_retries(1);
        request.retry_count = 2;
        assert!(matches!(
            dispatcher.submit(request),
            Err(DispatchError::InvalidRequest(_))
        ));
    }

    #[test]
    fn chain_depth_is_counted_through_parents() {
        let store = InMemoryJobStore::arc();
        let engine = Arc::new(LocalEngine::new(ConcurrencyBudget::new(4)));
        let config = ControlConfig {
            chain_depth_limit: 2,
            ..ControlConfig::default()
        };
        let dispatcher =
            JobDispatcher::new(store.clone(), engine, Arc::new(UnitRegistry::new()), config);
        dispatcher.registry().register("stage.*", count_all());

        let root = dispatcher
            .submit(DispatchRequest::new("stage.one", ExecutionMode::Chunked))
            .unwrap();
        let second = dispatcher
            .submit(
                DispatchRequest::new("stage.two", ExecutionMode::Chunked)
                    .child_of(root.id, ChainLink::new("etl", 1)),
            )
            .unwrap();
        let err = dispatcher
            .submit(
                DispatchRequest::new("stage.three", ExecutionMode::Chunked)
                    .child_of(second.id, ChainLink::new("etl", 2)),
            )
            .unwrap_err();
        assert!(matches!(err, DispatchError::ChainDepthExceeded { depth: 3, limit: 2 }));
        assert!(store.history("stage.three", None).unwrap().is_empty());
    }

    #[test]
    fn retry_request_continues_the_failed_record() {
        let mut failed = JobRecord::queued(
            JobId::new(),
            "nightly-sync",
            ExecutionMode::Chunked,
            LaunchConfig::chunked(50),
            Utc::now(),
        )
        .with_context(JobContext::new().with("cursor", 7))
        .with_retries(0, 3, None);
        failed
            .fail(
                &jobctl_core::UnitFailure::new(jobctl_core::FailureKind::Runtime, "reset"),
                Utc::now(),
            )
            .unwrap();

        let request = DispatchRequest::retry_of(&failed);
        assert_eq!(request.retry_count, 1);
        assert_eq!(request.max_retries, Some(3));
        assert_eq!(request.supersedes, Some(failed.id));
        assert_eq!(request.context, failed.context);
        assert_eq!(request.config, failed.config);
    }
}
