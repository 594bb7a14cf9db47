//! `ControlPlane`: one wiring of every component over a shared store and
//! engine. The API binary and the scenario tests build on it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use jobctl_core::{ExecutionMode, JobContext, JobRecord, LaunchConfig};

use crate::chaining::{ChainDefinition, ChainingController};
use crate::config::ControlConfig;
use crate::dispatcher::{DispatchError, DispatchRequest, JobDispatcher};
use crate::engine::{ConcurrencyBudget, ExecutionEngine, LocalEngine};
use crate::monitor::MonitoringService;
use crate::notify::{Notifier, TracingNotifier};
use crate::reconciler::{Reconciler, ReconcilerHandle, TickReport};
use crate::registry::{UnitRegistry, UnitWork};
use crate::retry::{RetryHandler, RetryPolicy};
use crate::schedule::{RecurringSchedule, RecurringScheduler};
use crate::store::{InMemoryJobStore, JobStore, StoreError};

#[derive(Clone)]
pub struct ControlPlane {
    config: ControlConfig,
    store: Arc<dyn JobStore>,
    engine: Arc<dyn ExecutionEngine>,
    registry: Arc<UnitRegistry>,
    dispatcher: JobDispatcher,
    chaining: Arc<ChainingController>,
    scheduler: Arc<RecurringScheduler>,
    monitor: MonitoringService,
    reconciler: Reconciler,
}

impl ControlPlane {
    pub fn new(
        config: ControlConfig,
        store: Arc<dyn JobStore>,
        engine: Arc<dyn ExecutionEngine>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let registry = Arc::new(UnitRegistry::new());
        let dispatcher = JobDispatcher::new(store.clone(), engine.clone(), registry.clone(), config.clone());
        let chaining = Arc::new(ChainingController::new(config.error_tolerance_for_chaining));
        let scheduler = Arc::new(RecurringScheduler::new());
        let monitor = MonitoringService::new(store.clone(), engine.clone());
        let reconciler = Reconciler::new(
            store.clone(),
            engine.clone(),
            dispatcher.clone(),
            chaining.clone(),
            RetryHandler::new(RetryPolicy::from_config(&config)),
            notifier,
            scheduler.clone(),
        );
        Self {
            config,
            store,
            engine,
            registry,
            dispatcher,
            chaining,
            scheduler,
            monitor,
            reconciler,
        }
    }

    /// In-memory store, local engine sized by `concurrency_ceiling`, and
    /// notifications written to the log.
    pub fn in_memory(config: ControlConfig) -> Self {
        Self::with_store(config, InMemoryJobStore::arc())
    }

    /// Like [`ControlPlane::in_memory`] but over the given store.
    pub fn with_store(config: ControlConfig, store: Arc<dyn JobStore>) -> Self {
        let engine = LocalEngine::new(ConcurrencyBudget::new(config.concurrency_ceiling))
            .with_name(config.engine_name.clone())
            .with_default_chunk_size(config.chunk_size);
        Self::new(config, store, Arc::new(engine), Arc::new(TracingNotifier))
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<dyn ExecutionEngine> {
        &self.engine
    }

    pub fn monitor(&self) -> &MonitoringService {
        &self.monitor
    }

    pub fn register_unit(&self, pattern: impl Into<String>, work: UnitWork) {
        self.registry.register(pattern, work);
    }

    pub fn dispatch(
        &self,
        logical_name: &str,
        unit: UnitWork,
        mode: ExecutionMode,
        config: LaunchConfig,
    ) -> Result<JobRecord, DispatchError> {
        self.dispatcher.dispatch(logical_name, unit, mode, config)
    }

    pub fn submit(&self, request: DispatchRequest) -> Result<JobRecord, DispatchError> {
        self.dispatcher.submit(request)
    }

    pub fn register_chain(&self, definition: ChainDefinition) -> Result<(), DispatchError> {
        self.chaining.register(definition)
    }

    /// Dispatch stage 0 of a registered chain.
    pub fn start_chain(&self, chain: &str, context: JobContext) -> Result<JobRecord, DispatchError> {
        let request = self.chaining.start_request(chain, context)?;
        self.dispatcher.submit(request)
    }

    pub fn schedule_recurring(
        &self,
        logical_name: &str,
        interval: Duration,
        config: LaunchConfig,
        context: JobContext,
    ) -> Result<RecurringSchedule, DispatchError> {
        self.scheduler
            .schedule(logical_name, interval, config, context, Utc::now())
    }

    pub fn unschedule_recurring(&self, logical_name: &str) -> bool {
        self.scheduler.unschedule(logical_name)
    }

    pub fn recurring(&self) -> Vec<RecurringSchedule> {
        self.scheduler.list()
    }

    /// One reconciliation pass.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, StoreError> {
        self.reconciler.tick(now)
    }

    /// Reconcile every `poll_interval_seconds` on a background thread.
    pub fn spawn_reconciler(&self) -> std::io::Result<ReconcilerHandle> {
        self.reconciler.clone().spawn(self.config.poll_interval())
    }
}
