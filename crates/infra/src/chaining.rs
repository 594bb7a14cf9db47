//! Chaining Controller.
//!
//! Reacts to terminal records and decides whether the next stage of their
//! chain is dispatched. Stage N+1 only ever starts from a Completed stage N
//! whose error count is within the chain's tolerance; its context is a copy of
//! stage N's final context.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use jobctl_core::{
    ChainLink, ExecutionMode, FailureKind, JobContext, JobId, JobRecord, JobStatus, LaunchConfig,
    Settlement, UnitFailure,
};

use crate::dispatcher::{DispatchError, DispatchRequest};
use crate::store::{JobStore, StoreError};

/// One stage of a chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainStage {
    pub logical_name: String,
    pub mode: ExecutionMode,
    pub config: LaunchConfig,
}

impl ChainStage {
    pub fn new(logical_name: impl Into<String>, mode: ExecutionMode) -> Self {
        Self {
            logical_name: logical_name.into(),
            mode,
            config: LaunchConfig::default(),
        }
    }

    pub fn with_config(mut self, config: LaunchConfig) -> Self {
        self.config = config;
        self
    }
}

/// Named, ordered stages.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainDefinition {
    pub name: String,
    pub stages: Vec<ChainStage>,
    /// Per-item errors a stage may finish with and still hand over.
    /// `None` uses the configured default.
    pub error_tolerance: Option<u64>,
}

impl ChainDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            error_tolerance: None,
        }
    }

    pub fn stage(mut self, stage: ChainStage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn tolerating(mut self, errors: u64) -> Self {
        self.error_tolerance = Some(errors);
        self
    }
}

/// Outcome of `on_unit_complete`.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainDecision {
    /// The record is not part of a known chain.
    NotChained,
    /// The record was the last stage.
    Finished,
    /// The chain stops here.
    Halted { reason: String },
    /// Dispatch this request next.
    Proceed(DispatchRequest),
}

#[derive(Debug)]
pub struct ChainingController {
    chains: RwLock<HashMap<String, ChainDefinition>>,
    default_tolerance: u64,
}

impl ChainingController {
    pub fn new(default_tolerance: u64) -> Self {
        Self {
            chains: RwLock::new(HashMap::new()),
            default_tolerance,
        }
    }

    pub fn register(&self, definition: ChainDefinition) -> Result<(), DispatchError> {
        if definition.name.trim().is_empty() {
            return Err(DispatchError::InvalidRequest("chain name must not be empty".to_string()));
        }
        if definition.stages.is_empty() {
            return Err(DispatchError::InvalidRequest(format!(
                "chain '{}' has no stages",
                definition.name
            )));
        }
        let mut chains = self
            .chains
            .write()
            .map_err(|_| DispatchError::Store(StoreError::Storage("chain table poisoned".to_string())))?;
        debug!(chain = %definition.name, stages = definition.stages.len(), "chain registered");
        chains.insert(definition.name.clone(), definition);
        Ok(())
    }

    pub fn definition(&self, name: &str) -> Option<ChainDefinition> {
        self.chains.read().ok()?.get(name).cloned()
    }

    /// Request for the first stage of `chain`.
    pub fn start_request(&self, chain: &str, context: JobContext) -> Result<DispatchRequest, DispatchError> {
        let definition = self
            .definition(chain)
            .ok_or_else(|| DispatchError::InvalidRequest(format!("unknown chain '{chain}'")))?;
        let first = &definition.stages[0];
        let mut request = DispatchRequest::new(first.logical_name.clone(), first.mode)
            .with_config(first.config.clone())
            .with_context(context);
        request.chain = Some(ChainLink::new(chain, 0));
        Ok(request)
    }

    /// Decide what follows a terminal record.
    pub fn on_unit_complete(&self, record: &JobRecord) -> ChainDecision {
        let Some(link) = &record.chain else {
            return ChainDecision::NotChained;
        };
        let Some(definition) = self.definition(&link.chain) else {
            warn!(job_id = %record.id, chain = %link.chain, "record names an unknown chain");
            return ChainDecision::NotChained;
        };

        if record.status != JobStatus::Completed {
            let reason = format!(
                "stage {} ({}) ended {}",
                link.stage, record.logical_name, record.status
            );
            info!(job_id = %record.id, chain = %link.chain, stage = link.stage, "chain halted: {reason}");
            return ChainDecision::Halted { reason };
        }

        let tolerance = definition.error_tolerance.unwrap_or(self.default_tolerance);
        if record.error_count > tolerance {
            let reason = format!(
                "stage {} ({}) completed with {} item errors, tolerance is {tolerance}",
                link.stage, record.logical_name, record.error_count
            );
            info!(
                job_id = %record.id,
                chain = %link.chain,
                stage = link.stage,
                error_count = record.error_count,
                tolerance,
                "chain halted on item errors"
            );
            return ChainDecision::Halted { reason };
        }

        let next = link.next();
        let Some(stage) = definition.stages.get(next.stage) else {
            debug!(job_id = %record.id, chain = %link.chain, "chain finished");
            return ChainDecision::Finished;
        };

        let request = DispatchRequest::new(stage.logical_name.clone(), stage.mode)
            .with_config(stage.config.clone())
            .with_context(record.context.clone())
            .child_of(record.id, next);
        ChainDecision::Proceed(request)
    }

    /// Record a link that was refused for exceeding the chain depth.
    ///
    /// The link never ran; it is stored as a settled `Failed` record so the
    /// halt is visible in the chain's history.
    pub fn record_refused_link(
        &self,
        store: &dyn JobStore,
        request: &DispatchRequest,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, StoreError> {
        let mut record = JobRecord::queued(
            JobId::new(),
            request.logical_name.clone(),
            request.mode,
            request.config.clone(),
            now,
        )
        .with_context(request.context.clone())
        .with_parent(request.parent_job_id)
        .with_chain(request.chain.clone());
        record.fail(&UnitFailure::new(FailureKind::Rejected, reason), now)?;
        record.settle(
            Settlement::GaveUp {
                reason: reason.to_string(),
            },
            now,
        )?;
        let stored = store.insert(record)?;
        warn!(
            job_id = %stored.id,
            logical_name = %stored.logical_name,
            parent_job_id = ?stored.parent_job_id,
            "chain link refused"
        );
        Ok(stored)
    }
}
