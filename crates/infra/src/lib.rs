//! Infrastructure layer: job record stores, the execution engine adapter and
//! the control components that launch, chain, retry, monitor and reconcile jobs.
//!
//! Everything here is synchronous; the Postgres store bridges onto a tokio
//! runtime internally so the same components run from plain threads and from
//! axum handlers alike.

pub mod chaining;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod guard;
pub mod monitor;
pub mod notify;
pub mod plane;
pub mod reconciler;
pub mod registry;
pub mod retry;
pub mod schedule;
pub mod store;


pub use chaining::{ChainDecision, ChainDefinition, ChainStage, ChainingController};
pub use config::{ConfigError, ControlConfig};
pub use dispatcher::{DispatchError, DispatchRequest, JobDispatcher};
pub use engine::{
    BudgetPermit, BudgetUsage, ConcurrencyBudget, EngineError, EngineSnapshot, ExecutionEngine,
    LocalEngine,
};
pub use guard::{Acquisition, DuplicateGuard};
pub use monitor::{DashboardStats, JobSummary, MonitorError, MonitoringService};
pub use notify::{InMemoryNotifier, Notification, Notifier, NotifyError, TracingNotifier};
pub use plane::ControlPlane;
pub use reconciler::{Reconciler, ReconcilerHandle, ReconcilerStats, TickReport};
pub use registry::{UnitRegistry, UnitWork};
pub use retry::{BackoffStrategy, RetryDecision, RetryHandler, RetryPolicy};
pub use schedule::{RecurringSchedule, RecurringScheduler};
pub use store::{InMemoryJobStore, JobStats, JobStore, PostgresJobStore, Reservation, StoreError};
