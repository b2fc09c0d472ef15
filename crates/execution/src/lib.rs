//! Execution layer - task store, dependency graph, and scheduling.

#![warn(missing_docs)]

pub mod dependency;
pub mod error;
pub mod events;
pub mod scheduler;
pub mod store;

pub use dependency::{DependencyGraph, GraphConfig};
pub use error::{OrchestrationError, Result};
pub use events::EventBus;
pub use scheduler::{Backoff, CancelOutcome, FailureOutcome, SchedulerConfig, TaskScheduler};
pub use store::{TaskStore, DEFAULT_MAX_RETRIES};
