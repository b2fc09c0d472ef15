//! Workflow layer - stage engine, integration adapter contract, and the
//! orchestrator that ties them to the task layer.

#![warn(missing_docs)]

pub mod adapter;
pub mod config;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod stage;

pub use adapter::{AdapterError, IntegrationAdapter, Invocation, OperationHandle, OperationResult, RecordingAdapter};
pub use config::{LoggingConfig, OrchestratorConfig};
pub use engine::{StageTransitionResult, WorkflowConfig, WorkflowEngine};
pub use error::{Result, WorkflowError};
pub use orchestrator::{Dispatched, Orchestrator};
pub use stage::{Blueprint, StagePolicy, TaskTemplate};
