//! Workflow engine: a declarative graph of typed steps driven to
//! completion over a swarm of agents.
//!
//! A [`WorkflowDefinition`] lists steps connected by `on_success` /
//! `on_failure` edges. The [`WorkflowOrchestrator`] runs the current batch
//! of steps concurrently, records each result in a shared result bag, and
//! follows edges until no steps remain.

pub mod condition;
pub mod definition;
pub mod metrics;
pub mod orchestrator;
pub mod state;

pub use condition::{evaluate_condition, lookup_field, truthy};
pub use definition::{
    ConditionEvaluator, ConditionKind, StepKind, WorkflowCondition, WorkflowDefinition,
    WorkflowStep,
};
pub use metrics::{StepMetrics, WorkflowMetrics};
pub use orchestrator::WorkflowOrchestrator;
pub use state::{WorkflowExecutionState, WorkflowStatus, WorkflowStepState};
