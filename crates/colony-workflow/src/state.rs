use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use colony_core::JsonMap;

/// Status of an execution or of one of its steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Created,
    Planning,
    Executing,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStepState {
    pub step_id: String,
    pub status: WorkflowStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Value,
    /// Zero-based attempt number of the latest attempt.
    pub retry_count: u32,
    /// Agent that ran the step. `None` for steps that run on no agent or
    /// fan out over several.
    pub assigned_agent_id: Option<String>,
}

impl WorkflowStepState {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: WorkflowStatus::Created,
            started_at: None,
            ended_at: None,
            error: None,
            result: Value::Null,
            retry_count: 0,
            assigned_agent_id: None,
        }
    }
}

/// Snapshot of one `start_workflow` run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionState {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub current_steps: Vec<String>,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub step_states: HashMap<String, WorkflowStepState>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// `input` plus one entry per completed step, keyed by step id.
    pub result: JsonMap,
}

impl WorkflowExecutionState {
    pub fn new(
        execution_id: impl Into<String>,
        workflow_id: impl Into<String>,
        initial_steps: Vec<String>,
        input: Value,
        started_at: DateTime<Utc>,
    ) -> Self {
        let mut result = JsonMap::new();
        result.insert(crate::definition::INPUT_KEY.into(), input);
        Self {
            execution_id: execution_id.into(),
            workflow_id: workflow_id.into(),
            status: WorkflowStatus::Created,
            current_steps: initial_steps,
            completed_steps: vec![],
            failed_steps: vec![],
            step_states: HashMap::new(),
            started_at,
            ended_at: None,
            error: None,
            result,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&WorkflowStepState> {
        self.step_states.get(step_id)
    }
}
