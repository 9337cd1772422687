use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use colony_core::{Agent, AgentInvoker, Result, TaskContext};

/// Invoker that answers every task locally without contacting a model.
///
/// The output echoes the task and agent so a run's result bag shows who
/// did what.
pub struct DryRunInvoker {
    latency: Duration,
}

impl DryRunInvoker {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

impl AgentInvoker for DryRunInvoker {
    fn invoke<'a>(
        &'a self,
        agent: &'a Agent,
        task: &'a TaskContext,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            debug!(agent_id = %agent.id, task_id = %task.id, "Dry-run invocation");
            Ok(json!({
                "task_id": task.id,
                "agent_id": agent.id,
                "description": task.description,
                "subtasks": task.subtasks.len(),
                "dry_run": true,
            }))
        })
    }

    fn name(&self) -> &str {
        "dry-run"
    }
}
