use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use colony_core::{Agent, AgentInvoker, ColonyError, Result, TaskContext};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationRecord {
    pub agent_id: String,
    pub task_id: String,
    /// Subtasks the task carried when it reached the invoker.
    pub subtask_count: usize,
}

/// Scriptable in-memory invoker.
///
/// Succeeds with `{"task_id", "agent_id", "ok": true}` unless a response or
/// a failure budget was configured for the task id.
#[derive(Default)]
pub struct MockInvoker {
    calls: Mutex<Vec<InvocationRecord>>,
    failures: Mutex<HashMap<String, u32>>,
    responses: Mutex<HashMap<String, Value>>,
    delay: Option<Duration>,
}

impl MockInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every invocation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next `times` invocations of `task_id`.
    pub fn fail_task(self, task_id: &str, times: u32) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(task_id.to_string(), times);
        self
    }

    pub fn always_fail(self, task_id: &str) -> Self {
        self.fail_task(task_id, u32::MAX)
    }

    pub fn respond(self, task_id: &str, value: Value) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(task_id.to_string(), value);
        self
    }

    pub fn calls(&self) -> Vec<InvocationRecord> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn task_order(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.task_id).collect()
    }
}

impl AgentInvoker for MockInvoker {
    fn invoke<'a>(
        &'a self,
        agent: &'a Agent,
        task: &'a TaskContext,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(InvocationRecord {
                agent_id: agent.id.clone(),
                task_id: task.id.clone(),
                subtask_count: task.subtasks.len(),
            });

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let should_fail = {
                let mut failures = self.failures.lock().unwrap();
                match failures.get_mut(&task.id) {
                    Some(left) if *left > 0 => {
                        if *left != u32::MAX {
                            *left -= 1;
                        }
                        true
                    }
                    _ => false,
                }
            };
            if should_fail {
                return Err(ColonyError::Invocation {
                    agent: agent.id.clone(),
                    message: format!("scripted failure for {}", task.id),
                });
            }

            if let Some(value) = self.responses.lock().unwrap().get(&task.id) {
                return Ok(value.clone());
            }
            Ok(json!({"task_id": task.id, "agent_id": agent.id, "ok": true}))
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}
