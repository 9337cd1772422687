//! Polling for agent runs executed by an external backend.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use colony_core::config::MonitorConfig;
use colony_core::{Agent, AgentInvoker, ColonyError, Result, TaskContext};

/// Status reported by a backend for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "payload", rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    /// The run is blocked on something only the caller can provide.
    RequiresAction(Value),
    Completed(Value),
    Failed(String),
}

/// A backend that accepts runs and reports on them.
pub trait RunBackend: Send + Sync + 'static {
    fn submit<'a>(&'a self, agent: &'a Agent, task: &'a TaskContext) -> BoxFuture<'a, Result<String>>;

    fn poll<'a>(&'a self, run_id: &'a str) -> BoxFuture<'a, Result<RunStatus>>;
}

pub struct RunMonitor {
    config: MonitorConfig,
}

fn backoff(interval_ms: u64, retry: u32) -> Duration {
    Duration::from_millis(interval_ms.saturating_mul(2u64.saturating_pow(retry)))
}

impl RunMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self { config }
    }

    /// Poll `run_id` until it completes or needs action.
    ///
    /// Returns `Completed` or `RequiresAction`. A failed run is re-polled
    /// with exponential backoff up to `max_retries` times.
    pub async fn monitor(&self, backend: &dyn RunBackend, run_id: &str) -> Result<RunStatus> {
        let mut retries = 0u32;
        loop {
            match backend.poll(run_id).await? {
                status @ (RunStatus::Completed(_) | RunStatus::RequiresAction(_)) => {
                    debug!(run_id, retries, "Run settled");
                    return Ok(status);
                }
                RunStatus::Failed(reason) => {
                    if retries >= self.config.max_retries {
                        return Err(ColonyError::execution(ColonyError::Agent(format!(
                            "run '{run_id}' failed after {retries} retries: {reason}"
                        ))));
                    }
                    let wait = backoff(self.config.polling_interval_ms, retries);
                    warn!(run_id, retry = retries + 1, wait_ms = wait.as_millis() as u64, reason = %reason, "Run failed, polling again");
                    tokio::time::sleep(wait).await;
                    retries += 1;
                }
                RunStatus::Queued | RunStatus::InProgress => {
                    tokio::time::sleep(Duration::from_millis(self.config.polling_interval_ms))
                        .await;
                }
            }
        }
    }
}

/// Adapts a submit/poll backend into an [`AgentInvoker`].
pub struct PollingInvoker {
    backend: Arc<dyn RunBackend>,
    monitor: RunMonitor,
}

impl PollingInvoker {
    pub fn new(backend: Arc<dyn RunBackend>, config: MonitorConfig) -> Self {
        Self {
            backend,
            monitor: RunMonitor::new(config),
        }
    }
}

impl AgentInvoker for PollingInvoker {
    fn invoke<'a>(&'a self, agent: &'a Agent, task: &'a TaskContext) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let run_id = self.backend.submit(agent, task).await?;
            debug!(agent_id = %agent.id, task_id = %task.id, run_id = %run_id, "Run submitted");
            match self.monitor.monitor(self.backend.as_ref(), &run_id).await? {
                RunStatus::Completed(output) => Ok(output),
                RunStatus::RequiresAction(_) => Err(ColonyError::Invocation {
                    agent: agent.id.clone(),
                    message: format!("run '{run_id}' requires action"),
                }),
                other => Err(ColonyError::Invocation {
                    agent: agent.id.clone(),
                    message: format!("run '{run_id}' ended as {other:?}"),
                }),
            }
        })
    }

    fn name(&self) -> &str {
        "polling"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use colony_core::TaskPriority;
    use colony_test_utils::{generalist, task};
    use serde_json::json;

    struct Scripted {
        statuses: Mutex<VecDeque<RunStatus>>,
        polls: Mutex<u32>,
    }

    impl Scripted {
        fn new(statuses: Vec<RunStatus>) -> Arc<Self> {
            Arc::new(Self {
                statuses: Mutex::new(statuses.into()),
                polls: Mutex::new(0),
            })
        }

        fn polls(&self) -> u32 {
            *self.polls.lock().unwrap()
        }
    }

    impl RunBackend for Scripted {
        fn submit<'a>(&'a self, _agent: &'a Agent, task: &'a TaskContext) -> BoxFuture<'a, Result<String>> {
            Box::pin(async move { Ok(format!("run-{}", task.id)) })
        }

        fn poll<'a>(&'a self, _run_id: &'a str) -> BoxFuture<'a, Result<RunStatus>> {
            Box::pin(async move {
                *self.polls.lock().unwrap() += 1;
                Ok(self
                    .statuses
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or(RunStatus::Failed("script exhausted".into())))
            })
        }
    }

    fn fast() -> MonitorConfig {
        MonitorConfig {
            polling_interval_ms: 1,
            max_retries: 3,
        }
    }

    #[test]
    fn backoff_doubles() {
        assert_eq!(backoff(1_000, 0), Duration::from_millis(1_000));
        assert_eq!(backoff(1_000, 3), Duration::from_millis(8_000));
    }

    #[tokio::test]
    async fn polls_until_completed() {
        let backend = Scripted::new(vec![
            RunStatus::Queued,
            RunStatus::InProgress,
            RunStatus::Failed("flaky".into()),
            RunStatus::Completed(json!({"answer": 42})),
        ]);
        let status = RunMonitor::new(fast()).monitor(backend.as_ref(), "r").await.unwrap();
        assert_eq!(status, RunStatus::Completed(json!({"answer": 42})));
        assert_eq!(backend.polls(), 4);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let backend = Scripted::new(vec![]);
        let err = RunMonitor::new(fast()).monitor(backend.as_ref(), "r").await.unwrap_err();
        assert_eq!(err.kind(), "execution_error");
        // One initial poll plus three retries.
        assert_eq!(backend.polls(), 4);
    }

    #[tokio::test]
    async fn requires_action_is_returned() {
        let backend = Scripted::new(vec![RunStatus::RequiresAction(json!({"tool": "search"}))]);
        let status = RunMonitor::new(fast()).monitor(backend.as_ref(), "r").await.unwrap();
        assert!(matches!(status, RunStatus::RequiresAction(_)));
    }

    #[tokio::test]
    async fn polling_invoker_returns_output() {
        let backend = Scripted::new(vec![RunStatus::InProgress, RunStatus::Completed(json!("ok"))]);
        let invoker = PollingInvoker::new(backend, fast());
        let out = invoker
            .invoke(&generalist("w"), &task("t", TaskPriority::Low))
            .await
            .unwrap();
        assert_eq!(out, json!("ok"));

        let blocked = PollingInvoker::new(Scripted::new(vec![RunStatus::RequiresAction(Value::Null)]), fast());
        let err = blocked
            .invoke(&generalist("w"), &task("t", TaskPriority::Low))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invocation_error");
    }
}
