use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{Agent, TaskContext};

/// Runs one task with one agent. The call behind it (an LLM run, a
/// subprocess, a remote worker) is opaque to the runtime.
pub trait AgentInvoker: Send + Sync + 'static {
    fn invoke<'a>(
        &'a self,
        agent: &'a Agent,
        task: &'a TaskContext,
    ) -> BoxFuture<'a, Result<serde_json::Value>>;

    /// Short label used in logs.
    fn name(&self) -> &str {
        "invoker"
    }
}
