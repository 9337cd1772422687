//! Task ordering, dependency validation, and sequential execution.

pub mod rules;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use colony_core::{
    Agent, AgentInvoker, Clock, ColonyError, HistoryAction, Result, TaskContext, TaskStatus,
};

pub use rules::{
    DependencyOptimizationRule, OptimizationRule, RulePipeline, SubtaskMergeRule,
    WorkloadBalanceRule,
};

/// Output of one task run.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub task_id: String,
    pub agent_id: String,
    pub output: serde_json::Value,
    pub duration_ms: u64,
}

pub struct TaskPlanner {
    invoker: Arc<dyn AgentInvoker>,
    clock: Arc<dyn Clock>,
    pipeline: RulePipeline,
}

impl TaskPlanner {
    pub fn new(invoker: Arc<dyn AgentInvoker>, clock: Arc<dyn Clock>) -> Self {
        Self {
            invoker,
            clock,
            pipeline: RulePipeline::default(),
        }
    }

    pub fn with_pipeline(mut self, pipeline: RulePipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn pipeline(&self) -> &RulePipeline {
        &self.pipeline
    }

    /// Validate, optimize each task, then order the batch.
    pub fn plan(&self, tasks: Vec<TaskContext>) -> Result<Vec<TaskContext>> {
        if !validate_task_dependencies(&tasks) {
            return Err(ColonyError::Validation(
                "task dependencies contain a cycle".into(),
            ));
        }
        let mut planned: Vec<TaskContext> =
            tasks.into_iter().map(|t| self.pipeline.apply(t)).collect();
        optimize_task_execution(&mut planned);
        debug!(count = planned.len(), "Planned task batch");
        Ok(planned)
    }

    /// Reorder `tasks` and run them one after another with `agent`.
    ///
    /// The first failure abandons the rest of the batch.
    pub async fn execute_tasks(
        &self,
        agent: &Agent,
        tasks: &mut [TaskContext],
    ) -> Result<Vec<TaskResult>> {
        optimize_task_execution(tasks);
        self.execute_in_order(agent, tasks).await
    }

    /// Run `tasks` exactly in the given order.
    pub async fn execute_in_order(
        &self,
        agent: &Agent,
        tasks: &mut [TaskContext],
    ) -> Result<Vec<TaskResult>> {
        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks.iter_mut() {
            results.push(self.execute_task(agent, task).await?);
        }
        info!(agent_id = %agent.id, tasks = results.len(), "Task batch completed");
        Ok(results)
    }

    async fn execute_task(&self, agent: &Agent, task: &mut TaskContext) -> Result<TaskResult> {
        if !agent.has_capabilities(&task.required_capabilities) {
            let err = ColonyError::Agent(format!(
                "agent '{}' lacks capabilities required by task '{}'",
                agent.id, task.id
            ));
            self.mark_failed(agent, task, &err);
            return Err(err);
        }

        task.status = TaskStatus::InProgress;
        task.record(&agent.id, HistoryAction::Start, self.clock.wall());
        let started = self.clock.now_millis();
        debug!(agent_id = %agent.id, task_id = %task.id, invoker = self.invoker.name(), "Invoking agent");

        match self.invoker.invoke(agent, task).await {
            Ok(output) => {
                task.status = TaskStatus::Completed;
                task.progress = 100;
                task.error = None;
                task.record(&agent.id, HistoryAction::Complete, self.clock.wall());
                task.state.insert("result".into(), output.clone());
                Ok(TaskResult {
                    task_id: task.id.clone(),
                    agent_id: agent.id.clone(),
                    output,
                    duration_ms: self.clock.now_millis().saturating_sub(started),
                })
            }
            Err(e) => {
                self.mark_failed(agent, task, &e);
                Err(e)
            }
        }
    }

    fn mark_failed(&self, agent: &Agent, task: &mut TaskContext, err: &ColonyError) {
        warn!(agent_id = %agent.id, task_id = %task.id, error = %err, "Task failed");
        task.status = TaskStatus::Failed;
        task.error = Some(err.to_string());
        task.record(&agent.id, HistoryAction::Fail, self.clock.wall());
    }
}

/// Stable sort: priority descending, then tasks without subtasks, then
/// fewer subtasks first.
pub fn optimize_task_execution(tasks: &mut [TaskContext]) {
    tasks.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| match (a.subtasks.is_empty(), b.subtasks.is_empty()) {
                (true, false) => std::cmp::Ordering::Less,
                (false, true) => std::cmp::Ordering::Greater,
                _ => a.subtasks.len().cmp(&b.subtasks.len()),
            })
    });
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Visited,
}

/// False iff the dependency graph has a cycle.
///
/// Edges run from each task to every dependency target of its subtasks,
/// and from each subtask to its own dependency targets.
pub fn validate_task_dependencies(tasks: &[TaskContext]) -> bool {
    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in tasks {
        edges.entry(task.id.as_str()).or_default();
        for subtask in &task.subtasks {
            for dep in &subtask.dependencies {
                edges
                    .entry(task.id.as_str())
                    .or_default()
                    .push(dep.task_id.as_str());
                edges
                    .entry(subtask.id.as_str())
                    .or_default()
                    .push(dep.task_id.as_str());
            }
        }
    }

    fn has_cycle<'a>(
        node: &'a str,
        edges: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> bool {
        match marks.get(node) {
            Some(Mark::Visiting) => return true,
            Some(Mark::Visited) => return false,
            None => {}
        }
        marks.insert(node, Mark::Visiting);
        if let Some(targets) = edges.get(node) {
            for target in targets {
                if has_cycle(*target, edges, marks) {
                    return true;
                }
            }
        }
        marks.insert(node, Mark::Visited);
        false
    }

    let mut marks = HashMap::new();
    tasks
        .iter()
        .all(|task| !has_cycle(task.id.as_str(), &edges, &mut marks))
}

/// Heuristic score; pure.
pub fn estimate_task_complexity(task: &TaskContext) -> f64 {
    let dependencies: usize = task.subtasks.iter().map(|s| s.dependencies.len()).sum();
    let description = (task.description.chars().count() as f64 / 100.0).min(2.0);
    let score = 1.0
        + task.subtasks.len() as f64 * 0.5
        + dependencies as f64 * 0.3
        + task.priority.weight() as f64 * 0.2
        + description;
    (score * 10.0).round() / 10.0
}
