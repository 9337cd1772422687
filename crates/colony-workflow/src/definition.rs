use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use colony_core::config::expand_env_vars;
use colony_core::{Capability, ColonyError, JsonMap, Result, TaskContext};
use colony_swarm::planner::validate_task_dependencies;

/// What a step does when it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// Run the step's tasks on one agent, in planner order.
    Task,
    /// Run each task on its own agent, concurrently.
    Parallel,
    /// Run the step's tasks on one agent, in declared order.
    Sequence,
    /// Evaluate a condition; `true` follows `on_success`, `false` follows
    /// `on_failure`.
    Condition,
    /// Repeat the step's tasks while the condition holds.
    Loop,
    /// Move the current agent's context to another agent.
    Handoff,
    /// Combine the results of `sources` steps.
    Aggregation,
    /// Publish a notification event.
    Notification,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Parallel => "parallel",
            Self::Sequence => "sequence",
            Self::Condition => "condition",
            Self::Loop => "loop",
            Self::Handoff => "handoff",
            Self::Aggregation => "aggregation",
            Self::Notification => "notification",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionKind {
    Equals,
    Contains,
    Greater,
    Less,
    Exists,
    /// Delegates to a [`ConditionEvaluator`].
    Custom,
}

/// Caller-supplied predicate over the workflow result bag. The returned
/// value is read for JSON truthiness.
pub trait ConditionEvaluator: Send + Sync + 'static {
    fn evaluate<'a>(&'a self, result: &'a JsonMap) -> BoxFuture<'a, Result<Value>>;
}

impl<F> ConditionEvaluator for F
where
    F: Fn(&JsonMap) -> Result<Value> + Send + Sync + 'static,
{
    fn evaluate<'a>(&'a self, result: &'a JsonMap) -> BoxFuture<'a, Result<Value>> {
        Box::pin(futures::future::ready(self(result)))
    }
}

/// A condition checked by condition and loop steps.
#[derive(Clone, Serialize, Deserialize)]
pub struct WorkflowCondition {
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    /// Key in the result bag; falls back to a dotted path.
    #[serde(default)]
    pub field: String,
    /// Operand for the structural kinds.
    #[serde(default)]
    pub value: Value,
    #[serde(skip)]
    pub evaluator: Option<Arc<dyn ConditionEvaluator>>,
}

impl fmt::Debug for WorkflowCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowCondition")
            .field("kind", &self.kind)
            .field("field", &self.field)
            .field("value", &self.value)
            .field("evaluator", &self.evaluator.as_ref().map(|_| "<custom>"))
            .finish()
    }
}

impl WorkflowCondition {
    pub fn new(kind: ConditionKind, field: impl Into<String>, value: Value) -> Self {
        Self {
            kind,
            field: field.into(),
            value,
            evaluator: None,
        }
    }

    pub fn equals(field: impl Into<String>, value: Value) -> Self {
        Self::new(ConditionKind::Equals, field, value)
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Self::new(ConditionKind::Exists, field, Value::Null)
    }

    pub fn custom(evaluator: impl ConditionEvaluator) -> Self {
        Self {
            kind: ConditionKind::Custom,
            field: String::new(),
            value: Value::Null,
            evaluator: Some(Arc::new(evaluator)),
        }
    }
}

/// One node of the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default)]
    pub description: String,
    /// Agents picked for this step must hold all of these.
    #[serde(default)]
    pub required_capabilities: Vec<Capability>,
    #[serde(default)]
    pub tasks: Vec<TaskContext>,
    #[serde(default)]
    pub condition: Option<WorkflowCondition>,
    /// Extra attempts after the first failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-attempt deadline.
    #[serde(default = "default_step_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub on_success: Vec<String>,
    #[serde(default)]
    pub on_failure: Vec<String>,
    /// Upper bound on loop iterations.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Steps whose results an aggregation step combines.
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub metadata: JsonMap,
}

fn default_max_retries() -> u32 {
    3
}

fn default_step_timeout_ms() -> u64 {
    30_000
}

fn default_max_iterations() -> u32 {
    10
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            description: String::new(),
            required_capabilities: vec![],
            tasks: vec![],
            condition: None,
            max_retries: default_max_retries(),
            timeout_ms: default_step_timeout_ms(),
            on_success: vec![],
            on_failure: vec![],
            max_iterations: default_max_iterations(),
            sources: vec![],
            metadata: JsonMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.required_capabilities = capabilities;
        self
    }

    pub fn with_tasks(mut self, tasks: Vec<TaskContext>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn with_condition(mut self, condition: WorkflowCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_sources(mut self, sources: &[&str]) -> Self {
        self.sources = sources.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn on_success(mut self, ids: &[&str]) -> Self {
        self.on_success = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn on_failure(mut self, ids: &[&str]) -> Self {
        self.on_failure = ids.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// A registered workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    /// Steps of the first batch.
    #[serde(default)]
    pub initial_steps: Vec<String>,
    /// Deadline for the whole run.
    #[serde(default = "default_global_timeout_ms")]
    pub global_timeout_ms: u64,
    #[serde(default)]
    pub required_agents: Vec<String>,
    #[serde(default)]
    pub metadata: JsonMap,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_global_timeout_ms() -> u64 {
    300_000
}

/// Reserved key holding the start input in the result bag.
pub const INPUT_KEY: &str = "input";

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            version: default_version(),
            steps: vec![],
            initial_steps: vec![],
            global_timeout_ms: default_global_timeout_ms(),
            required_agents: vec![],
            metadata: JsonMap::new(),
        }
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_initial_steps(mut self, ids: &[&str]) -> Self {
        self.initial_steps = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_global_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.global_timeout_ms = timeout_ms;
        self
    }

    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Load a definition from a `.json` or `.toml` file, with env var
    /// expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ColonyError::ConfigNotFound(path.display().to_string()))?;
        let content = expand_env_vars(&content);
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            Ok(serde_json::from_str(&content)?)
        } else {
            Self::from_toml(&content)
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ColonyError::Validation(e.to_string()))
    }

    /// Check that the graph is well formed.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ColonyError::Validation(msg));

        let mut ids = HashSet::new();
        for step in &self.steps {
            if step.id == INPUT_KEY {
                return invalid(format!("step id '{INPUT_KEY}' is reserved"));
            }
            if !ids.insert(step.id.as_str()) {
                return invalid(format!("duplicate step id '{}'", step.id));
            }
        }

        if let Some(missing) = self.initial_steps.iter().find(|id| !ids.contains(id.as_str())) {
            return invalid(format!("invalid initial step reference '{missing}'"));
        }
        let mut initial = HashSet::new();
        if let Some(repeated) = self.initial_steps.iter().find(|id| !initial.insert(id.as_str())) {
            return invalid(format!("initial step '{repeated}' listed twice"));
        }

        for step in &self.steps {
            if let Some(missing) = step.on_success.iter().find(|id| !ids.contains(id.as_str())) {
                return invalid(format!(
                    "invalid on_success reference '{missing}' in step '{}'",
                    step.id
                ));
            }
            if let Some(missing) = step.on_failure.iter().find(|id| !ids.contains(id.as_str())) {
                return invalid(format!(
                    "invalid on_failure reference '{missing}' in step '{}'",
                    step.id
                ));
            }
            if let Some(missing) = step.sources.iter().find(|id| !ids.contains(id.as_str())) {
                return invalid(format!(
                    "invalid aggregation source '{missing}' in step '{}'",
                    step.id
                ));
            }
            if step.kind == StepKind::Aggregation && step.sources.is_empty() {
                return invalid(format!("aggregation step '{}' has no sources", step.id));
            }
            if !validate_task_dependencies(&step.tasks) {
                return invalid(format!(
                    "task dependencies in step '{}' contain a cycle",
                    step.id
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colony_core::TaskPriority;
    use colony_test_utils::{task, task_depending_on, write_temp_file};
    use serde_json::json;

    fn linear() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "Linear")
            .with_step(
                WorkflowStep::new("a", StepKind::Task)
                    .with_tasks(vec![task("t1", TaskPriority::Low)])
                    .on_success(&["b"]),
            )
            .with_step(WorkflowStep::new("b", StepKind::Notification))
            .with_initial_steps(&["a"])
    }

    #[test]
    fn valid_graph_passes() {
        linear().validate().unwrap();
    }

    #[test]
    fn dangling_references_rejected() {
        let wf = linear().with_initial_steps(&["nope"]);
        assert!(wf.validate().unwrap_err().to_string().contains("initial step"));

        let wf = linear().with_step(WorkflowStep::new("c", StepKind::Task).on_failure(&["ghost"]));
        assert!(wf.validate().unwrap_err().to_string().contains("on_failure"));

        let wf = linear().with_step(
            WorkflowStep::new("agg", StepKind::Aggregation).with_sources(&["a", "missing"]),
        );
        assert!(wf.validate().unwrap_err().to_string().contains("aggregation source"));
    }

    #[test]
    fn structural_rules() {
        let dup = linear().with_step(WorkflowStep::new("a", StepKind::Task));
        assert!(dup.validate().unwrap_err().to_string().contains("duplicate"));

        let twice = linear().with_initial_steps(&["a", "a"]);
        assert!(twice.validate().unwrap_err().to_string().contains("listed twice"));

        let reserved = linear().with_step(WorkflowStep::new("input", StepKind::Task));
        assert_eq!(reserved.validate().unwrap_err().kind(), "validation_error");

        let empty_agg = linear().with_step(WorkflowStep::new("agg", StepKind::Aggregation));
        assert!(empty_agg.validate().is_err());

        let cyclic = linear().with_step(WorkflowStep::new("c", StepKind::Task).with_tasks(vec![
            task_depending_on("x", &["y"]),
            task_depending_on("y", &["x"]),
        ]));
        assert!(cyclic.validate().unwrap_err().to_string().contains("cycle"));
    }

    #[test]
    fn toml_defaults() {
        let wf = WorkflowDefinition::from_toml(
            r#"
id = "review"
name = "Review"
initial_steps = ["analyze"]

[[steps]]
id = "analyze"
type = "task"
required_capabilities = ["analysis"]
on_success = ["gate"]

[[steps.tasks]]
id = "t1"
description = "read the diff"
priority = "high"

[[steps]]
id = "gate"
type = "condition"
condition = { type = "greater", field = "score", value = 3 }
"#,
        )
        .unwrap();
        wf.validate().unwrap();
        assert_eq!(wf.global_timeout_ms, 300_000);
        assert_eq!(wf.version, "1.0.0");
        let analyze = wf.step("analyze").unwrap();
        assert_eq!(analyze.max_retries, 3);
        assert_eq!(analyze.timeout_ms, 30_000);
        assert_eq!(analyze.tasks[0].priority, TaskPriority::High);
        let gate = wf.step("gate").unwrap();
        let cond = gate.condition.as_ref().unwrap();
        assert_eq!(cond.kind, ConditionKind::Greater);
        assert_eq!(cond.value, json!(3));
        assert!(cond.evaluator.is_none());
    }

    #[test]
    fn load_json_file() {
        let body = serde_json::to_string(&linear()).unwrap();
        let (_dir, path) = write_temp_file("wf.json", &body);
        let wf = WorkflowDefinition::load(&path).unwrap();
        assert_eq!(wf.steps.len(), 2);
        assert_eq!(wf.step("a").unwrap().on_success, ["b"]);
    }

    #[tokio::test]
    async fn closure_evaluator() {
        let cond = WorkflowCondition::custom(|bag: &JsonMap| {
            Ok::<_, ColonyError>(json!(bag.contains_key("ready")))
        });
        let mut bag = JsonMap::new();
        bag.insert("ready".into(), json!(true));
        let out = cond.evaluator.as_ref().unwrap().evaluate(&bag).await.unwrap();
        assert_eq!(out, json!(true));
        assert!(format!("{cond:?}").contains("<custom>"));
    }
}
