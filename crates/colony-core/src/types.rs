use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// JSON object used for context blobs, metadata and state bags.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// What kind of work an agent provides or a task requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    TaskExecution,
    Planning,
    Analysis,
    Coordination,
    DataProcessing,
    CodeGeneration,
    Review,
    Optimization,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Self::TaskExecution,
        Self::Planning,
        Self::Analysis,
        Self::Coordination,
        Self::DataProcessing,
        Self::CodeGeneration,
        Self::Review,
        Self::Optimization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskExecution => "task-execution",
            Self::Planning => "planning",
            Self::Analysis => "analysis",
            Self::Coordination => "coordination",
            Self::DataProcessing => "data-processing",
            Self::CodeGeneration => "code-generation",
            Self::Review => "review",
            Self::Optimization => "optimization",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role metadata used for assignment tie-breaks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRole {
    #[serde(default)]
    pub specialization: String,
    /// Higher wins when loads are equal.
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Idle,
    Busy,
    Error,
}

/// A capability-tagged, load-tracked worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub role: AgentRole,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default = "default_available")]
    pub is_available: bool,
    #[serde(default)]
    pub current_load: u32,
    #[serde(default = "default_max_load")]
    pub max_load: u32,
    /// Peer id -> number of handoffs sent to that peer.
    #[serde(default)]
    pub relationships: HashMap<String, u32>,
    #[serde(default)]
    pub context: JsonMap,
    #[serde(default)]
    pub status: AgentStatus,
}

fn default_available() -> bool {
    true
}

fn default_max_load() -> u32 {
    5
}

impl Agent {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: AgentRole::default(),
            capabilities: vec![],
            is_available: true,
            current_load: 0,
            max_load: default_max_load(),
            relationships: HashMap::new(),
            context: JsonMap::new(),
            status: AgentStatus::Idle,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.role.priority = priority;
        self
    }

    pub fn with_specialization(mut self, specialization: impl Into<String>) -> Self {
        self.role.specialization = specialization.into();
        self
    }

    pub fn with_load(mut self, load: u32) -> Self {
        self.current_load = load;
        self.refresh_status();
        self
    }

    pub fn with_max_load(mut self, max_load: u32) -> Self {
        self.max_load = max_load;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.is_available = false;
        self
    }

    /// True when every required capability is declared by this agent.
    pub fn has_capabilities(&self, required: &[Capability]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }

    /// Keep `status` in step with the load counter. `Error` is sticky.
    pub fn refresh_status(&mut self) {
        if self.status == AgentStatus::Error {
            return;
        }
        self.status = if self.current_load > 0 {
            AgentStatus::Busy
        } else {
            AgentStatus::Idle
        };
    }

    pub fn relationship_strength(&self, peer_id: &str) -> u32 {
        self.relationships.get(peer_id).copied().unwrap_or(0)
    }
}

/// Task priority; declaration order is the ordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    pub fn weight(&self) -> u32 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
            Self::Critical => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Blocked,
    Waiting,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyType {
    /// Must complete before the dependent starts.
    Sequential,
    /// May run alongside the dependent.
    Parallel,
    /// Gated on a condition produced by the dependency.
    Conditional,
    /// Nice to have.
    Optional,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDependency {
    pub task_id: String,
    #[serde(rename = "type")]
    pub kind: DependencyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl TaskDependency {
    pub fn new(task_id: impl Into<String>, kind: DependencyType) -> Self {
        Self {
            task_id: task_id.into(),
            kind,
            condition: None,
        }
    }
}

/// A decomposed unit of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub parent_id: String,
    pub description: String,
    #[serde(default)]
    pub required_capabilities: Vec<Capability>,
    /// 1 (trivial) to 10 (hard).
    #[serde(default = "default_complexity")]
    pub estimated_complexity: u8,
    #[serde(default)]
    pub dependencies: Vec<TaskDependency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent_id: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: JsonMap,
}

fn default_complexity() -> u8 {
    1
}

impl Subtask {
    pub fn new(
        id: impl Into<String>,
        parent_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            parent_id: parent_id.into(),
            description: description.into(),
            required_capabilities: vec![],
            estimated_complexity: default_complexity(),
            dependencies: vec![],
            assigned_agent_id: None,
            status: TaskStatus::Pending,
            result: None,
            metadata: JsonMap::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.required_capabilities = capabilities;
        self
    }

    pub fn with_complexity(mut self, complexity: u8) -> Self {
        self.estimated_complexity = complexity.clamp(1, 10);
        self
    }

    pub fn depends_on(mut self, task_id: impl Into<String>, kind: DependencyType) -> Self {
        self.dependencies.push(TaskDependency::new(task_id, kind));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryAction {
    Start,
    Complete,
    Fail,
    Handoff,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHistoryEntry {
    pub agent_id: String,
    pub action: HistoryAction,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonMap>,
}

/// A unit of work, possibly decomposed into subtasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    pub id: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required_capabilities: Vec<Capability>,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default = "default_task_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
    #[serde(default)]
    pub metadata: JsonMap,
    #[serde(default)]
    pub status: TaskStatus,
    /// Percentage, 0-100.
    #[serde(default)]
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub history: Vec<TaskHistoryEntry>,
    #[serde(default)]
    pub state: JsonMap,
}

fn default_task_retries() -> u32 {
    3
}

impl TaskContext {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            priority: TaskPriority::Medium,
            description: description.into(),
            required_capabilities: vec![],
            requirements: vec![],
            constraints: vec![],
            deadline: None,
            max_retries: default_task_retries(),
            subtasks: vec![],
            metadata: JsonMap::new(),
            status: TaskStatus::Pending,
            progress: 0,
            error: None,
            history: vec![],
            state: JsonMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.required_capabilities = capabilities;
        self
    }

    pub fn with_subtask(mut self, subtask: Subtask) -> Self {
        self.subtasks.push(subtask);
        self
    }

    pub fn with_subtasks(mut self, subtasks: Vec<Subtask>) -> Self {
        self.subtasks = subtasks;
        self
    }

    pub fn record(&mut self, agent_id: &str, action: HistoryAction, timestamp: DateTime<Utc>) {
        self.history.push(TaskHistoryEntry {
            agent_id: agent_id.to_string(),
            action,
            timestamp,
            metadata: None,
        });
    }
}

/// A request to move an in-flight task between agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffRequest {
    pub task_id: String,
    pub from_agent_id: String,
    pub to_agent_id: String,
    /// Snapshot of whatever the source agent wants the target to see.
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(default)]
    pub priority: TaskPriority,
    pub timestamp: DateTime<Utc>,
}

impl HandoffRequest {
    pub fn new(
        task_id: impl Into<String>,
        from_agent_id: impl Into<String>,
        to_agent_id: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            from_agent_id: from_agent_id.into(),
            to_agent_id: to_agent_id.into(),
            context: serde_json::Value::Null,
            priority: TaskPriority::Medium,
            timestamp: Utc::now(),
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}
