use thiserror::Error;

#[derive(Debug, Error)]
pub enum ColonyError {
    // Workflow errors
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Workflow execution failed: {source}")]
    Execution {
        #[source]
        source: Box<ColonyError>,
    },

    #[error("Condition error: {0}")]
    Condition(String),

    #[error("Handoff error: {0}")]
    Handoff(String),

    #[error("{what} timed out after {timeout_ms}ms")]
    Timeout { what: String, timeout_ms: u64 },

    #[error("Execution cancelled: {0}")]
    Cancelled(String),

    // Swarm errors
    #[error("Circuit breaker is open")]
    CircuitOpen,

    #[error("No available agents")]
    NoAvailableAgent,

    #[error("Target agent unavailable: {0}")]
    AgentUnavailable(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    // Collaborator errors
    #[error("Agent invocation failed: {agent}: {message}")]
    Invocation { agent: String, message: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ColonyError {
    /// Wrap a step failure as a workflow-level execution error.
    pub fn execution(source: ColonyError) -> Self {
        Self::Execution {
            source: Box::new(source),
        }
    }

    /// Stable tag for callers deciding on remediation.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Agent(_) => "agent_error",
            Self::Execution { .. } => "execution_error",
            Self::Condition(_) => "condition_error",
            Self::Handoff(_) => "handoff_error",
            Self::Timeout { .. } => "timeout_error",
            Self::Cancelled(_) => "cancelled",
            Self::CircuitOpen => "circuit_open",
            Self::NoAvailableAgent => "no_available_agent",
            Self::AgentUnavailable(_) => "agent_unavailable",
            Self::TaskNotFound(_) => "task_not_found",
            Self::Invocation { .. } => "invocation_error",
            Self::Config(_) | Self::ConfigNotFound(_) => "config_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
        }
    }

    /// The innermost error behind any `Execution` wrapping.
    pub fn root_cause(&self) -> &ColonyError {
        match self {
            Self::Execution { source } => source.root_cause(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, ColonyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_wraps_and_unwraps() {
        let err = ColonyError::execution(ColonyError::Agent("no reviewer".into()));
        assert_eq!(err.kind(), "execution_error");
        assert_eq!(err.root_cause().kind(), "agent_error");
        assert_eq!(
            err.to_string(),
            "Workflow execution failed: Agent error: no reviewer"
        );
    }

    #[test]
    fn nested_execution_root_cause() {
        let err = ColonyError::execution(ColonyError::execution(ColonyError::CircuitOpen));
        assert!(matches!(err.root_cause(), ColonyError::CircuitOpen));
    }

    #[test]
    fn timeout_display() {
        let err = ColonyError::Timeout {
            what: "step 'fetch'".into(),
            timeout_ms: 250,
        };
        assert_eq!(err.to_string(), "step 'fetch' timed out after 250ms");
    }
}
