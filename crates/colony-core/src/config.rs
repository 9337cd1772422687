use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ColonyError, Result};
use crate::types::{Agent, AgentRole, Capability};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub swarm: SwarmConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

/// Failure isolation settings for one guarded call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

impl BreakerConfig {
    pub fn new(failure_threshold: u32, reset_timeout_ms: u64) -> Self {
        Self {
            failure_threshold,
            reset_timeout_ms,
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::new(default_failure_threshold(), default_reset_timeout_ms())
    }
}

fn default_failure_threshold() -> u32 { 3 }
fn default_reset_timeout_ms() -> u64 { 30_000 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// Guards handoff requests.
    #[serde(default)]
    pub breaker: BreakerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Guards every step attempt.
    #[serde(default = "default_orchestrator_breaker")]
    pub breaker: BreakerConfig,
    /// Race step attempts and whole runs against their deadlines.
    #[serde(default = "default_true")]
    pub enforce_timeouts: bool,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            breaker: default_orchestrator_breaker(),
            enforce_timeouts: true,
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_orchestrator_breaker() -> BreakerConfig {
    BreakerConfig::new(5, 60_000)
}
fn default_true() -> bool { true }
fn default_event_capacity() -> usize { 256 }

/// Polling settings for external agent runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
    #[serde(default = "default_monitor_retries")]
    pub max_retries: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            polling_interval_ms: default_polling_interval_ms(),
            max_retries: default_monitor_retries(),
        }
    }
}

fn default_polling_interval_ms() -> u64 { 1_000 }
fn default_monitor_retries() -> u32 { 3 }

/// An agent declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub specialization: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_max_load")]
    pub max_load: u32,
    #[serde(default = "default_true")]
    pub available: bool,
}

fn default_max_load() -> u32 { 5 }

impl AgentConfig {
    pub fn to_agent(&self) -> Agent {
        let mut agent = Agent::new(
            self.id.clone(),
            self.name.clone().unwrap_or_else(|| self.id.clone()),
        )
        .with_capabilities(self.capabilities.clone())
        .with_max_load(self.max_load);
        agent.role = AgentRole {
            specialization: self.specialization.clone(),
            priority: self.priority,
        };
        agent.is_available = self.available;
        agent
    }
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ColonyError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| ColonyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if agent.id.is_empty() {
                return Err(ColonyError::Config("agent id must not be empty".into()));
            }
            if !seen.insert(agent.id.as_str()) {
                return Err(ColonyError::Config(format!(
                    "duplicate agent id '{}'",
                    agent.id
                )));
            }
        }
        for (name, breaker) in [
            ("swarm.breaker", &self.swarm.breaker),
            ("orchestrator.breaker", &self.orchestrator.breaker),
        ] {
            if breaker.failure_threshold == 0 {
                return Err(ColonyError::Config(format!(
                    "{name}.failure_threshold must be at least 1"
                )));
            }
        }
        Ok(())
    }

    pub fn build_agents(&self) -> Vec<Agent> {
        self.agents.iter().map(AgentConfig::to_agent).collect()
    }
}

/// Expand `${ENV_VAR}` patterns in a string. Unset variables and an
/// unterminated `${` are left as written.
pub fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(len) = after.find('}') else {
            result.push_str(&rest[start..]);
            return result;
        };
        let name = &after[..len];
        match std::env::var(name) {
            Ok(value) => result.push_str(&value),
            Err(_) => result.push_str(&rest[start..start + 2 + len + 1]),
        }
        rest = &after[len + 1..];
    }
    result.push_str(rest);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_COLONY_VAR", "planner-1");
        let result = expand_env_vars("id = \"${TEST_COLONY_VAR}\"");
        assert_eq!(result, "id = \"planner-1\"");
        std::env::remove_var("TEST_COLONY_VAR");
    }

    #[test]
    fn test_expand_env_vars_unterminated() {
        assert_eq!(expand_env_vars("cost = \"$5\""), "cost = \"$5\"");
        assert_eq!(expand_env_vars("id = \"${OPEN"), "id = \"${OPEN");
        std::env::set_var("TEST_COLONY_TAIL", "x");
        assert_eq!(expand_env_vars("${TEST_COLONY_TAIL}-${"), "x-${");
        std::env::remove_var("TEST_COLONY_TAIL");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("id = \"${NONEXISTENT_COLONY_VAR}\"");
        assert_eq!(result, "id = \"${NONEXISTENT_COLONY_VAR}\"");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.swarm.breaker, BreakerConfig::new(3, 30_000));
        assert_eq!(config.orchestrator.breaker, BreakerConfig::new(5, 60_000));
        assert!(config.orchestrator.enforce_timeouts);
        assert_eq!(config.orchestrator.event_capacity, 256);
        assert_eq!(config.monitor.polling_interval_ms, 1_000);
        assert_eq!(config.monitor.max_retries, 3);
        assert!(config.agents.is_empty());
    }

    #[test]
    fn test_agents_section() {
        let config = AppConfig::parse(
            r#"
[[agents]]
id = "analyst"
capabilities = ["analysis", "review"]
priority = 2

[[agents]]
id = "coder"
name = "Coder"
capabilities = ["code-generation"]
available = false
max_load = 2
"#,
        )
        .unwrap();
        let agents = config.build_agents();
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[0].name, "analyst");
        assert_eq!(agents[0].role.priority, 2);
        assert!(agents[0].is_available);
        assert_eq!(agents[1].max_load, 2);
        assert!(!agents[1].is_available);
        assert!(agents[1].has_capabilities(&[Capability::CodeGeneration]));
    }

    #[test]
    fn test_duplicate_agent_rejected() {
        let err = AppConfig::parse(
            r#"
[[agents]]
id = "a"
[[agents]]
id = "a"
"#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "config_error");
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let err = AppConfig::parse("[swarm.breaker]\nfailure_threshold = 0\n").unwrap_err();
        assert!(err.to_string().contains("swarm.breaker"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("colony.toml");
        std::fs::write(&path, "[monitor]\npolling_interval_ms = 50\n").unwrap();
        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.monitor.polling_interval_ms, 50);
        assert_eq!(config.monitor.max_retries, 3);
    }

    #[test]
    fn test_missing_file() {
        let err = AppConfig::load(Path::new("/nonexistent/colony.toml")).unwrap_err();
        assert!(matches!(err, ColonyError::ConfigNotFound(_)));
    }
}
