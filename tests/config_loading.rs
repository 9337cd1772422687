use std::io::Write;

use colony_core::config::AppConfig;
use colony_core::{Capability, ColonyError};
use colony_workflow::{ConditionKind, StepKind, WorkflowDefinition};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[swarm.breaker]
failure_threshold = 2
reset_timeout_ms = 500

[orchestrator]
enforce_timeouts = false
event_capacity = 64

[orchestrator.breaker]
failure_threshold = 7

[monitor]
polling_interval_ms = 50
max_retries = 1

[[agents]]
id = "planner-1"
name = "Planner"
capabilities = ["planning", "code-generation"]
specialization = "decomposition"
priority = 4
max_load = 2

[[agents]]
id = "spare"
available = false
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.swarm.breaker.failure_threshold, 2);
    assert_eq!(config.swarm.breaker.reset_timeout_ms, 500);
    assert!(!config.orchestrator.enforce_timeouts);
    assert_eq!(config.orchestrator.event_capacity, 64);
    assert_eq!(config.orchestrator.breaker.failure_threshold, 7);
    assert_eq!(config.orchestrator.breaker.reset_timeout_ms, 60_000);
    assert_eq!(config.monitor.polling_interval_ms, 50);
    assert_eq!(config.monitor.max_retries, 1);

    let agents = config.build_agents();
    assert_eq!(agents.len(), 2);
    assert_eq!(agents[0].name, "Planner");
    assert_eq!(
        agents[0].capabilities,
        vec![Capability::Planning, Capability::CodeGeneration]
    );
    assert_eq!(agents[0].role.priority, 4);
    assert_eq!(agents[0].role.specialization, "decomposition");
    assert_eq!(agents[0].max_load, 2);
    assert_eq!(agents[1].name, "spare");
    assert!(!agents[1].is_available);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("COLONY_TEST_AGENT_ID", "expanded-agent");

    let toml_content = r#"
[[agents]]
id = "${COLONY_TEST_AGENT_ID}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.agents[0].id, "expanded-agent");

    std::env::remove_var("COLONY_TEST_AGENT_ID");
}

#[test]
fn test_empty_config_uses_defaults() {
    let tmp = tempfile::NamedTempFile::new().expect("create temp file");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.swarm.breaker.failure_threshold, 3);
    assert_eq!(config.swarm.breaker.reset_timeout_ms, 30_000);
    assert_eq!(config.orchestrator.breaker.failure_threshold, 5);
    assert_eq!(config.orchestrator.breaker.reset_timeout_ms, 60_000);
    assert!(config.orchestrator.enforce_timeouts);
    assert_eq!(config.orchestrator.event_capacity, 256);
    assert_eq!(config.monitor.polling_interval_ms, 1_000);
    assert_eq!(config.monitor.max_retries, 3);
    assert!(config.agents.is_empty());
}

#[test]
fn test_missing_config_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = AppConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ColonyError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_configs_rejected() {
    let duplicate = r#"
[[agents]]
id = "a"

[[agents]]
id = "a"
"#;
    assert_eq!(AppConfig::parse(duplicate).unwrap_err().kind(), "config_error");

    let zero = "[swarm.breaker]\nfailure_threshold = 0\n";
    assert!(AppConfig::parse(zero).is_err());

    let unknown_capability = "[[agents]]\nid = \"a\"\ncapabilities = [\"telepathy\"]\n";
    assert!(AppConfig::parse(unknown_capability).is_err());
}

#[test]
fn test_demo_config_parses() {
    let config = AppConfig::parse(include_str!("../demos/colony.toml")).expect("demo config");
    let ids: Vec<_> = config.agents.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, ["planner-1", "analyst-1", "reviewer-1"]);
    assert_eq!(config.agents[2].max_load, 3);
}

#[test]
fn test_demo_workflow_loads_and_validates() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/triage.toml");
    let definition = WorkflowDefinition::load(&path).expect("load workflow");
    definition.validate().expect("valid workflow");

    assert_eq!(definition.id, "triage");
    assert_eq!(definition.version, "1.0.0");
    assert_eq!(definition.global_timeout_ms, 60_000);
    assert_eq!(definition.steps.len(), 6);

    let intake = definition.step("intake").unwrap();
    assert_eq!(intake.kind, StepKind::Task);
    assert_eq!(intake.max_retries, 3);
    assert_eq!(intake.tasks[0].subtasks.len(), 3);
    assert_eq!(intake.tasks[0].max_retries, 3);

    let check = definition.step("check").unwrap();
    let condition = check.condition.as_ref().unwrap();
    assert_eq!(condition.kind, ConditionKind::Equals);
    assert_eq!(condition.field, "input.urgent");
    assert_eq!(check.on_failure, ["review"]);
}

#[test]
fn test_json_workflow_file() {
    let json = r#"{
        "id": "tiny",
        "name": "Tiny",
        "initial_steps": ["hello"],
        "steps": [{"id": "hello", "type": "notification", "description": "hi"}]
    }"#;
    let (_dir, path) = colony_test_utils::write_temp_file("tiny.json", json);

    let definition = WorkflowDefinition::load(&path).expect("load json workflow");
    assert_eq!(definition.steps[0].kind, StepKind::Notification);
    assert_eq!(definition.steps[0].timeout_ms, 30_000);
    definition.validate().expect("valid");
}

#[test]
fn test_workflow_with_dangling_edge_fails_validation() {
    let toml_content = r#"
id = "broken"
initial_steps = ["a"]

[[steps]]
id = "a"
type = "notification"
on_success = ["nowhere"]
"#;
    let (_dir, path) = colony_test_utils::write_temp_file("broken.toml", toml_content);
    let definition = WorkflowDefinition::load(&path).expect("parses");
    let err = definition.validate().unwrap_err();
    assert_eq!(err.kind(), "validation_error");
    assert!(err.to_string().contains("nowhere"));
}
