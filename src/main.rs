mod dry_run;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use colony_core::config::AppConfig;
use colony_core::{Agent, Capability, Clock, SystemClock, WorkflowEvent};
use colony_swarm::planner::estimate_task_complexity;
use colony_swarm::{SwarmManager, TaskPlanner};
use colony_workflow::{WorkflowDefinition, WorkflowOrchestrator};

use crate::dry_run::DryRunInvoker;

#[derive(Parser)]
#[command(name = "colony", version, about = "Multi-agent workflow orchestrator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "colony.toml", env = "COLONY_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow file against the configured agents
    Run {
        /// Workflow definition (.toml or .json)
        file: PathBuf,
        /// Start input as a JSON document
        #[arg(long, default_value = "{}")]
        input: String,
        /// Simulated latency of every agent invocation
        #[arg(long, default_value = "0")]
        latency_ms: u64,
    },
    /// Check a workflow file without running it
    Validate {
        /// Workflow definition (.toml or .json)
        file: PathBuf,
    },
    /// Show how the planner would order and rewrite each step's tasks
    Plan {
        /// Workflow definition (.toml or .json)
        file: PathBuf,
    },
    /// List the configured agents
    Agents,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("colony=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "colony", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run {
            file,
            input,
            latency_ms,
        } => {
            let input: serde_json::Value = serde_json::from_str(&input)
                .map_err(|e| anyhow::anyhow!("--input is not valid JSON: {e}"))?;
            run_workflow(&config, &file, input, Duration::from_millis(latency_ms)).await?;
        }
        Commands::Validate { file } => {
            let definition = load_workflow(&file)?;
            println!(
                "{} ({}) v{}: {} steps, initial [{}]",
                definition.id,
                definition.name,
                definition.version,
                definition.steps.len(),
                definition.initial_steps.join(", ")
            );
        }
        Commands::Plan { file } => {
            let definition = load_workflow(&file)?;
            print_plan(&definition)?;
        }
        Commands::Agents => {
            let agents = config.build_agents();
            if agents.is_empty() {
                println!("No agents configured.");
            }
            for agent in &agents {
                print_agent(agent);
            }
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        Ok(AppConfig::load(path)?)
    } else {
        warn!(path = %path.display(), "No config file found, using defaults");
        Ok(AppConfig::default())
    }
}

fn load_workflow(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let definition = WorkflowDefinition::load(path)?;
    definition.validate()?;
    Ok(definition)
}

async fn run_workflow(
    config: &AppConfig,
    file: &Path,
    input: serde_json::Value,
    latency: Duration,
) -> anyhow::Result<()> {
    let definition = load_workflow(file)?;
    let workflow_id = definition.id.clone();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let swarm = Arc::new(SwarmManager::new(config.swarm.breaker, clock.clone()));
    let mut agents = config.build_agents();
    if agents.is_empty() {
        warn!("No agents configured, registering a single generalist");
        agents.push(
            Agent::new("generalist", "Generalist").with_capabilities(Capability::ALL.to_vec()),
        );
    }
    for agent in agents {
        swarm.register_agent(agent).await;
    }

    let planner = Arc::new(TaskPlanner::new(
        Arc::new(DryRunInvoker::new(latency)),
        clock.clone(),
    ));
    let orchestrator = Arc::new(WorkflowOrchestrator::new(
        swarm,
        planner,
        config.orchestrator.clone(),
        clock,
    ));
    orchestrator.register_workflow(definition).await?;

    // Spawn event printer
    let mut rx = orchestrator.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            print_event(&event);
        }
    });

    // Ctrl-C cancels whatever is still running
    let canceller = {
        let orchestrator = orchestrator.clone();
        let workflow_id = workflow_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            eprintln!("\n[interrupt] cancelling");
            for execution_id in orchestrator.executions(&workflow_id).await {
                if let Err(e) = orchestrator.cancel_workflow(&execution_id).await {
                    warn!(error = %e, "Cancel failed");
                }
            }
        })
    };

    let outcome = orchestrator.start_workflow(&workflow_id, input).await;
    canceller.abort();
    // Let the printer drain what was already published.
    tokio::time::sleep(Duration::from_millis(20)).await;
    printer.abort();

    let execution_id = match &outcome {
        Ok(id) => Some(id.clone()),
        Err(_) => orchestrator.executions(&workflow_id).await.pop(),
    };
    if let Some(execution_id) = execution_id {
        let state = orchestrator.get_workflow_state(&execution_id).await?;
        println!("{}", serde_json::to_string_pretty(&state)?);
    }
    let metrics = orchestrator.get_workflow_metrics(&workflow_id).await?;
    info!(
        workflow_id = %workflow_id,
        average_duration_ms = metrics.average_duration_ms,
        "Run finished"
    );

    outcome?;
    Ok(())
}

fn print_event(event: &WorkflowEvent) {
    match event {
        WorkflowEvent::StepStarted {
            step_id, attempt, ..
        } => {
            if *attempt == 0 {
                eprintln!("[step: {step_id}]");
            } else {
                eprintln!("[step: {step_id}] retry {attempt}");
            }
        }
        WorkflowEvent::StepFailed { step_id, error, .. } => {
            eprintln!("[{step_id}: ERROR] {error}");
        }
        WorkflowEvent::ConditionEvaluated {
            step_id, result, ..
        } => {
            eprintln!("[{step_id}: condition] {result}");
        }
        WorkflowEvent::HandoffCompleted {
            step_id,
            source,
            target,
            ..
        } => {
            eprintln!("[{step_id}: handoff] {source} -> {target}");
        }
        WorkflowEvent::TimeoutOccurred {
            step_id,
            timeout_ms,
            ..
        } => {
            let what = step_id.as_deref().unwrap_or("workflow");
            eprintln!("[{what}: timeout] {timeout_ms}ms");
        }
        WorkflowEvent::Notification { message, .. } => {
            eprintln!("[notice] {message}");
        }
        WorkflowEvent::WorkflowCompleted { duration_ms, .. } => {
            eprintln!("[done] {duration_ms}ms");
        }
        WorkflowEvent::WorkflowFailed { error, .. } => {
            eprintln!("[failed] {error}");
        }
        _ => {}
    }
}

fn print_plan(definition: &WorkflowDefinition) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let planner = TaskPlanner::new(Arc::new(DryRunInvoker::new(Duration::ZERO)), clock);

    for step in &definition.steps {
        println!("{} [{}]", step.id, step.kind);
        if step.tasks.is_empty() {
            continue;
        }
        for task in planner.plan(step.tasks.clone())? {
            let rules = task
                .metadata
                .get("applied_rules")
                .map(|v| v.to_string())
                .unwrap_or_default();
            println!(
                "  {} priority={:?} subtasks={} complexity={:.1} rules={}",
                task.id,
                task.priority,
                task.subtasks.len(),
                estimate_task_complexity(&task),
                rules
            );
            for sub in &task.subtasks {
                let group = sub
                    .metadata
                    .get("similarity_group")
                    .and_then(|v| v.as_str())
                    .unwrap_or("-");
                println!("    - {} ({group}) {}", sub.id, sub.description);
            }
        }
    }
    Ok(())
}

fn print_agent(agent: &Agent) {
    let caps: Vec<&str> = agent.capabilities.iter().map(Capability::as_str).collect();
    println!(
        "  {} ({}) priority={} load={}/{} available={} [{}]",
        agent.id,
        agent.name,
        agent.role.priority,
        agent.current_load,
        agent.max_load,
        agent.is_available,
        caps.join(", ")
    );
}
