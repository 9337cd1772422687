use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use colony_core::config::OrchestratorConfig;
use colony_core::{
    Agent, Capability, Clock, ColonyError, EventBus, JsonMap, Result, WorkflowEvent,
};
use colony_swarm::{CircuitBreaker, SwarmManager, TaskPlanner};

use crate::condition::evaluate_condition;
use crate::definition::{StepKind, WorkflowDefinition, WorkflowStep};
use crate::metrics::WorkflowMetrics;
use crate::state::{WorkflowExecutionState, WorkflowStatus, WorkflowStepState};

struct ExecutionRecord {
    state: WorkflowExecutionState,
    started_ms: u64,
    cancel: CancellationToken,
    /// Agent most recently picked by any step of this execution.
    last_assigned_agent: Option<String>,
}

/// Interprets registered workflow graphs over a swarm of agents.
///
/// Each `start_workflow` call walks the graph batch by batch: every step in
/// the current batch runs concurrently, each step attempt goes through the
/// orchestrator's circuit breaker, and failed attempts are retried up to
/// the step's `max_retries`. A step that exhausts its retries fails the
/// whole execution.
pub struct WorkflowOrchestrator {
    swarm: Arc<SwarmManager>,
    planner: Arc<TaskPlanner>,
    breaker: CircuitBreaker,
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    executions: RwLock<HashMap<String, ExecutionRecord>>,
    metrics: RwLock<HashMap<String, WorkflowMetrics>>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
}

fn capability_list(caps: &[Capability]) -> String {
    caps.iter()
        .map(Capability::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

impl WorkflowOrchestrator {
    pub fn new(
        swarm: Arc<SwarmManager>,
        planner: Arc<TaskPlanner>,
        config: OrchestratorConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            swarm,
            planner,
            breaker: CircuitBreaker::new("workflow-steps", config.breaker, clock.clone()),
            definitions: RwLock::new(HashMap::new()),
            executions: RwLock::new(HashMap::new()),
            metrics: RwLock::new(HashMap::new()),
            events: Arc::new(EventBus::new(config.event_capacity)),
            clock,
            config,
        }
    }

    /// Share an existing bus instead of the orchestrator's own.
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    pub fn swarm(&self) -> &Arc<SwarmManager> {
        &self.swarm
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Validate and store a definition. Re-registering replaces the
    /// definition and zeroes its metrics.
    pub async fn register_workflow(&self, definition: WorkflowDefinition) -> Result<()> {
        definition.validate()?;
        let id = definition.id.clone();
        info!(workflow_id = %id, steps = definition.steps.len(), "Workflow registered");
        self.definitions
            .write()
            .await
            .insert(id.clone(), Arc::new(definition));
        self.metrics
            .write()
            .await
            .insert(id, WorkflowMetrics::default());
        Ok(())
    }

    /// Registered workflow ids, sorted.
    pub async fn workflows(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.definitions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions.read().await.get(workflow_id).cloned()
    }

    /// Run a workflow to completion and return its execution id.
    ///
    /// On failure the execution is still queryable; its id is carried by
    /// the `workflow_started` event.
    pub async fn start_workflow(&self, workflow_id: &str, input: Value) -> Result<String> {
        let definition = self.get_workflow(workflow_id).await.ok_or_else(|| {
            ColonyError::Validation(format!("workflow '{workflow_id}' not found"))
        })?;

        for required in &definition.required_agents {
            if self.swarm.get_agent(required).await.is_err() {
                warn!(workflow_id, agent_id = %required, "Required agent is not registered");
            }
        }

        let now = self.clock.wall();
        let execution_id = format!(
            "{}-{}-{}",
            workflow_id,
            now.timestamp_millis(),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let cancel = CancellationToken::new();
        let state = WorkflowExecutionState::new(
            execution_id.clone(),
            workflow_id,
            definition.initial_steps.clone(),
            input,
            now,
        );
        self.executions.write().await.insert(
            execution_id.clone(),
            ExecutionRecord {
                state,
                started_ms: self.clock.now_millis(),
                cancel: cancel.clone(),
                last_assigned_agent: None,
            },
        );

        info!(workflow_id, execution_id = %execution_id, "Workflow started");
        self.events.publish(WorkflowEvent::WorkflowStarted {
            execution_id: execution_id.clone(),
            workflow_id: workflow_id.to_string(),
        });

        match self.run_guarded(&definition, &execution_id, cancel).await {
            Ok(()) => Ok(execution_id),
            Err(e) => {
                self.fail_execution(&definition, &execution_id, &e).await;
                Err(e)
            }
        }
    }

    /// Signal an in-flight execution to stop. Returns `false` when it has
    /// already finished.
    pub async fn cancel_workflow(&self, execution_id: &str) -> Result<bool> {
        let executions = self.executions.read().await;
        let record = executions.get(execution_id).ok_or_else(|| {
            ColonyError::Validation(format!("workflow execution '{execution_id}' not found"))
        })?;
        if record.state.status.is_terminal() {
            return Ok(false);
        }
        info!(execution_id, "Cancelling workflow execution");
        record.cancel.cancel();
        Ok(true)
    }

    pub async fn get_workflow_state(&self, execution_id: &str) -> Result<WorkflowExecutionState> {
        self.executions
            .read()
            .await
            .get(execution_id)
            .map(|r| r.state.clone())
            .ok_or_else(|| {
                ColonyError::Validation(format!("workflow execution '{execution_id}' not found"))
            })
    }

    /// Execution ids of a workflow, oldest first.
    pub async fn executions(&self, workflow_id: &str) -> Vec<String> {
        let executions = self.executions.read().await;
        let mut runs: Vec<(&String, u64)> = executions
            .iter()
            .filter(|(_, r)| r.state.workflow_id == workflow_id)
            .map(|(id, r)| (id, r.started_ms))
            .collect();
        runs.sort_by_key(|(_, started)| *started);
        runs.into_iter().map(|(id, _)| id.clone()).collect()
    }

    pub async fn get_workflow_metrics(&self, workflow_id: &str) -> Result<WorkflowMetrics> {
        self.metrics
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| ColonyError::Validation(format!("workflow '{workflow_id}' not found")))
    }

    async fn run_guarded(
        &self,
        definition: &WorkflowDefinition,
        execution_id: &str,
        cancel: CancellationToken,
    ) -> Result<()> {
        let run = async {
            let deadline = definition.global_timeout_ms;
            if !self.config.enforce_timeouts || deadline == 0 {
                return self.execute_workflow(definition, execution_id).await;
            }
            match tokio::time::timeout(
                Duration::from_millis(deadline),
                self.execute_workflow(definition, execution_id),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => {
                    warn!(execution_id, timeout_ms = deadline, "Workflow timed out");
                    self.events.publish(WorkflowEvent::TimeoutOccurred {
                        execution_id: execution_id.to_string(),
                        step_id: None,
                        timeout_ms: deadline,
                    });
                    Err(ColonyError::Timeout {
                        what: format!("workflow '{}'", definition.id),
                        timeout_ms: deadline,
                    })
                }
            }
        };

        tokio::select! {
            result = run => result,
            _ = cancel.cancelled() => Err(ColonyError::Cancelled(execution_id.to_string())),
        }
    }

    async fn execute_workflow(
        &self,
        definition: &WorkflowDefinition,
        execution_id: &str,
    ) -> Result<()> {
        self.with_record(execution_id, |r| r.state.status = WorkflowStatus::Executing)
            .await;

        loop {
            let current = self
                .with_record(execution_id, |r| r.state.current_steps.clone())
                .await
                .unwrap_or_default();
            if current.is_empty() {
                break;
            }
            debug!(execution_id, steps = ?current, "Executing step batch");

            let outcomes = join_all(
                current
                    .iter()
                    .map(|step_id| self.execute_step(definition, execution_id, step_id)),
            )
            .await;
            if let Some(err) = outcomes.into_iter().find_map(|r| r.err()) {
                return Err(ColonyError::execution(err));
            }

            self.with_record(execution_id, |r| {
                let next = next_steps(definition, &mut r.state, &current);
                r.state.current_steps = next;
            })
            .await;
        }

        let duration_ms = self.finish(execution_id, WorkflowStatus::Completed, None).await;
        self.metrics
            .write()
            .await
            .entry(definition.id.clone())
            .or_default()
            .record_execution(true, duration_ms);

        info!(workflow_id = %definition.id, execution_id, duration_ms, "Workflow completed");
        self.events.publish(WorkflowEvent::WorkflowCompleted {
            execution_id: execution_id.to_string(),
            workflow_id: definition.id.clone(),
            duration_ms,
        });
        Ok(())
    }

    async fn fail_execution(
        &self,
        definition: &WorkflowDefinition,
        execution_id: &str,
        err: &ColonyError,
    ) {
        let status = match err.root_cause() {
            ColonyError::Cancelled(_) => WorkflowStatus::Cancelled,
            _ => WorkflowStatus::Failed,
        };
        let duration_ms = self
            .finish(execution_id, status, Some(err.to_string()))
            .await;
        self.metrics
            .write()
            .await
            .entry(definition.id.clone())
            .or_default()
            .record_execution(false, duration_ms);

        error!(workflow_id = %definition.id, execution_id, error = %err, "Workflow failed");
        self.events.publish(WorkflowEvent::WorkflowFailed {
            execution_id: execution_id.to_string(),
            workflow_id: definition.id.clone(),
            error: err.to_string(),
        });
    }

    /// Stamp the terminal status and return the run's duration.
    async fn finish(&self, execution_id: &str, status: WorkflowStatus, error: Option<String>) -> u64 {
        let now = self.clock.now_millis();
        let wall = self.clock.wall();
        self.with_record(execution_id, |r| {
            r.state.status = status;
            r.state.ended_at = Some(wall);
            r.state.error = error;
            now.saturating_sub(r.started_ms)
        })
        .await
        .unwrap_or(0)
    }

    /// Bounded retry loop around one step.
    async fn execute_step(
        &self,
        definition: &WorkflowDefinition,
        execution_id: &str,
        step_id: &str,
    ) -> Result<()> {
        let step = definition.step(step_id).ok_or_else(|| {
            ColonyError::Validation(format!("step '{step_id}' not found in '{}'", definition.id))
        })?;
        let attempts = step.max_retries.saturating_add(1);

        let mut attempt = 0;
        loop {
            let wall = self.clock.wall();
            self.with_record(execution_id, |r| {
                let mut state = WorkflowStepState::new(step.id.clone());
                state.retry_count = attempt;
                state.started_at = Some(wall);
                r.state.step_states.insert(step.id.clone(), state);
            })
            .await;

            let started = self.clock.now_millis();
            let outcome = self
                .breaker
                .execute(|| self.run_attempt(execution_id, step, attempt))
                .await;
            let duration_ms = self.clock.now_millis().saturating_sub(started);

            let err = match outcome {
                Ok(()) => {
                    self.record_step_metrics(&definition.id, &step.id, true, duration_ms)
                        .await;
                    return Ok(());
                }
                Err(e) => e,
            };

            let rejected = matches!(err, ColonyError::CircuitOpen);
            if !rejected {
                self.record_step_metrics(&definition.id, &step.id, false, duration_ms)
                    .await;
            }
            let wall = self.clock.wall();
            let message = err.to_string();
            self.update_step(execution_id, &step.id, |s| {
                s.status = WorkflowStatus::Failed;
                s.error = Some(message.clone());
                s.ended_at = Some(wall);
            })
            .await;
            warn!(execution_id, step_id = %step.id, attempt, error = %err, "Step attempt failed");
            self.events.publish(WorkflowEvent::StepFailed {
                execution_id: execution_id.to_string(),
                step_id: step.id.clone(),
                attempt,
                error: message,
            });

            attempt += 1;
            if rejected || attempt >= attempts {
                return Err(err);
            }
        }
    }

    async fn run_attempt(&self, execution_id: &str, step: &WorkflowStep, attempt: u32) -> Result<()> {
        self.update_step(execution_id, &step.id, |s| s.status = WorkflowStatus::Executing)
            .await;
        self.events.publish(WorkflowEvent::StepStarted {
            execution_id: execution_id.to_string(),
            step_id: step.id.clone(),
            attempt,
        });

        let work = self.dispatch(execution_id, step);
        let result = if self.config.enforce_timeouts && step.timeout_ms > 0 {
            match tokio::time::timeout(Duration::from_millis(step.timeout_ms), work).await {
                Ok(result) => result?,
                Err(_) => {
                    self.events.publish(WorkflowEvent::TimeoutOccurred {
                        execution_id: execution_id.to_string(),
                        step_id: Some(step.id.clone()),
                        timeout_ms: step.timeout_ms,
                    });
                    return Err(ColonyError::Timeout {
                        what: format!("step '{}'", step.id),
                        timeout_ms: step.timeout_ms,
                    });
                }
            }
        } else {
            work.await?
        };

        let wall = self.clock.wall();
        self.with_record(execution_id, |r| {
            if let Some(state) = r.state.step_states.get_mut(&step.id) {
                state.status = WorkflowStatus::Completed;
                state.ended_at = Some(wall);
                state.error = None;
                state.result = result.clone();
            }
            r.state.result.insert(step.id.clone(), result.clone());
        })
        .await;

        debug!(execution_id, step_id = %step.id, kind = %step.kind, "Step completed");
        self.events.publish(WorkflowEvent::StepCompleted {
            execution_id: execution_id.to_string(),
            step_id: step.id.clone(),
            result,
        });
        Ok(())
    }

    async fn dispatch(&self, execution_id: &str, step: &WorkflowStep) -> Result<Value> {
        match step.kind {
            StepKind::Task => self.execute_task_step(execution_id, step, true).await,
            StepKind::Sequence => self.execute_task_step(execution_id, step, false).await,
            StepKind::Parallel => self.execute_parallel_step(step).await,
            StepKind::Condition => self.execute_condition_step(execution_id, step).await,
            StepKind::Loop => self.execute_loop_step(execution_id, step).await,
            StepKind::Handoff => self.execute_handoff_step(execution_id, step).await,
            StepKind::Aggregation => self.execute_aggregation_step(execution_id, step).await,
            StepKind::Notification => self.execute_notification_step(execution_id, step),
        }
    }

    fn require_tasks(step: &WorkflowStep) -> Result<()> {
        if step.tasks.is_empty() {
            return Err(ColonyError::Validation(format!(
                "{} step '{}' must have at least one task",
                step.kind, step.id
            )));
        }
        Ok(())
    }

    async fn pick_agent(&self, execution_id: &str, step: &WorkflowStep) -> Result<Agent> {
        let agent = self
            .swarm
            .find_available_agent(&step.required_capabilities)
            .await
            .ok_or_else(|| {
                ColonyError::Agent(format!(
                    "no available agent with capabilities [{}] for step '{}'",
                    capability_list(&step.required_capabilities),
                    step.id
                ))
            })?;
        self.assign_step_agent(execution_id, &step.id, &agent.id).await;
        Ok(agent)
    }

    async fn assign_step_agent(&self, execution_id: &str, step_id: &str, agent_id: &str) {
        self.with_record(execution_id, |r| {
            if let Some(state) = r.state.step_states.get_mut(step_id) {
                state.assigned_agent_id = Some(agent_id.to_string());
            }
            r.last_assigned_agent = Some(agent_id.to_string());
        })
        .await;
    }

    async fn execute_task_step(
        &self,
        execution_id: &str,
        step: &WorkflowStep,
        reorder: bool,
    ) -> Result<Value> {
        Self::require_tasks(step)?;
        let agent = self.pick_agent(execution_id, step).await?;
        let mut tasks = if reorder {
            self.planner.plan(step.tasks.clone())?
        } else {
            step.tasks.clone()
        };
        let results = self.planner.execute_in_order(&agent, &mut tasks).await?;
        Ok(serde_json::to_value(results)?)
    }

    async fn execute_parallel_step(&self, step: &WorkflowStep) -> Result<Value> {
        Self::require_tasks(step)?;
        let wanted = step.tasks.len();
        let agents = self
            .swarm
            .find_available_agents(&step.required_capabilities, wanted)
            .await;
        if agents.len() < wanted {
            return Err(ColonyError::Agent(format!(
                "insufficient agents for parallel step '{}': need {wanted}, found {}",
                step.id,
                agents.len()
            )));
        }

        let planner = self.planner.as_ref();
        let runs = step.tasks.iter().zip(agents.iter()).map(|(task, agent)| async move {
            let mut batch = planner.plan(vec![task.clone()])?;
            planner.execute_in_order(agent, &mut batch).await
        });

        let mut collected = Vec::with_capacity(wanted);
        for outcome in join_all(runs).await {
            collected.extend(outcome?);
        }
        Ok(serde_json::to_value(collected)?)
    }

    async fn execute_condition_step(&self, execution_id: &str, step: &WorkflowStep) -> Result<Value> {
        let condition = step.condition.as_ref().ok_or_else(|| {
            ColonyError::Validation(format!("condition step '{}' has no condition", step.id))
        })?;
        let bag = self.result_bag(execution_id).await;
        let outcome = evaluate_condition(condition, &bag).await?;

        self.update_step(execution_id, &step.id, |s| s.result = Value::Bool(outcome))
            .await;
        self.events.publish(WorkflowEvent::ConditionEvaluated {
            execution_id: execution_id.to_string(),
            step_id: step.id.clone(),
            result: outcome,
        });
        Ok(Value::Bool(outcome))
    }

    async fn execute_loop_step(&self, execution_id: &str, step: &WorkflowStep) -> Result<Value> {
        let condition = step.condition.as_ref().ok_or_else(|| {
            ColonyError::Validation(format!("loop step '{}' has no condition", step.id))
        })?;
        Self::require_tasks(step)?;
        let planned = self.planner.plan(step.tasks.clone())?;
        let agent = self.pick_agent(execution_id, step).await?;

        let mut bag = self.result_bag(execution_id).await;
        let mut iteration = 0u32;
        let mut last = Value::Null;
        while iteration < step.max_iterations {
            bag.insert(
                step.id.clone(),
                json!({"iteration": iteration, "last": last}),
            );
            if !evaluate_condition(condition, &bag).await? {
                break;
            }
            let mut tasks = planned.clone();
            let results = self.planner.execute_in_order(&agent, &mut tasks).await?;
            last = serde_json::to_value(results)?;
            iteration += 1;
            debug!(execution_id, step_id = %step.id, iteration, "Loop iteration finished");
        }
        Ok(json!({"iteration": iteration, "last": last}))
    }

    async fn execute_handoff_step(&self, execution_id: &str, step: &WorkflowStep) -> Result<Value> {
        self.events.publish(WorkflowEvent::HandoffInitiated {
            execution_id: execution_id.to_string(),
            step_id: step.id.clone(),
        });

        // Source is the agent that most recently worked on this execution.
        let source_id = self
            .with_record(execution_id, |r| {
                let source = r.last_assigned_agent.clone();
                if let Some(state) = r.state.step_states.get_mut(&step.id) {
                    state.assigned_agent_id = source.clone();
                }
                source
            })
            .await
            .flatten()
            .ok_or_else(|| {
                ColonyError::Agent(format!("handoff step '{}' has no assigned agent", step.id))
            })?;
        let source = self.swarm.get_agent(&source_id).await?;

        let target = self
            .swarm
            .find_available_agents(&step.required_capabilities, usize::MAX)
            .await
            .into_iter()
            .find(|a| a.id != source.id)
            .ok_or_else(|| {
                ColonyError::Agent(format!(
                    "no available agent for handoff step '{}' with capabilities [{}]",
                    step.id,
                    capability_list(&step.required_capabilities)
                ))
            })?;

        let bag = self.result_bag(execution_id).await;
        self.swarm
            .handle_agent_handoff(&source.id, &target.id, &bag)
            .await?;
        self.assign_step_agent(execution_id, &step.id, &target.id).await;

        info!(execution_id, step_id = %step.id, source = %source.id, target = %target.id, "Handoff step completed");
        self.events.publish(WorkflowEvent::HandoffCompleted {
            execution_id: execution_id.to_string(),
            step_id: step.id.clone(),
            source: source.id.clone(),
            target: target.id.clone(),
        });
        Ok(json!({"source": source.id, "target": target.id}))
    }

    async fn execute_aggregation_step(&self, execution_id: &str, step: &WorkflowStep) -> Result<Value> {
        let bag = self.result_bag(execution_id).await;
        let mut combined = JsonMap::new();
        for source in &step.sources {
            let value = bag.get(source).ok_or_else(|| {
                ColonyError::Validation(format!(
                    "aggregation step '{}': source '{source}' has no result",
                    step.id
                ))
            })?;
            combined.insert(source.clone(), value.clone());
        }
        Ok(Value::Object(combined))
    }

    fn execute_notification_step(&self, execution_id: &str, step: &WorkflowStep) -> Result<Value> {
        let message = if step.description.is_empty() {
            step.name.clone()
        } else {
            step.description.clone()
        };
        info!(execution_id, step_id = %step.id, message = %message, "Workflow notification");
        self.events.publish(WorkflowEvent::Notification {
            execution_id: execution_id.to_string(),
            step_id: step.id.clone(),
            message,
        });
        Ok(Value::Null)
    }

    async fn result_bag(&self, execution_id: &str) -> JsonMap {
        self.with_record(execution_id, |r| r.state.result.clone())
            .await
            .unwrap_or_default()
    }

    async fn record_step_metrics(&self, workflow_id: &str, step_id: &str, success: bool, duration_ms: u64) {
        self.metrics
            .write()
            .await
            .entry(workflow_id.to_string())
            .or_default()
            .record_step(step_id, success, duration_ms);
    }

    async fn with_record<R>(
        &self,
        execution_id: &str,
        f: impl FnOnce(&mut ExecutionRecord) -> R,
    ) -> Option<R> {
        self.executions.write().await.get_mut(execution_id).map(f)
    }

    async fn update_step(
        &self,
        execution_id: &str,
        step_id: &str,
        f: impl FnOnce(&mut WorkflowStepState),
    ) {
        self.with_record(execution_id, |r| {
            if let Some(state) = r.state.step_states.get_mut(step_id) {
                f(state);
            }
        })
        .await;
    }
}

/// Record the batch outcome and compute the next batch, deduplicated in
/// first-seen order. Condition steps route `false` to `on_failure`.
fn next_steps(
    definition: &WorkflowDefinition,
    state: &mut WorkflowExecutionState,
    current: &[String],
) -> Vec<String> {
    let mut next: Vec<String> = Vec::new();
    for step_id in current {
        let (Some(step), Some(step_state)) =
            (definition.step(step_id), state.step_states.get(step_id))
        else {
            continue;
        };
        let edges = match step_state.status {
            WorkflowStatus::Completed => {
                state.completed_steps.push(step_id.clone());
                let took_false_branch = step.kind == StepKind::Condition
                    && step_state.result == Value::Bool(false);
                if took_false_branch {
                    &step.on_failure
                } else {
                    &step.on_success
                }
            }
            WorkflowStatus::Failed => {
                state.failed_steps.push(step_id.clone());
                &step.on_failure
            }
            _ => continue,
        };
        for id in edges {
            if !next.contains(id) {
                next.push(id.clone());
            }
        }
    }
    next
}
