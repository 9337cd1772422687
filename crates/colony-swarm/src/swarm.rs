use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use colony_core::{
    Agent, BreakerConfig, Capability, Clock, ColonyError, HandoffRequest, HistoryAction, JsonMap,
    Result, TaskContext,
};

use crate::breaker::{CircuitBreaker, CircuitState};

/// A task taken by `assign_task` and the agent currently holding it.
#[derive(Debug, Clone)]
struct ActiveTask {
    task: TaskContext,
    agent_id: String,
}

/// Point-in-time view of the swarm.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SwarmStats {
    pub registered_agents: usize,
    pub available_agents: usize,
    pub total_load: u32,
    pub total_capacity: u32,
    pub active_tasks: usize,
    pub handoff_backlog: usize,
}

/// Agent registry, load balancer and handoff protocol.
///
/// Lock order is always registry, then active tasks, then backlog.
pub struct SwarmManager {
    agents: RwLock<Vec<Agent>>,
    active: RwLock<HashMap<String, ActiveTask>>,
    backlog: Mutex<VecDeque<HandoffRequest>>,
    breaker: CircuitBreaker,
    clock: Arc<dyn Clock>,
}

impl SwarmManager {
    pub fn new(breaker: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            agents: RwLock::new(Vec::new()),
            active: RwLock::new(HashMap::new()),
            backlog: Mutex::new(VecDeque::new()),
            breaker: CircuitBreaker::new("swarm-handoff", breaker, clock.clone()),
            clock,
        }
    }

    /// Insert or overwrite by id. Overwrites keep their slot.
    pub async fn register_agent(&self, mut agent: Agent) {
        agent.refresh_status();
        let mut agents = self.agents.write().await;
        match agents.iter_mut().find(|a| a.id == agent.id) {
            Some(slot) => {
                debug!(agent_id = %agent.id, "Replacing registered agent");
                *slot = agent;
            }
            None => {
                info!(agent_id = %agent.id, name = %agent.name, "Agent registered");
                agents.push(agent);
            }
        }
    }

    pub async fn deregister_agent(&self, agent_id: &str) {
        let mut agents = self.agents.write().await;
        let before = agents.len();
        agents.retain(|a| a.id != agent_id);
        if agents.len() != before {
            info!(agent_id, "Agent deregistered");
        }
    }

    /// Pick the least-loaded available agent, highest role priority first
    /// on ties, and take the task.
    pub async fn assign_task(&self, task: TaskContext) -> Result<String> {
        let mut agents = self.agents.write().await;
        let selected = agents
            .iter_mut()
            .filter(|a| a.is_available)
            .min_by(|a, b| {
                a.current_load
                    .cmp(&b.current_load)
                    .then_with(|| b.role.priority.cmp(&a.role.priority))
            })
            .ok_or(ColonyError::NoAvailableAgent)?;

        selected.current_load += 1;
        selected.refresh_status();
        let agent_id = selected.id.clone();

        info!(task_id = %task.id, agent_id = %agent_id, load = selected.current_load, "Task assigned");
        self.active.write().await.insert(
            task.id.clone(),
            ActiveTask {
                task,
                agent_id: agent_id.clone(),
            },
        );
        Ok(agent_id)
    }

    /// Drop an active task and give its holder back one unit of load.
    pub async fn release_task(&self, task_id: &str) -> Result<TaskContext> {
        let mut agents = self.agents.write().await;
        let entry = self
            .active
            .write()
            .await
            .remove(task_id)
            .ok_or_else(|| ColonyError::TaskNotFound(task_id.to_string()))?;

        if let Some(agent) = agents.iter_mut().find(|a| a.id == entry.agent_id) {
            agent.current_load = agent.current_load.saturating_sub(1);
            agent.refresh_status();
        }
        debug!(task_id, agent_id = %entry.agent_id, "Task released");
        Ok(entry.task)
    }

    pub async fn find_available_agent(&self, required: &[Capability]) -> Option<Agent> {
        self.agents
            .read()
            .await
            .iter()
            .find(|a| a.is_available && a.has_capabilities(required))
            .cloned()
    }

    pub async fn find_available_agents(&self, required: &[Capability], count: usize) -> Vec<Agent> {
        self.agents
            .read()
            .await
            .iter()
            .filter(|a| a.is_available && a.has_capabilities(required))
            .take(count)
            .cloned()
            .collect()
    }

    /// Move an active task between agents, guarded by the handoff breaker.
    pub async fn request_handoff(&self, request: HandoffRequest) -> Result<bool> {
        if !self.breaker.can_execute() {
            warn!(task_id = %request.task_id, "Handoff rejected, circuit open");
            return Err(ColonyError::CircuitOpen);
        }

        match self.process_handoff(request).await {
            Ok(()) => {
                self.breaker.record_success();
                Ok(true)
            }
            Err(e) => {
                warn!(error = %e, "Handoff failed");
                self.breaker.record_failure();
                Err(e)
            }
        }
    }

    async fn process_handoff(&self, request: HandoffRequest) -> Result<()> {
        let mut agents = self.agents.write().await;

        let target_idx = agents
            .iter()
            .position(|a| a.id == request.to_agent_id && a.is_available)
            .ok_or_else(|| ColonyError::AgentUnavailable(request.to_agent_id.clone()))?;

        self.backlog.lock().await.push_back(request.clone());

        let source_idx = agents
            .iter()
            .position(|a| a.id == request.from_agent_id)
            .ok_or_else(|| {
                ColonyError::Handoff(format!("source agent '{}' not found", request.from_agent_id))
            })?;

        let mut active = self.active.write().await;
        let entry = active
            .get_mut(&request.task_id)
            .ok_or_else(|| ColonyError::TaskNotFound(request.task_id.clone()))?;

        entry
            .task
            .record(&request.from_agent_id, HistoryAction::Handoff, self.clock.wall());
        entry.agent_id = request.to_agent_id.clone();

        let source = &mut agents[source_idx];
        source.current_load = source.current_load.saturating_sub(1);
        *source
            .relationships
            .entry(request.to_agent_id.clone())
            .or_insert(0) += 1;
        source.refresh_status();

        let target = &mut agents[target_idx];
        target.current_load += 1;
        target.refresh_status();

        info!(
            task_id = %request.task_id,
            from = %request.from_agent_id,
            to = %request.to_agent_id,
            "Handoff completed"
        );
        Ok(())
    }

    /// Swap availability between two agents and merge `patch` into the
    /// target's context. Loads and relationships are untouched.
    pub async fn handle_agent_handoff(
        &self,
        source_id: &str,
        target_id: &str,
        patch: &JsonMap,
    ) -> Result<()> {
        let mut agents = self.agents.write().await;
        let source_idx = agents
            .iter()
            .position(|a| a.id == source_id)
            .ok_or_else(|| ColonyError::Agent(format!("agent '{source_id}' not found")))?;
        let target_idx = agents
            .iter()
            .position(|a| a.id == target_id)
            .ok_or_else(|| ColonyError::Agent(format!("agent '{target_id}' not found")))?;

        agents[source_idx].is_available = true;
        let target = &mut agents[target_idx];
        target.is_available = false;
        for (key, value) in patch {
            target.context.insert(key.clone(), value.clone());
        }
        debug!(source_id, target_id, keys = patch.len(), "Agent context handed off");
        Ok(())
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<Agent> {
        self.agents
            .read()
            .await
            .iter()
            .find(|a| a.id == agent_id)
            .cloned()
            .ok_or_else(|| ColonyError::Agent(format!("agent '{agent_id}' not found")))
    }

    /// Load of an agent; 0 when unknown.
    pub async fn agent_load(&self, agent_id: &str) -> u32 {
        self.agents
            .read()
            .await
            .iter()
            .find(|a| a.id == agent_id)
            .map(|a| a.current_load)
            .unwrap_or(0)
    }

    /// Snapshot of active tasks keyed by task id.
    pub async fn active_threads(&self) -> HashMap<String, TaskContext> {
        self.active
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.task.clone()))
            .collect()
    }

    pub async fn handoff_queue_len(&self) -> usize {
        self.backlog.lock().await.len()
    }

    pub async fn take_handoff_backlog(&self) -> Vec<HandoffRequest> {
        self.backlog.lock().await.drain(..).collect()
    }

    /// Snapshot of the registry in iteration order.
    pub async fn agents(&self) -> Vec<Agent> {
        self.agents.read().await.clone()
    }

    pub async fn stats(&self) -> SwarmStats {
        let agents = self.agents.read().await;
        let active_tasks = self.active.read().await.len();
        let handoff_backlog = self.backlog.lock().await.len();
        SwarmStats {
            registered_agents: agents.len(),
            available_agents: agents.iter().filter(|a| a.is_available).count(),
            total_load: agents.iter().map(|a| a.current_load).sum(),
            total_capacity: agents.iter().map(|a| a.max_load).sum(),
            active_tasks,
            handoff_backlog,
        }
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }
}
