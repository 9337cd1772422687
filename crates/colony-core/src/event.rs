use serde::{Deserialize, Serialize};

/// Lifecycle events published by the workflow orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowStarted {
        execution_id: String,
        workflow_id: String,
    },
    WorkflowCompleted {
        execution_id: String,
        workflow_id: String,
        duration_ms: u64,
    },
    WorkflowFailed {
        execution_id: String,
        workflow_id: String,
        error: String,
    },
    StepStarted {
        execution_id: String,
        step_id: String,
        attempt: u32,
    },
    StepCompleted {
        execution_id: String,
        step_id: String,
        result: serde_json::Value,
    },
    StepFailed {
        execution_id: String,
        step_id: String,
        attempt: u32,
        error: String,
    },
    ConditionEvaluated {
        execution_id: String,
        step_id: String,
        result: bool,
    },
    HandoffInitiated {
        execution_id: String,
        step_id: String,
    },
    HandoffCompleted {
        execution_id: String,
        step_id: String,
        source: String,
        target: String,
    },
    /// `step_id` is `None` when the global workflow deadline fired.
    TimeoutOccurred {
        execution_id: String,
        step_id: Option<String>,
        timeout_ms: u64,
    },
    Notification {
        execution_id: String,
        step_id: String,
        message: String,
    },
}

impl WorkflowEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::WorkflowCompleted { .. } => "workflow_completed",
            Self::WorkflowFailed { .. } => "workflow_failed",
            Self::StepStarted { .. } => "step_started",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::ConditionEvaluated { .. } => "condition_evaluated",
            Self::HandoffInitiated { .. } => "handoff_initiated",
            Self::HandoffCompleted { .. } => "handoff_completed",
            Self::TimeoutOccurred { .. } => "timeout_occurred",
            Self::Notification { .. } => "notification",
        }
    }

    pub fn execution_id(&self) -> &str {
        match self {
            Self::WorkflowStarted { execution_id, .. }
            | Self::WorkflowCompleted { execution_id, .. }
            | Self::WorkflowFailed { execution_id, .. }
            | Self::StepStarted { execution_id, .. }
            | Self::StepCompleted { execution_id, .. }
            | Self::StepFailed { execution_id, .. }
            | Self::ConditionEvaluated { execution_id, .. }
            | Self::HandoffInitiated { execution_id, .. }
            | Self::HandoffCompleted { execution_id, .. }
            | Self::TimeoutOccurred { execution_id, .. }
            | Self::Notification { execution_id, .. } => execution_id,
        }
    }
}

/// Broadcast fan-out of workflow events. Every subscriber sees every
/// execution; use [`EventBus::subscribe_execution`] to follow one run.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns how many subscribers the event reached.
    pub fn publish(&self, event: WorkflowEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }

    pub fn subscribe_execution(&self, execution_id: impl Into<String>) -> ExecutionEvents {
        ExecutionEvents {
            execution_id: execution_id.into(),
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receiver that yields only the events of a single execution.
pub struct ExecutionEvents {
    execution_id: String,
    rx: tokio::sync::broadcast::Receiver<WorkflowEvent>,
}

impl ExecutionEvents {
    /// Next event for this execution. Lagged gaps are skipped; `None`
    /// once the bus is dropped.
    pub async fn recv(&mut self) -> Option<WorkflowEvent> {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match self.rx.recv().await {
                Ok(event) if event.execution_id() == self.execution_id => return Some(event),
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers() {
        let bus = EventBus::default();
        let reached = bus.publish(WorkflowEvent::WorkflowStarted {
            execution_id: "e1".into(),
            workflow_id: "wf".into(),
        });
        assert_eq!(reached, 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn execution_subscription_filters_other_runs() {
        let bus = EventBus::new(8);
        let mut mine = bus.subscribe_execution("e2");
        let _all = bus.subscribe();
        for id in ["e1", "e2", "e1"] {
            let reached = bus.publish(WorkflowEvent::WorkflowStarted {
                execution_id: id.into(),
                workflow_id: "wf".into(),
            });
            assert_eq!(reached, 2);
        }
        bus.publish(WorkflowEvent::WorkflowCompleted {
            execution_id: "e2".into(),
            workflow_id: "wf".into(),
            duration_ms: 5,
        });

        assert_eq!(mine.recv().await.unwrap().name(), "workflow_started");
        let done = mine.recv().await.unwrap();
        assert_eq!(done.name(), "workflow_completed");
        assert_eq!(done.execution_id(), "e2");

        drop(bus);
        assert!(mine.recv().await.is_none());
    }

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(WorkflowEvent::StepStarted {
            execution_id: "e1".into(),
            step_id: "a".into(),
            attempt: 0,
        });
        bus.publish(WorkflowEvent::StepCompleted {
            execution_id: "e1".into(),
            step_id: "a".into(),
            result: serde_json::json!({"ok": true}),
        });
        assert_eq!(rx.recv().await.unwrap().name(), "step_started");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.name(), "step_completed");
        assert_eq!(second.execution_id(), "e1");
    }

    #[test]
    fn serialized_tag_matches_name() {
        let ev = WorkflowEvent::TimeoutOccurred {
            execution_id: "e".into(),
            step_id: None,
            timeout_ms: 10,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], ev.name());
    }
}
