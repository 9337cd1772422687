pub mod breaker;
pub mod monitor;
pub mod planner;
pub mod swarm;

pub use breaker::{CircuitBreaker, CircuitState};
pub use monitor::{PollingInvoker, RunBackend, RunMonitor, RunStatus};
pub use planner::{TaskPlanner, TaskResult};
pub use swarm::{SwarmManager, SwarmStats};
