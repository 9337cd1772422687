pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use clock::{Clock, SystemClock};
pub use config::{AppConfig, BreakerConfig};
pub use error::{ColonyError, Result};
pub use event::{EventBus, ExecutionEvents, WorkflowEvent};
pub use traits::AgentInvoker;
pub use types::*;
