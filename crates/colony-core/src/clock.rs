use std::time::Instant;

use chrono::{DateTime, Utc};

/// Time source for breakers, metrics and execution stamps.
pub trait Clock: Send + Sync + 'static {
    /// Monotonic milliseconds since an arbitrary origin.
    fn now_millis(&self) -> u64;

    /// Wall-clock timestamp for history entries and state stamps.
    fn wall(&self) -> DateTime<Utc>;
}

/// Real time. Monotonic readings are relative to construction.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
