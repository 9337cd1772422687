use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::{info, warn};

use colony_core::{BreakerConfig, Clock, ColonyError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    last_failure_ms: Option<u64>,
}

/// Three-state circuit breaker guarding one call site.
///
/// After `failure_threshold` consecutive failures the circuit opens and
/// rejects calls with [`ColonyError::CircuitOpen`]. Once more than
/// `reset_timeout_ms` has passed since the last failure, trial calls are
/// admitted (half-open); a success closes the circuit again.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                last_failure_ms: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `action` if the circuit admits it, recording the outcome.
    pub async fn execute<F, Fut, T>(&self, action: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.can_execute() {
            return Err(ColonyError::CircuitOpen);
        }
        match action().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    pub fn can_execute(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let now = self.clock.now_millis();
                let elapsed = inner
                    .last_failure_ms
                    .map(|at| now.saturating_sub(at))
                    .unwrap_or(u64::MAX);
                if elapsed > self.config.reset_timeout_ms {
                    inner.state = CircuitState::HalfOpen;
                    info!(breaker = %self.name, elapsed_ms = elapsed, "Circuit half-open, admitting trial calls");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!(breaker = %self.name, "Circuit closed after successful trial");
        }
        inner.failures = 0;
        inner.state = CircuitState::Closed;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failures = inner.failures.saturating_add(1);
        inner.last_failure_ms = Some(self.clock.now_millis());
        if inner.failures >= self.config.failure_threshold {
            if inner.state != CircuitState::Open {
                warn!(
                    breaker = %self.name,
                    failures = inner.failures,
                    threshold = self.config.failure_threshold,
                    "Circuit opened"
                );
            }
            inner.state = CircuitState::Open;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.last_failure_ms = None;
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
