use std::collections::HashMap;

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepMetrics {
    pub total_executions: u64,
    pub failed_executions: u64,
    pub failure_rate: f64,
    pub average_duration_ms: f64,
}

impl StepMetrics {
    pub fn record(&mut self, success: bool, duration_ms: u64) {
        self.total_executions += 1;
        if !success {
            self.failed_executions += 1;
        }
        let n = self.total_executions as f64;
        self.failure_rate = self.failed_executions as f64 / n;
        self.average_duration_ms = running_average(self.average_duration_ms, n, duration_ms);
    }
}

/// Per-workflow counters across all of its executions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkflowMetrics {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub average_duration_ms: f64,
    pub step_metrics: HashMap<String, StepMetrics>,
}

impl WorkflowMetrics {
    pub fn record_execution(&mut self, success: bool, duration_ms: u64) {
        self.total_executions += 1;
        if success {
            self.successful_executions += 1;
        } else {
            self.failed_executions += 1;
        }
        self.average_duration_ms = running_average(
            self.average_duration_ms,
            self.total_executions as f64,
            duration_ms,
        );
    }

    pub fn record_step(&mut self, step_id: &str, success: bool, duration_ms: u64) {
        self.step_metrics
            .entry(step_id.to_string())
            .or_default()
            .record(success, duration_ms);
    }
}

/// `(avg * (n - 1) + sample) / n`, where `n` already counts the sample.
fn running_average(avg: f64, n: f64, sample: u64) -> f64 {
    (avg * (n - 1.0) + sample as f64) / n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cumulative_average() {
        let mut m = WorkflowMetrics::default();
        m.record_execution(true, 100);
        m.record_execution(false, 200);
        m.record_execution(true, 600);
        assert_eq!(m.total_executions, 3);
        assert_eq!(m.successful_executions, 2);
        assert_eq!(m.failed_executions, 1);
        assert_eq!(m.average_duration_ms, 300.0);
    }

    #[test]
    fn step_failure_rate() {
        let mut m = WorkflowMetrics::default();
        m.record_step("fetch", false, 10);
        m.record_step("fetch", true, 30);
        let step = &m.step_metrics["fetch"];
        assert_eq!(step.total_executions, 2);
        assert_eq!(step.failure_rate, 0.5);
        assert_eq!(step.average_duration_ms, 20.0);
    }
}
