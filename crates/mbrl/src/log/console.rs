//! Console logging backend.

use super::MetricLogger;
use std::collections::BTreeMap;

/// Logger that prints metrics through tracing, one line per iteration.
#[derive(Default)]
pub struct ConsoleLogger;

impl ConsoleLogger {
    pub fn new() -> Self {
        Self
    }
}

impl MetricLogger for ConsoleLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        tracing::info!("Itr {}: {} = {:.4}", step, name, value);
    }

    fn log_metrics(&self, metrics: &BTreeMap<String, f64>, step: u64) {
        // BTreeMap iterates in key order
        let body = metrics
            .iter()
            .map(|(key, value)| format!("{}={:.4}", key, value))
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!("Itr {}: {}", step, body);
    }
}
