//! Metric logger traits and composites.

use std::collections::BTreeMap;

/// Trait for logging per-iteration diagnostics to various backends.
pub trait MetricLogger: Send + Sync {
    /// Log a scalar value (e.g. reward, loss).
    fn log_scalar(&self, name: &str, value: f64, step: u64);

    /// Log every diagnostic recorded for one iteration.
    fn log_metrics(&self, metrics: &BTreeMap<String, f64>, step: u64);

    /// Close the logger and flush any pending writes.
    fn close(&self) {}
}

/// A logger that does nothing.
pub struct NoOpLogger;

impl MetricLogger for NoOpLogger {
    fn log_scalar(&self, _name: &str, _value: f64, _step: u64) {}
    fn log_metrics(&self, _metrics: &BTreeMap<String, f64>, _step: u64) {}
}

/// A composite logger that dispatches to multiple backends.
#[derive(Default)]
pub struct CompositeLogger {
    loggers: Vec<Box<dyn MetricLogger>>,
}

impl CompositeLogger {
    pub fn new(loggers: Vec<Box<dyn MetricLogger>>) -> Self {
        Self { loggers }
    }

    pub fn add(&mut self, logger: Box<dyn MetricLogger>) {
        self.loggers.push(logger);
    }

    pub fn len(&self) -> usize {
        self.loggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loggers.is_empty()
    }
}

impl MetricLogger for CompositeLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        for logger in &self.loggers {
            logger.log_scalar(name, value, step);
        }
    }

    fn log_metrics(&self, metrics: &BTreeMap<String, f64>, step: u64) {
        for logger in &self.loggers {
            logger.log_metrics(metrics, step);
        }
    }

    fn close(&self) {
        for logger in &self.loggers {
            logger.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recording(Arc<Mutex<Vec<(String, u64)>>>);

    impl MetricLogger for Recording {
        fn log_scalar(&self, name: &str, _value: f64, step: u64) {
            self.0.lock().unwrap().push((name.to_string(), step));
        }
        fn log_metrics(&self, metrics: &BTreeMap<String, f64>, step: u64) {
            for name in metrics.keys() {
                self.log_scalar(name, 0.0, step);
            }
        }
    }

    #[test]
    fn test_composite_dispatches_to_all() {
        let a = Recording::default();
        let b = Recording::default();
        let composite = CompositeLogger::new(vec![Box::new(a.clone()), Box::new(b.clone())]);
        let mut metrics = BTreeMap::new();
        metrics.insert("AverageReturn".to_string(), 1.0);
        metrics.insert("Itr".to_string(), 3.0);
        composite.log_metrics(&metrics, 3);

        assert_eq!(a.0.lock().unwrap().len(), 2);
        assert_eq!(b.0.lock().unwrap()[0], ("AverageReturn".to_string(), 3));
    }
}
