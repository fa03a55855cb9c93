//! Metric logging.
//!
//! Provides:
//! - `MetricLogger` trait for composable backends
//! - `ConsoleLogger` for lightweight stdout logging via tracing
//! - `CsvLogger` for a `progress.csv` table, one row per iteration
//! - `CompositeLogger` for multi-backend logging

mod console;
mod csv;
mod logger;

pub use self::csv::CsvLogger;
pub use console::ConsoleLogger;
pub use logger::{CompositeLogger, MetricLogger, NoOpLogger};
