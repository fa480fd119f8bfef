//! Load generation, resilient block monitoring and metrics aggregation for
//! comparing execution environments.

pub mod collector;
pub mod compare;
pub mod config;
pub mod error;
pub mod load;
pub mod monitor;
pub mod report;
pub mod rpc;
pub mod source;
pub mod target;
pub mod types;

pub use collector::{MetricsCollector, Record};
pub use compare::{ComparisonReport, Direction, Metric, Winner, compare_runs};
pub use load::{LoadConfig, LoadGenerator, RunHandle, RunSummary, start_load};
pub use monitor::{MonitorConfig, ResilientMonitor, StopHandle, spawn_monitor, start_monitor};
pub use source::{DataSource, ProviderPool};
pub use target::{OperationOutcome, Target};
pub use types::{MonitoringReport, RunSnapshot};
