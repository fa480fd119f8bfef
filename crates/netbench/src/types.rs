//! Snapshot schema shared by the collector, the monitor and the comparator.
//!
//! Everything here is plain data: it serializes to the JSON documents written
//! at the end of a run and read back by [`crate::compare`].

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// One immutable record of a single operation outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Unix time in milliseconds at which the operation settled.
    pub timestamp_ms: u64,
    pub operation: String,
    pub source: String,
    /// Resource units consumed (gas). Always 0 for failures.
    pub cost: u64,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Price per resource unit reported by the target, in wei.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_price: Option<u64>,
    /// Block number in which a write operation was included.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<u64>,
}

/// Mean over values that were actually reported. The count is independent of
/// any success counter so that unpriced successes do not skew the mean.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningMean {
    pub sum: u128,
    pub count: u64,
}

impl RunningMean {
    pub fn push(&mut self, value: u64) {
        self.sum += u128::from(value);
        self.count += 1;
    }

    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        Some(self.sum as f64 / self.count as f64)
    }
}

/// Per operation kind counters within one source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationStats {
    pub count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_cost: u64,
    pub total_duration_ms: u64,
    pub success_rate: f64,
    pub avg_cost: f64,
}

/// Statistics for a single source, recomputed from the observation log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceStats {
    pub total_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Sum of cost over successful observations, saturating at `u64::MAX`.
    pub total_cost: u64,
    pub total_duration_ms: u64,
    pub unit_price: RunningMean,
    pub avg_unit_price: f64,
    pub success_rate: f64,
    pub avg_cost_per_success: f64,
    pub avg_duration_ms: f64,
    pub estimated_throughput: f64,
    pub operations: BTreeMap<String, OperationStats>,
}

impl SourceStats {
    pub(crate) fn observe(&mut self, observation: &Observation) {
        self.total_count += 1;
        self.total_duration_ms = self.total_duration_ms.saturating_add(observation.duration_ms);

        let op = self
            .operations
            .entry(observation.operation.clone())
            .or_default();
        op.count += 1;
        op.total_duration_ms = op.total_duration_ms.saturating_add(observation.duration_ms);

        if observation.success {
            self.success_count += 1;
            self.total_cost = self.total_cost.saturating_add(observation.cost);
            op.success_count += 1;
            op.total_cost = op.total_cost.saturating_add(observation.cost);
            if let Some(price) = observation.unit_price {
                self.unit_price.push(price);
            }
        } else {
            self.failure_count += 1;
            op.failure_count += 1;
        }
    }

    /// Fill the derived fields once every observation has been folded in.
    pub(crate) fn finish(&mut self) {
        self.success_rate = percent(self.success_count, self.total_count);
        self.avg_cost_per_success = ratio(self.total_cost as f64, self.success_count);
        self.avg_duration_ms = ratio(self.total_duration_ms as f64, self.total_count);
        self.avg_unit_price = self.unit_price.mean().unwrap_or(0.0);
        self.estimated_throughput = if self.total_count > 0 && self.total_duration_ms > 0 {
            self.total_count as f64 / (self.total_duration_ms as f64 / 1000.0)
        } else {
            0.0
        };

        for op in self.operations.values_mut() {
            op.success_rate = percent(op.success_count, op.count);
            op.avg_cost = ratio(op.total_cost as f64, op.count);
        }
    }
}

/// Header of a block as seen by a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub number: u64,
    /// Unix time in seconds.
    pub timestamp: u64,
    pub tx_count: u64,
}

/// Inter-block timing derived from two consecutive blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSample {
    pub block_number: u64,
    pub timestamp: u64,
    pub tx_count: u64,
    /// `timestamp(n) - timestamp(n - 1)` in seconds.
    pub block_time: u64,
}

impl BlockSample {
    /// Derive a sample from block `n` and block `n - 1`. Returns `None` unless
    /// the two blocks are consecutive and time does not go backwards.
    pub fn between(previous: &BlockInfo, current: &BlockInfo) -> Option<Self> {
        if current.number != previous.number.checked_add(1)? {
            return None;
        }
        let block_time = current.timestamp.checked_sub(previous.timestamp)?;
        Some(Self {
            block_number: current.number,
            timestamp: current.timestamp,
            tx_count: current.tx_count,
            block_time,
        })
    }
}

/// Terminal report of one monitoring run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringReport {
    pub network: String,
    pub sample_count: usize,
    pub avg_block_time: f64,
    pub min_block_time: u64,
    pub max_block_time: u64,
    pub block_time_std_dev: f64,
    pub avg_tx_per_block: f64,
    pub avg_unit_price: f64,
    pub connection_errors: u64,
    pub poll_attempts: u64,
    /// `sample_count / (sample_count + connection_errors) * 100`, in `[0, 100]`.
    pub reliability: f64,
    #[serde(default)]
    pub exhausted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub samples: Vec<BlockSample>,
}

impl MonitoringReport {
    pub fn from_samples(
        network: &str,
        samples: &[BlockSample],
        unit_price: &RunningMean,
        connection_errors: u64,
        poll_attempts: u64,
    ) -> Self {
        let sample_count = samples.len();
        let mut report = Self::empty(network, connection_errors, poll_attempts);
        if sample_count == 0 {
            report.error = Some("no data collected".to_owned());
            return report;
        }

        let n = sample_count as f64;
        let times: Vec<f64> = samples.iter().map(|s| s.block_time as f64).collect();
        let avg_block_time = times.iter().sum::<f64>() / n;
        let variance = times
            .iter()
            .map(|t| (t - avg_block_time).powi(2))
            .sum::<f64>()
            / n;

        report.sample_count = sample_count;
        report.avg_block_time = avg_block_time;
        report.min_block_time = samples.iter().map(|s| s.block_time).min().unwrap_or(0);
        report.max_block_time = samples.iter().map(|s| s.block_time).max().unwrap_or(0);
        report.block_time_std_dev = variance.sqrt();
        report.avg_tx_per_block = samples.iter().map(|s| s.tx_count as f64).sum::<f64>() / n;
        report.avg_unit_price = unit_price.mean().unwrap_or(0.0);
        report.reliability = reliability(sample_count as u64, connection_errors);
        report.samples = samples.to_vec();
        report
    }

    /// Report for a run that ended because every source in the pool failed.
    pub fn exhausted(
        network: &str,
        connection_errors: u64,
        poll_attempts: u64,
        message: String,
    ) -> Self {
        let mut report = Self::empty(network, connection_errors, poll_attempts);
        report.exhausted = true;
        report.error = Some(message);
        report
    }

    fn empty(network: &str, connection_errors: u64, poll_attempts: u64) -> Self {
        Self {
            network: network.to_owned(),
            sample_count: 0,
            avg_block_time: 0.0,
            min_block_time: 0,
            max_block_time: 0,
            block_time_std_dev: 0.0,
            avg_tx_per_block: 0.0,
            avg_unit_price: 0.0,
            connection_errors,
            poll_attempts,
            reliability: 0.0,
            exhausted: false,
            error: None,
            samples: Vec::new(),
        }
    }

    pub fn is_usable(&self) -> bool {
        self.error.is_none() && self.sample_count > 0
    }
}

/// Share of monitoring attempts that yielded a sample, as a percentage.
pub fn reliability(sample_count: u64, connection_errors: u64) -> f64 {
    let attempts = sample_count + connection_errors;
    if attempts == 0 {
        return 0.0;
    }
    (sample_count as f64 / attempts as f64 * 100.0).clamp(0.0, 100.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub total_observations: usize,
    pub run_duration_ms: u64,
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEfficiency {
    pub total_cost: u64,
    pub avg_cost_per_success: f64,
    pub avg_unit_price: f64,
    pub unit_price_gwei: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    pub avg_duration_ms: f64,
    pub estimated_throughput: f64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reliability {
    pub total_attempts: u64,
    pub successful: u64,
    pub failed: u64,
    pub reliability_score: f64,
}

/// Efficiency and reliability views derived from one source's stats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedView {
    pub cost_efficiency: CostEfficiency,
    pub performance: Performance,
    pub reliability: Reliability,
}

impl From<&SourceStats> for DetailedView {
    fn from(stats: &SourceStats) -> Self {
        Self {
            cost_efficiency: CostEfficiency {
                total_cost: stats.total_cost,
                avg_cost_per_success: stats.avg_cost_per_success,
                avg_unit_price: stats.avg_unit_price,
                unit_price_gwei: stats.avg_unit_price / 1e9,
            },
            performance: Performance {
                avg_duration_ms: stats.avg_duration_ms,
                estimated_throughput: stats.estimated_throughput,
                success_rate: stats.success_rate,
            },
            reliability: Reliability {
                total_attempts: stats.total_count,
                successful: stats.success_count,
                failed: stats.failure_count,
                reliability_score: stats.success_rate,
            },
        }
    }
}

/// Immutable deep copy of a collector's state, as persisted at run end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub label: String,
    pub created_at_ms: u64,
    pub summary: SnapshotSummary,
    pub per_source: BTreeMap<String, SourceStats>,
    pub detailed: BTreeMap<String, DetailedView>,
    pub raw: Vec<Observation>,
    /// Monitoring reports gathered alongside the load, keyed by `network`.
    #[serde(default)]
    pub monitoring: Vec<MonitoringReport>,
}

impl RunSnapshot {
    pub fn with_monitoring(mut self, reports: Vec<MonitoringReport>) -> Self {
        self.monitoring.extend(reports);
        self
    }
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    part as f64 / total as f64 * 100.0
}

fn ratio(numerator: f64, denominator: u64) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    numerator / denominator as f64
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(number: u64, timestamp: u64, tx_count: u64) -> BlockInfo {
        BlockInfo {
            number,
            timestamp,
            tx_count,
        }
    }

    #[test]
    fn test_block_sample_requires_consecutive_blocks() {
        assert!(BlockSample::between(&block(10, 100, 1), &block(12, 124, 1)).is_none());
        assert!(BlockSample::between(&block(10, 100, 1), &block(10, 100, 1)).is_none());

        let sample = BlockSample::between(&block(10, 100, 1), &block(11, 112, 7))
            .expect("consecutive blocks");
        assert_eq!(sample.block_number, 11);
        assert_eq!(sample.block_time, 12);
        assert_eq!(sample.tx_count, 7);
    }

    #[test]
    fn test_block_sample_rejects_time_going_backwards() {
        assert!(BlockSample::between(&block(10, 100, 1), &block(11, 99, 1)).is_none());
    }

    #[test]
    fn test_report_from_samples() {
        let samples = [
            BlockSample::between(&block(10, 100, 2), &block(11, 112, 4)).expect("sample"),
            BlockSample::between(&block(11, 112, 4), &block(12, 125, 6)).expect("sample"),
        ];
        let report = MonitoringReport::from_samples("l1", &samples, &RunningMean::default(), 0, 3);

        assert_eq!(report.sample_count, 2);
        assert!((report.avg_block_time - 12.5).abs() < f64::EPSILON);
        assert_eq!(report.min_block_time, 12);
        assert_eq!(report.max_block_time, 13);
        assert!((report.block_time_std_dev - 0.5).abs() < 1e-9);
        assert!((report.avg_tx_per_block - 5.0).abs() < f64::EPSILON);
        assert!((report.reliability - 100.0).abs() < f64::EPSILON);
        assert!(report.error.is_none());
    }

    #[test]
    fn test_report_without_samples_sets_error() {
        let report = MonitoringReport::from_samples("l2", &[], &RunningMean::default(), 0, 0);
        assert_eq!(report.reliability, 0.0);
        assert_eq!(report.error.as_deref(), Some("no data collected"));
        assert!(!report.is_usable());
    }

    #[test]
    fn test_reliability_bounds() {
        assert_eq!(reliability(0, 0), 0.0);
        assert_eq!(reliability(0, 5), 0.0);
        assert_eq!(reliability(5, 0), 100.0);
        assert!((reliability(3, 1) - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_running_mean_counts_only_reported_values() {
        let mut mean = RunningMean::default();
        assert!(mean.mean().is_none());
        mean.push(10);
        mean.push(30);
        assert_eq!(mean.count, 2);
        assert_eq!(mean.mean(), Some(20.0));
    }

    #[test]
    fn test_optional_fields_skipped_in_json() {
        let observation = Observation {
            timestamp_ms: 1,
            operation: "read".to_string(),
            source: "l1".to_string(),
            cost: 0,
            duration_ms: 5,
            success: true,
            error: None,
            unit_price: None,
            sequence_id: None,
        };
        let json = serde_json::to_string(&observation).expect("serialize");
        assert!(!json.contains("error"));
        assert!(!json.contains("unit_price"));
        assert!(!json.contains("sequence_id"));
    }
}
