//! Cross-run comparison over persisted snapshots.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{RunSnapshot, SourceStats};

/// Two values closer than this are a tie.
pub const TIE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    SuccessRate,
    AvgCostPerSuccess,
    AvgDurationMs,
    EstimatedThroughput,
    AvgUnitPrice,
    AvgBlockTime,
    AvgTxPerBlock,
    MonitorReliability,
}

impl Metric {
    pub const ALL: [Metric; 8] = [
        Metric::SuccessRate,
        Metric::AvgCostPerSuccess,
        Metric::AvgDurationMs,
        Metric::EstimatedThroughput,
        Metric::AvgUnitPrice,
        Metric::AvgBlockTime,
        Metric::AvgTxPerBlock,
        Metric::MonitorReliability,
    ];

    pub fn default_direction(self) -> Direction {
        match self {
            Metric::SuccessRate
            | Metric::EstimatedThroughput
            | Metric::AvgTxPerBlock
            | Metric::MonitorReliability => Direction::HigherIsBetter,
            Metric::AvgCostPerSuccess
            | Metric::AvgDurationMs
            | Metric::AvgUnitPrice
            | Metric::AvgBlockTime => Direction::LowerIsBetter,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::SuccessRate => "success_rate",
            Metric::AvgCostPerSuccess => "avg_cost_per_success",
            Metric::AvgDurationMs => "avg_duration_ms",
            Metric::EstimatedThroughput => "estimated_throughput",
            Metric::AvgUnitPrice => "avg_unit_price",
            Metric::AvgBlockTime => "avg_block_time",
            Metric::AvgTxPerBlock => "avg_tx_per_block",
            Metric::MonitorReliability => "monitor_reliability",
        }
    }

    /// Every metric paired with its default direction.
    pub fn defaults() -> Vec<(Metric, Direction)> {
        Self::ALL
            .iter()
            .map(|metric| (*metric, metric.default_direction()))
            .collect()
    }

    /// Value of this metric for one source of a load run, if meaningful.
    /// Cost and price are undefined for a source without successes.
    fn stat_value(self, stats: &SourceStats) -> Option<f64> {
        match self {
            Metric::SuccessRate => Some(stats.success_rate),
            Metric::AvgCostPerSuccess => {
                (stats.success_count > 0).then_some(stats.avg_cost_per_success)
            }
            Metric::AvgDurationMs => Some(stats.avg_duration_ms),
            Metric::EstimatedThroughput => Some(stats.estimated_throughput),
            Metric::AvgUnitPrice => stats.unit_price.mean(),
            Metric::AvgBlockTime | Metric::AvgTxPerBlock | Metric::MonitorReliability => None,
        }
    }

    fn is_monitoring(self) -> bool {
        matches!(
            self,
            Metric::AvgBlockTime | Metric::AvgTxPerBlock | Metric::MonitorReliability
        )
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|metric| metric.as_str() == s)
            .ok_or_else(|| format!("unknown metric: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    HigherIsBetter,
    LowerIsBetter,
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "higher" | "higher_is_better" => Ok(Self::HigherIsBetter),
            "lower" | "lower_is_better" => Ok(Self::LowerIsBetter),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

/// Parse `metric` or `metric:higher|lower`.
pub fn parse_metric_direction(s: &str) -> Result<(Metric, Direction), String> {
    match s.split_once(':') {
        Some((metric, direction)) => Ok((metric.parse()?, direction.parse()?)),
        None => {
            let metric: Metric = s.parse()?;
            Ok((metric, metric.default_direction()))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    Source(String),
    /// Fewer than two sources had a value, or the best values tied.
    NotApplicable,
}

impl Winner {
    pub fn source(&self) -> Option<&str> {
        match self {
            Winner::Source(id) => Some(id),
            Winner::NotApplicable => None,
        }
    }
}

impl fmt::Display for Winner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Winner::Source(id) => f.write_str(id),
            Winner::NotApplicable => f.write_str("N/A"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricComparison {
    pub metric: Metric,
    pub direction: Direction,
    /// Mean value per source over every snapshot that reported it.
    pub values: BTreeMap<String, f64>,
    pub winner: Winner,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub snapshots: Vec<String>,
    pub entries: Vec<MetricComparison>,
}

impl ComparisonReport {
    pub fn winner(&self, metric: Metric) -> Option<&Winner> {
        self.entries
            .iter()
            .find(|entry| entry.metric == metric)
            .map(|entry| &entry.winner)
    }
}

/// Pick a winner per metric across `snapshots`. Pure: reads only the
/// already materialized snapshots.
pub fn compare_runs(
    snapshots: &[RunSnapshot],
    metrics: &[(Metric, Direction)],
) -> ComparisonReport {
    let entries = metrics
        .iter()
        .map(|&(metric, direction)| {
            let values = collect_values(snapshots, metric);
            let winner = pick_winner(&values, direction);
            MetricComparison {
                metric,
                direction,
                values,
                winner,
            }
        })
        .collect();

    ComparisonReport {
        snapshots: snapshots.iter().map(|s| s.label.clone()).collect(),
        entries,
    }
}

fn collect_values(snapshots: &[RunSnapshot], metric: Metric) -> BTreeMap<String, f64> {
    let mut sums: BTreeMap<String, (f64, u32)> = BTreeMap::new();
    let mut push = |source: &str, value: f64| {
        if value.is_finite() {
            let entry = sums.entry(source.to_owned()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    };

    for snapshot in snapshots {
        if metric.is_monitoring() {
            for report in &snapshot.monitoring {
                let value = match metric {
                    Metric::MonitorReliability => Some(report.reliability),
                    Metric::AvgBlockTime if report.is_usable() => Some(report.avg_block_time),
                    Metric::AvgTxPerBlock if report.is_usable() => Some(report.avg_tx_per_block),
                    _ => None,
                };
                if let Some(value) = value {
                    push(&report.network, value);
                }
            }
        } else {
            for (source, stats) in &snapshot.per_source {
                if let Some(value) = metric.stat_value(stats) {
                    push(source, value);
                }
            }
        }
    }

    sums.into_iter()
        .map(|(source, (sum, count))| (source, sum / f64::from(count)))
        .collect()
}

fn pick_winner(values: &BTreeMap<String, f64>, direction: Direction) -> Winner {
    if values.len() < 2 {
        return Winner::NotApplicable;
    }

    let better = |a: f64, b: f64| match direction {
        Direction::HigherIsBetter => a > b,
        Direction::LowerIsBetter => a < b,
    };
    let mut best: Option<(&String, f64)> = None;
    for (source, &value) in values {
        match best {
            Some((_, current)) if !better(value, current) => {}
            _ => best = Some((source, value)),
        }
    }

    let Some((source, value)) = best else {
        return Winner::NotApplicable;
    };
    let tied = values
        .iter()
        .any(|(other, &v)| other != source && (v - value).abs() < TIE_EPSILON);
    if tied {
        Winner::NotApplicable
    } else {
        Winner::Source(source.clone())
    }
}
