//! Append-only observation log with on-demand reduction.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::types::{DetailedView, Observation, RunSnapshot, SnapshotSummary, SourceStats, unix_millis};

/// Outcome fields accepted by [`MetricsCollector::record`].
#[derive(Debug, Clone, Default)]
pub struct Record<'a> {
    pub operation: &'a str,
    pub source: &'a str,
    pub cost: u64,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    pub unit_price: Option<u64>,
    pub sequence_id: Option<u64>,
}

/// Thread-safe sink for [`Observation`]s.
///
/// Appends take a short mutex; [`stats`](Self::stats) always folds the whole
/// log again, so there is no cached aggregate that could drift.
#[derive(Debug)]
pub struct MetricsCollector {
    label: String,
    started: Instant,
    observations: Mutex<Vec<Observation>>,
}

impl MetricsCollector {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            started: Instant::now(),
            observations: Mutex::new(Vec::new()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Append one observation. Never fails.
    pub fn record(&self, record: Record<'_>) {
        let observation = Observation {
            timestamp_ms: unix_millis(),
            operation: record.operation.to_owned(),
            source: record.source.to_owned(),
            cost: if record.success { record.cost } else { 0 },
            duration_ms: record.duration_ms,
            success: record.success,
            error: record.error,
            unit_price: record.unit_price,
            sequence_id: record.sequence_id,
        };
        self.log().push(observation);
    }

    pub fn record_success(
        &self,
        operation: &str,
        source: &str,
        cost: u64,
        duration_ms: u64,
        unit_price: Option<u64>,
    ) {
        self.record(Record {
            operation,
            source,
            cost,
            duration_ms,
            success: true,
            unit_price,
            ..Default::default()
        });
    }

    pub fn record_failure(&self, operation: &str, source: &str, duration_ms: u64, error: String) {
        self.record(Record {
            operation,
            source,
            duration_ms,
            error: Some(error),
            ..Default::default()
        });
    }

    pub fn len(&self) -> usize {
        self.log().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Single pass over the log, grouped by source.
    pub fn stats(&self) -> BTreeMap<String, SourceStats> {
        let observations = self.log().clone();
        reduce(&observations)
    }

    /// Deep copy of the current log together with its reductions.
    pub fn export_snapshot(&self) -> RunSnapshot {
        let raw = self.log().clone();
        let per_source = reduce(&raw);
        let detailed = per_source
            .iter()
            .map(|(source, stats)| (source.clone(), DetailedView::from(stats)))
            .collect();

        RunSnapshot {
            label: self.label.clone(),
            created_at_ms: unix_millis(),
            summary: SnapshotSummary {
                total_observations: raw.len(),
                run_duration_ms: self.started.elapsed().as_millis() as u64,
                sources: per_source.keys().cloned().collect(),
            },
            per_source,
            detailed,
            raw,
            monitoring: Vec::new(),
        }
    }

    fn log(&self) -> MutexGuard<'_, Vec<Observation>> {
        self.observations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Commutative reduction: the order of `observations` does not matter.
pub fn reduce(observations: &[Observation]) -> BTreeMap<String, SourceStats> {
    let mut stats: BTreeMap<String, SourceStats> = BTreeMap::new();
    for observation in observations {
        stats
            .entry(observation.source.clone())
            .or_default()
            .observe(observation);
    }
    for source_stats in stats.values_mut() {
        source_stats.finish();
    }
    stats
}
