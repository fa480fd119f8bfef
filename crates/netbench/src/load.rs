//! Concurrent load generation.
//!
//! Operations are issued in batches. Every operation of a batch runs on its
//! own task and the batch only completes once all of them settled. Sustained
//! batches share a semaphore of `concurrency` permits; a progressive level
//! gets exactly `level` permits, so all of its operations are in flight at
//! once. Each issued operation produces
//! exactly one observation in the collector, whatever its outcome.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::collector::{MetricsCollector, Record};
use crate::error::{ConfigError, LoadError, OperationError};
use crate::monitor::StopHandle;
use crate::target::{OperationOutcome, Target};

/// Number of sustained batches between two progress lines.
const PROGRESS_EVERY_BATCHES: u64 = 15;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedOperation {
    pub kind: String,
    pub weight: f64,
}

impl WeightedOperation {
    pub fn new(kind: impl Into<String>, weight: f64) -> Self {
        Self {
            kind: kind.into(),
            weight,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSelection {
    /// Batch `i` goes to target `i % targets`.
    #[default]
    Deterministic,
    /// Each batch picks a target uniformly at random.
    RandomPerBatch,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum DriveMode {
    /// For each level, `level` concurrent operations against every target.
    Progressive { levels: Vec<usize> },
    /// Fixed-size batches at a fixed cadence until the duration elapses.
    #[default]
    Sustained,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Maximum operations in flight at once in sustained mode.
    pub concurrency: usize,
    pub batch_size: usize,
    pub batch_interval_ms: u64,
    pub total_duration_ms: Option<u64>,
    pub operation_timeout_ms: u64,
    pub operation_mix: Vec<WeightedOperation>,
    pub target_selection: TargetSelection,
    pub drive: DriveMode,
    pub seed: Option<u64>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            concurrency: 20,
            batch_size: 5,
            batch_interval_ms: 2_000,
            total_duration_ms: Some(300_000),
            operation_timeout_ms: 60_000,
            operation_mix: vec![
                WeightedOperation::new("create", 0.2),
                WeightedOperation::new("read", 0.8),
            ],
            target_selection: TargetSelection::default(),
            drive: DriveMode::default(),
            seed: None,
        }
    }
}

impl LoadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Zero {
                field: "load.concurrency",
            });
        }
        if self.operation_timeout_ms == 0 {
            return Err(ConfigError::Zero {
                field: "load.operation_timeout_ms",
            });
        }
        OperationMix::new(&self.operation_mix)?;

        match &self.drive {
            DriveMode::Progressive { levels } => {
                if levels.is_empty() {
                    return Err(ConfigError::NoLevels);
                }
                if levels.contains(&0) {
                    return Err(ConfigError::Zero {
                        field: "load.drive.levels",
                    });
                }
                if levels.windows(2).any(|pair| pair[0] >= pair[1]) {
                    return Err(ConfigError::UnorderedLevels(levels.clone()));
                }
            }
            DriveMode::Sustained => {
                if self.batch_size == 0 {
                    return Err(ConfigError::Zero {
                        field: "load.batch_size",
                    });
                }
                match self.total_duration_ms {
                    None => return Err(ConfigError::MissingDuration),
                    Some(0) => {
                        return Err(ConfigError::Zero {
                            field: "load.total_duration_ms",
                        });
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }
}

/// Weighted choice over operation kinds.
#[derive(Debug, Clone)]
pub struct OperationMix {
    kinds: Vec<String>,
    index: WeightedIndex<f64>,
}

impl OperationMix {
    pub fn new(operations: &[WeightedOperation]) -> Result<Self, ConfigError> {
        if operations.is_empty() {
            return Err(ConfigError::EmptyOperationMix);
        }
        if let Some(bad) = operations
            .iter()
            .find(|op| !op.weight.is_finite() || op.weight <= 0.0)
        {
            return Err(ConfigError::InvalidWeight {
                kind: bad.kind.clone(),
                weight: bad.weight,
            });
        }
        let index = WeightedIndex::new(operations.iter().map(|op| op.weight))
            .map_err(|_| ConfigError::EmptyOperationMix)?;
        Ok(Self {
            kinds: operations.iter().map(|op| op.kind.clone()).collect(),
            index,
        })
    }

    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> &str {
        &self.kinds[self.index.sample(rng)]
    }

    pub fn kinds(&self) -> &[String] {
        &self.kinds
    }
}

/// One operation scheduled inside a batch.
#[derive(Clone)]
pub struct PlannedOperation {
    pub target: Arc<dyn Target>,
    pub operation: String,
}

impl PlannedOperation {
    pub fn new(target: Arc<dyn Target>, operation: impl Into<String>) -> Self {
        Self {
            target,
            operation: operation.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub issued: u64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub operations_issued: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub batches: u64,
    pub elapsed_ms: u64,
    pub cancelled: bool,
}

impl RunSummary {
    fn absorb(&mut self, batch: BatchSummary) {
        self.operations_issued += batch.issued;
        self.succeeded += batch.succeeded;
        self.failed += batch.failed;
        self.batches += 1;
    }
}

pub struct LoadGenerator {
    config: LoadConfig,
    targets: Vec<Arc<dyn Target>>,
    collector: Arc<MetricsCollector>,
    mix: OperationMix,
    limiter: Arc<Semaphore>,
}

impl LoadGenerator {
    pub fn new(
        config: LoadConfig,
        targets: Vec<Arc<dyn Target>>,
        collector: Arc<MetricsCollector>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        let mix = OperationMix::new(&config.operation_mix)?;
        for target in &targets {
            let supported = target.operations();
            if let Some(kind) = mix.kinds().iter().find(|kind| !supported.contains(*kind)) {
                return Err(ConfigError::UnknownOperation {
                    target: target.id().to_owned(),
                    kind: kind.clone(),
                });
            }
        }

        let limiter = Arc::new(Semaphore::new(config.concurrency));
        Ok(Self {
            config,
            targets,
            collector,
            mix,
            limiter,
        })
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    /// Drive the configured mode to completion. Cancellation and the
    /// duration are only checked between batches.
    pub async fn run(&self, cancel: CancellationToken) -> RunSummary {
        let started = Instant::now();
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        info!(
            collector = %self.collector.label(),
            targets = self.targets.len(),
            concurrency = self.config.concurrency,
            mode = ?self.config.drive,
            "starting load generation"
        );

        let mut summary = match &self.config.drive {
            DriveMode::Progressive { levels } => {
                self.run_progressive(levels, started, &mut rng, &cancel)
                    .await
            }
            DriveMode::Sustained => self.run_sustained(started, &mut rng, &cancel).await,
        };
        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        summary.cancelled = cancel.is_cancelled();

        info!(
            issued = summary.operations_issued,
            succeeded = summary.succeeded,
            failed = summary.failed,
            batches = summary.batches,
            elapsed_ms = summary.elapsed_ms,
            "load generation finished"
        );
        summary
    }

    async fn run_progressive(
        &self,
        levels: &[usize],
        started: Instant,
        rng: &mut StdRng,
        cancel: &CancellationToken,
    ) -> RunSummary {
        let mut summary = RunSummary::default();
        'levels: for &level in levels {
            for target in &self.targets {
                if cancel.is_cancelled() || self.past_duration(started) {
                    break 'levels;
                }
                let plan = (0..level)
                    .map(|_| PlannedOperation::new(target.clone(), self.mix.pick(rng)))
                    .collect();
                let limiter = Arc::new(Semaphore::new(level));
                let batch = self.run_batch_with(plan, limiter).await;
                info!(
                    target = %target.id(),
                    level,
                    succeeded = batch.succeeded,
                    failed = batch.failed,
                    "load level completed"
                );
                summary.absorb(batch);
            }
        }
        summary
    }

    async fn run_sustained(
        &self,
        started: Instant,
        rng: &mut StdRng,
        cancel: &CancellationToken,
    ) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut batch_index: u64 = 0;

        while !cancel.is_cancelled() && !self.past_duration(started) {
            let target = self.select_target(batch_index, rng);
            let plan = (0..self.config.batch_size)
                .map(|_| PlannedOperation::new(target.clone(), self.mix.pick(rng)))
                .collect();
            let batch = self.run_batch(plan).await;
            debug!(
                target = %target.id(),
                batch = batch_index,
                succeeded = batch.succeeded,
                failed = batch.failed,
                "batch settled"
            );
            summary.absorb(batch);
            batch_index += 1;

            if batch_index % PROGRESS_EVERY_BATCHES == 0 {
                info!(
                    batches = batch_index,
                    elapsed_secs = started.elapsed().as_secs(),
                    issued = summary.operations_issued,
                    "sustained load progress"
                );
            }

            if self.past_duration(started) {
                break;
            }
            let mut until = Instant::now() + self.config.batch_interval();
            if let Some(ms) = self.config.total_duration_ms {
                until = until.min(started + Duration::from_millis(ms));
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(until) => {}
            }
        }
        summary
    }

    fn select_target(&self, batch_index: u64, rng: &mut StdRng) -> Arc<dyn Target> {
        let index = match self.config.target_selection {
            TargetSelection::Deterministic => (batch_index % self.targets.len() as u64) as usize,
            TargetSelection::RandomPerBatch => rng.gen_range(0..self.targets.len()),
        };
        self.targets[index].clone()
    }

    fn past_duration(&self, started: Instant) -> bool {
        self.config
            .total_duration_ms
            .is_some_and(|ms| started.elapsed() >= Duration::from_millis(ms))
    }

    /// Issue every planned operation concurrently and wait for all of them.
    /// Each one is recorded exactly once, including tasks that panicked.
    pub async fn run_batch(&self, plan: Vec<PlannedOperation>) -> BatchSummary {
        self.run_batch_with(plan, self.limiter.clone()).await
    }

    async fn run_batch_with(
        &self,
        plan: Vec<PlannedOperation>,
        limiter: Arc<Semaphore>,
    ) -> BatchSummary {
        let timeout = self.config.operation_timeout();
        let in_flight: Vec<(PlannedOperation, Instant, JoinHandle<Settled>)> = plan
            .into_iter()
            .map(|planned| {
                let task = tokio::spawn(execute(
                    limiter.clone(),
                    planned.target.clone(),
                    planned.operation.clone(),
                    timeout,
                ));
                (planned, Instant::now(), task)
            })
            .collect();

        let settled = join_all(in_flight.into_iter().map(
            |(planned, issued_at, task)| async move { (planned, issued_at, task.await) },
        ))
        .await;

        let mut summary = BatchSummary::default();
        for (planned, issued_at, joined) in settled {
            let (elapsed, result) = joined.unwrap_or_else(|join_error| {
                (
                    issued_at.elapsed(),
                    Err(OperationError::Aborted(join_error.to_string())),
                )
            });
            summary.issued += 1;
            if result.is_ok() {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
            self.record(&planned, elapsed, result);
        }
        summary
    }

    fn record(
        &self,
        planned: &PlannedOperation,
        elapsed: Duration,
        result: Result<OperationOutcome, OperationError>,
    ) {
        let duration_ms = elapsed.as_millis() as u64;
        match result {
            Ok(outcome) => self.collector.record(Record {
                operation: &planned.operation,
                source: planned.target.id(),
                cost: outcome.cost,
                duration_ms,
                success: true,
                error: None,
                unit_price: outcome.unit_price,
                sequence_id: outcome.sequence_id,
            }),
            Err(error) => {
                debug!(
                    target = %planned.target.id(),
                    operation = %planned.operation,
                    error = %error,
                    "operation failed"
                );
                self.collector.record_failure(
                    &planned.operation,
                    planned.target.id(),
                    duration_ms,
                    error.to_string(),
                );
            }
        }
    }
}

type Settled = (Duration, Result<OperationOutcome, OperationError>);

async fn execute(
    limiter: Arc<Semaphore>,
    target: Arc<dyn Target>,
    operation: String,
    timeout: Duration,
) -> Settled {
    // The semaphore is never closed, so a failed acquire cannot happen.
    let _permit = limiter.acquire_owned().await.ok();
    let started = Instant::now();
    let result = match tokio::time::timeout(timeout, target.execute(&operation)).await {
        Ok(result) => result,
        Err(_) => Err(OperationError::Timeout(timeout.as_millis() as u64)),
    };
    (started.elapsed(), result)
}

/// A load run executing on its own task.
pub struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<RunSummary>,
    collector: Arc<MetricsCollector>,
}

impl RunHandle {
    /// Stop issuing new batches; the batch in flight still settles.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle::new(self.cancel.clone())
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> Result<RunSummary, LoadError> {
        Ok(self.task.await?)
    }
}

/// Validate `config` and start driving `targets` in the background.
pub fn start_load(
    config: LoadConfig,
    targets: Vec<Arc<dyn Target>>,
    collector: Arc<MetricsCollector>,
) -> Result<RunHandle, ConfigError> {
    let generator = LoadGenerator::new(config, targets, collector.clone())?;
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let task = tokio::spawn(async move { generator.run(token).await });
    Ok(RunHandle {
        cancel,
        task,
        collector,
    })
}
