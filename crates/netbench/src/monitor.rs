//! Block production monitor with failover across redundant sources.
//!
//! The monitor walks `Idle -> SelectingSource -> Polling <-> FailingOver`
//! until the duration elapses or it is stopped (`Stopped`), or until every
//! source in the pool failed back to back (`Exhausted`). Failover is a loop
//! bounded by the pool size; once exhausted the run is over.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ConfigError, SourceError};
use crate::source::{DataSource, ProviderPool};
use crate::types::{BlockSample, MonitoringReport, RunningMean};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Delay between two successful polls.
    pub poll_interval_ms: u64,
    /// Constant delay after a failed poll. Must exceed `poll_interval_ms`.
    pub error_backoff_ms: u64,
    /// Default wall-clock budget of a run.
    pub duration_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            error_backoff_ms: 5_000,
            duration_ms: 60_000,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Zero {
                field: "monitor.poll_interval_ms",
            });
        }
        if self.duration_ms == 0 {
            return Err(ConfigError::Zero {
                field: "monitor.duration_ms",
            });
        }
        if self.error_backoff_ms <= self.poll_interval_ms {
            return Err(ConfigError::BackoffTooShort {
                backoff_ms: self.error_backoff_ms,
                poll_ms: self.poll_interval_ms,
            });
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorPhase {
    Idle,
    SelectingSource,
    Polling,
    FailingOver,
    Stopped,
    Exhausted,
}

impl MonitorPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Exhausted)
    }
}

/// Mutable state of one monitoring run.
#[derive(Debug, Clone)]
pub struct MonitorState {
    pub phase: MonitorPhase,
    pub samples: Vec<BlockSample>,
    pub last_height: Option<u64>,
    pub unit_price: RunningMean,
    pub connection_errors: u64,
    pub poll_attempts: u64,
    /// Cursor at which the current run of consecutive failures started.
    pub sweep_origin: Option<usize>,
    pub fatal_error: Option<String>,
}

impl Default for MonitorState {
    fn default() -> Self {
        Self {
            phase: MonitorPhase::Idle,
            samples: Vec::new(),
            last_height: None,
            unit_price: RunningMean::default(),
            connection_errors: 0,
            poll_attempts: 0,
            sweep_origin: None,
            fatal_error: None,
        }
    }
}

impl MonitorState {
    /// Append a sample unless it would break strictly increasing block order.
    pub fn push_sample(&mut self, sample: BlockSample) -> bool {
        if let Some(last) = self.samples.last() {
            if sample.block_number <= last.block_number {
                return false;
            }
        }
        self.samples.push(sample);
        true
    }
}

/// Cooperative stop signal for a running monitor or load run.
#[derive(Debug, Clone)]
pub struct StopHandle(CancellationToken);

impl StopHandle {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self(token)
    }

    pub fn stop(&self) {
        self.0.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.0.is_cancelled()
    }
}

#[derive(Debug)]
pub struct ResilientMonitor {
    network: String,
    pool: ProviderPool,
    config: MonitorConfig,
    state: MonitorState,
    cancel: CancellationToken,
}

impl ResilientMonitor {
    pub fn new(
        network: impl Into<String>,
        pool: ProviderPool,
        config: MonitorConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            network: network.into(),
            pool,
            config,
            state: MonitorState::default(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn phase(&self) -> MonitorPhase {
        self.state.phase
    }

    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    pub fn active_source(&self) -> String {
        self.pool.current().id().to_owned()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle::new(self.cancel.clone())
    }

    /// Request a stop; observed at the top of the next poll iteration.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Poll until `duration` elapses, [`stop`](Self::stop) is called or the
    /// pool is exhausted. A monitor runs once; calling `start` again after a
    /// terminal phase only returns the report.
    pub async fn start(&mut self, duration: Duration) -> MonitoringReport {
        if self.state.phase.is_terminal() {
            return self.report();
        }

        let deadline = Instant::now() + duration;
        self.state.phase = MonitorPhase::SelectingSource;
        info!(
            network = %self.network,
            source = %self.active_source(),
            pool_size = self.pool.len(),
            duration_secs = duration.as_secs(),
            "starting network monitoring"
        );

        loop {
            if self.cancel.is_cancelled() || Instant::now() >= deadline {
                self.state.phase = MonitorPhase::Stopped;
                break;
            }

            self.state.phase = MonitorPhase::Polling;
            self.state.poll_attempts += 1;

            let wait = match self.poll_once().await {
                Ok(()) => {
                    self.state.sweep_origin = None;
                    self.config.poll_interval()
                }
                Err(error) => {
                    if self.fail_over(error) {
                        break;
                    }
                    self.config.error_backoff()
                }
            };

            if !self.pause(wait, deadline).await {
                self.state.phase = MonitorPhase::Stopped;
                break;
            }
        }

        let report = self.report();
        info!(
            network = %self.network,
            phase = ?self.state.phase,
            samples = report.sample_count,
            connection_errors = report.connection_errors,
            reliability = report.reliability,
            "network monitoring finished"
        );
        report
    }

    /// Pure view over what has been collected so far.
    pub fn report(&self) -> MonitoringReport {
        if self.state.phase == MonitorPhase::Exhausted {
            return MonitoringReport::exhausted(
                &self.network,
                self.state.connection_errors,
                self.state.poll_attempts,
                self.state
                    .fatal_error
                    .clone()
                    .unwrap_or_else(|| "source pool exhausted".to_owned()),
            );
        }
        MonitoringReport::from_samples(
            &self.network,
            &self.state.samples,
            &self.state.unit_price,
            self.state.connection_errors,
            self.state.poll_attempts,
        )
    }

    async fn poll_once(&mut self) -> Result<(), SourceError> {
        let source = self.pool.current();
        let height = source.current_height().await?;

        let Some(previous) = self.state.last_height else {
            debug!(network = %self.network, height, "baseline height");
            self.state.last_height = Some(height);
            return Ok(());
        };
        if height <= previous {
            return Ok(());
        }

        let current = source.block_at(height).await?;
        let parent = source.block_at(height - 1).await?;
        match BlockSample::between(&parent, &current) {
            Some(sample) => {
                if self.state.push_sample(sample) {
                    debug!(
                        network = %self.network,
                        block = sample.block_number,
                        block_time = sample.block_time,
                        txs = sample.tx_count,
                        "block sampled"
                    );
                } else {
                    debug!(network = %self.network, block = height, "out of order block dropped");
                }
            }
            None => {
                warn!(network = %self.network, block = height, "inconsistent boundary blocks");
            }
        }

        self.sample_unit_price(source.as_ref()).await;
        self.state.last_height = Some(height);
        Ok(())
    }

    async fn sample_unit_price(&mut self, source: &dyn DataSource) {
        match source.current_unit_price().await {
            Ok(Some(price)) => self.state.unit_price.push(price),
            Ok(None) => {}
            Err(error) => {
                warn!(network = %self.network, source = %source.id(), error = %error, "could not read unit price");
            }
        }
    }

    /// Count the error and move the cursor. Returns `true` when the cursor
    /// came back to where this run of failures began.
    fn fail_over(&mut self, error: SourceError) -> bool {
        self.state.connection_errors += 1;
        self.state.phase = MonitorPhase::FailingOver;
        let failed = self.pool.current();
        warn!(network = %self.network, source = %failed.id(), error = %error, "poll failed");

        let origin = *self.state.sweep_origin.get_or_insert(self.pool.cursor());
        let next = self.pool.advance();
        if next == origin {
            let message = format!(
                "all {} sources failed for {}; last error: {error}",
                self.pool.len(),
                self.network
            );
            error!(network = %self.network, "{message}");
            self.state.fatal_error = Some(message);
            self.state.phase = MonitorPhase::Exhausted;
            return true;
        }

        info!(network = %self.network, source = %self.pool.current().id(), "failing over");
        false
    }

    async fn pause(&self, wait: Duration, deadline: Instant) -> bool {
        let until = std::cmp::min(Instant::now() + wait, deadline);
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep_until(until) => true,
        }
    }
}

/// Build a monitor over `pool` and run it to completion.
pub async fn start_monitor(
    network: &str,
    pool: ProviderPool,
    config: MonitorConfig,
    duration: Duration,
) -> Result<MonitoringReport, ConfigError> {
    let mut monitor = ResilientMonitor::new(network, pool, config)?;
    Ok(monitor.start(duration).await)
}

/// Run a monitor on its own task. The handle stops it early.
pub fn spawn_monitor(
    mut monitor: ResilientMonitor,
    duration: Duration,
) -> (StopHandle, JoinHandle<MonitoringReport>) {
    let stop = monitor.stop_handle();
    let task = tokio::spawn(async move { monitor.start(duration).await });
    (stop, task)
}
