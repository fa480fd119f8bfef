use netbench::{
    DataSource, MonitorConfig, ProviderPool, ResilientMonitor, spawn_monitor, start_monitor,
    error::{ConfigError, SourceError},
    monitor::MonitorPhase,
    types::BlockInfo,
};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;

/// Always fails, like an unreachable endpoint.
struct DownSource {
    id: String,
    calls: AtomicU64,
}

impl DownSource {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            calls: AtomicU64::new(0),
        })
    }
}

#[async_trait::async_trait]
impl DataSource for DownSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn current_height(&self) -> Result<u64, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(SourceError::Connection {
            url: format!("http://{}", self.id),
            cause: "connection refused".to_string(),
        })
    }

    async fn block_at(&self, height: u64) -> Result<BlockInfo, SourceError> {
        Err(SourceError::BlockNotFound(height))
    }

    async fn current_unit_price(&self) -> Result<Option<u64>, SourceError> {
        Ok(None)
    }
}

/// Replays a fixed sequence of heights, then keeps reporting the last one.
/// Block `n` has timestamp `timestamps[n - first]`.
struct ScriptedSource {
    id: String,
    heights: Mutex<Vec<u64>>,
    first: u64,
    timestamps: Vec<u64>,
    unit_price: Option<u64>,
}

impl ScriptedSource {
    fn new(id: &str, heights: Vec<u64>, first: u64, timestamps: Vec<u64>) -> Self {
        Self {
            id: id.to_string(),
            heights: Mutex::new(heights.into_iter().rev().collect()),
            first,
            timestamps,
            unit_price: None,
        }
    }

    /// A chain producing one block per poll, 12 seconds apart.
    fn steady(id: &str) -> Self {
        let heights = (10..10_000).collect();
        let timestamps = (0..10_000).map(|i| 1_000 + i * 12).collect();
        Self::new(id, heights, 10, timestamps)
    }
}

#[async_trait::async_trait]
impl DataSource for ScriptedSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn current_height(&self) -> Result<u64, SourceError> {
        let mut heights = match self.heights.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let height = if heights.len() > 1 {
            heights.pop()
        } else {
            heights.last().copied()
        };
        height.ok_or(SourceError::BlockNotFound(0))
    }

    async fn block_at(&self, height: u64) -> Result<BlockInfo, SourceError> {
        let timestamp = height
            .checked_sub(self.first)
            .and_then(|i| self.timestamps.get(i as usize))
            .copied()
            .ok_or(SourceError::BlockNotFound(height))?;
        Ok(BlockInfo {
            number: height,
            timestamp,
            tx_count: height % 5,
        })
    }

    async fn current_unit_price(&self) -> Result<Option<u64>, SourceError> {
        Ok(self.unit_price)
    }
}

/// Serves a steady chain for `healthy_polls` height requests, then goes down.
struct FlakySource {
    inner: ScriptedSource,
    healthy_polls: AtomicU64,
}

impl FlakySource {
    fn new(id: &str, healthy_polls: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: ScriptedSource::steady(id),
            healthy_polls: AtomicU64::new(healthy_polls),
        })
    }
}

#[async_trait::async_trait]
impl DataSource for FlakySource {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn current_height(&self) -> Result<u64, SourceError> {
        let remaining = self
            .healthy_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if remaining.is_err() {
            return Err(SourceError::Connection {
                url: format!("http://{}", self.inner.id),
                cause: "connection reset".to_string(),
            });
        }
        self.inner.current_height().await
    }

    async fn block_at(&self, height: u64) -> Result<BlockInfo, SourceError> {
        self.inner.block_at(height).await
    }

    async fn current_unit_price(&self) -> Result<Option<u64>, SourceError> {
        Ok(None)
    }
}

fn fast_config() -> MonitorConfig {
    MonitorConfig {
        poll_interval_ms: 5,
        error_backoff_ms: 10,
        duration_ms: 1_000,
    }
}

fn shared<S: DataSource + 'static>(source: Arc<S>) -> Arc<dyn DataSource> {
    source
}

fn pool(sources: Vec<Arc<dyn DataSource>>) -> ProviderPool {
    match ProviderPool::new("l1", sources) {
        Ok(pool) => pool,
        Err(error) => panic!("pool: {error}"),
    }
}

#[tokio::test]
async fn fails_over_to_the_healthy_source() {
    let first = DownSource::new("a");
    let second = DownSource::new("b");
    let pool = pool(vec![
        shared(first.clone()),
        shared(second.clone()),
        shared(Arc::new(ScriptedSource::steady("c"))),
    ]);

    let mut monitor = ResilientMonitor::new("l1", pool, fast_config()).expect("valid config");
    let report = monitor.start(Duration::from_millis(300)).await;

    assert_eq!(monitor.phase(), MonitorPhase::Stopped);
    assert_eq!(monitor.active_source(), "c");
    assert!(!report.exhausted);
    assert!(report.error.is_none());
    assert_eq!(report.connection_errors, 2);
    assert!(report.sample_count > 0);
    assert_eq!(first.calls.load(Ordering::SeqCst), 1);
    assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    assert!((report.avg_block_time - 12.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn exhausted_pool_returns_error_report_without_hanging() {
    let pool = pool(vec![
        shared(DownSource::new("a")),
        shared(DownSource::new("b")),
        shared(DownSource::new("c")),
    ]);
    let mut monitor = ResilientMonitor::new("l1", pool, fast_config()).expect("valid config");

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        monitor.start(Duration::from_secs(60)),
    )
    .await
    .expect("monitor must stop once every source failed");

    assert_eq!(monitor.phase(), MonitorPhase::Exhausted);
    assert!(report.exhausted);
    assert_eq!(report.sample_count, 0);
    assert_eq!(report.connection_errors, 3);
    assert_eq!(report.reliability, 0.0);
    assert!(report.error.is_some());
}

#[tokio::test]
async fn block_times_follow_consecutive_timestamps() {
    let source = ScriptedSource::new("a", vec![10, 11, 12], 10, vec![100, 112, 125]);
    let report = start_monitor(
        "l1",
        pool(vec![shared(Arc::new(source))]),
        fast_config(),
        Duration::from_millis(100),
    )
    .await
    .expect("valid config");

    let block_times: Vec<u64> = report.samples.iter().map(|s| s.block_time).collect();
    assert_eq!(block_times, vec![12, 13]);
    assert_eq!(report.sample_count, 2);
    assert!((report.avg_block_time - 12.5).abs() < f64::EPSILON);
    assert_eq!(report.min_block_time, 12);
    assert_eq!(report.max_block_time, 13);
    assert_eq!(report.connection_errors, 0);
    assert_eq!(report.reliability, 100.0);
}

#[tokio::test]
async fn skipped_heights_only_sample_the_newest_block() {
    // 10 -> 13 skips blocks; only (12, 13) is sampled
    let source = ScriptedSource::new("a", vec![10, 13], 10, vec![100, 112, 124, 140]);
    let report = start_monitor(
        "l1",
        pool(vec![shared(Arc::new(source))]),
        fast_config(),
        Duration::from_millis(60),
    )
    .await
    .expect("valid config");

    assert_eq!(report.sample_count, 1);
    assert_eq!(report.samples[0].block_number, 13);
    assert_eq!(report.samples[0].block_time, 16);
}

#[tokio::test]
async fn unit_price_is_averaged_over_priced_polls() {
    let mut source = ScriptedSource::steady("a");
    source.unit_price = Some(2_000_000_000);
    let report = start_monitor(
        "l1",
        pool(vec![shared(Arc::new(source))]),
        fast_config(),
        Duration::from_millis(80),
    )
    .await
    .expect("valid config");

    assert!(report.sample_count > 0);
    assert!((report.avg_unit_price - 2_000_000_000.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn stop_handle_ends_the_run_early() {
    let monitor = ResilientMonitor::new(
        "l1",
        pool(vec![shared(Arc::new(ScriptedSource::steady("a")))]),
        fast_config(),
    )
    .expect("valid config");
    let (stop, task) = spawn_monitor(monitor, Duration::from_secs(60));

    tokio::time::sleep(Duration::from_millis(50)).await;
    stop.stop();
    assert!(stop.is_stopped());

    let report = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("stopped monitor must return")
        .expect("monitor task");
    assert!(!report.exhausted);
    assert!(report.sample_count > 0);
}

#[tokio::test]
async fn invalid_config_fails_fast() {
    let config = MonitorConfig {
        poll_interval_ms: 100,
        error_backoff_ms: 50,
        duration_ms: 1_000,
    };
    let result = start_monitor(
        "l1",
        pool(vec![shared(DownSource::new("a"))]),
        config,
        Duration::from_secs(1),
    )
    .await;
    assert!(matches!(result, Err(ConfigError::BackoffTooShort { .. })));

    let empty = ProviderPool::new("l2", Vec::new());
    assert!(matches!(empty, Err(ConfigError::EmptyPool(_))));
}

#[tokio::test]
async fn source_dying_mid_run_fails_over_without_exhausting() {
    let dead = DownSource::new("c");
    let pool = pool(vec![
        shared(FlakySource::new("a", 3)),
        shared(Arc::new(ScriptedSource::steady("b"))),
        shared(dead.clone()),
    ]);

    let mut monitor = ResilientMonitor::new("l1", pool, fast_config()).expect("valid config");
    let report = monitor.start(Duration::from_millis(300)).await;

    assert_eq!(monitor.phase(), MonitorPhase::Stopped);
    assert_eq!(monitor.active_source(), "b");
    assert!(!report.exhausted);
    assert!(report.error.is_none());
    assert_eq!(report.connection_errors, 1);
    assert!(report.sample_count > 0);
    assert_eq!(dead.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn sweep_starting_mid_pool_still_ends_exhausted() {
    // a dies first, b takes over and dies later; the second sweep starts at b
    let pool = pool(vec![
        shared(FlakySource::new("a", 3)),
        shared(FlakySource::new("b", 5)),
        shared(DownSource::new("c")),
    ]);
    let mut monitor = ResilientMonitor::new("l1", pool, fast_config()).expect("valid config");

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        monitor.start(Duration::from_secs(60)),
    )
    .await
    .expect("monitor must stop once every source failed");

    assert_eq!(monitor.phase(), MonitorPhase::Exhausted);
    assert!(report.exhausted);
    // a, then b, c and a again in the final sweep
    assert_eq!(report.connection_errors, 4);
    assert_eq!(report.sample_count, 0);
}
