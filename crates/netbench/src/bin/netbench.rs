use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use eyre::WrapErr;
use futures::future::join_all;
use netbench::{
    MetricsCollector, MonitoringReport, ResilientMonitor, RunSnapshot, StopHandle,
    compare::{Direction, Metric, compare_runs, parse_metric_direction},
    config::BenchConfig,
    report::{read_snapshot, save_monitoring_report, save_snapshot, to_json, write_json},
    spawn_monitor, start_load,
    types::unix_millis,
};
use tokio::task::JoinHandle;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "netbench", about = "Load and block-production benchmark for chain endpoints")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, env = "NETBENCH_CONFIG", default_value = "netbench.toml")]
    config: PathBuf,

    /// Overrides `reports_dir` from the configuration
    #[arg(long, global = true, env = "NETBENCH_REPORTS_DIR")]
    reports_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive the configured targets and persist a run snapshot
    Load {
        #[arg(long, default_value = "load")]
        label: String,

        /// Overrides `load.total_duration_ms`
        #[arg(long)]
        duration_ms: Option<u64>,
    },

    /// Monitor block production on the configured networks
    Monitor {
        /// Only monitor these networks (default: all)
        #[arg(long)]
        network: Vec<String>,

        /// Overrides `monitor.duration_ms`
        #[arg(long)]
        duration_ms: Option<u64>,
    },

    /// Load and monitor concurrently; monitoring reports are attached to the snapshot
    Run {
        #[arg(long, default_value = "run")]
        label: String,

        #[arg(long)]
        duration_ms: Option<u64>,
    },

    /// Pick a winner per metric across persisted snapshots
    Compare {
        /// Snapshot JSON files
        #[arg(required = true)]
        snapshots: Vec<PathBuf>,

        /// `metric` or `metric:higher|lower`, repeatable (default: all metrics)
        #[arg(long = "metric", value_parser = parse_metric_direction)]
        metrics: Vec<(Metric, Direction)>,

        /// Output JSON file path (default: stdout)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Compare {
            snapshots,
            metrics,
            output,
        } => compare(&snapshots, metrics, output.as_deref()),
        Command::Load { label, duration_ms } => {
            let config = load_config(&cli.config, cli.reports_dir)?;
            let snapshot = run_load(&config, &label, duration_ms, Vec::new()).await?;
            persist_snapshot(&config, &snapshot)
        }
        Command::Monitor {
            network,
            duration_ms,
        } => {
            let config = load_config(&cli.config, cli.reports_dir)?;
            let duration = Duration::from_millis(duration_ms.unwrap_or(config.monitor.duration_ms));
            let (stops, tasks) = spawn_monitors(&config, duration, &network)?;
            stop_on_ctrl_c(stops);
            let reports = collect_reports(tasks).await?;
            for report in &reports {
                let path = save_monitoring_report(&config.reports_dir, report, unix_millis())?;
                info!(network = %report.network, path = %path.display(), "monitoring report saved");
            }
            Ok(())
        }
        Command::Run { label, duration_ms } => {
            let config = load_config(&cli.config, cli.reports_dir)?;
            let duration_ms = duration_ms
                .or(config.load.total_duration_ms)
                .unwrap_or(config.monitor.duration_ms);
            // Monitors get the full budget but are stopped when the load ends.
            let (stops, tasks) = spawn_monitors(&config, Duration::from_millis(duration_ms), &[])?;
            let snapshot = run_load(&config, &label, Some(duration_ms), stops.clone()).await?;
            for stop in &stops {
                stop.stop();
            }
            let reports = collect_reports(tasks).await?;
            persist_snapshot(&config, &snapshot.with_monitoring(reports))
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: &Path, reports_dir: Option<PathBuf>) -> eyre::Result<BenchConfig> {
    let mut config = BenchConfig::from_file(path)
        .wrap_err_with(|| format!("invalid configuration {}", path.display()))?;
    if let Some(dir) = reports_dir {
        config.reports_dir = dir;
    }
    Ok(config)
}

async fn run_load(
    config: &BenchConfig,
    label: &str,
    duration_ms: Option<u64>,
    mut also_stop: Vec<StopHandle>,
) -> eyre::Result<RunSnapshot> {
    let mut load = config.load.clone();
    if duration_ms.is_some() {
        load.total_duration_ms = duration_ms;
    }

    let targets = config.build_targets()?;
    let collector = Arc::new(MetricsCollector::new(label));
    let handle = start_load(load, targets, collector.clone())?;
    also_stop.push(handle.stop_handle());
    stop_on_ctrl_c(also_stop);

    let summary = handle.wait().await?;
    info!(
        issued = summary.operations_issued,
        succeeded = summary.succeeded,
        failed = summary.failed,
        cancelled = summary.cancelled,
        "load run complete"
    );
    Ok(collector.export_snapshot())
}

type MonitorTasks = (Vec<StopHandle>, Vec<JoinHandle<MonitoringReport>>);

fn spawn_monitors(
    config: &BenchConfig,
    duration: Duration,
    only: &[String],
) -> eyre::Result<MonitorTasks> {
    let mut stops = Vec::new();
    let mut tasks = Vec::new();
    for (name, pool) in config.build_pools()? {
        if !only.is_empty() && !only.contains(&name) {
            continue;
        }
        let monitor = ResilientMonitor::new(&name, pool, config.monitor.clone())?;
        let (stop, task) = spawn_monitor(monitor, duration);
        stops.push(stop);
        tasks.push(task);
    }
    Ok((stops, tasks))
}

async fn collect_reports(
    tasks: Vec<JoinHandle<MonitoringReport>>,
) -> eyre::Result<Vec<MonitoringReport>> {
    let mut reports = Vec::with_capacity(tasks.len());
    for joined in join_all(tasks).await {
        let report = joined.wrap_err("monitor task failed")?;
        if let Some(error) = &report.error {
            warn!(network = %report.network, error = %error, "monitoring produced no usable data");
        }
        reports.push(report);
    }
    Ok(reports)
}

fn stop_on_ctrl_c(handles: Vec<StopHandle>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping at the next boundary");
            for handle in &handles {
                handle.stop();
            }
        }
    });
}

fn persist_snapshot(config: &BenchConfig, snapshot: &RunSnapshot) -> eyre::Result<()> {
    let path = save_snapshot(&config.reports_dir, snapshot)?;
    info!(
        label = %snapshot.label,
        observations = snapshot.summary.total_observations,
        path = %path.display(),
        "snapshot saved"
    );
    Ok(())
}

fn compare(
    paths: &[PathBuf],
    metrics: Vec<(Metric, Direction)>,
    output: Option<&Path>,
) -> eyre::Result<()> {
    let snapshots = paths
        .iter()
        .map(|path| {
            read_snapshot(path).wrap_err_with(|| format!("failed to read {}", path.display()))
        })
        .collect::<eyre::Result<Vec<_>>>()?;
    let metrics = if metrics.is_empty() {
        Metric::defaults()
    } else {
        metrics
    };

    let report = compare_runs(&snapshots, &metrics);
    for entry in &report.entries {
        info!(metric = %entry.metric, winner = %entry.winner, "comparison");
    }
    match output {
        Some(path) => write_json(path, &report)?,
        None => println!("{}", to_json(&report)?),
    }
    Ok(())
}
