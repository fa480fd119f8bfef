//! Error types for the benchmark engine.
//!
//! Only [`ConfigError`] and pool exhaustion ever reach the orchestrating
//! caller. [`SourceError`] and [`OperationError`] are absorbed by the monitor
//! and the load generator and turned into counters and observations.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("source pool for {0} is empty")]
    EmptyPool(String),
    #[error("no targets configured")]
    NoTargets,
    #[error("operation mix is empty")]
    EmptyOperationMix,
    #[error("operation {kind} has a non-positive weight ({weight})")]
    InvalidWeight { kind: String, weight: f64 },
    #[error("{field} must be > 0")]
    Zero { field: &'static str },
    #[error("sustained mode requires total_duration_ms")]
    MissingDuration,
    #[error("progressive mode requires at least one level")]
    NoLevels,
    #[error("progressive levels must be strictly ascending, got {0:?}")]
    UnorderedLevels(Vec<usize>),
    #[error("error_backoff ({backoff_ms}ms) must be longer than poll_interval ({poll_ms}ms)")]
    BackoffTooShort { backoff_ms: u64, poll_ms: u64 },
    #[error("target {target} does not define operation {kind}")]
    UnknownOperation { target: String, kind: String },
    #[error("invalid URL for {name}: {source}")]
    InvalidUrl {
        name: String,
        source: url::ParseError,
    },
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to build http client: {0}")]
    Http(#[from] reqwest::Error),
}

/// A single failed interaction with a data source. Any variant triggers
/// failover in the monitor.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("connection to {url} failed: {cause}")]
    Connection { url: String, cause: String },
    #[error("{method} timed out")]
    Timeout { method: String },
    #[error("{method} JSON-RPC error {code}: {message}")]
    JsonRpc {
        method: String,
        code: i64,
        message: String,
    },
    #[error("{method} response missing {field}")]
    MissingField { method: String, field: String },
    #[error("{method} returned malformed {field}: {value}")]
    Malformed {
        method: String,
        field: String,
        value: String,
    },
    #[error("block {0} not found")]
    BlockNotFound(u64),
}

/// A single failed operation against a target. Always recorded, never raised.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OperationError {
    #[error("operation timed out after {0}ms")]
    Timeout(u64),
    #[error("operation rejected: {0}")]
    Rejected(String),
    #[error("operation reverted")]
    Reverted,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("operation {0} is not supported by this target")]
    Unsupported(String),
    #[error("operation task aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("load driver task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
