//! File-based configuration, loadable from TOML.
//!
//! ```toml
//! reports_dir = "reports"
//! request_timeout_ms = 10000
//!
//! [load]
//! concurrency = 20
//! batch_size = 5
//! total_duration_ms = 300000
//! operation_mix = [{ kind = "create", weight = 0.2 }, { kind = "read", weight = 0.8 }]
//!
//! [monitor]
//! poll_interval_ms = 2000
//! error_backoff_ms = 5000
//!
//! [[targets]]
//! name = "l2"
//! url = "http://localhost:1729"
//! [targets.operations.read]
//! method = "eth_blockNumber"
//!
//! [[networks]]
//! name = "l1"
//! urls = ["http://localhost:8545", "http://localhost:8546"]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;
use crate::load::LoadConfig;
use crate::monitor::MonitorConfig;
use crate::rpc::{OperationCall, RpcClient, RpcTarget};
use crate::source::{DataSource, ProviderPool};
use crate::target::Target;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Where snapshots and monitoring reports are written.
    pub reports_dir: PathBuf,
    /// Per-request HTTP timeout for every endpoint.
    pub request_timeout_ms: u64,
    pub load: LoadConfig,
    pub monitor: MonitorConfig,
    pub targets: Vec<TargetConfig>,
    pub networks: Vec<NetworkConfig>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            reports_dir: PathBuf::from("reports"),
            request_timeout_ms: 10_000,
            load: LoadConfig::default(),
            monitor: MonitorConfig::default(),
            targets: Vec::new(),
            networks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub operations: BTreeMap<String, OperationCall>,
}

/// A monitored network and its redundant endpoints, in failover order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub urls: Vec<String>,
}

impl BenchConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks everything that can be checked without touching the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Zero {
                field: "request_timeout_ms",
            });
        }
        self.monitor.validate()?;
        if !self.targets.is_empty() {
            self.load.validate()?;
        }

        for target in &self.targets {
            parse_url(&target.name, &target.url)?;
            if let Some(op) = self
                .load
                .operation_mix
                .iter()
                .find(|op| !target.operations.contains_key(&op.kind))
            {
                return Err(ConfigError::UnknownOperation {
                    target: target.name.clone(),
                    kind: op.kind.clone(),
                });
            }
        }

        for network in &self.networks {
            if network.urls.is_empty() {
                return Err(ConfigError::EmptyPool(network.name.clone()));
            }
            for url in &network.urls {
                parse_url(&network.name, url)?;
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn build_targets(&self) -> Result<Vec<Arc<dyn Target>>, ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        self.targets
            .iter()
            .map(|target| {
                let url = parse_url(&target.name, &target.url)?;
                let client = RpcClient::with_timeout(&target.name, url, self.request_timeout())?;
                let target: Arc<dyn Target> =
                    Arc::new(RpcTarget::new(client, target.operations.clone()));
                Ok(target)
            })
            .collect()
    }

    /// One provider pool per configured network. Sources are named
    /// `<network>#<index>` in failover order.
    pub fn build_pools(&self) -> Result<Vec<(String, ProviderPool)>, ConfigError> {
        self.networks
            .iter()
            .map(|network| {
                let sources = network
                    .urls
                    .iter()
                    .enumerate()
                    .map(|(i, raw)| {
                        let url = parse_url(&network.name, raw)?;
                        let client = RpcClient::with_timeout(
                            format!("{}#{i}", network.name),
                            url,
                            self.request_timeout(),
                        )?;
                        let source: Arc<dyn DataSource> = Arc::new(client);
                        Ok(source)
                    })
                    .collect::<Result<Vec<_>, ConfigError>>()?;
                Ok((network.name.clone(), ProviderPool::new(&network.name, sources)?))
            })
            .collect()
    }
}

fn parse_url(name: &str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|source| ConfigError::InvalidUrl {
        name: name.to_owned(),
        source,
    })
}
