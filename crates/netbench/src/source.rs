//! Redundant data sources polled by the monitor.

use std::sync::Arc;

use crate::error::{ConfigError, SourceError};
use crate::types::BlockInfo;

/// A provider of periodic chain state. Any error is treated as a single
/// failure signal by the monitor, regardless of its cause.
#[async_trait::async_trait]
pub trait DataSource: Send + Sync {
    fn id(&self) -> &str;

    async fn current_height(&self) -> Result<u64, SourceError>;

    async fn block_at(&self, height: u64) -> Result<BlockInfo, SourceError>;

    /// Current price per resource unit in wei, if the source exposes one.
    async fn current_unit_price(&self) -> Result<Option<u64>, SourceError>;
}

/// Ordered set of redundant sources with a cursor on the active one.
pub struct ProviderPool {
    sources: Vec<Arc<dyn DataSource>>,
    cursor: usize,
}

impl ProviderPool {
    pub fn new(network: &str, sources: Vec<Arc<dyn DataSource>>) -> Result<Self, ConfigError> {
        if sources.is_empty() {
            return Err(ConfigError::EmptyPool(network.to_owned()));
        }
        Ok(Self { sources, cursor: 0 })
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// The source currently selected. The pool is never empty.
    pub fn current(&self) -> Arc<dyn DataSource> {
        self.sources[self.cursor].clone()
    }

    /// Move to the next source, wrapping around, and return the new cursor.
    pub fn advance(&mut self) -> usize {
        self.cursor = (self.cursor + 1) % self.sources.len();
        self.cursor
    }
}

impl std::fmt::Debug for ProviderPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.sources.iter().map(|s| s.id()).collect();
        f.debug_struct("ProviderPool")
            .field("sources", &ids)
            .field("cursor", &self.cursor)
            .finish()
    }
}
