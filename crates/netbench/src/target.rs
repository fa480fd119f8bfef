//! Endpoints the load generator drives.

use crate::error::OperationError;

/// Metadata reported by a target for a settled operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationOutcome {
    /// Resource units consumed, 0 for reads.
    pub cost: u64,
    pub unit_price: Option<u64>,
    pub sequence_id: Option<u64>,
}

/// An opaque endpoint exposing a small set of named operations.
#[async_trait::async_trait]
pub trait Target: Send + Sync {
    fn id(&self) -> &str;

    /// Operation kinds this target understands.
    fn operations(&self) -> Vec<String>;

    async fn execute(&self, operation: &str) -> Result<OperationOutcome, OperationError>;
}
