//! Error types for the prefetching pool

use std::time::Duration;
use thiserror::Error;

/// Error type an item factory may return.
pub type FactoryError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Execution bridge failed to start: {0}")]
    BridgeStart(String),

    #[error("Execution bridge has been stopped")]
    BridgeStopped,

    #[error("Item factory failed: {0}")]
    Factory(String),

    #[error("Item factory panicked")]
    FactoryPanicked,

    #[error("Metrics export failed: {0}")]
    MetricsExport(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation was cancelled")]
    Cancelled,
}

impl PoolError {
    pub(crate) fn from_factory(err: &FactoryError) -> Self {
        PoolError::Factory(err.to_string())
    }
}

#[cfg(feature = "metrics")]
impl From<prometheus::Error> for PoolError {
    fn from(err: prometheus::Error) -> Self {
        PoolError::MetricsExport(err.to_string())
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
