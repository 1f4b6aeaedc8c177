//! Health monitoring for prefetching pools

use crate::circuit_breaker::BreakerState;
use crate::metrics::PoolMetrics;

/// Retrievals needed before the hit rate is judged
const MIN_RETRIEVALS_FOR_HIT_RATE: usize = 10;

/// Health status of a prefetching pool
///
/// # Examples
///
/// ```
/// use esox_prefetchpool::{HealthStatus, PoolMetrics};
///
/// let metrics = PoolMetrics {
///     retrieval_hits: 9,
///     retrieval_misses: 1,
///     hit_rate: 0.9,
///     ..PoolMetrics::default()
/// };
///
/// let health = HealthStatus::new(&metrics, 0, false, None);
/// assert!(health.is_healthy());
/// assert_eq!(health.warning_count, 0);
/// ```
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Whether the pool is healthy
    pub is_healthy: bool,

    /// Number of warnings detected
    pub warning_count: usize,

    /// Share of retrievals served from the pool
    pub hit_rate: f64,

    /// Share of factory calls that failed
    pub failure_ratio: f64,

    /// Items still missing across all categories
    pub outstanding_deficit: usize,

    /// Whether background production has been stopped
    pub stopped: bool,

    /// Warning messages
    pub warnings: Vec<String>,
}

impl HealthStatus {
    pub fn new(
        metrics: &PoolMetrics,
        outstanding_deficit: usize,
        stopped: bool,
        breaker: Option<BreakerState>,
    ) -> Self {
        let mut warnings = Vec::new();
        let mut is_healthy = true;
        let failure_ratio = metrics.failure_ratio();

        if metrics.total_retrievals() >= MIN_RETRIEVALS_FOR_HIT_RATE && metrics.hit_rate < 0.5 {
            warnings.push(format!("Low hit rate: {:.1}%", metrics.hit_rate * 100.0));
        }

        if failure_ratio > 0.5 {
            warnings.push(format!("High factory failure ratio: {:.1}%", failure_ratio * 100.0));
            is_healthy = false;
        }

        if breaker == Some(BreakerState::Open) {
            warnings.push("Production breaker is open".to_string());
            is_healthy = false;
        }

        if stopped {
            warnings.push("Background production stopped".to_string());
        } else if outstanding_deficit > 0 {
            warnings.push(format!("{} items still being prefetched", outstanding_deficit));
        }

        Self {
            is_healthy,
            warning_count: warnings.len(),
            hit_rate: metrics.hit_rate,
            failure_ratio,
            outstanding_deficit,
            stopped,
            warnings,
        }
    }

    /// Check if the pool is healthy
    pub fn is_healthy(&self) -> bool {
        self.is_healthy
    }
}
