//! Metrics collection and export for prefetching pools

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(feature = "metrics")]
use crate::errors::{PoolError, PoolResult};

/// Metrics data for a pool
///
/// # Examples
///
/// ```
/// use esox_prefetchpool::{BoundedStorage, Category, ManualBridge, PoolConfiguration, PoolStore};
/// use std::sync::Arc;
///
/// #[derive(Debug)]
/// struct Row(i32);
///
/// impl esox_prefetchpool::Categorized for Row {
///     fn category(&self) -> Category {
///         Category::new(self.0)
///     }
/// }
///
/// let bridge = Arc::new(ManualBridge::new());
/// let mut pool = PoolStore::new(
///     BoundedStorage::new(),
///     |c: Category| Ok(Row(c.value())),
///     bridge.clone(),
///     PoolConfiguration::default(),
/// )
/// .unwrap();
///
/// pool.configure_bound(Category::new(1), 2);
/// bridge.run_pending();
/// pool.pump();
///
/// let metrics = pool.get_metrics();
/// assert_eq!(metrics.units_enqueued, 2);
/// assert_eq!(metrics.items_integrated, 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PoolMetrics {
    /// Retrievals served from storage
    pub retrieval_hits: usize,

    /// Retrievals that found nothing stored
    pub retrieval_misses: usize,

    /// Items the host reported constructing itself
    pub external_creations: usize,

    /// Units of background work handed to the bridge
    pub units_enqueued: usize,

    /// Items built successfully by background work
    pub items_produced: usize,

    /// Factory calls that returned an error or panicked
    pub production_failures: usize,

    /// Units that found their category already satisfied
    pub units_aborted: usize,

    /// Units skipped while the production breaker was open
    pub units_suppressed: usize,

    /// Completions integrated on the designated context
    pub items_integrated: usize,

    /// Completions dropped because the pool had been reset
    pub items_discarded: usize,

    /// Items handed to host storage
    pub items_stored: usize,

    /// Share of retrievals that were hits (0.0 to 1.0)
    pub hit_rate: f64,
}

impl PoolMetrics {
    /// Export metrics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        for (name, _, value) in self.counters() {
            metrics.insert(name.trim_end_matches("_total").to_string(), value.to_string());
        }
        metrics.insert("hit_rate".to_string(), format!("{:.2}", self.hit_rate));
        metrics
    }

    /// Total retrievals, hits and misses together
    pub fn total_retrievals(&self) -> usize {
        self.retrieval_hits + self.retrieval_misses
    }

    /// Ratio of failed factory calls to all factory calls
    pub fn failure_ratio(&self) -> f64 {
        let attempts = self.items_produced + self.production_failures;
        if attempts == 0 {
            0.0
        } else {
            self.production_failures as f64 / attempts as f64
        }
    }

    fn counters(&self) -> [(&'static str, &'static str, usize); 11] {
        [
            ("retrieval_hits_total", "Retrievals served from the pool", self.retrieval_hits),
            ("retrieval_misses_total", "Retrievals that missed the pool", self.retrieval_misses),
            ("external_creations_total", "Items created outside the pool", self.external_creations),
            ("units_enqueued_total", "Background units enqueued", self.units_enqueued),
            ("items_produced_total", "Items produced in the background", self.items_produced),
            ("production_failures_total", "Factory failures", self.production_failures),
            ("units_aborted_total", "Units aborted on a satisfied category", self.units_aborted),
            ("units_suppressed_total", "Units skipped by the open breaker", self.units_suppressed),
            ("items_integrated_total", "Completions integrated", self.items_integrated),
            ("items_discarded_total", "Completions discarded after reset", self.items_discarded),
            ("items_stored_total", "Items handed to host storage", self.items_stored),
        ]
    }
}

/// Metrics exporter for Prometheus format
#[cfg(feature = "metrics")]
pub struct MetricsExporter;

#[cfg(feature = "metrics")]
impl MetricsExporter {
    /// Export metrics in Prometheus exposition format
    ///
    /// Every sample carries a `pool` label plus any extra tags.
    pub fn export_prometheus(
        metrics: &PoolMetrics,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> PoolResult<String> {
        use prometheus::{Encoder, Gauge, IntCounter, Opts, Registry, TextEncoder};

        let mut labels = HashMap::new();
        labels.insert("pool".to_string(), pool_name.to_string());
        if let Some(tags) = tags {
            for (key, value) in tags {
                labels.insert(key.clone(), value.clone());
            }
        }

        let registry = Registry::new_custom(Some("prefetchpool".to_string()), Some(labels))?;

        for (name, help, value) in metrics.counters() {
            let counter = IntCounter::with_opts(Opts::new(name, help))?;
            counter.inc_by(value as u64);
            registry.register(Box::new(counter))?;
        }

        let hit_rate = Gauge::with_opts(Opts::new("hit_rate", "Pool retrieval hit rate"))?;
        hit_rate.set(metrics.hit_rate);
        registry.register(Box::new(hit_rate))?;

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| PoolError::MetricsExport(e.to_string()))
    }
}

/// Internal metrics tracker, shared by the coordinator and the store
#[derive(Debug, Default)]
pub(crate) struct MetricsTracker {
    pub retrieval_hits: AtomicUsize,
    pub retrieval_misses: AtomicUsize,
    pub external_creations: AtomicUsize,
    pub units_enqueued: AtomicUsize,
    pub items_produced: AtomicUsize,
    pub production_failures: AtomicUsize,
    pub units_aborted: AtomicUsize,
    pub units_suppressed: AtomicUsize,
    pub items_integrated: AtomicUsize,
    pub items_discarded: AtomicUsize,
    pub items_stored: AtomicUsize,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(counter: &AtomicUsize, n: usize) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr(counter: &AtomicUsize) {
        Self::add(counter, 1);
    }

    pub fn get_metrics(&self) -> PoolMetrics {
        let hits = self.retrieval_hits.load(Ordering::Relaxed);
        let misses = self.retrieval_misses.load(Ordering::Relaxed);
        let hit_rate = if hits + misses > 0 {
            hits as f64 / (hits + misses) as f64
        } else {
            0.0
        };

        PoolMetrics {
            retrieval_hits: hits,
            retrieval_misses: misses,
            external_creations: self.external_creations.load(Ordering::Relaxed),
            units_enqueued: self.units_enqueued.load(Ordering::Relaxed),
            items_produced: self.items_produced.load(Ordering::Relaxed),
            production_failures: self.production_failures.load(Ordering::Relaxed),
            units_aborted: self.units_aborted.load(Ordering::Relaxed),
            units_suppressed: self.units_suppressed.load(Ordering::Relaxed),
            items_integrated: self.items_integrated.load(Ordering::Relaxed),
            items_discarded: self.items_discarded.load(Ordering::Relaxed),
            items_stored: self.items_stored.load(Ordering::Relaxed),
            hit_rate,
        }
    }
}
