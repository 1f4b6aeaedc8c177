//! Pool configuration options

use std::time::Duration;

/// Configuration for prefetching pool behavior
///
/// # Examples
///
/// ```
/// use esox_prefetchpool::PoolConfiguration;
/// use std::time::Duration;
///
/// let config = PoolConfiguration::new()
///     .with_default_bound(8)
///     .with_worker_threads(2)
///     .with_timeout(Duration::from_millis(4));
///
/// assert_eq!(config.default_bound, 8);
/// assert_eq!(config.worker_threads, 2);
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfiguration {
    /// Capacity bound for categories that were never explicitly configured
    pub default_bound: usize,

    /// Number of background threads used by `ThreadPoolBridge::from_config`
    pub worker_threads: usize,

    /// Name prefix for background worker threads
    pub thread_name_prefix: String,

    /// Default wait for async retrieval of an in-flight prefetch
    pub operation_timeout: Option<Duration>,

    /// Enable the production circuit breaker
    pub enable_circuit_breaker: bool,

    /// Consecutive factory failures before production is suppressed
    pub circuit_breaker_threshold: usize,

    /// How long production stays suppressed before a trial unit runs
    pub circuit_breaker_timeout: Duration,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            default_bound: 5,
            worker_threads: workers.max(1),
            thread_name_prefix: "prefetch-worker".to_string(),
            operation_timeout: Some(Duration::from_millis(16)),
            enable_circuit_breaker: false,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfiguration {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bound applied to never-configured categories
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_prefetchpool::PoolConfiguration;
    ///
    /// let config = PoolConfiguration::new().with_default_bound(3);
    /// assert_eq!(config.default_bound, 3);
    /// ```
    pub fn with_default_bound(mut self, bound: usize) -> Self {
        self.default_bound = bound;
        self
    }

    /// Set the number of background worker threads (at least one)
    pub fn with_worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count.max(1);
        self
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Set operation timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Enable the production circuit breaker
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_prefetchpool::PoolConfiguration;
    /// use std::time::Duration;
    ///
    /// let config = PoolConfiguration::new()
    ///     .with_circuit_breaker(3, Duration::from_secs(10));
    ///
    /// assert!(config.enable_circuit_breaker);
    /// assert_eq!(config.circuit_breaker_threshold, 3);
    /// ```
    pub fn with_circuit_breaker(mut self, threshold: usize, timeout: Duration) -> Self {
        self.enable_circuit_breaker = true;
        self.circuit_breaker_threshold = threshold.max(1);
        self.circuit_breaker_timeout = timeout;
        self
    }
}
