//! Pool store: host storage, capacity bounds and the designated context

use crate::bridge::ExecutionBridge;
use crate::category::{Categorized, Category};
use crate::config::PoolConfiguration;
use crate::coordinator::{Completion, SupplyCoordinator};
use crate::errors::{FactoryError, PoolError, PoolResult};
use crate::health::HealthStatus;
use crate::metrics::{MetricsTracker, PoolMetrics};
use crate::timing::TimingSample;

#[cfg(feature = "metrics")]
use crate::metrics::MetricsExporter;

use crossbeam::channel::{self, Receiver, Sender};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Bounded per-category storage owned by the host.
///
/// The pool only ever calls these four operations; retention and
/// eviction beyond the bound are the storage's own business.
pub trait HostStorage<T> {
    /// Set the maximum number of items retained for `category`
    fn apply_capacity_bound(&mut self, category: Category, max: usize);

    /// Take one item of `category`, if any is held
    fn get(&mut self, category: Category) -> Option<T>;

    /// Offer an item; storage may drop it when its category is full
    fn put(&mut self, item: T);

    fn clear(&mut self);
}

const UNCONFIGURED_MAX: usize = 5;

struct Slot<T> {
    items: Vec<T>,
    max: usize,
}

/// Simple recycled-item storage: one stack per category, items beyond the
/// bound are dropped.
pub struct BoundedStorage<T> {
    slots: HashMap<Category, Slot<T>>,
}

impl<T> BoundedStorage<T> {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }

    /// Items currently held for `category`
    pub fn len(&self, category: Category) -> usize {
        self.slots.get(&category).map_or(0, |slot| slot.items.len())
    }

    pub fn total_len(&self) -> usize {
        self.slots.values().map(|slot| slot.items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Bound last applied to `category`
    pub fn capacity(&self, category: Category) -> Option<usize> {
        self.slots.get(&category).map(|slot| slot.max)
    }

    fn slot(&mut self, category: Category) -> &mut Slot<T> {
        self.slots.entry(category).or_insert_with(|| Slot {
            items: Vec::new(),
            max: UNCONFIGURED_MAX,
        })
    }
}

impl<T> Default for BoundedStorage<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Categorized> HostStorage<T> for BoundedStorage<T> {
    fn apply_capacity_bound(&mut self, category: Category, max: usize) {
        let slot = self.slot(category);
        slot.max = max;
        slot.items.truncate(max);
    }

    fn get(&mut self, category: Category) -> Option<T> {
        self.slots.get_mut(&category).and_then(|slot| slot.items.pop())
    }

    fn put(&mut self, item: T) {
        let category = item.category();
        let slot = self.slot(category);
        if slot.items.len() < slot.max {
            slot.items.push(item);
        } else {
            trace!(%category, max = slot.max, "storage full, item dropped");
        }
    }

    fn clear(&mut self) {
        self.slots.clear();
    }
}

type Task = Box<dyn FnOnce() + Send>;

/// Cloneable handle for posting low-priority work onto the designated
/// context. Posted tasks run from [`PoolStore::pump`], always after every
/// pending completion has been integrated.
#[derive(Clone)]
pub struct DesignatedHandle {
    sender: Sender<Task>,
}

impl DesignatedHandle {
    pub fn post<F>(&self, task: F) -> PoolResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .send(Box::new(task))
            .map_err(|_| PoolError::Cancelled)
    }
}

/// What one [`PoolStore::pump`] call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpReport {
    pub integrated: usize,
    pub discarded: usize,
    pub tasks_run: usize,
}

/// Prefetching pool over host storage.
///
/// The store lives on the designated context: every storage mutation and
/// every integration happens through `&mut self`. Background production is
/// delegated to a [`SupplyCoordinator`], whose finished items arrive over a
/// channel and are integrated by [`PoolStore::pump`]. Dropping the store
/// stops background production.
///
/// # Examples
///
/// ```
/// use esox_prefetchpool::{BoundedStorage, Categorized, Category, ManualBridge, PoolConfiguration, PoolStore};
/// use std::sync::Arc;
///
/// #[derive(Debug)]
/// struct Cell { kind: i32 }
///
/// impl Categorized for Cell {
///     fn category(&self) -> Category {
///         Category::new(self.kind)
///     }
/// }
///
/// let bridge = Arc::new(ManualBridge::new());
/// let mut pool = PoolStore::new(
///     BoundedStorage::new(),
///     |c: Category| Ok(Cell { kind: c.value() }),
///     bridge.clone(),
///     PoolConfiguration::default(),
/// )
/// .unwrap();
///
/// pool.configure_bound(Category::new(5), 2);
/// bridge.run_pending();
/// pool.pump();
///
/// assert!(pool.retrieve(Category::new(5)).is_some());
/// assert!(pool.retrieve(Category::new(5)).is_some());
/// assert!(pool.retrieve(Category::new(5)).is_none());
/// assert_eq!(pool.coordinator().snapshot(Category::new(5)).created, 3);
/// ```
pub struct PoolStore<T, S = BoundedStorage<T>>
where
    T: Categorized + Send + 'static,
    S: HostStorage<T>,
{
    storage: S,
    bounds: HashMap<Category, usize>,
    coordinator: SupplyCoordinator<T>,
    completions: Receiver<Completion<T>>,
    tasks: Receiver<Task>,
    task_sender: Sender<Task>,
    timing_sink: Option<Box<dyn FnMut(TimingSample) + Send>>,
    metrics: Arc<MetricsTracker>,
    config: PoolConfiguration,
}

impl<T, S> PoolStore<T, S>
where
    T: Categorized + Send + 'static,
    S: HostStorage<T>,
{
    /// Create a store and start background production through `bridge`
    pub fn new<F>(
        storage: S,
        factory: F,
        bridge: Arc<dyn ExecutionBridge>,
        config: PoolConfiguration,
    ) -> PoolResult<Self>
    where
        F: Fn(Category) -> Result<T, FactoryError> + Send + Sync + 'static,
    {
        let (completion_tx, completions) = channel::unbounded();
        let (task_sender, tasks) = channel::unbounded();
        let metrics = Arc::new(MetricsTracker::new());

        let coordinator = SupplyCoordinator::with_metrics(
            Arc::new(factory),
            bridge,
            completion_tx,
            &config,
            Arc::clone(&metrics),
        )?;

        Ok(Self {
            storage,
            bounds: HashMap::new(),
            coordinator,
            completions,
            tasks,
            task_sender,
            timing_sink: None,
            metrics,
            config,
        })
    }

    /// Receive the timing sample of every integrated item
    pub fn with_timing_sink<F>(mut self, sink: F) -> Self
    where
        F: FnMut(TimingSample) + Send + 'static,
    {
        self.timing_sink = Some(Box::new(sink));
        self
    }

    /// Set the retention bound for `category` and prefetch up to `count`
    /// items. Returns the number of units enqueued.
    pub fn configure_bound(&mut self, category: Category, count: usize) -> usize {
        self.bounds
            .insert(category, self.config.default_bound.max(count));
        self.coordinator.configure_bound(category, count)
    }

    /// Hand an item to host storage, prefetched or recycled alike
    pub fn store(&mut self, item: T) {
        let category = item.category();
        let bound = *self
            .bounds
            .entry(category)
            .or_insert(self.config.default_bound);

        self.storage.apply_capacity_bound(category, bound);
        self.storage.put(item);
        MetricsTracker::incr(&self.metrics.items_stored);
    }

    /// Take a stored item of `category`.
    ///
    /// On a miss the caller is expected to build the item itself; the miss
    /// is counted as an external creation so the deficit stays accurate.
    pub fn retrieve(&mut self, category: Category) -> Option<T> {
        match self.storage.get(category) {
            Some(item) => {
                self.record_hit(category);
                Some(item)
            }
            None => {
                self.record_miss(category);
                None
            }
        }
    }

    /// Like [`retrieve`](Self::retrieve), but first waits up to `timeout`
    /// (default: the configured operation timeout) for an outstanding
    /// prefetch of `category` to land.
    ///
    /// Returns `None` on a miss, whether or not the wait timed out. Use
    /// [`retrieve_or_timeout`](Self::retrieve_or_timeout) to tell the two
    /// apart.
    pub async fn retrieve_async(&mut self, category: Category, timeout: Option<Duration>) -> Option<T> {
        self.retrieve_or_timeout(category, timeout)
            .await
            .ok()
            .flatten()
    }

    /// Wait for an outstanding prefetch of `category` like
    /// [`retrieve_async`](Self::retrieve_async), reporting how a miss came
    /// about.
    ///
    /// `Ok(None)` means no unit of that category could still deliver an
    /// item, so waiting longer would not help. `Err(PoolError::Timeout)`
    /// means units were still pending when the time ran out. Both count as
    /// a miss and an external creation.
    pub async fn retrieve_or_timeout(
        &mut self,
        category: Category,
        timeout: Option<Duration>,
    ) -> PoolResult<Option<T>> {
        let timeout = timeout
            .or(self.config.operation_timeout)
            .unwrap_or(Duration::ZERO);

        let waited = tokio::time::timeout(timeout, async {
            loop {
                self.pump();
                if let Some(item) = self.storage.get(category) {
                    return Some(item);
                }

                // Units that already failed or aborted leave the deficit
                // positive but can no longer deliver anything.
                let pending = self.coordinator.snapshot(category).has_pending_work()
                    || self.completions_in_transit();
                if !pending || self.coordinator.is_stopped() {
                    return None;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await;

        match waited {
            Ok(Some(item)) => {
                self.record_hit(category);
                Ok(Some(item))
            }
            Ok(None) => {
                self.record_miss(category);
                Ok(None)
            }
            Err(_) => {
                self.record_miss(category);
                debug!(%category, ?timeout, "prefetch did not land in time");
                Err(PoolError::Timeout(timeout))
            }
        }
    }

    /// Drain the designated context's mailbox.
    ///
    /// Completions always go first: every pending completion is integrated
    /// before each low-priority task runs.
    pub fn pump(&mut self) -> PumpReport {
        let mut report = PumpReport::default();
        loop {
            while let Ok(completion) = self.completions.try_recv() {
                if self.integrate(completion) {
                    report.integrated += 1;
                } else {
                    report.discarded += 1;
                }
            }

            match self.tasks.try_recv() {
                Ok(task) => {
                    task();
                    report.tasks_run += 1;
                }
                Err(_) => break,
            }
        }
        report
    }

    /// Clear host storage and stop background production.
    ///
    /// Completions still in flight are discarded when they arrive; counters
    /// keep their values.
    pub fn reset(&mut self) {
        self.storage.clear();
        self.coordinator.stop();
        debug!("pool store reset");
    }

    /// Handle for posting low-priority designated-context work
    pub fn handle(&self) -> DesignatedHandle {
        DesignatedHandle {
            sender: self.task_sender.clone(),
        }
    }

    pub fn coordinator(&self) -> &SupplyCoordinator<T> {
        &self.coordinator
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Bound that the next store of `category` will apply
    pub fn capacity_bound(&self, category: Category) -> usize {
        self.bounds
            .get(&category)
            .copied()
            .unwrap_or(self.config.default_bound)
    }

    /// Get pool metrics
    pub fn get_metrics(&self) -> PoolMetrics {
        self.metrics.get_metrics()
    }

    /// Get health status
    pub fn get_health_status(&self) -> HealthStatus {
        HealthStatus::new(
            &self.get_metrics(),
            self.coordinator.outstanding_deficit(),
            self.coordinator.is_stopped(),
            self.coordinator.breaker_state(),
        )
    }

    /// Export metrics
    pub fn export_metrics(&self) -> HashMap<String, String> {
        self.get_metrics().export()
    }

    /// Export metrics in Prometheus format
    #[cfg(feature = "metrics")]
    pub fn export_metrics_prometheus(
        &self,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> PoolResult<String> {
        MetricsExporter::export_prometheus(&self.get_metrics(), pool_name, tags)
    }

    fn integrate(&mut self, completion: Completion<T>) -> bool {
        if self.coordinator.is_stopped() {
            MetricsTracker::incr(&self.metrics.items_discarded);
            trace!(category = %completion.category, "completion after reset discarded");
            return false;
        }

        if let Some(sink) = self.timing_sink.as_mut() {
            sink(completion.timing());
        }
        self.store(completion.item);
        MetricsTracker::incr(&self.metrics.items_integrated);
        true
    }

    /// Items built but not yet integrated or discarded
    fn completions_in_transit(&self) -> bool {
        let metrics = self.metrics.get_metrics();
        metrics.items_produced > metrics.items_integrated + metrics.items_discarded
    }

    fn record_hit(&self, category: Category) {
        MetricsTracker::incr(&self.metrics.retrieval_hits);
        trace!(%category, "pool hit");
    }

    fn record_miss(&self, category: Category) {
        MetricsTracker::incr(&self.metrics.retrieval_misses);
        self.coordinator.mark_external_creation(category);
        trace!(%category, "pool miss, caller builds the item");
    }
}
