//! Supply coordinator: per-category targets, deficits and background production

use crate::bridge::{ExecutionBridge, ProduceFn};
use crate::category::Category;
use crate::circuit_breaker::{BreakerState, ProductionBreaker};
use crate::config::PoolConfiguration;
use crate::errors::{FactoryError, PoolError, PoolResult};
use crate::metrics::{MetricsTracker, PoolMetrics};
use crate::timing::TimingSample;

use crossbeam::channel::Sender;
use dashmap::DashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Builds one item for a category. Runs off the designated context and
/// may be called concurrently.
pub type ItemFactory<T> = Arc<dyn Fn(Category) -> Result<T, FactoryError> + Send + Sync>;

/// A finished item on its way to the designated context.
#[derive(Debug)]
pub struct Completion<T> {
    pub item: T,
    pub category: Category,
    pub duration: Duration,
}

impl<T> Completion<T> {
    pub fn timing(&self) -> TimingSample {
        TimingSample::new(self.category, self.duration)
    }
}

/// Counters for one category at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CountSnapshot {
    /// Items built so far, by background units or reported by the host
    pub created: usize,

    /// Current target; only ever raised
    pub queued: usize,

    /// Units currently inside the factory
    pub in_flight: usize,

    /// Units enqueued by `configure_bound` that have not finished yet
    pub outstanding: usize,
}

impl CountSnapshot {
    /// Items still missing to reach the target
    pub fn deficit(&self) -> usize {
        self.queued.saturating_sub(self.created)
    }

    /// Whether a background unit may still deliver an item
    pub fn has_pending_work(&self) -> bool {
        self.outstanding > 0 || self.in_flight > 0
    }

    pub fn state(&self) -> CategoryState {
        if self.created == 0 && self.queued == 0 {
            CategoryState::Idle
        } else if self.created >= self.queued {
            CategoryState::Satisfied
        } else {
            CategoryState::Targeting { queued: self.queued }
        }
    }
}

/// Where a category stands relative to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryState {
    /// Never targeted and nothing created
    Idle,

    /// Below target; units are outstanding
    Targeting { queued: usize },

    /// At or above target; further units abort
    Satisfied,
}

/// What a single background unit ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProduceOutcome {
    /// An item was built and dispatched
    Produced,

    /// The category had already reached its target
    Satisfied,

    /// The factory failed or panicked; nothing changed
    Failed,

    /// The production breaker is open; the factory was not called
    Suppressed,

    /// The coordinator was stopped before the unit ran
    Stopped,
}

#[derive(Debug, Default)]
struct CountState {
    created: usize,
    queued: usize,
    in_flight: usize,
    outstanding: usize,
}

impl CountState {
    fn snapshot(&self) -> CountSnapshot {
        CountSnapshot {
            created: self.created,
            queued: self.queued,
            in_flight: self.in_flight,
            outstanding: self.outstanding,
        }
    }
}

/// State shared between the coordinator and the units it runs.
struct Shared<T> {
    counts: DashMap<Category, CountState>,
    factory: ItemFactory<T>,
    completions: Sender<Completion<T>>,
    stopped: AtomicBool,
    metrics: Arc<MetricsTracker>,
    breaker: Option<ProductionBreaker>,
}

impl<T: Send + 'static> Shared<T> {
    fn produce_one(&self, category: Category) -> ProduceOutcome {
        let outcome = self.run_unit(category);
        self.settle(category);
        outcome
    }

    fn run_unit(&self, category: Category) -> ProduceOutcome {
        if self.stopped.load(Ordering::Acquire) {
            return ProduceOutcome::Stopped;
        }

        if !self.reserve(category) {
            MetricsTracker::incr(&self.metrics.units_aborted);
            trace!(%category, "category satisfied, unit aborted");
            return ProduceOutcome::Satisfied;
        }

        if let Some(ref breaker) = self.breaker
            && !breaker.allow_attempt()
        {
            self.release(category);
            MetricsTracker::incr(&self.metrics.units_suppressed);
            trace!(%category, "production breaker open, unit suppressed");
            return ProduceOutcome::Suppressed;
        }

        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| (self.factory)(category)));
        let duration = started.elapsed();

        let item = match result {
            Ok(Ok(item)) => item,
            Ok(Err(err)) => {
                let error = PoolError::from_factory(&err);
                self.absorb_failure(category, &error);
                return ProduceOutcome::Failed;
            }
            Err(_) => {
                self.absorb_failure(category, &PoolError::FactoryPanicked);
                return ProduceOutcome::Failed;
            }
        };

        // Counted before the commit so an observer that sees the new
        // `created` value also sees the item as in transit.
        MetricsTracker::incr(&self.metrics.items_produced);
        self.commit(category);
        if let Some(ref breaker) = self.breaker {
            breaker.record_success();
        }

        let completion = Completion {
            item,
            category,
            duration,
        };
        if self.completions.send(completion).is_err() {
            trace!(%category, "designated context gone, completion dropped");
        }
        ProduceOutcome::Produced
    }

    /// Check the target and claim a slot as one step under the key's lock.
    ///
    /// Units already inside the factory count against the target, so two
    /// concurrent units can never both pass for the last slot.
    fn reserve(&self, category: Category) -> bool {
        let Some(mut state) = self.counts.get_mut(&category) else {
            return false;
        };
        if state.created + state.in_flight + 1 > state.queued {
            return false;
        }
        state.in_flight += 1;
        true
    }

    /// Retire one enqueued unit, whatever it ended up doing.
    fn settle(&self, category: Category) {
        if let Some(mut state) = self.counts.get_mut(&category) {
            state.outstanding = state.outstanding.saturating_sub(1);
        }
    }

    fn release(&self, category: Category) {
        if let Some(mut state) = self.counts.get_mut(&category) {
            state.in_flight = state.in_flight.saturating_sub(1);
        }
    }

    fn commit(&self, category: Category) {
        if let Some(mut state) = self.counts.get_mut(&category) {
            state.in_flight = state.in_flight.saturating_sub(1);
            state.created += 1;
        }
    }

    fn absorb_failure(&self, category: Category, error: &PoolError) {
        self.release(category);
        MetricsTracker::incr(&self.metrics.production_failures);
        if let Some(ref breaker) = self.breaker {
            breaker.record_failure();
        }
        warn!(%category, %error, "background construction failed");
    }
}

/// Decides how many items each category needs and drives their
/// construction through an [`ExecutionBridge`].
///
/// Finished items leave as [`Completion`] messages on the channel given at
/// construction; the coordinator never touches pool storage itself.
///
/// # Examples
///
/// ```
/// use esox_prefetchpool::{Category, ManualBridge, PoolConfiguration, SupplyCoordinator};
/// use std::sync::Arc;
///
/// let (tx, rx) = crossbeam::channel::unbounded();
/// let bridge = Arc::new(ManualBridge::new());
/// let coordinator = SupplyCoordinator::new(
///     |c: Category| Ok(format!("row-{c}")),
///     bridge.clone(),
///     tx,
///     &PoolConfiguration::default(),
/// )
/// .unwrap();
///
/// assert_eq!(coordinator.configure_bound(Category::new(5), 3), 3);
/// bridge.run_pending();
///
/// assert_eq!(coordinator.snapshot(Category::new(5)).created, 3);
/// assert_eq!(rx.try_iter().count(), 3);
/// ```
pub struct SupplyCoordinator<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    bridge: Arc<dyn ExecutionBridge>,
}

impl<T: Send + 'static> SupplyCoordinator<T> {
    /// Create a coordinator and start its bridge
    pub fn new<F>(
        factory: F,
        bridge: Arc<dyn ExecutionBridge>,
        completions: Sender<Completion<T>>,
        config: &PoolConfiguration,
    ) -> PoolResult<Self>
    where
        F: Fn(Category) -> Result<T, FactoryError> + Send + Sync + 'static,
    {
        Self::with_metrics(
            Arc::new(factory),
            bridge,
            completions,
            config,
            Arc::new(MetricsTracker::new()),
        )
    }

    pub(crate) fn with_metrics(
        factory: ItemFactory<T>,
        bridge: Arc<dyn ExecutionBridge>,
        completions: Sender<Completion<T>>,
        config: &PoolConfiguration,
        metrics: Arc<MetricsTracker>,
    ) -> PoolResult<Self> {
        let breaker = if config.enable_circuit_breaker {
            Some(ProductionBreaker::new(
                config.circuit_breaker_threshold,
                config.circuit_breaker_timeout,
            ))
        } else {
            None
        };

        let shared = Arc::new(Shared {
            counts: DashMap::new(),
            factory,
            completions,
            stopped: AtomicBool::new(false),
            metrics,
            breaker,
        });

        let unit_shared = Arc::clone(&shared);
        let producer: ProduceFn = Arc::new(move |category| {
            unit_shared.produce_one(category);
        });
        bridge.start(producer)?;

        Ok(Self { shared, bridge })
    }

    /// Raise the target for `category` and enqueue one unit per missing
    /// item. Returns the number of units enqueued.
    ///
    /// A target at or below the current one is a no-op.
    pub fn configure_bound(&self, category: Category, count: usize) -> usize {
        if self.is_stopped() {
            debug!(%category, count, "coordinator stopped, bound ignored");
            return 0;
        }

        let deficit = {
            let mut state = self.shared.counts.entry(category).or_default();
            if count <= state.queued {
                return 0;
            }
            state.queued = count;
            let deficit = count.saturating_sub(state.created);
            state.outstanding += deficit;
            deficit
        };

        if deficit == 0 {
            trace!(%category, count, "target already met by earlier creations");
            return 0;
        }

        for _ in 0..deficit {
            self.bridge.enqueue(category);
        }
        MetricsTracker::add(&self.shared.metrics.units_enqueued, deficit);
        debug!(%category, target = count, deficit, "prefetch units enqueued");
        deficit
    }

    /// Body of one enqueued unit. Bridges reach this through the
    /// [`ProduceFn`] handed to them at start-up.
    pub fn produce_one(&self, category: Category) -> ProduceOutcome {
        self.shared.produce_one(category)
    }

    /// Count an item the host is building itself after a miss
    pub fn mark_external_creation(&self, category: Category) {
        self.shared.counts.entry(category).or_default().created += 1;
        MetricsTracker::incr(&self.shared.metrics.external_creations);
    }

    /// Stop issuing work and stop the bridge. Counters are left intact.
    pub fn stop(&self) {
        if !self.shared.stopped.swap(true, Ordering::AcqRel) {
            self.bridge.stop();
            debug!("supply coordinator stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Counters for `category`; zero for categories never seen
    pub fn snapshot(&self, category: Category) -> CountSnapshot {
        self.shared
            .counts
            .get(&category)
            .map(|state| state.snapshot())
            .unwrap_or_default()
    }

    pub fn state(&self, category: Category) -> CategoryState {
        self.snapshot(category).state()
    }

    /// Every category observed so far
    pub fn categories(&self) -> Vec<Category> {
        self.shared.counts.iter().map(|entry| *entry.key()).collect()
    }

    /// Sum of deficits over all categories
    pub fn outstanding_deficit(&self) -> usize {
        self.shared
            .counts
            .iter()
            .map(|entry| entry.snapshot().deficit())
            .sum()
    }

    pub fn breaker_state(&self) -> Option<BreakerState> {
        self.shared.breaker.as_ref().map(ProductionBreaker::state)
    }

    pub fn get_metrics(&self) -> PoolMetrics {
        self.shared.metrics.get_metrics()
    }
}

impl<T: Send + 'static> Drop for SupplyCoordinator<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::ManualBridge;
    use crossbeam::channel::{self, Receiver};
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn manual_coordinator<F>(
        factory: F,
    ) -> (SupplyCoordinator<u32>, Arc<ManualBridge>, Receiver<Completion<u32>>)
    where
        F: Fn(Category) -> Result<u32, FactoryError> + Send + Sync + 'static,
    {
        let (tx, rx) = channel::unbounded();
        let bridge = Arc::new(ManualBridge::new());
        let coordinator =
            SupplyCoordinator::new(factory, bridge.clone(), tx, &PoolConfiguration::default())
                .unwrap();
        (coordinator, bridge, rx)
    }

    fn ok_factory(c: Category) -> Result<u32, FactoryError> {
        Ok(c.value() as u32)
    }

    #[test]
    fn test_lower_bound_is_noop() {
        let (coordinator, bridge, _rx) = manual_coordinator(ok_factory);
        let c = Category::new(1);

        assert_eq!(coordinator.configure_bound(c, 4), 4);
        assert_eq!(coordinator.configure_bound(c, 2), 0);
        assert_eq!(coordinator.configure_bound(c, 4), 0);

        assert_eq!(coordinator.snapshot(c).queued, 4);
        assert_eq!(bridge.pending_len(), 4);
    }

    #[test]
    fn test_all_units_succeed() {
        let (coordinator, bridge, rx) = manual_coordinator(ok_factory);
        let c = Category::new(2);

        coordinator.configure_bound(c, 3);
        assert_eq!(bridge.run_pending(), 3);

        let completions: Vec<_> = rx.try_iter().collect();
        assert_eq!(completions.len(), 3);
        assert!(completions.iter().all(|done| done.category == c && done.item == 2));
        assert_eq!(coordinator.snapshot(c).created, 3);
        assert_eq!(coordinator.state(c), CategoryState::Satisfied);
    }

    #[test]
    fn test_failing_factory_never_counts() {
        let (coordinator, bridge, rx) = manual_coordinator(|_| Err("no luck".into()));
        let c = Category::new(3);

        coordinator.configure_bound(c, 5);
        bridge.run_pending();

        assert_eq!(coordinator.snapshot(c).created, 0);
        assert_eq!(coordinator.snapshot(c).in_flight, 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(coordinator.get_metrics().production_failures, 5);
    }

    #[test]
    fn test_outstanding_units_settle_on_every_outcome() {
        let (coordinator, bridge, _rx) =
            manual_coordinator(|c| if c.value() < 0 { Err("refused".into()) } else { Ok(1) });
        let good = Category::new(20);
        let bad = Category::new(-20);

        coordinator.configure_bound(good, 2);
        coordinator.configure_bound(bad, 3);
        assert_eq!(coordinator.snapshot(good).outstanding, 2);
        assert_eq!(coordinator.snapshot(bad).outstanding, 3);
        assert!(coordinator.snapshot(bad).has_pending_work());

        // A stale duplicate aborts as satisfied and must not go negative.
        bridge.enqueue(good);
        bridge.run_pending();

        assert_eq!(coordinator.snapshot(good).outstanding, 0);
        assert_eq!(coordinator.snapshot(bad).outstanding, 0);
        assert!(!coordinator.snapshot(bad).has_pending_work());
        assert_eq!(coordinator.snapshot(bad).deficit(), 3);
    }

    #[test]
    fn test_panicking_factory_is_absorbed() {
        let (coordinator, bridge, rx) = manual_coordinator(|_| panic!("factory blew up"));
        let c = Category::new(4);

        coordinator.configure_bound(c, 1);
        bridge.run_pending();

        assert_eq!(
            coordinator.snapshot(c),
            CountSnapshot { created: 0, queued: 1, in_flight: 0, outstanding: 0 }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_external_creation_counts_toward_target() {
        let (coordinator, bridge, _rx) = manual_coordinator(ok_factory);
        let c = Category::new(6);

        coordinator.mark_external_creation(c);
        coordinator.mark_external_creation(c);
        assert_eq!(coordinator.snapshot(c).created, 2);

        assert_eq!(coordinator.configure_bound(c, 2), 0);
        assert_eq!(coordinator.configure_bound(c, 3), 1);
        assert_eq!(bridge.pending_len(), 1);
    }

    #[test]
    fn test_stale_units_abort_without_side_effects() {
        let (coordinator, bridge, rx) = manual_coordinator(ok_factory);
        let c = Category::new(7);

        coordinator.configure_bound(c, 2);
        bridge.enqueue(c);
        bridge.enqueue(c);
        bridge.run_pending();

        assert_eq!(coordinator.snapshot(c).created, 2);
        assert_eq!(rx.try_iter().count(), 2);
        assert_eq!(coordinator.get_metrics().units_aborted, 2);
        assert_eq!(coordinator.produce_one(c), ProduceOutcome::Satisfied);
    }

    #[test]
    fn test_unknown_category_unit_aborts() {
        let (coordinator, _bridge, _rx) = manual_coordinator(ok_factory);
        assert_eq!(coordinator.produce_one(Category::new(99)), ProduceOutcome::Satisfied);
        assert!(coordinator.categories().is_empty());
    }

    #[test]
    fn test_concurrent_units_never_overproduce() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let (coordinator, _bridge, rx) = manual_coordinator(move |c| {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(2));
            Ok(c.value() as u32)
        });
        let c = Category::new(8);
        coordinator.configure_bound(c, 3);

        let barrier = Barrier::new(5);
        let outcomes: Vec<ProduceOutcome> = thread::scope(|scope| {
            let handles: Vec<_> = (0..5)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        coordinator.produce_one(c)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let produced = outcomes.iter().filter(|o| **o == ProduceOutcome::Produced).count();
        assert_eq!(produced, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(coordinator.snapshot(c).created, 3);
        assert_eq!(rx.try_iter().count(), 3);
    }

    #[test]
    fn test_state_machine() {
        let (coordinator, bridge, _rx) = manual_coordinator(ok_factory);
        let c = Category::new(10);
        assert_eq!(coordinator.state(c), CategoryState::Idle);

        coordinator.configure_bound(c, 1);
        assert_eq!(coordinator.state(c), CategoryState::Targeting { queued: 1 });

        bridge.run_pending();
        assert_eq!(coordinator.state(c), CategoryState::Satisfied);

        coordinator.configure_bound(c, 2);
        assert_eq!(coordinator.state(c), CategoryState::Targeting { queued: 2 });
        assert_eq!(coordinator.outstanding_deficit(), 1);
    }

    #[test]
    fn test_stop_keeps_counters_and_blocks_work() {
        let (coordinator, bridge, _rx) = manual_coordinator(ok_factory);
        let c = Category::new(11);

        coordinator.configure_bound(c, 2);
        bridge.run_one();
        coordinator.stop();

        assert!(bridge.is_stopped());
        assert_eq!(coordinator.snapshot(c).created, 1);
        assert_eq!(coordinator.configure_bound(c, 10), 0);
        assert_eq!(coordinator.produce_one(c), ProduceOutcome::Stopped);
        assert_eq!(coordinator.snapshot(c).created, 1);
    }

    #[test]
    fn test_breaker_suppresses_factory_calls() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let (tx, _rx) = channel::unbounded::<Completion<u32>>();
        let bridge = Arc::new(ManualBridge::new());
        let config = PoolConfiguration::new().with_circuit_breaker(2, Duration::from_secs(60));
        let coordinator = SupplyCoordinator::new(
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("down".into())
            },
            bridge.clone(),
            tx,
            &config,
        )
        .unwrap();

        let c = Category::new(12);
        coordinator.configure_bound(c, 5);
        bridge.run_pending();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(coordinator.breaker_state(), Some(BreakerState::Open));
        assert_eq!(coordinator.get_metrics().units_suppressed, 3);
        assert_eq!(coordinator.snapshot(c).created, 0);
    }
}
