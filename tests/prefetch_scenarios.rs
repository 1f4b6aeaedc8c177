//! Integration tests for the prefetch coordination engine.
//!
//! Covers target monotonicity, deficit accounting, failure absorption and
//! the no-overproduction guarantee under real worker threads.

use esox_prefetchpool::{
    BoundedStorage, Categorized, Category, CategoryState, ExecutionBridge, FactoryError, ManualBridge,
    PoolConfiguration, PoolError, PoolStore, ThreadPoolBridge, TimingSample, TokioBridge,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, PartialEq)]
struct Item {
    kind: i32,
    serial: usize,
}

impl Categorized for Item {
    fn category(&self) -> Category {
        Category::new(self.kind)
    }
}

/// Factory that hands out increasing serial numbers and counts its calls.
fn serial_factory(
    delay: Duration,
) -> (
    impl Fn(Category) -> Result<Item, FactoryError> + Send + Sync + 'static,
    Arc<AtomicUsize>,
) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let factory = move |c: Category| {
        let serial = counter.fetch_add(1, Ordering::SeqCst);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        Ok::<_, FactoryError>(Item {
            kind: c.value(),
            serial,
        })
    };
    (factory, calls)
}

/// Pump until `expected` completions have been integrated or five seconds pass.
fn pump_until<S>(pool: &mut PoolStore<Item, S>, expected: usize) -> usize
where
    S: esox_prefetchpool::HostStorage<Item>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut integrated = 0;
    while integrated < expected && Instant::now() < deadline {
        integrated += pool.pump().integrated;
        thread::sleep(Duration::from_millis(1));
    }
    integrated
}

#[test]
fn configure_then_retrieve_scenario() {
    let samples = Arc::new(Mutex::new(Vec::<TimingSample>::new()));
    let sink = Arc::clone(&samples);
    let (factory, _calls) = serial_factory(Duration::from_millis(2));
    let bridge = Arc::new(ManualBridge::new());
    let mut pool = PoolStore::new(
        BoundedStorage::new(),
        factory,
        bridge.clone(),
        PoolConfiguration::default(),
    )
    .expect("pool")
    .with_timing_sink(move |sample| sink.lock().push(sample));

    let c = Category::new(5);
    assert_eq!(pool.configure_bound(c, 3), 3);
    assert_eq!(bridge.pending_len(), 3);

    assert_eq!(bridge.run_pending(), 3);
    assert_eq!(pool.pump().integrated, 3);

    let counts = pool.coordinator().snapshot(c);
    assert_eq!(counts.created, 3);
    assert_eq!(counts.queued, 3);
    {
        let samples = samples.lock();
        assert_eq!(samples.len(), 3);
        assert!(samples.iter().all(|s| s.duration >= Duration::from_millis(2)));
    }

    for _ in 0..3 {
        assert!(pool.retrieve(c).is_some());
    }
    assert!(pool.retrieve(c).is_none());
    assert_eq!(pool.coordinator().snapshot(c).created, 4);

    let metrics = pool.get_metrics();
    assert_eq!(metrics.retrieval_hits, 3);
    assert_eq!(metrics.retrieval_misses, 1);
    assert_eq!(metrics.external_creations, 1);
}

#[test]
fn repeated_bound_enqueues_once() {
    let (factory, _calls) = serial_factory(Duration::ZERO);
    let bridge = Arc::new(ManualBridge::new());
    let mut pool =
        PoolStore::new(BoundedStorage::new(), factory, bridge.clone(), PoolConfiguration::default())
            .expect("pool");

    let c = Category::new(2);
    pool.configure_bound(c, 4);
    pool.configure_bound(c, 4);
    pool.configure_bound(c, 1);

    assert_eq!(bridge.pending_len(), 4);
    assert_eq!(pool.coordinator().snapshot(c).queued, 4);
    assert_eq!(pool.get_metrics().units_enqueued, 4);
}

#[test]
fn raising_target_enqueues_only_the_difference() {
    let (factory, calls) = serial_factory(Duration::ZERO);
    let bridge = Arc::new(ManualBridge::new());
    let mut pool =
        PoolStore::new(BoundedStorage::new(), factory, bridge.clone(), PoolConfiguration::default())
            .expect("pool");

    let c = Category::new(3);
    pool.configure_bound(c, 2);
    bridge.run_pending();
    pool.pump();
    assert_eq!(pool.coordinator().state(c), CategoryState::Satisfied);

    assert_eq!(pool.configure_bound(c, 5), 3);
    bridge.run_pending();
    pool.pump();

    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(pool.storage().len(c), 5);
}

#[test]
fn failing_factory_leaves_counts_untouched() {
    let bridge = Arc::new(ManualBridge::new());
    let mut pool = PoolStore::<Item>::new(
        BoundedStorage::new(),
        |_| Err("resource unavailable".into()),
        bridge.clone(),
        PoolConfiguration::default(),
    )
    .expect("pool");

    let c = Category::new(4);
    pool.configure_bound(c, 6);
    bridge.run_pending();
    let report = pool.pump();

    assert_eq!(report.integrated, 0);
    assert_eq!(pool.coordinator().snapshot(c).created, 0);
    assert_eq!(pool.get_metrics().production_failures, 6);

    // The host falls back to building inline, which the pool counts.
    assert!(pool.retrieve(c).is_none());
    assert_eq!(pool.coordinator().snapshot(c).created, 1);
}

#[test]
fn external_creations_satisfy_later_targets() {
    let (factory, calls) = serial_factory(Duration::ZERO);
    let bridge = Arc::new(ManualBridge::new());
    let mut pool =
        PoolStore::new(BoundedStorage::new(), factory, bridge.clone(), PoolConfiguration::default())
            .expect("pool");

    let c = Category::new(8);
    for _ in 0..3 {
        assert!(pool.retrieve(c).is_none());
    }

    assert_eq!(pool.configure_bound(c, 3), 0);
    assert_eq!(pool.configure_bound(c, 4), 1);
    bridge.run_pending();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn created_never_decreases() {
    let (factory, _calls) = serial_factory(Duration::ZERO);
    let bridge = Arc::new(ManualBridge::new());
    let mut pool =
        PoolStore::new(BoundedStorage::new(), factory, bridge.clone(), PoolConfiguration::default())
            .expect("pool");

    let c = Category::new(9);
    let mut last = 0;
    let mut observe = |pool: &PoolStore<Item>| {
        let created = pool.coordinator().snapshot(c).created;
        assert!(created >= last);
        last = created;
    };

    pool.configure_bound(c, 2);
    observe(&pool);
    bridge.run_one();
    observe(&pool);
    pool.retrieve(c);
    observe(&pool);
    pool.reset();
    observe(&pool);
    pool.pump();
    observe(&pool);
    bridge.run_pending();
    observe(&pool);
}

#[test]
fn concurrent_stale_units_never_overproduce() {
    let (factory, calls) = serial_factory(Duration::from_millis(2));
    let bridge = Arc::new(ManualBridge::new());
    let mut pool =
        PoolStore::new(BoundedStorage::new(), factory, bridge.clone(), PoolConfiguration::default())
            .expect("pool");

    let c = Category::new(11);
    pool.configure_bound(c, 3);
    // Two duplicate units land on top of the three the target asked for.
    bridge.enqueue(c);
    bridge.enqueue(c);
    assert_eq!(bridge.pending_len(), 5);

    let barrier = Barrier::new(5);
    thread::scope(|scope| {
        for _ in 0..5 {
            scope.spawn(|| {
                barrier.wait();
                bridge.run_one();
            });
        }
    });

    assert_eq!(pool.pump().integrated, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(pool.coordinator().snapshot(c).created, 3);
    assert_eq!(pool.get_metrics().units_aborted, 2);
}

#[test]
fn thread_pool_bridge_reaches_exact_targets() {
    let (factory, calls) = serial_factory(Duration::from_millis(1));
    let config = PoolConfiguration::new().with_worker_threads(4);
    let bridge = Arc::new(ThreadPoolBridge::from_config(&config));
    let mut pool = PoolStore::new(BoundedStorage::new(), factory, bridge, config).expect("pool");

    let targets = [(Category::new(1), 5), (Category::new(2), 3), (Category::new(3), 7)];
    let mut expected = 0;
    for (category, count) in targets {
        expected += pool.configure_bound(category, count);
    }

    assert_eq!(pump_until(&mut pool, expected), 15);
    for (category, count) in targets {
        assert_eq!(pool.coordinator().snapshot(category).created, count);
        assert_eq!(pool.storage().len(category), count);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 15);

    // Nothing more shows up after the targets are met.
    thread::sleep(Duration::from_millis(20));
    assert_eq!(pool.pump().integrated, 0);
}

#[test]
fn shared_bridge_refuses_a_second_pool() {
    let (factory, _calls) = serial_factory(Duration::ZERO);
    let (other_factory, other_calls) = serial_factory(Duration::ZERO);
    let config = PoolConfiguration::new().with_worker_threads(2);
    let bridge = Arc::new(ThreadPoolBridge::from_config(&config));
    let mut pool =
        PoolStore::new(BoundedStorage::new(), factory, bridge.clone(), config.clone()).expect("pool");

    let second = PoolStore::new(BoundedStorage::new(), other_factory, bridge, config);
    assert_eq!(
        second.err(),
        Some(PoolError::BridgeStart("already started".into()))
    );

    // The first pool keeps its workers.
    let c = Category::new(7);
    let enqueued = pool.configure_bound(c, 3);
    assert_eq!(pump_until(&mut pool, enqueued), 3);
    assert_eq!(pool.coordinator().snapshot(c).created, 3);
    assert_eq!(other_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn reset_stops_background_production() {
    let (factory, calls) = serial_factory(Duration::from_millis(5));
    let config = PoolConfiguration::new().with_worker_threads(1);
    let bridge = Arc::new(ThreadPoolBridge::from_config(&config));
    let mut pool =
        PoolStore::new(BoundedStorage::new(), factory, bridge.clone(), config).expect("pool");

    let c = Category::new(12);
    pool.configure_bound(c, 50);
    thread::sleep(Duration::from_millis(12));
    pool.reset();

    let after_reset = calls.load(Ordering::SeqCst);
    assert!(after_reset < 50);

    thread::sleep(Duration::from_millis(30));
    assert_eq!(calls.load(Ordering::SeqCst), after_reset);
    assert_eq!(pool.configure_bound(c, 100), 0);
    assert_eq!(pool.pump().integrated, 0);
    assert_eq!(pool.storage().total_len(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tokio_bridge_feeds_async_retrieval() {
    let (factory, _calls) = serial_factory(Duration::from_millis(2));
    let bridge = Arc::new(TokioBridge::current().expect("runtime"));
    let mut pool = PoolStore::new(
        BoundedStorage::new(),
        factory,
        bridge,
        PoolConfiguration::new().with_timeout(Duration::from_secs(2)),
    )
    .expect("pool");

    let c = Category::new(13);
    pool.configure_bound(c, 2);

    assert!(pool.retrieve_async(c, None).await.is_some());
    assert!(pool.retrieve_async(c, None).await.is_some());
    assert!(pool.retrieve_async(c, None).await.is_none());

    let counts = pool.coordinator().snapshot(c);
    assert_eq!(counts.created, 3);
    assert_eq!(pool.get_metrics().retrieval_hits, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_units_do_not_hold_async_retrieval() {
    let config = PoolConfiguration::new().with_worker_threads(2);
    let bridge = Arc::new(ThreadPoolBridge::from_config(&config));
    let mut pool = PoolStore::<Item>::new(
        BoundedStorage::new(),
        |_| Err("resource unavailable".into()),
        bridge,
        config,
    )
    .expect("pool");

    let c = Category::new(1);
    assert_eq!(pool.configure_bound(c, 3), 3);

    let started = Instant::now();
    let item = pool.retrieve_async(c, Some(Duration::from_secs(5))).await;

    assert!(item.is_none());
    assert!(started.elapsed() < Duration::from_secs(1));
    let counts = pool.coordinator().snapshot(c);
    assert_eq!(counts.outstanding, 0);
    assert_eq!(counts.in_flight, 0);
    assert_eq!(pool.get_metrics().production_failures, 3);
}
