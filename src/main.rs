// EsoxSolutions.PrefetchPool
// Prefetching object pool with background production

// This is just a binary wrapper - the actual library is in lib.rs
// Run demos with: cargo run --example basic

use esox_prefetchpool::{
    BoundedStorage, Categorized, Category, PoolConfiguration, PoolResult, PoolStore,
    ThreadPoolBridge,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

struct Row {
    kind: i32,
}

impl Categorized for Row {
    fn category(&self) -> Category {
        Category::new(self.kind)
    }
}

fn main() -> PoolResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("EsoxSolutions.PrefetchPool demo, see demos/ for more");

    let config = PoolConfiguration::new().with_worker_threads(2);
    let bridge = Arc::new(ThreadPoolBridge::from_config(&config));
    let mut pool = PoolStore::new(
        BoundedStorage::new(),
        |c: Category| {
            thread::sleep(Duration::from_millis(2));
            Ok(Row { kind: c.value() })
        },
        bridge,
        config,
    )?;

    let row = Category::new(5);
    let enqueued = pool.configure_bound(row, 3);
    info!(enqueued, "prefetch requested");

    let deadline = Instant::now() + Duration::from_secs(1);
    let mut integrated = 0;
    while integrated < enqueued && Instant::now() < deadline {
        integrated += pool.pump().integrated;
        thread::sleep(Duration::from_millis(1));
    }
    info!(integrated, "prefetched items integrated");

    for attempt in 1..=4 {
        let hit = pool.retrieve(row).is_some();
        info!(attempt, hit, "retrieve");
    }

    let snapshot = pool.coordinator().snapshot(row);
    info!(created = snapshot.created, queued = snapshot.queued, "final counts");

    pool.reset();
    Ok(())
}
