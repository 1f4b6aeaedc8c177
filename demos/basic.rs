//! Basic usage: cooperative prefetching with a manual bridge

use esox_prefetchpool::{
    BoundedStorage, Categorized, Category, ManualBridge, PoolConfiguration, PoolStore,
};
use std::sync::Arc;

#[derive(Debug)]
struct ListRow {
    kind: i32,
    label: String,
}

impl Categorized for ListRow {
    fn category(&self) -> Category {
        Category::new(self.kind)
    }
}

const HEADER: Category = Category::new(1);
const ENTRY: Category = Category::new(2);

fn main() {
    println!("=== EsoxSolutions.PrefetchPool - Basic Usage ===\n");

    let bridge = Arc::new(ManualBridge::new());
    let mut pool = PoolStore::new(
        BoundedStorage::new(),
        |c: Category| {
            Ok(ListRow {
                kind: c.value(),
                label: format!("row of kind {}", c),
            })
        },
        bridge.clone(),
        PoolConfiguration::default(),
    )
    .expect("pool");

    // 1. Ask for spare rows
    println!("1. Configure bounds:");
    println!("   header units enqueued: {}", pool.configure_bound(HEADER, 1));
    println!("   entry units enqueued:  {}", pool.configure_bound(ENTRY, 4));
    println!("   asking for fewer entries enqueues: {}", pool.configure_bound(ENTRY, 2));
    println!();

    // 2. Idle time between frames: build a couple of rows
    println!("2. Idle-time production:");
    bridge.run_one();
    bridge.run_one();
    let report = pool.pump();
    println!("   integrated {} rows, {} units still pending", report.integrated, bridge.pending_len());
    println!();

    // 3. More idle time
    bridge.run_pending();
    pool.pump();

    // 4. Consume
    println!("3. Retrieval:");
    for _ in 0..5 {
        match pool.retrieve(ENTRY) {
            Some(row) => println!("   hit:  {}", row.label),
            None => println!("   miss: building an entry row inline"),
        }
    }
    let counts = pool.coordinator().snapshot(ENTRY);
    println!("   entry created={} queued={}", counts.created, counts.queued);
    println!();

    // 5. Metrics
    println!("4. Metrics:");
    let mut metrics: Vec<_> = pool.export_metrics().into_iter().collect();
    metrics.sort();
    for (key, value) in metrics {
        println!("   {}: {}", key, value);
    }
}
