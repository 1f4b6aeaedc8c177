//! Background production on worker threads with timing feedback

use esox_prefetchpool::{
    BoundedStorage, Categorized, Category, CreationTimeTracker, PoolConfiguration, PoolStore,
    ThreadPoolBridge,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

struct Tile {
    kind: i32,
}

impl Categorized for Tile {
    fn category(&self) -> Category {
        Category::new(self.kind)
    }
}

fn main() {
    println!("=== EsoxSolutions.PrefetchPool - Worker Threads ===\n");

    let config = PoolConfiguration::new()
        .with_worker_threads(3)
        .with_thread_name_prefix("tile-builder");
    let bridge = Arc::new(ThreadPoolBridge::from_config(&config));
    let tracker = Arc::new(CreationTimeTracker::new());
    let samples = Arc::clone(&tracker);

    let mut pool = PoolStore::new(
        BoundedStorage::new(),
        |c: Category| {
            // Heavier tiles take longer to build
            thread::sleep(Duration::from_millis(c.value() as u64));
            Ok(Tile { kind: c.value() })
        },
        bridge,
        config,
    )
    .expect("pool")
    .with_timing_sink(move |sample| samples.record(sample));

    let light = Category::new(1);
    let heavy = Category::new(6);
    pool.configure_bound(light, 6);
    pool.configure_bound(heavy, 3);

    // Frame loop on the designated context
    for frame in 0..20 {
        let frame_start = Instant::now();
        let report = pool.pump();
        if report.integrated > 0 {
            println!("frame {:2}: integrated {}", frame, report.integrated);
        }

        let deadline = frame_start + Duration::from_millis(4);
        for category in [light, heavy] {
            let fits = tracker.will_create_in_time(category, Instant::now(), deadline);
            if !fits {
                println!("frame {:2}: category {} would not fit this frame", frame, category);
            }
        }

        thread::sleep(Duration::from_millis(4));
    }

    for category in [light, heavy] {
        println!(
            "category {}: average build {:?}, stored {}",
            category,
            tracker.average(category).unwrap_or_default(),
            pool.storage().len(category)
        );
    }

    let health = pool.get_health_status();
    println!("healthy: {} warnings: {:?}", health.is_healthy(), health.warnings);

    pool.reset();
}
