//! Async retrieval on top of the tokio bridge

use esox_prefetchpool::{
    BoundedStorage, Categorized, Category, PoolConfiguration, PoolStore, TokioBridge,
};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct Session {
    kind: i32,
}

impl Categorized for Session {
    fn category(&self) -> Category {
        Category::new(self.kind)
    }
}

#[tokio::main]
async fn main() {
    println!("=== EsoxSolutions.PrefetchPool - Async Usage ===\n");

    let bridge = Arc::new(TokioBridge::current().expect("inside a runtime"));
    let mut pool = PoolStore::new(
        BoundedStorage::new(),
        |c: Category| {
            std::thread::sleep(Duration::from_millis(5));
            if c.value() < 0 {
                return Err("negative categories cannot be built".into());
            }
            Ok(Session { kind: c.value() })
        },
        bridge,
        PoolConfiguration::new().with_timeout(Duration::from_millis(100)),
    )
    .expect("pool");

    let sessions = Category::new(3);
    pool.configure_bound(sessions, 2);

    // Waits for the in-flight prefetch instead of missing straight away
    for _ in 0..3 {
        match pool.retrieve_async(sessions, None).await {
            Some(session) => println!("   got prefetched {:?}", session),
            None => println!("   miss: building inline"),
        }
    }

    // Failures are absorbed; the caller just sees misses
    let broken = Category::new(-1);
    pool.configure_bound(broken, 1);
    let result = pool.retrieve_or_timeout(broken, Some(Duration::from_secs(1))).await;
    println!("   broken category: {:?}", result.map(|s| s.map(|s| s.kind)));

    println!("\n{}", pool.export_metrics_prometheus("sessions", None).unwrap_or_default());
}
