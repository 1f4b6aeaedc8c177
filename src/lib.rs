//! # EsoxSolutions.PrefetchPool
//!
//! Prefetching object pool: a bounded cache of categorized reusable items
//! that is refilled by background work instead of only on demand.
//!
//! ## Features
//!
//! - Per-category targets that only ever rise, with deficit-driven
//!   background production
//! - Atomic check-and-reserve per category: concurrent units never build
//!   more than the target
//! - Items the host builds itself after a miss still count toward targets
//! - Pluggable execution bridges: cooperative, thread pool, tokio
//! - Completions reach the designated context ahead of other pending work
//! - Per-item timing samples for host-side scheduling decisions
//! - Metrics, Prometheus export, health status and a production breaker
//!
//! ## Quick Start
//!
//! ```rust
//! use esox_prefetchpool::{BoundedStorage, Categorized, Category, ManualBridge, PoolConfiguration, PoolStore};
//! use std::sync::Arc;
//!
//! struct Row { kind: i32 }
//!
//! impl Categorized for Row {
//!     fn category(&self) -> Category {
//!         Category::new(self.kind)
//!     }
//! }
//!
//! let bridge = Arc::new(ManualBridge::new());
//! let mut pool = PoolStore::new(
//!     BoundedStorage::new(),
//!     |c: Category| Ok(Row { kind: c.value() }),
//!     bridge.clone(),
//!     PoolConfiguration::default(),
//! )
//! .unwrap();
//!
//! pool.configure_bound(Category::new(1), 3);
//! bridge.run_pending(); // background context
//! pool.pump();          // designated context
//!
//! assert!(pool.retrieve(Category::new(1)).is_some());
//! ```

mod bridge;
mod category;
mod circuit_breaker;
mod config;
mod coordinator;
mod errors;
mod health;
mod metrics;
mod store;
mod timing;

pub use bridge::{ExecutionBridge, ManualBridge, ProduceFn, ThreadPoolBridge, TokioBridge};
pub use category::{Categorized, Category};
pub use circuit_breaker::{BreakerState, ProductionBreaker};
pub use config::PoolConfiguration;
pub use coordinator::{
    CategoryState, Completion, CountSnapshot, ItemFactory, ProduceOutcome, SupplyCoordinator,
};
pub use errors::{FactoryError, PoolError, PoolResult};
pub use health::HealthStatus;
#[cfg(feature = "metrics")]
pub use metrics::MetricsExporter;
pub use metrics::PoolMetrics;
pub use store::{BoundedStorage, DesignatedHandle, HostStorage, PoolStore, PumpReport};
pub use timing::{CreationTimeTracker, TimingSample};
