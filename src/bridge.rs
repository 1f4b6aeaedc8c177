//! Execution bridges that run background production units
//!
//! The coordinator never assumes a concurrency technology. It hands each
//! bridge a [`ProduceFn`] at start-up and then only ever calls
//! [`ExecutionBridge::enqueue`]; the bridge decides where and when the
//! unit runs.

use crate::category::Category;
use crate::errors::{PoolError, PoolResult};

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

/// Body of one unit of background work.
pub type ProduceFn = Arc<dyn Fn(Category) + Send + Sync>;

/// Capability for running production units off the designated context.
///
/// A bridge serves exactly one coordinator: a second `start` fails with
/// [`PoolError::BridgeStart`] and leaves the first producer in place.
/// Implementations must tolerate `enqueue` after `stop` (the unit is
/// dropped) and repeated calls to `stop`.
pub trait ExecutionBridge: Send + Sync {
    /// Install the unit body and begin accepting work.
    fn start(&self, producer: ProduceFn) -> PoolResult<()>;

    /// Stop accepting work. Units already running may still finish.
    fn stop(&self);

    /// Schedule one independent unit of work for `category`.
    fn enqueue(&self, category: Category);
}

/// Cooperative bridge: units run on whichever thread calls
/// [`ManualBridge::run_one`] or [`ManualBridge::run_pending`].
///
/// Suits hosts that prefetch in idle time between frames, and makes
/// production fully deterministic in tests.
///
/// # Examples
///
/// ```
/// use esox_prefetchpool::{Category, ExecutionBridge, ManualBridge};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let ran = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&ran);
///
/// let bridge = ManualBridge::new();
/// bridge.start(Arc::new(move |_| { counter.fetch_add(1, Ordering::Relaxed); })).unwrap();
/// bridge.enqueue(Category::new(1));
/// bridge.enqueue(Category::new(2));
///
/// assert_eq!(bridge.pending_len(), 2);
/// assert_eq!(bridge.run_pending(), 2);
/// assert_eq!(ran.load(Ordering::Relaxed), 2);
/// ```
#[derive(Default)]
pub struct ManualBridge {
    producer: Mutex<Option<ProduceFn>>,
    pending: Mutex<VecDeque<Category>>,
    stopped: AtomicBool,
}

impl ManualBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of units waiting to run
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Run the oldest pending unit on the calling thread.
    ///
    /// Returns `false` when nothing ran: no pending unit, not started yet,
    /// or stopped.
    pub fn run_one(&self) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }

        let Some(producer) = self.producer.lock().clone() else {
            return false;
        };

        // The queue lock is released before the unit runs.
        let next = self.pending.lock().pop_front();
        match next {
            Some(category) => {
                producer(category);
                true
            }
            None => false,
        }
    }

    /// Run units until the queue is empty, returning how many ran
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl ExecutionBridge for ManualBridge {
    fn start(&self, producer: ProduceFn) -> PoolResult<()> {
        if self.is_stopped() {
            return Err(PoolError::BridgeStopped);
        }
        let mut slot = self.producer.lock();
        if slot.is_some() {
            return Err(PoolError::BridgeStart("already started".into()));
        }
        *slot = Some(producer);
        Ok(())
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped = {
            let mut pending = self.pending.lock();
            let len = pending.len();
            pending.clear();
            len
        };
        self.producer.lock().take();
        debug!(dropped, "manual bridge stopped");
    }

    fn enqueue(&self, category: Category) {
        if self.is_stopped() {
            trace!(%category, "enqueue after stop ignored");
            return;
        }
        self.pending.lock().push_back(category);
    }
}

/// Bridge backed by a fixed set of named worker threads fed through an
/// unbounded crossbeam channel.
pub struct ThreadPoolBridge {
    worker_count: usize,
    thread_name_prefix: String,
    sender: Mutex<Option<Sender<Category>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stopped: Arc<AtomicBool>,
}

impl ThreadPoolBridge {
    pub fn new(worker_count: usize, thread_name_prefix: impl Into<String>) -> Self {
        Self {
            worker_count: worker_count.max(1),
            thread_name_prefix: thread_name_prefix.into(),
            sender: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a bridge sized by `worker_threads` and `thread_name_prefix`
    pub fn from_config(config: &crate::config::PoolConfiguration) -> Self {
        Self::new(config.worker_threads, config.thread_name_prefix.clone())
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }
}

impl ExecutionBridge for ThreadPoolBridge {
    fn start(&self, producer: ProduceFn) -> PoolResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(PoolError::BridgeStopped);
        }

        let mut sender = self.sender.lock();
        if sender.is_some() {
            return Err(PoolError::BridgeStart("already started".into()));
        }

        let (tx, rx) = channel::unbounded::<Category>();
        let mut workers = self.workers.lock();

        for index in 0..self.worker_count {
            let rx = rx.clone();
            let producer = Arc::clone(&producer);
            let stopped = Arc::clone(&self.stopped);

            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.thread_name_prefix, index))
                .spawn(move || {
                    while let Ok(category) = rx.recv() {
                        if stopped.load(Ordering::Acquire) {
                            break;
                        }
                        producer(category);
                    }
                })
                .map_err(|e| PoolError::BridgeStart(e.to_string()))?;

            workers.push(handle);
        }

        *sender = Some(tx);
        debug!(workers = self.worker_count, "thread pool bridge started");
        Ok(())
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        // Closing the channel lets idle workers fall out of `recv`.
        self.sender.lock().take();

        let current = thread::current().id();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("prefetch worker exited with a panic");
            }
        }
        debug!("thread pool bridge stopped");
    }

    fn enqueue(&self, category: Category) {
        if self.stopped.load(Ordering::Acquire) {
            trace!(%category, "enqueue after stop ignored");
            return;
        }

        match self.sender.lock().as_ref() {
            Some(tx) => {
                if tx.send(category).is_err() {
                    trace!(%category, "worker channel closed");
                }
            }
            None => warn!(%category, "enqueue before start ignored"),
        }
    }
}

impl Drop for ThreadPoolBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Bridge that runs units on a tokio runtime's blocking pool.
pub struct TokioBridge {
    handle: Handle,
    producer: Mutex<Option<ProduceFn>>,
    stopped: Arc<AtomicBool>,
}

impl TokioBridge {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            producer: Mutex::new(None),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Bind to the runtime the caller is running inside
    pub fn current() -> PoolResult<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| PoolError::BridgeStart(e.to_string()))
    }
}

impl ExecutionBridge for TokioBridge {
    fn start(&self, producer: ProduceFn) -> PoolResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(PoolError::BridgeStopped);
        }
        let mut slot = self.producer.lock();
        if slot.is_some() {
            return Err(PoolError::BridgeStart("already started".into()));
        }
        *slot = Some(producer);
        debug!("tokio bridge started");
        Ok(())
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.producer.lock().take();
            debug!("tokio bridge stopped");
        }
    }

    fn enqueue(&self, category: Category) {
        if self.stopped.load(Ordering::Acquire) {
            trace!(%category, "enqueue after stop ignored");
            return;
        }

        let Some(producer) = self.producer.lock().clone() else {
            warn!(%category, "enqueue before start ignored");
            return;
        };

        let stopped = Arc::clone(&self.stopped);
        self.handle.spawn_blocking(move || {
            if !stopped.load(Ordering::Acquire) {
                producer(category);
            }
        });
    }
}
