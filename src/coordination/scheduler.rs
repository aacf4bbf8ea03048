//! Priority scheduler: a deduplicated work queue drained by one consumer loop.
//!
//! The loop enforces three limits independently:
//! - a global rate-limit cooldown (nothing is dispatched while it runs)
//! - a cap on simultaneous fetches
//! - a minimum delay between two dispatches

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::rate_limit::RateLimitGate;
use crate::config::SchedulerConfig;
use crate::domain::{DataKind, Priority};

/// One desired fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub symbol: String,
    pub kind: DataKind,
    pub priority: Priority,
}

#[derive(Debug, Default)]
struct QueueInner {
    tiers: [VecDeque<QueueEntry>; 3],
    pending: HashSet<(String, DataKind)>,
}

/// Work queue with at most one entry per (symbol, kind)
#[derive(Debug, Default)]
pub struct WorkQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("Work queue mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Queue a fetch. Returns `false` if `(symbol, kind)` is already queued;
    /// in that case the original priority is kept.
    pub fn enqueue(&self, symbol: &str, kind: DataKind, priority: Priority) -> bool {
        {
            let mut inner = self.lock();
            if !inner.pending.insert((symbol.to_string(), kind)) {
                return false;
            }
            inner.tiers[priority.tier()].push_back(QueueEntry {
                symbol: symbol.to_string(),
                kind,
                priority,
            });
        }
        self.notify.notify_one();
        true
    }

    /// Highest-priority entry, first-enqueued within a tier.
    pub fn pop(&self) -> Option<QueueEntry> {
        let mut inner = self.lock();
        let entry = inner.tiers.iter_mut().find_map(|tier| tier.pop_front())?;
        inner.pending.remove(&(entry.symbol.clone(), entry.kind));
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn notified(&self) {
        self.notify.notified().await
    }
}

/// Work performed for each dispatched entry
#[async_trait]
pub trait FetchJob: Send + Sync + 'static {
    async fn run(&self, entry: QueueEntry);
}

#[derive(Debug, Default)]
struct Counters {
    in_flight: AtomicUsize,
    dispatched: AtomicU64,
    settled: AtomicU64,
}

struct InFlightGuard(Arc<Counters>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.0.settled.fetch_add(1, Ordering::SeqCst);
    }
}

/// Handle to the running consumer loop
pub struct Scheduler {
    queue: Arc<WorkQueue>,
    counters: Arc<Counters>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn the consumer loop. Must be called inside a tokio runtime.
    pub fn start(
        queue: Arc<WorkQueue>,
        job: Arc<dyn FetchJob>,
        gate: Arc<RateLimitGate>,
        config: &SchedulerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());
        let max_concurrent = config.max_concurrent.max(1);
        let permits = Arc::new(Semaphore::new(max_concurrent));

        let consumer = Consumer {
            queue: Arc::clone(&queue),
            job,
            gate,
            permits: Arc::clone(&permits),
            dispatch_delay: config.dispatch_delay(),
            counters: Arc::clone(&counters),
        };

        info!(
            max_concurrent,
            dispatch_delay_ms = config.dispatch_delay_ms,
            "Starting fetch scheduler"
        );
        let handle = tokio::spawn(consumer.run(shutdown_rx));

        Self {
            queue,
            counters,
            permits,
            max_concurrent,
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn enqueue(&self, symbol: &str, kind: DataKind, priority: Priority) -> bool {
        self.queue.enqueue(symbol, kind, priority)
    }

    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    /// Entries handed to the job so far
    pub fn dispatched(&self) -> u64 {
        self.counters.dispatched.load(Ordering::SeqCst)
    }

    /// Entries whose job has completed
    pub fn settled(&self) -> u64 {
        self.counters.settled.load(Ordering::SeqCst)
    }

    /// Nothing queued and nothing in flight
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight() == 0
    }

    /// Stop the consumer loop. In-flight jobs run to completion.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Scheduler loop ended abnormally: {}", e);
            }
        }

        // Every running job holds a permit until it finishes.
        let running = self.in_flight();
        if running > 0 {
            debug!(running, "Waiting for in-flight fetches");
        }
        let _drained = self.permits.acquire_many(self.max_concurrent as u32).await;
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

struct Consumer {
    queue: Arc<WorkQueue>,
    job: Arc<dyn FetchJob>,
    gate: Arc<RateLimitGate>,
    permits: Arc<Semaphore>,
    dispatch_delay: Duration,
    counters: Arc<Counters>,
}

impl Consumer {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            if self.queue.is_empty() {
                tokio::select! {
                    _ = self.queue.notified() => {}
                    _ = shutdown_rx.changed() => break,
                }
                continue;
            }

            if let Some(left) = self.gate.remaining() {
                debug!(wait_ms = left.as_millis() as u64, "Scheduler paused for cooldown");
                tokio::select! {
                    _ = tokio::time::sleep(left) => {}
                    _ = shutdown_rx.changed() => break,
                }
                continue;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown_rx.changed() => break,
            };

            // A 429 may have landed while we waited for a slot.
            if self.gate.is_cooling_down() {
                drop(permit);
                continue;
            }

            // Counted before the pop so the item is never invisible to `is_idle`.
            self.counters.in_flight.fetch_add(1, Ordering::SeqCst);
            let Some(entry) = self.queue.pop() else {
                self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
                continue;
            };
            self.counters.dispatched.fetch_add(1, Ordering::SeqCst);
            debug!(
                symbol = %entry.symbol,
                kind = %entry.kind,
                priority = %entry.priority,
                queued = self.queue.len(),
                "Dispatching fetch"
            );

            let job = Arc::clone(&self.job);
            let guard = InFlightGuard(Arc::clone(&self.counters));
            tokio::spawn(async move {
                // Dropped in reverse: the counters settle before the permit frees.
                let _permit = permit;
                let _guard = guard;
                job.run(entry).await;
            });

            tokio::select! {
                _ = tokio::time::sleep(self.dispatch_delay) => {}
                _ = shutdown_rx.changed() => break,
            }
        }

        info!("Fetch scheduler stopped");
    }
}
