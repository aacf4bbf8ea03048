//! Per-symbol notification bus.
//!
//! Each subscription owns an unbounded channel. Publishing never blocks and
//! never calls back into subscriber code, so a cache write can fan out while
//! the writer still holds the freshly built record.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::TickerRecord;

/// What caused a bus event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// Cached state replayed to a new subscriber
    Snapshot,
    /// REST quote written to the cache
    Quote,
    /// REST profile written to the cache
    Profile,
    /// Cached quote patched by a streamed trade
    Tick,
}

/// Event delivered to subscribers
#[derive(Debug, Clone)]
pub struct TickerUpdate {
    pub symbol: String,
    pub kind: UpdateKind,
    pub record: TickerRecord,
}

type SubscriberId = u64;

#[derive(Default)]
struct Registry {
    next_id: SubscriberId,
    by_symbol: HashMap<String, HashMap<SubscriberId, mpsc::UnboundedSender<TickerUpdate>>>,
    symbols_by_id: HashMap<SubscriberId, Vec<String>>,
}

impl Registry {
    fn remove(&mut self, id: SubscriberId) -> bool {
        let Some(symbols) = self.symbols_by_id.remove(&id) else {
            return false;
        };
        for symbol in symbols {
            if let Some(subs) = self.by_symbol.get_mut(&symbol) {
                subs.remove(&id);
                if subs.is_empty() {
                    self.by_symbol.remove(&symbol);
                }
            }
        }
        true
    }
}

#[derive(Default)]
pub struct NotificationBus {
    registry: Mutex<Registry>,
}

impl NotificationBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| {
            warn!("Notification bus registry mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Register interest in `symbols`.
    ///
    /// `initial` is queued into the new channel before this returns; the
    /// caller sees it on its first `recv`.
    pub fn subscribe(
        self: &Arc<Self>,
        symbols: &[String],
        initial: impl IntoIterator<Item = TickerUpdate>,
    ) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut unique = Vec::new();
        let mut seen = HashSet::new();
        for symbol in symbols {
            if seen.insert(symbol.as_str()) {
                unique.push(symbol.clone());
            }
        }

        for update in initial {
            let _ = tx.send(update);
        }

        let id = {
            let mut registry = self.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            for symbol in &unique {
                registry
                    .by_symbol
                    .entry(symbol.clone())
                    .or_default()
                    .insert(id, tx.clone());
            }
            registry.symbols_by_id.insert(id, unique.clone());
            id
        };

        debug!(subscriber = id, symbols = ?unique, "Bus subscription added");

        Subscription {
            id,
            symbols: unique,
            rx,
            bus: Arc::downgrade(self),
            active: AtomicBool::new(true),
        }
    }

    /// Fan an update out to every subscriber of `update.symbol`.
    ///
    /// Returns the number of subscribers reached.
    pub fn publish(&self, update: TickerUpdate) -> usize {
        let mut registry = self.lock();
        let Some(subs) = registry.by_symbol.get(&update.symbol) else {
            return 0;
        };

        let mut delivered = 0;
        let mut gone = Vec::new();
        for (id, tx) in subs {
            if tx.send(update.clone()).is_ok() {
                delivered += 1;
            } else {
                gone.push(*id);
            }
        }

        for id in gone {
            registry.remove(id);
        }

        delivered
    }

    pub fn subscriber_count(&self, symbol: &str) -> usize {
        self.lock().by_symbol.get(symbol).map(|s| s.len()).unwrap_or(0)
    }

    fn remove(&self, id: SubscriberId) {
        if self.lock().remove(id) {
            debug!(subscriber = id, "Bus subscription removed");
        }
    }
}

/// Live interest in a set of symbols. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriberId,
    symbols: Vec<String>,
    rx: mpsc::UnboundedReceiver<TickerUpdate>,
    bus: Weak<NotificationBus>,
    active: AtomicBool,
}

impl Subscription {
    /// Next update, or `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<TickerUpdate> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TickerUpdate> {
        self.rx.try_recv().ok()
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Stop receiving updates for every symbol. Safe to call repeatedly.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("symbols", &self.symbols)
            .finish()
    }
}
