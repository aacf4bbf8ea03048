//! Façade over the cache, scheduler, fetcher and streaming connection.
//!
//! Consumers never touch the queue, ledger or ref-count table directly.
//! Every expected failure surfaces as `None`.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::adapters::rest::{HttpTransport, ReqwestTransport};
use crate::adapters::stream_ws::{StreamConnector, WsConnector};
use crate::cache::store::to_chrono;
use crate::cache::{
    persist_profiles, restore_profiles, CacheEntry, Cached, InFlightLedger, JsonFileStore,
    MarketCache, MemoryStore, ProfileStore,
};
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::coordination::{FetchJob, QueueEntry, RateLimitGate, Scheduler, WorkQueue};
use crate::domain::{
    normalize_symbol, ConnectionState, DataKind, MarketStatus, Priority, Profile, Quote, Tick,
    TickerRecord,
};
use crate::error::{Result, TickerHubError};
use crate::services::bus::{NotificationBus, Subscription, TickerUpdate, UpdateKind};
use crate::services::fetcher::MarketDataFetcher;
use crate::services::streaming::{StreamingManager, TickHandler};

/// Shared state reached from the scheduler's jobs and the streaming task
struct HubCore {
    cache: MarketCache,
    ledger: Arc<InFlightLedger>,
    bus: Arc<NotificationBus>,
    fetcher: MarketDataFetcher,
    store: Arc<dyn ProfileStore>,
    /// Held across snapshot and write so the newest snapshot lands last
    persist_lock: AsyncMutex<()>,
    queue: Arc<WorkQueue>,
    /// Last tick-triggered baseline request per symbol
    baseline_requests: DashMap<String, DateTime<Utc>>,
    baseline_retry: ChronoDuration,
}

#[async_trait]
impl FetchJob for HubCore {
    async fn run(&self, entry: QueueEntry) {
        let Some(claim) = self.ledger.try_claim(&entry.symbol, entry.kind) else {
            debug!(symbol = %entry.symbol, kind = %entry.kind, "Already in flight, skipping");
            return;
        };
        if self.cache.is_fresh(&entry.symbol, entry.kind) {
            debug!(symbol = %entry.symbol, kind = %entry.kind, "Fresh while queued, skipping");
            return;
        }

        match entry.kind {
            DataKind::Quote => {
                if let Some(quote) = self.fetcher.fetch_quote(claim.symbol()).await {
                    self.cache.put_quote(quote);
                }
            }
            DataKind::Profile => {
                if let Some(profile) = self.fetcher.fetch_profile(claim.symbol()).await {
                    self.cache.put_profile(profile);
                    let _persisting = self.persist_lock.lock().await;
                    persist_profiles(&self.cache, Arc::clone(&self.store)).await;
                }
            }
        }
    }
}

impl TickHandler for HubCore {
    fn on_tick(&self, tick: Tick) {
        if self.cache.patch_with_tick(&tick).is_some() {
            return;
        }

        // Without a REST baseline there is no previous close to patch against.
        let now = self.cache.now();
        let due = match self.baseline_requests.entry(tick.symbol.clone()) {
            Entry::Occupied(mut last) => {
                let due = now - *last.get() >= self.baseline_retry;
                if due {
                    last.insert(now);
                }
                due
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        };

        if due {
            debug!(symbol = %tick.symbol, "Tick without cached quote, fetching baseline");
            self.queue.enqueue(&tick.symbol, DataKind::Quote, Priority::High);
        } else {
            debug!(symbol = %tick.symbol, "Tick without cached quote, baseline recently requested");
        }
    }
}

pub struct Hub {
    core: Arc<HubCore>,
    scheduler: Scheduler,
    streaming: StreamingManager,
    market_status: AsyncMutex<Option<CacheEntry<MarketStatus>>>,
    market_status_ttl: ChronoDuration,
    exchange: String,
    request_timeout: Duration,
}

impl Hub {
    /// Wire every component together and start the scheduler loop.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        config: &AppConfig,
        transport: Arc<dyn HttpTransport>,
        connector: Arc<dyn StreamConnector>,
        store: Arc<dyn ProfileStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let bus = NotificationBus::new();
        let cache = MarketCache::new(
            Duration::from_secs(config.cache.quote_ttl_secs),
            Duration::from_secs(config.cache.profile_ttl_secs),
            clock,
            Arc::clone(&bus),
        );
        restore_profiles(&cache, store.as_ref());

        let gate = Arc::new(RateLimitGate::new(
            Duration::from_millis(config.fetcher.cooldown_base_ms),
            Duration::from_millis(config.fetcher.cooldown_max_ms),
        ));
        let fetcher = MarketDataFetcher::new(transport, Arc::clone(&gate), &config.fetcher);
        let queue = WorkQueue::new();

        let core = Arc::new(HubCore {
            cache,
            ledger: InFlightLedger::new(),
            bus,
            fetcher,
            store,
            persist_lock: AsyncMutex::new(()),
            queue: Arc::clone(&queue),
            baseline_requests: DashMap::new(),
            baseline_retry: to_chrono(Duration::from_secs(config.streaming.baseline_retry_secs)),
        });

        let scheduler = Scheduler::start(
            queue,
            Arc::clone(&core) as Arc<dyn FetchJob>,
            gate,
            &config.scheduler,
        );
        let streaming = StreamingManager::new(
            connector,
            Arc::clone(&core) as Arc<dyn TickHandler>,
            config.streaming.clone(),
        );

        let market_status_ttl = to_chrono(Duration::from_secs(config.cache.market_status_ttl_secs));

        info!(
            quote_ttl_secs = config.cache.quote_ttl_secs,
            profile_ttl_secs = config.cache.profile_ttl_secs,
            "Market data hub started"
        );

        Self {
            core,
            scheduler,
            streaming,
            market_status: AsyncMutex::new(None),
            market_status_ttl,
            exchange: config.endpoints.exchange.clone(),
            request_timeout: config.request_timeout(),
        }
    }

    /// Build production transports from configuration.
    pub fn connect(config: &AppConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| TickerHubError::InvalidConfig(errors.join("; ")))?;

        let token = config.endpoints.api_token.clone();
        let transport = ReqwestTransport::new(
            &config.endpoints.rest_base_url,
            token.clone(),
            Duration::from_millis(config.endpoints.http_timeout_ms),
        )?;
        let connector = WsConnector::new(&config.endpoints.ws_url, token.as_deref())?;

        let store: Arc<dyn ProfileStore> = match durable_dir(config) {
            Some(dir) => {
                info!("Using profile store in {}", dir.display());
                Arc::new(JsonFileStore::new(dir))
            }
            None => Arc::new(MemoryStore::default()),
        };

        Ok(Self::new(
            config,
            Arc::new(transport),
            Arc::new(connector),
            store,
            Arc::new(SystemClock),
        ))
    }

    /// Queue quote and profile fetches for every symbol not already fresh.
    pub fn prefetch(&self, symbols: &[String], priority: Priority) {
        for symbol in symbols.iter().map(|s| normalize_symbol(s)).filter(|s| !s.is_empty()) {
            for kind in [DataKind::Quote, DataKind::Profile] {
                if !self.core.cache.is_fresh(&symbol, kind) {
                    self.scheduler.enqueue(&symbol, kind, priority);
                }
            }
        }
    }

    /// Fresh quote from cache, or the next one fetched or streamed for `symbol`.
    ///
    /// Resolves to `None` when nothing arrives within the request timeout.
    pub async fn request_quote(&self, symbol: &str, priority: Priority) -> Option<Quote> {
        let symbol = normalize_symbol(symbol);
        self.request(&symbol, DataKind::Quote, priority, |update| match update.kind {
            UpdateKind::Quote | UpdateKind::Tick => update.record.quote,
            _ => None,
        })
        .await
    }

    pub async fn request_profile(&self, symbol: &str, priority: Priority) -> Option<Profile> {
        let symbol = normalize_symbol(symbol);
        self.request(&symbol, DataKind::Profile, priority, |update| match update.kind {
            UpdateKind::Profile => update.record.profile,
            _ => None,
        })
        .await
    }

    async fn request<T, F>(&self, symbol: &str, kind: DataKind, priority: Priority, pick: F) -> Option<T>
    where
        F: Fn(TickerUpdate) -> Option<T>,
    {
        if symbol.is_empty() {
            return None;
        }
        if let Some(hit) = self.fresh(symbol, kind, &pick) {
            return Some(hit);
        }

        // Subscribe before enqueueing so the write cannot slip past us.
        let mut sub = self.core.bus.subscribe(&[symbol.to_string()], std::iter::empty());
        if let Some(hit) = self.fresh(symbol, kind, &pick) {
            return Some(hit);
        }
        self.scheduler.enqueue(symbol, kind, priority);

        let wait = async {
            while let Some(update) = sub.recv().await {
                if let Some(value) = pick(update) {
                    return Some(value);
                }
            }
            None
        };

        match tokio::time::timeout(self.request_timeout, wait).await {
            Ok(value) => value,
            Err(_) => {
                debug!(symbol, kind = %kind, "Request timed out");
                None
            }
        }
    }

    fn fresh<T, F>(&self, symbol: &str, kind: DataKind, pick: &F) -> Option<T>
    where
        F: Fn(TickerUpdate) -> Option<T>,
    {
        if !self.core.cache.is_fresh(symbol, kind) {
            return None;
        }
        let record = self.core.cache.ticker_record(symbol);
        let kind = match kind {
            DataKind::Quote => UpdateKind::Quote,
            DataKind::Profile => UpdateKind::Profile,
        };
        pick(TickerUpdate {
            symbol: symbol.to_string(),
            kind,
            record,
        })
    }

    /// Cached quote, fresh or stale; never touches the network.
    pub fn get_quote(&self, symbol: &str) -> Option<Cached<Quote>> {
        self.core.cache.get_quote(&normalize_symbol(symbol))
    }

    pub fn get_profile(&self, symbol: &str) -> Option<Cached<Profile>> {
        self.core.cache.get_profile(&normalize_symbol(symbol))
    }

    pub fn ticker(&self, symbol: &str) -> TickerRecord {
        self.core.cache.ticker_record(&normalize_symbol(symbol))
    }

    /// Watch `symbols` on the bus; cached records arrive as the first events.
    pub fn subscribe(&self, symbols: &[String]) -> Subscription {
        let symbols: Vec<String> = symbols.iter().map(|s| normalize_symbol(s)).collect();
        let snapshots: Vec<TickerUpdate> = symbols
            .iter()
            .map(|s| self.core.cache.ticker_record(s))
            .filter(|record| !record.is_empty())
            .map(|record| TickerUpdate {
                symbol: record.symbol.clone(),
                kind: UpdateKind::Snapshot,
                record,
            })
            .collect();
        self.core.bus.subscribe(&symbols, snapshots)
    }

    pub fn stream_subscribe(&self, symbols: &[String]) {
        self.streaming.subscribe(symbols);
    }

    pub fn stream_unsubscribe(&self, symbols: &[String]) {
        self.streaming.unsubscribe(symbols);
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.streaming.state()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.streaming.watch_state()
    }

    /// Exchange session status, cached for a few minutes.
    ///
    /// Concurrent callers share one refresh, which waits out any rate-limit
    /// cooldown first. Falls back to the last known status on failure.
    pub async fn market_status(&self) -> Option<MarketStatus> {
        let mut cached = self.market_status.lock().await;
        let now = self.core.cache.now();
        if let Some(entry) = cached.as_ref() {
            if entry.is_fresh(now, self.market_status_ttl) {
                return Some(entry.data.clone());
            }
        }

        self.core.fetcher.gate().wait().await;
        match self.core.fetcher.fetch_market_status(&self.exchange).await {
            Some(status) => {
                *cached = Some(CacheEntry::new(status.clone(), self.core.cache.now()));
                Some(status)
            }
            None => {
                warn!(exchange = %self.exchange, "Market status unavailable");
                cached.as_ref().map(|entry| entry.data.clone())
            }
        }
    }

    /// Nothing queued and nothing in flight
    pub fn scheduler_idle(&self) -> bool {
        self.scheduler.is_idle()
    }

    pub fn pending(&self) -> usize {
        self.scheduler.queue().len()
    }

    pub fn in_flight(&self) -> usize {
        self.scheduler.in_flight()
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.streaming.stop().await;
        info!("Market data hub shut down");
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("exchange", &self.exchange)
            .field("pending", &self.pending())
            .field("in_flight", &self.in_flight())
            .field("streaming", &self.streaming)
            .finish()
    }
}

fn durable_dir(config: &AppConfig) -> Option<PathBuf> {
    if !config.cache.durable {
        return None;
    }
    let dir = config.cache.resolved_store_dir();
    if dir.is_none() {
        warn!("No data directory available; profiles will not persist");
    }
    dir
}
