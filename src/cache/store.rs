use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use crate::clock::Clock;
use crate::domain::{DataKind, Profile, Quote, Tick, TickerRecord};
use crate::services::bus::{NotificationBus, TickerUpdate, UpdateKind};

/// A cached value and the time it was fetched
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub data: T,
    pub fetched_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T, fetched_at: DateTime<Utc>) -> Self {
        Self { data, fetched_at }
    }

    /// Fresh iff `now - fetched_at < ttl`
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: ChronoDuration) -> bool {
        now - self.fetched_at < ttl
    }
}

/// Cache read result. Stale data is still returned as last-known-good.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub data: T,
    pub fresh: bool,
    pub fetched_at: DateTime<Utc>,
}

/// TTL cache for quotes and profiles.
///
/// Writes fan out on the notification bus. Reads never touch the network.
pub struct MarketCache {
    quotes: DashMap<String, CacheEntry<Quote>>,
    profiles: DashMap<String, CacheEntry<Profile>>,
    quote_ttl: ChronoDuration,
    profile_ttl: ChronoDuration,
    clock: Arc<dyn Clock>,
    bus: Arc<NotificationBus>,
}

impl MarketCache {
    pub fn new(
        quote_ttl: std::time::Duration,
        profile_ttl: std::time::Duration,
        clock: Arc<dyn Clock>,
        bus: Arc<NotificationBus>,
    ) -> Self {
        Self {
            quotes: DashMap::new(),
            profiles: DashMap::new(),
            quote_ttl: to_chrono(quote_ttl),
            profile_ttl: to_chrono(profile_ttl),
            clock,
            bus,
        }
    }

    pub fn ttl(&self, kind: DataKind) -> ChronoDuration {
        match kind {
            DataKind::Quote => self.quote_ttl,
            DataKind::Profile => self.profile_ttl,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn get_quote(&self, symbol: &str) -> Option<Cached<Quote>> {
        let now = self.clock.now();
        self.quotes.get(symbol).map(|e| Cached {
            data: e.data.clone(),
            fresh: e.is_fresh(now, self.quote_ttl),
            fetched_at: e.fetched_at,
        })
    }

    pub fn get_profile(&self, symbol: &str) -> Option<Cached<Profile>> {
        let now = self.clock.now();
        self.profiles.get(symbol).map(|e| Cached {
            data: e.data.clone(),
            fresh: e.is_fresh(now, self.profile_ttl),
            fetched_at: e.fetched_at,
        })
    }

    /// `Some(fresh)` if anything is cached for `(symbol, kind)`
    pub fn freshness(&self, symbol: &str, kind: DataKind) -> Option<bool> {
        let now = self.clock.now();
        match kind {
            DataKind::Quote => self
                .quotes
                .get(symbol)
                .map(|e| e.is_fresh(now, self.quote_ttl)),
            DataKind::Profile => self
                .profiles
                .get(symbol)
                .map(|e| e.is_fresh(now, self.profile_ttl)),
        }
    }

    pub fn is_fresh(&self, symbol: &str, kind: DataKind) -> bool {
        self.freshness(symbol, kind).unwrap_or(false)
    }

    /// Store a REST quote, stamp it now, and notify subscribers.
    pub fn put_quote(&self, quote: Quote) -> TickerRecord {
        let symbol = quote.symbol.clone();
        self.quotes
            .insert(symbol.clone(), CacheEntry::new(quote, self.clock.now()));
        self.notify(&symbol, UpdateKind::Quote)
    }

    /// Store a REST profile, stamp it now, and notify subscribers.
    pub fn put_profile(&self, profile: Profile) -> TickerRecord {
        let symbol = profile.symbol.clone();
        self.profiles
            .insert(symbol.clone(), CacheEntry::new(profile, self.clock.now()));
        self.notify(&symbol, UpdateKind::Profile)
    }

    /// Insert a profile restored from the durable store without notifying.
    pub fn seed_profile(&self, profile: Profile, fetched_at: DateTime<Utc>) {
        self.profiles
            .insert(profile.symbol.clone(), CacheEntry::new(profile, fetched_at));
    }

    /// Patch the cached quote with a streamed trade.
    ///
    /// Returns `None` (tick dropped) when there is no REST quote to patch:
    /// without it there is no previous close to compute change against.
    pub fn patch_with_tick(&self, tick: &Tick) -> Option<TickerRecord> {
        {
            let mut entry = self.quotes.get_mut(&tick.symbol)?;
            let patched = entry.data.with_tick(tick.price, tick.timestamp);
            entry.data = patched;
        }
        Some(self.notify(&tick.symbol, UpdateKind::Tick))
    }

    pub fn ticker_record(&self, symbol: &str) -> TickerRecord {
        TickerRecord {
            symbol: symbol.to_string(),
            quote: self.quotes.get(symbol).map(|e| e.data.clone()),
            profile: self.profiles.get(symbol).map(|e| e.data.clone()),
        }
    }

    pub fn profile_entries(&self) -> Vec<(String, CacheEntry<Profile>)> {
        self.profiles
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    fn notify(&self, symbol: &str, kind: UpdateKind) -> TickerRecord {
        let record = self.ticker_record(symbol);
        let delivered = self.bus.publish(TickerUpdate {
            symbol: symbol.to_string(),
            kind,
            record: record.clone(),
        });
        debug!(symbol, ?kind, delivered, "Cache write published");
        record
    }
}

pub(crate) fn to_chrono(d: std::time::Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::days(365 * 100))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn quote(symbol: &str) -> Quote {
        Quote {
            symbol: symbol.to_string(),
            price: dec!(100),
            change: dec!(5),
            change_percent: dec!(5.26),
            high: dec!(101),
            low: dec!(94),
            open: dec!(95.5),
            previous_close: dec!(95),
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            volume: None,
        }
    }

    fn cache(clock: &ManualClock, bus: Arc<NotificationBus>) -> MarketCache {
        MarketCache::new(
            Duration::from_secs(600),
            Duration::from_secs(86_400),
            Arc::new(clock.clone()),
            bus,
        )
    }

    #[test]
    fn test_quote_ttl_boundary() {
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let clock = ManualClock::new(t0);
        let cache = cache(&clock, NotificationBus::new());

        cache.put_quote(quote("AAPL"));

        clock.set(t0 + ChronoDuration::minutes(10) - ChronoDuration::milliseconds(1));
        assert!(cache.get_quote("AAPL").unwrap().fresh);

        clock.set(t0 + ChronoDuration::minutes(10) + ChronoDuration::milliseconds(1));
        let stale = cache.get_quote("AAPL").unwrap();
        assert!(!stale.fresh);
        assert_eq!(stale.data.price, dec!(100));
    }

    #[test]
    fn test_profile_ttl_is_independent() {
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let clock = ManualClock::new(t0);
        let cache = cache(&clock, NotificationBus::new());

        cache.put_quote(quote("AAPL"));
        cache.put_profile(Profile {
            symbol: "AAPL".to_string(),
            name: "Apple Inc".to_string(),
            logo: None,
            website: None,
            exchange: None,
            industry: None,
            market_cap: None,
            shares_outstanding: None,
            currency: None,
            country: None,
        });

        clock.advance(ChronoDuration::hours(1));
        assert_eq!(cache.freshness("AAPL", DataKind::Quote), Some(false));
        assert_eq!(cache.freshness("AAPL", DataKind::Profile), Some(true));
        assert_eq!(cache.freshness("MSFT", DataKind::Profile), None);
    }

    #[tokio::test]
    async fn test_put_publishes_joined_record() {
        let clock = ManualClock::new(Utc::now());
        let bus = NotificationBus::new();
        let cache = cache(&clock, bus.clone());
        let mut sub = bus.subscribe(&["AAPL".to_string()], []);

        cache.put_quote(quote("AAPL"));
        let update = sub.recv().await.unwrap();
        assert_eq!(update.kind, UpdateKind::Quote);
        assert_eq!(update.record.quote.unwrap().price, dec!(100));
        assert!(update.record.profile.is_none());
    }

    #[tokio::test]
    async fn test_tick_without_quote_is_dropped() {
        let clock = ManualClock::new(Utc::now());
        let bus = NotificationBus::new();
        let cache = cache(&clock, bus.clone());
        let mut sub = bus.subscribe(&["AAPL".to_string()], []);

        let tick = Tick {
            symbol: "AAPL".to_string(),
            price: dec!(102),
            timestamp: Utc::now(),
        };
        assert!(cache.patch_with_tick(&tick).is_none());
        assert!(sub.try_recv().is_none());

        cache.put_quote(quote("AAPL"));
        let _ = sub.recv().await;
        let record = cache.patch_with_tick(&tick).unwrap();
        let patched = record.quote.unwrap();
        assert_eq!(patched.price, dec!(102));
        assert_eq!(patched.change, dec!(7));
        assert_eq!(patched.change_percent.round_dp(2), dec!(7.37));
        assert_eq!(sub.recv().await.unwrap().kind, UpdateKind::Tick);
    }
}
