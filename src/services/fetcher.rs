//! Network fetch with bounded retry.
//!
//! Every call resolves to `Option<T>`: expected failures (exhausted retries,
//! non-retryable statuses, malformed bodies) are logged and become `None`.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::adapters::rest::HttpTransport;
use crate::config::FetcherConfig;
use crate::coordination::{Backoff, BackoffPolicy, RateLimitGate};
use crate::domain::{MarketStatus, Profile, Quote};
use crate::error::{Result, TickerHubError};

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

pub type SharedJitter = Arc<dyn Fn() -> f64 + Send + Sync>;

// ============================================================================
// Wire shapes
// ============================================================================

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    c: Option<Decimal>,
    d: Option<Decimal>,
    dp: Option<Decimal>,
    h: Option<Decimal>,
    l: Option<Decimal>,
    o: Option<Decimal>,
    pc: Option<Decimal>,
    /// Epoch seconds
    t: Option<i64>,
    #[serde(default)]
    v: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    ticker: Option<String>,
    name: Option<String>,
    logo: Option<String>,
    weburl: Option<String>,
    exchange: Option<String>,
    finnhub_industry: Option<String>,
    market_capitalization: Option<f64>,
    share_outstanding: Option<f64>,
    currency: Option<String>,
    country: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketStatusResponse {
    exchange: Option<String>,
    is_open: bool,
    session: Option<String>,
    holiday: Option<String>,
    timezone: Option<String>,
    t: Option<i64>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn from_epoch_secs(t: Option<i64>) -> DateTime<Utc> {
    t.filter(|t| *t > 0)
        .and_then(|t| Utc.timestamp_opt(t, 0).single())
        .unwrap_or_else(Utc::now)
}

pub(crate) fn parse_quote(symbol: &str, body: &str) -> Result<Quote> {
    let raw: QuoteResponse = serde_json::from_str(body)?;

    let price = raw
        .c
        .filter(|c| *c > Decimal::ZERO)
        .ok_or_else(|| TickerHubError::InvalidMarketData(format!("{}: missing or zero price", symbol)))?;
    let previous_close = raw.pc.unwrap_or(Decimal::ZERO);
    let change = raw.d.unwrap_or(price - previous_close);
    let change_percent = raw.dp.unwrap_or_else(|| {
        if previous_close.is_zero() {
            Decimal::ZERO
        } else {
            change / previous_close * Decimal::ONE_HUNDRED
        }
    });

    Ok(Quote {
        symbol: symbol.to_string(),
        price,
        change,
        change_percent,
        high: raw.h.unwrap_or(price),
        low: raw.l.unwrap_or(price),
        open: raw.o.unwrap_or(Decimal::ZERO),
        previous_close,
        timestamp: from_epoch_secs(raw.t),
        volume: raw.v,
    })
}

pub(crate) fn parse_profile(symbol: &str, body: &str) -> Result<Profile> {
    let raw: ProfileResponse = serde_json::from_str(body)?;

    // Unknown symbols come back as `{}`.
    let name = non_empty(raw.name)
        .ok_or_else(|| TickerHubError::InvalidMarketData(format!("{}: empty profile", symbol)))?;

    Ok(Profile {
        symbol: non_empty(raw.ticker)
            .map(|t| t.to_uppercase())
            .unwrap_or_else(|| symbol.to_string()),
        name,
        logo: non_empty(raw.logo),
        website: non_empty(raw.weburl),
        exchange: non_empty(raw.exchange),
        industry: non_empty(raw.finnhub_industry),
        market_cap: raw.market_capitalization,
        shares_outstanding: raw.share_outstanding,
        currency: non_empty(raw.currency),
        country: non_empty(raw.country),
    })
}

pub(crate) fn parse_market_status(exchange: &str, body: &str) -> Result<MarketStatus> {
    let raw: MarketStatusResponse = serde_json::from_str(body)?;
    Ok(MarketStatus {
        exchange: non_empty(raw.exchange).unwrap_or_else(|| exchange.to_string()),
        is_open: raw.is_open,
        session: non_empty(raw.session),
        holiday: non_empty(raw.holiday),
        timezone: non_empty(raw.timezone),
        timestamp: from_epoch_secs(raw.t),
    })
}

// ============================================================================
// Fetcher
// ============================================================================

pub struct MarketDataFetcher {
    transport: Arc<dyn HttpTransport>,
    gate: Arc<RateLimitGate>,
    policy: BackoffPolicy,
    sleeper: Arc<dyn Sleeper>,
    jitter: SharedJitter,
}

impl MarketDataFetcher {
    pub fn new(transport: Arc<dyn HttpTransport>, gate: Arc<RateLimitGate>, config: &FetcherConfig) -> Self {
        Self {
            transport,
            gate,
            policy: BackoffPolicy::new(
                Duration::from_millis(config.base_delay_ms),
                Duration::from_millis(config.max_delay_ms),
                config.max_attempts,
            ),
            sleeper: Arc::new(TokioSleeper),
            jitter: Arc::new(rand::random::<f64>),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_jitter(mut self, jitter: SharedJitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn gate(&self) -> &Arc<RateLimitGate> {
        &self.gate
    }

    pub async fn fetch_quote(&self, symbol: &str) -> Option<Quote> {
        let path = format!("/quote/{}", urlencoding::encode(symbol));
        self.fetch_with_retry(&path, |body| parse_quote(symbol, body)).await
    }

    pub async fn fetch_profile(&self, symbol: &str) -> Option<Profile> {
        let path = format!("/profile/{}", urlencoding::encode(symbol));
        self.fetch_with_retry(&path, |body| parse_profile(symbol, body)).await
    }

    pub async fn fetch_market_status(&self, exchange: &str) -> Option<MarketStatus> {
        let path = format!("/market-status?exchange={}", urlencoding::encode(exchange));
        self.fetch_with_retry(&path, |body| parse_market_status(exchange, body)).await
    }

    async fn fetch_with_retry<T, F>(&self, path: &str, parse: F) -> Option<T>
    where
        F: Fn(&str) -> Result<T>,
    {
        let jitter = Arc::clone(&self.jitter);
        let mut backoff = Backoff::with_jitter(self.policy, Box::new(move || jitter()));

        loop {
            let err = match self.transport.get(path).await {
                Ok(resp) if resp.is_rate_limited() => {
                    self.gate.record_rate_limit();
                    TickerHubError::RateLimited(path.to_string())
                }
                Ok(resp) if resp.is_success() => {
                    self.gate.record_success();
                    return match parse(&resp.body) {
                        Ok(value) => Some(value),
                        Err(e) => {
                            warn!(path, "Discarding malformed response: {}", e);
                            None
                        }
                    };
                }
                Ok(resp) => TickerHubError::HttpStatus {
                    status: resp.status,
                    path: path.to_string(),
                },
                Err(e) => e,
            };

            if !err.is_retryable() {
                warn!(path, "Request failed, not retrying: {}", err);
                return None;
            }

            match backoff.record_failure() {
                Some(delay) => {
                    debug!(
                        path,
                        attempt = backoff.failures(),
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after error: {}",
                        err
                    );
                    self.sleeper.sleep(delay).await;
                    // A 429 pauses every request, this retry included.
                    if err.is_rate_limited() {
                        self.gate.wait().await;
                    }
                    backoff.begin_retry();
                }
                None => {
                    warn!(path, attempts = backoff.failures(), "Giving up: {}", err);
                    return None;
                }
            }
        }
    }
}

impl std::fmt::Debug for MarketDataFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataFetcher")
            .field("policy", &self.policy)
            .field("gate", &self.gate)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::rest::{HttpResponse, MockHttpTransport};
    use rust_decimal_macros::dec;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Records requested delays and the cooldown deadline at each wait
    #[derive(Default)]
    struct RecordingSleeper {
        gate: Option<Arc<RateLimitGate>>,
        waits: Mutex<Vec<(Duration, Option<Instant>)>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            let until = self.gate.as_ref().and_then(|g| g.cooldown_until());
            self.waits.lock().unwrap().push((duration, until));
        }
    }

    fn config() -> FetcherConfig {
        FetcherConfig {
            max_attempts: 6,
            base_delay_ms: 1_000,
            max_delay_ms: 12_000,
            cooldown_base_ms: 2_000,
            cooldown_max_ms: 60_000,
        }
    }

    fn gate() -> Arc<RateLimitGate> {
        Arc::new(RateLimitGate::new(Duration::from_secs(2), Duration::from_secs(60)))
    }

    fn fetcher(mock: MockHttpTransport, gate: Arc<RateLimitGate>) -> (MarketDataFetcher, Arc<RecordingSleeper>) {
        let sleeper = Arc::new(RecordingSleeper {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        });
        let f = MarketDataFetcher::new(Arc::new(mock), gate, &config())
            .with_sleeper(sleeper.clone())
            .with_jitter(Arc::new(|| 0.7));
        (f, sleeper)
    }

    const QUOTE: &str = r#"{"c":101.5,"d":1.5,"dp":1.5,"h":102,"l":99,"o":100,"pc":100,"t":1700000000}"#;

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_rate_limits_back_off_and_extend_cooldown() {
        let mut mock = MockHttpTransport::new();
        mock.expect_get()
            .times(6)
            .returning(|_| Ok(HttpResponse::status(429)));
        let gate = gate();
        let (f, sleeper) = fetcher(mock, Arc::clone(&gate));

        assert!(f.fetch_quote("AAPL").await.is_none());
        assert_eq!(gate.consecutive_hits(), 6);

        let waits = sleeper.waits.lock().unwrap().clone();
        assert_eq!(waits.len(), 5);
        assert!(waits.windows(2).all(|w| w[0].0 <= w[1].0));
        assert!(waits.iter().all(|(d, _)| *d <= Duration::from_secs(12)));
        assert_eq!(waits[4].0, Duration::from_secs(12));

        let deadlines: Vec<Instant> = waits.iter().filter_map(|(_, u)| *u).collect();
        assert_eq!(deadlines.len(), 5);
        assert!(deadlines.windows(2).all(|w| w[0] < w[1]));
        assert!(gate.cooldown_until().unwrap() > deadlines[4]);
    }

    #[tokio::test]
    async fn test_server_error_is_retried_without_cooldown() {
        let mut mock = MockHttpTransport::new();
        let mut calls = 0;
        mock.expect_get().times(3).returning(move |_| {
            calls += 1;
            if calls < 3 {
                Ok(HttpResponse::status(503))
            } else {
                Ok(HttpResponse::ok(QUOTE))
            }
        });
        let gate = gate();
        let (f, sleeper) = fetcher(mock, Arc::clone(&gate));

        let quote = f.fetch_quote("AAPL").await.unwrap();
        assert_eq!(quote.price, dec!(101.5));
        assert_eq!(quote.previous_close, dec!(100));
        assert_eq!(sleeper.waits.lock().unwrap().len(), 2);
        assert!(gate.cooldown_until().is_none());
    }

    #[tokio::test]
    async fn test_transport_timeout_is_retried() {
        let mut mock = MockHttpTransport::new();
        let mut calls = 0;
        mock.expect_get().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(TickerHubError::Timeout("slow upstream".into()))
            } else {
                Ok(HttpResponse::ok(QUOTE))
            }
        });
        let (f, _) = fetcher(mock, gate());
        assert!(f.fetch_quote("AAPL").await.is_some());
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let mut mock = MockHttpTransport::new();
        mock.expect_get()
            .withf(|path: &str| path == "/profile/NOPE")
            .times(1)
            .returning(|_| Ok(HttpResponse::status(404)));
        let (f, sleeper) = fetcher(mock, gate());

        assert!(f.fetch_profile("NOPE").await.is_none());
        assert!(sleeper.waits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_quotes_are_discarded_once() {
        for body in [r#"{"c":0,"pc":10}"#, r#"{"c":"abc"}"#, "not json"] {
            let mut mock = MockHttpTransport::new();
            mock.expect_get()
                .times(1)
                .returning(move |_| Ok(HttpResponse::ok(body)));
            let (f, sleeper) = fetcher(mock, gate());
            assert!(f.fetch_quote("AAPL").await.is_none(), "body {}", body);
            assert!(sleeper.waits.lock().unwrap().is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_retry_waits_out_cooldown() {
        let calls = Arc::new(Mutex::new(Vec::<Instant>::new()));
        let seen = Arc::clone(&calls);
        let mut mock = MockHttpTransport::new();
        mock.expect_get().times(2).returning(move |_| {
            let mut seen = seen.lock().unwrap();
            seen.push(Instant::now());
            if seen.len() == 1 {
                Ok(HttpResponse::status(429))
            } else {
                Ok(HttpResponse::ok(QUOTE))
            }
        });
        let gate = gate();
        let f = MarketDataFetcher::new(Arc::new(mock), Arc::clone(&gate), &FetcherConfig::default())
            .with_jitter(Arc::new(|| 0.5));

        assert!(f.fetch_quote("AAPL").await.is_some());

        // Backoff alone would retry after 625ms; the cooldown is 2s.
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        let until = gate.cooldown_until().unwrap();
        assert!(calls[1] >= until);
        assert!(calls[1] - calls[0] >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_clears_rate_limit_streak() {
        let mut mock = MockHttpTransport::new();
        let mut calls = 0;
        mock.expect_get().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Ok(HttpResponse::status(429))
            } else {
                Ok(HttpResponse::ok(QUOTE))
            }
        });
        let gate = gate();
        let (f, _) = fetcher(mock, Arc::clone(&gate));

        assert!(f.fetch_quote("AAPL").await.is_some());
        assert_eq!(gate.consecutive_hits(), 0);
    }

    #[test]
    fn test_profile_mapping() {
        let body = r#"{"ticker":"aapl","name":"Apple Inc","logo":"https://x/aapl.png","weburl":"https://apple.com",
            "exchange":"NASDAQ","finnhubIndustry":"Technology","marketCapitalization":2800000.5,
            "shareOutstanding":15500.2,"currency":"USD","country":"US"}"#;
        let p = parse_profile("AAPL", body).unwrap();
        assert_eq!(p.symbol, "AAPL");
        assert_eq!(p.industry.as_deref(), Some("Technology"));
        assert_eq!(p.website.as_deref(), Some("https://apple.com"));

        assert!(parse_profile("ZZZZ", "{}").is_err());
    }

    #[test]
    fn test_quote_derives_missing_change() {
        let q = parse_quote("MSFT", r#"{"c":110,"pc":100,"t":1700000000}"#).unwrap();
        assert_eq!(q.change, dec!(10));
        assert_eq!(q.change_percent, dec!(10));
        assert_eq!(q.timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_market_status_mapping() {
        let s = parse_market_status(
            "US",
            r#"{"exchange":"US","isOpen":false,"session":"pre-market","holiday":null,"timezone":"America/New_York","t":1700000000}"#,
        )
        .unwrap();
        assert!(!s.is_open);
        assert_eq!(s.session.as_deref(), Some("pre-market"));
        assert!(s.holiday.is_none());
    }
}
