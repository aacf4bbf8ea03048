use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tickerhub::adapters::{
    Frame, HttpResponse, HttpTransport, Outbound, StreamConnector, WireHalves, WireSink,
    WireStream, POLICY_VIOLATION,
};
use tickerhub::cache::{JsonFileStore, MemoryStore, ProfileStore};
use tickerhub::clock::ManualClock;
use tickerhub::config::AppConfig;
use tickerhub::services::{Hub, UpdateKind};
use tickerhub::{Priority, Result, TickerHubError};
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};

type Responder = Box<dyn Fn(&str) -> HttpResponse + Send + Sync>;

/// REST stand-in with per-path call counts and a fixed latency
struct FakeTransport {
    respond: Responder,
    latency: Duration,
    calls: Mutex<HashMap<String, usize>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeTransport {
    fn new(latency: Duration, respond: impl Fn(&str) -> HttpResponse + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            latency,
            calls: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn calls(&self, path: &str) -> usize {
        self.calls.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn get(&self, path: &str) -> Result<HttpResponse> {
        *self.calls.lock().unwrap().entry(path.to_string()).or_insert(0) += 1;
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        sleep(self.latency).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok((self.respond)(path))
    }
}

/// Answers quotes and profiles for any symbol
fn market_data(path: &str) -> HttpResponse {
    if path.starts_with("/quote/") {
        HttpResponse::ok(r#"{"c":100,"d":5,"dp":5.2632,"h":101,"l":94,"o":95,"pc":95,"t":1700000000}"#)
    } else if let Some(symbol) = path.strip_prefix("/profile/") {
        HttpResponse::ok(format!(r#"{{"ticker":"{0}","name":"{0} Inc","currency":"USD"}}"#, symbol))
    } else {
        HttpResponse::status(404)
    }
}

struct ChannelSink(mpsc::UnboundedSender<Outbound>);

#[async_trait]
impl WireSink for ChannelSink {
    async fn send(&mut self, msg: Outbound) -> Result<()> {
        self.0
            .send(msg)
            .map_err(|_| TickerHubError::Stream("peer gone".into()))
    }
}

struct ChannelStream(mpsc::UnboundedReceiver<Result<Frame>>);

#[async_trait]
impl WireStream for ChannelStream {
    async fn next(&mut self) -> Option<Result<Frame>> {
        self.0.recv().await
    }
}

struct Remote {
    sent: mpsc::UnboundedReceiver<Outbound>,
    frames: Option<mpsc::UnboundedSender<Result<Frame>>>,
}

impl Remote {
    async fn next_control(&mut self) -> serde_json::Value {
        loop {
            if let Outbound::Text(text) = self.sent.recv().await.expect("sink closed") {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn subscribed_symbols(&mut self, n: usize) -> Vec<String> {
        let mut symbols = Vec::new();
        for _ in 0..n {
            let msg = self.next_control().await;
            assert_eq!(msg["type"], "subscribe");
            symbols.push(msg["symbol"].as_str().unwrap().to_string());
        }
        symbols.sort();
        symbols
    }

    fn push(&self, frame: Frame) {
        self.frames.as_ref().unwrap().send(Ok(frame)).unwrap();
    }

    fn hang_up(&mut self) {
        self.frames = None;
    }
}

#[derive(Default)]
struct FakeConnector {
    sessions: Mutex<VecDeque<WireHalves>>,
    attempts: AtomicUsize,
}

impl FakeConnector {
    fn add_session(&self) -> Remote {
        let (sent_tx, sent) = mpsc::unbounded_channel();
        let (frames, frames_rx) = mpsc::unbounded_channel();
        self.sessions.lock().unwrap().push_back((
            Box::new(ChannelSink(sent_tx)) as Box<dyn WireSink>,
            Box::new(ChannelStream(frames_rx)) as Box<dyn WireStream>,
        ));
        Remote {
            sent,
            frames: Some(frames),
        }
    }
}

#[async_trait]
impl StreamConnector for FakeConnector {
    async fn connect(&self) -> Result<WireHalves> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.sessions
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| TickerHubError::Stream("connection refused".into()))
    }
}

fn start_time() -> chrono::DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

fn build_hub(
    config: &AppConfig,
    transport: Arc<FakeTransport>,
    connector: Arc<FakeConnector>,
    store: Arc<dyn ProfileStore>,
) -> Hub {
    Hub::new(
        config,
        transport,
        connector,
        store,
        Arc::new(ManualClock::new(start_time())),
    )
}

fn symbols(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

async fn wait_until_idle(hub: &Hub) {
    while !hub.scheduler_idle() {
        sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_share_one_fetch() {
    let transport = FakeTransport::new(Duration::from_millis(200), market_data);
    let hub = build_hub(
        &AppConfig::default(),
        transport.clone(),
        Arc::new(FakeConnector::default()),
        Arc::new(MemoryStore::default()),
    );

    let requests = (0..8).map(|_| hub.request_quote("AAPL", Priority::High));
    let quotes = futures_util::future::join_all(requests).await;

    assert!(quotes.iter().all(|q| q.as_ref().map(|q| q.price) == Some(dec!(100))));
    assert_eq!(transport.calls("/quote/AAPL"), 1);
    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn prefetch_drain_respects_spacing_and_cap() {
    let transport = FakeTransport::new(Duration::from_millis(1_200), market_data);
    let hub = build_hub(
        &AppConfig::default(),
        transport.clone(),
        Arc::new(FakeConnector::default()),
        Arc::new(MemoryStore::default()),
    );

    let watchlist: Vec<String> = (0..24).map(|i| format!("SYM{}", i)).collect();
    let started = Instant::now();
    hub.prefetch(&watchlist, Priority::Medium);
    assert_eq!(hub.pending() + hub.in_flight(), 48);

    wait_until_idle(&hub).await;

    assert!(started.elapsed() >= Duration::from_millis(24 * 2 / 2 * 500));
    assert_eq!(transport.total_calls(), 48);
    assert_eq!(transport.peak.load(Ordering::SeqCst), 2);
    assert!(hub.get_quote("SYM23").unwrap().fresh);
    assert_eq!(hub.get_profile("SYM0").unwrap().data.name, "SYM0 Inc");
    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn request_for_unavailable_symbol_times_out_as_none() {
    let transport = FakeTransport::new(Duration::from_millis(10), |_| HttpResponse::status(404));
    let hub = build_hub(
        &AppConfig::default(),
        transport.clone(),
        Arc::new(FakeConnector::default()),
        Arc::new(MemoryStore::default()),
    );

    let started = Instant::now();
    assert!(hub.request_quote("NOPE", Priority::High).await.is_none());
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(transport.calls("/quote/NOPE"), 1);
    assert!(hub.get_quote("NOPE").is_none());
    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn streamed_ticks_patch_cached_quotes() {
    let transport = FakeTransport::new(Duration::from_millis(10), market_data);
    let connector = Arc::new(FakeConnector::default());
    let mut remote = connector.add_session();
    let hub = build_hub(
        &AppConfig::default(),
        transport,
        connector.clone(),
        Arc::new(MemoryStore::default()),
    );

    let baseline = hub.request_quote("AAPL", Priority::High).await.unwrap();
    assert_eq!(baseline.previous_close, dec!(95));

    let mut sub = hub.subscribe(&symbols(&["AAPL"]));
    assert_eq!(sub.recv().await.unwrap().kind, UpdateKind::Snapshot);

    hub.stream_subscribe(&symbols(&["AAPL"]));
    assert_eq!(remote.subscribed_symbols(1).await, symbols(&["AAPL"]));
    remote.push(Frame::Text(
        r#"{"type":"trade","data":[{"s":"AAPL","p":102,"t":1700000060000}]}"#.to_string(),
    ));

    let update = sub.recv().await.unwrap();
    assert_eq!(update.kind, UpdateKind::Tick);
    let quote = update.record.quote.unwrap();
    assert_eq!(quote.price, dec!(102));
    assert_eq!(quote.change, dec!(7));
    assert_eq!(quote.change_percent.round_dp(2), dec!(7.37));
    assert_eq!(quote.previous_close, dec!(95));
    assert_eq!(quote.high, dec!(102));
    assert_eq!(quote.timestamp.timestamp_millis(), 1_700_000_060_000);

    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_replays_every_live_symbol() {
    let transport = FakeTransport::new(Duration::from_millis(10), market_data);
    let connector = Arc::new(FakeConnector::default());
    let mut first = connector.add_session();
    let mut second = connector.add_session();
    let hub = build_hub(
        &AppConfig::default(),
        transport,
        connector.clone(),
        Arc::new(MemoryStore::default()),
    );

    hub.stream_subscribe(&symbols(&["X", "Y"]));
    assert_eq!(first.subscribed_symbols(2).await, symbols(&["X", "Y"]));

    let mut states = hub.watch_connection_state();
    first.hang_up();
    states
        .wait_for(|s| matches!(s, tickerhub::ConnectionState::Backoff { .. }))
        .await
        .unwrap();

    assert_eq!(second.subscribed_symbols(2).await, symbols(&["X", "Y"]));
    assert!(hub.connection_state().is_open());
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn policy_close_surfaces_as_unavailable() {
    let transport = FakeTransport::new(Duration::from_millis(10), market_data);
    let connector = Arc::new(FakeConnector::default());
    let mut remote = connector.add_session();
    let hub = build_hub(
        &AppConfig::default(),
        transport,
        connector.clone(),
        Arc::new(MemoryStore::default()),
    );

    hub.stream_subscribe(&symbols(&["AAPL"]));
    remote.subscribed_symbols(1).await;
    remote.push(Frame::Close {
        code: Some(POLICY_VIOLATION),
        reason: "Access denied".to_string(),
    });

    let mut states = hub.watch_connection_state();
    states.wait_for(|s| s.is_fatal()).await.unwrap();
    sleep(Duration::from_secs(60)).await;

    assert_eq!(hub.connection_state().as_str(), "UNAVAILABLE");
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn profiles_survive_restart_through_durable_store() {
    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig::default();

    let transport = FakeTransport::new(Duration::from_millis(10), market_data);
    let hub = build_hub(
        &config,
        transport.clone(),
        Arc::new(FakeConnector::default()),
        Arc::new(JsonFileStore::new(dir.path())),
    );
    let profile = hub.request_profile("NVDA", Priority::High).await.unwrap();
    assert_eq!(profile.name, "NVDA Inc");
    hub.shutdown().await;

    let cold = FakeTransport::new(Duration::from_millis(10), |_| HttpResponse::status(500));
    let restarted = build_hub(
        &config,
        cold.clone(),
        Arc::new(FakeConnector::default()),
        Arc::new(JsonFileStore::new(dir.path())),
    );
    let restored = restarted.request_profile("nvda", Priority::Low).await.unwrap();
    assert_eq!(restored, profile);
    assert_eq!(cold.total_calls(), 0);
    restarted.shutdown().await;
}
