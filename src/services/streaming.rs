//! Shared streaming connection with per-symbol reference counting.
//!
//! One background task owns the socket. Symbols are wire-subscribed while
//! their count is above zero, and every reconnect replays the full set, so
//! consumers never see the connection cycling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::adapters::stream_ws::{
    ClientMessage, Frame, Outbound, ServerMessage, StreamConnector, WireSink, WireStream, POLICY_VIOLATION,
};
use crate::config::StreamingConfig;
use crate::coordination::{Backoff, BackoffPolicy};
use crate::domain::{normalize_symbol, ConnectionState, Tick};
use crate::error::TickerHubError;

/// Receives every valid streamed trade
pub trait TickHandler: Send + Sync {
    fn on_tick(&self, tick: Tick);
}

#[derive(Default)]
struct Inner {
    refcounts: HashMap<String, usize>,
    /// Present only while a connection is open
    outbound: Option<mpsc::UnboundedSender<ClientMessage>>,
    task: Option<JoinHandle<()>>,
    stopped: bool,
}

struct Shared {
    connector: Arc<dyn StreamConnector>,
    handler: Arc<dyn TickHandler>,
    config: StreamingConfig,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
}

/// How a single connection ended
enum SessionEnd {
    Shutdown,
    Closed(String),
    Failed(TickerHubError),
    Fatal(String),
}

pub struct StreamingManager {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
}

impl StreamingManager {
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        handler: Arc<dyn TickHandler>,
        config: StreamingConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::idle());
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                connector,
                handler,
                config,
                inner: Mutex::new(Inner::default()),
                state_tx,
            }),
            shutdown_tx,
        }
    }

    /// Increment ref-counts, wire-subscribing symbols that go 0 -> 1.
    ///
    /// Starts the connection task on first use.
    pub fn subscribe(&self, symbols: &[String]) {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        for symbol in symbols.iter().map(|s| normalize_symbol(s)).filter(|s| !s.is_empty()) {
            let count = inner.refcounts.entry(symbol.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                debug!(symbol = %symbol, "Stream symbol added");
                if let Some(tx) = &inner.outbound {
                    let _ = tx.send(ClientMessage::Subscribe { symbol });
                }
            }
        }
        self.ensure_started(inner);
    }

    /// Decrement ref-counts, wire-unsubscribing symbols that reach zero.
    pub fn unsubscribe(&self, symbols: &[String]) {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        for symbol in symbols.iter().map(|s| normalize_symbol(s)) {
            let Some(count) = inner.refcounts.get_mut(&symbol) else {
                continue;
            };
            *count -= 1;
            if *count == 0 {
                inner.refcounts.remove(&symbol);
                debug!(symbol = %symbol, "Stream symbol released");
                if let Some(tx) = &inner.outbound {
                    let _ = tx.send(ClientMessage::Unsubscribe { symbol });
                }
            }
        }
    }

    pub fn refcount(&self, symbol: &str) -> usize {
        self.shared
            .lock()
            .refcounts
            .get(&normalize_symbol(symbol))
            .copied()
            .unwrap_or(0)
    }

    /// Symbols currently wire-subscribed (or pending subscription), sorted
    pub fn active_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.shared.lock().refcounts.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// End the connection task. A fatal state is preserved.
    pub async fn stop(&self) {
        let handle = {
            let mut inner = self.shared.lock();
            inner.stopped = true;
            inner.outbound = None;
            inner.task.take()
        };
        self.shutdown_tx.send_replace(true);

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Streaming task ended abnormally: {}", e);
            }
        }
        if !self.state().is_fatal() {
            self.shared.set_state(ConnectionState::Disconnected { fatal: None });
        }
        info!("Streaming manager stopped");
    }

    fn ensure_started(&self, inner: &mut Inner) {
        if inner.task.is_some() || inner.stopped {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let shutdown_rx = self.shutdown_tx.subscribe();
        inner.task = Some(tokio::spawn(shared.run(shutdown_rx)));
    }
}

impl Drop for StreamingManager {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

impl std::fmt::Debug for StreamingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingManager")
            .field("state", &self.state())
            .field("symbols", &self.active_symbols())
            .finish()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("Streaming state mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn set_state(&self, state: ConnectionState) {
        debug!(state = %state, "Stream connection state");
        self.state_tx.send_replace(state);
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let policy = BackoffPolicy::unbounded(
            Duration::from_millis(self.config.base_reconnect_ms),
            Duration::from_millis(self.config.max_reconnect_ms),
        );
        let mut backoff = Backoff::new(policy);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            let connected = tokio::select! {
                res = self.connector.connect() => res,
                _ = shutdown_rx.changed() => break,
            };

            match connected {
                Ok((sink, stream)) => {
                    let end = self.drive(sink, stream, &mut shutdown_rx, &mut backoff).await;
                    self.lock().outbound = None;

                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Fatal(reason) => {
                            error!("Stream closed by policy, not reconnecting: {}", reason);
                            self.set_state(ConnectionState::Disconnected {
                                fatal: Some(reason),
                            });
                            return;
                        }
                        SessionEnd::Closed(reason) => info!("Stream closed: {}", reason),
                        SessionEnd::Failed(e) => warn!("Stream connection failed: {}", e),
                    }
                }
                Err(e) => warn!("Stream connect failed: {}", e),
            }

            let delay = backoff.record_failure().unwrap_or(policy.max);
            self.set_state(ConnectionState::Backoff {
                attempt: backoff.failures(),
            });
            info!(
                attempt = backoff.failures(),
                delay_ms = delay.as_millis() as u64,
                "Reconnecting stream"
            );

            tokio::select! {
                _ = sleep(delay) => backoff.begin_retry(),
                _ = shutdown_rx.changed() => break,
            }
        }

        self.set_state(ConnectionState::Disconnected { fatal: None });
    }

    async fn drive(
        &self,
        mut sink: Box<dyn WireSink>,
        mut stream: Box<dyn WireStream>,
        shutdown_rx: &mut watch::Receiver<bool>,
        backoff: &mut Backoff,
    ) -> SessionEnd {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let replayed = {
            let mut inner = self.lock();
            for symbol in inner.refcounts.keys() {
                let _ = tx.send(ClientMessage::Subscribe {
                    symbol: symbol.clone(),
                });
            }
            inner.outbound = Some(tx);
            inner.refcounts.len()
        };
        self.set_state(ConnectionState::Open);
        info!(symbols = replayed, "Stream open");

        let ping_every = Duration::from_secs(self.config.ping_interval_secs.max(1));
        let stale_after = Duration::from_secs(self.config.stale_timeout_secs.max(1));
        let mut ping = interval_at(Instant::now() + ping_every, ping_every);
        let mut last_frame = Instant::now();
        // The reconnect delay keeps growing until the server sends something usable.
        let mut healthy = false;

        loop {
            tokio::select! {
                frame = stream.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => return SessionEnd::Failed(e),
                        None => return SessionEnd::Closed("stream ended".to_string()),
                    };
                    last_frame = Instant::now();
                    match frame {
                        Frame::Text(text) => {
                            if let Some(end) = self.handle_text(&text) {
                                return end;
                            }
                        }
                        Frame::Ping(data) => {
                            if let Err(e) = sink.send(Outbound::Pong(data)).await {
                                return SessionEnd::Failed(e);
                            }
                        }
                        Frame::Pong => {}
                        Frame::Close { code: Some(POLICY_VIOLATION), reason } => {
                            return SessionEnd::Fatal(if reason.is_empty() {
                                "policy violation".to_string()
                            } else {
                                reason
                            });
                        }
                        Frame::Close { code, reason } => {
                            return SessionEnd::Closed(format!("code {:?} {}", code, reason));
                        }
                    }
                    if !healthy {
                        healthy = true;
                        backoff.reset();
                    }
                }
                Some(msg) = rx.recv() => {
                    let text = match msg.to_json() {
                        Ok(text) => text,
                        Err(e) => return SessionEnd::Failed(e),
                    };
                    if let Err(e) = sink.send(Outbound::Text(text)).await {
                        return SessionEnd::Failed(e);
                    }
                    debug!(symbol = msg.symbol(), "Sent stream control message");
                }
                _ = ping.tick() => {
                    if let Err(e) = sink.send(Outbound::Ping(Vec::new())).await {
                        return SessionEnd::Failed(e);
                    }
                    debug!("Sent ping");
                }
                _ = sleep_until(last_frame + stale_after) => {
                    return SessionEnd::Failed(TickerHubError::Stream(format!(
                        "no frames for {:?}; recycling connection",
                        stale_after
                    )));
                }
                _ = shutdown_rx.changed() => {
                    let _ = sink.send(Outbound::Close).await;
                    return SessionEnd::Shutdown;
                }
            }
        }
    }

    /// Returns `Some` when the message ends the session.
    fn handle_text(&self, text: &str) -> Option<SessionEnd> {
        match ServerMessage::parse(text) {
            Ok(ServerMessage::Trade { data }) => {
                for trade in data {
                    match trade.clone().into_tick() {
                        Some(tick) => self.handler.on_tick(tick),
                        None => debug!(symbol = %trade.s, price = %trade.p, "Dropping invalid trade"),
                    }
                }
                None
            }
            Ok(ServerMessage::Error { msg }) => Some(SessionEnd::Failed(TickerHubError::Stream(
                msg.unwrap_or_else(|| "server error".to_string()),
            ))),
            Ok(ServerMessage::Ping) => None,
            Err(_) => {
                debug!("Ignoring unrecognised stream message: {}", preview(text, 200));
                None
            }
        }
    }
}

/// At most `max_chars` characters of `text`, cut on a char boundary.
fn preview(text: &str, max_chars: usize) -> &str {
    text.char_indices().nth(max_chars).map_or(text, |(i, _)| &text[..i])
}
