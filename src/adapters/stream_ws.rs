//! Streaming trade feed over WebSocket.
//!
//! The connection is hidden behind [`StreamConnector`], which hands back split
//! sink/stream halves speaking [`Outbound`] and [`Frame`]. The streaming
//! manager only ever talks to those traits.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use crate::domain::{normalize_symbol, Tick};
use crate::error::{Result, TickerHubError};

/// Close code the server uses for policy violations (bad token, plan limits)
pub const POLICY_VIOLATION: u16 = 1008;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Wire protocol
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe { symbol: String },
    Unsubscribe { symbol: String },
}

impl ClientMessage {
    pub fn symbol(&self) -> &str {
        match self {
            ClientMessage::Subscribe { symbol } | ClientMessage::Unsubscribe { symbol } => symbol,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TradeData {
    /// Symbol
    pub s: String,
    /// Last price
    pub p: Decimal,
    /// Epoch milliseconds
    pub t: i64,
    #[serde(default)]
    pub v: Option<Decimal>,
}

impl TradeData {
    /// `None` for non-positive prices or unrepresentable timestamps.
    pub fn into_tick(self) -> Option<Tick> {
        if self.p <= Decimal::ZERO {
            return None;
        }
        let timestamp = Utc.timestamp_millis_opt(self.t).single()?;
        Some(Tick {
            symbol: normalize_symbol(&self.s),
            price: self.p,
            timestamp,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Trade {
        #[serde(default)]
        data: Vec<TradeData>,
    },
    Error {
        #[serde(default)]
        msg: Option<String>,
    },
    Ping,
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

// ============================================================================
// Transport seam
// ============================================================================

/// Frames the manager sends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Frames the manager receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping(Vec<u8>),
    Pong,
    Close { code: Option<u16>, reason: String },
}

#[async_trait]
pub trait WireSink: Send {
    async fn send(&mut self, msg: Outbound) -> Result<()>;
}

#[async_trait]
pub trait WireStream: Send {
    /// `None` once the peer is gone.
    async fn next(&mut self) -> Option<Result<Frame>>;
}

pub type WireHalves = (Box<dyn WireSink>, Box<dyn WireStream>);

#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self) -> Result<WireHalves>;
}

// ============================================================================
// tokio-tungstenite implementation
// ============================================================================

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    pub fn new(ws_url: &str, token: Option<&str>) -> Result<Self> {
        let mut url = Url::parse(ws_url)
            .map_err(|e| TickerHubError::InvalidConfig(format!("invalid WebSocket URL {}: {}", ws_url, e)))?;
        if let Some(token) = token.filter(|t| !t.trim().is_empty()) {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(Self { url })
    }

    /// Host and path only; the query holds the token.
    pub fn endpoint(&self) -> String {
        format!("{}{}", self.url.host_str().unwrap_or_default(), self.url.path())
    }
}

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self) -> Result<WireHalves> {
        info!("Connecting to stream: {}", self.endpoint());

        let (ws_stream, _) = timeout(CONNECT_TIMEOUT, connect_async(self.url.as_str()))
            .await
            .map_err(|_| TickerHubError::Timeout("WebSocket connection timeout".to_string()))?
            .map_err(TickerHubError::WebSocket)?;

        let (write, read) = ws_stream.split();
        Ok((Box::new(WsSink(write)), Box::new(WsStream(read))))
    }
}

struct WsSink(SplitSink<Ws, Message>);

#[async_trait]
impl WireSink for WsSink {
    async fn send(&mut self, msg: Outbound) -> Result<()> {
        let msg = match msg {
            Outbound::Text(text) => Message::Text(text),
            Outbound::Ping(data) => Message::Ping(data),
            Outbound::Pong(data) => Message::Pong(data),
            Outbound::Close => Message::Close(None),
        };
        self.0.send(msg).await?;
        Ok(())
    }
}

struct WsStream(SplitStream<Ws>);

#[async_trait]
impl WireStream for WsStream {
    async fn next(&mut self) -> Option<Result<Frame>> {
        loop {
            let frame = match self.0.next().await? {
                Ok(Message::Text(text)) => Frame::Text(text),
                Ok(Message::Binary(bytes)) => Frame::Text(String::from_utf8_lossy(&bytes).into_owned()),
                Ok(Message::Ping(data)) => Frame::Ping(data),
                Ok(Message::Pong(_)) => Frame::Pong,
                Ok(Message::Close(close)) => Frame::Close {
                    code: close.as_ref().map(|c| u16::from(c.code)),
                    reason: close.map(|c| c.reason.into_owned()).unwrap_or_default(),
                },
                Ok(Message::Frame(_)) => {
                    debug!("Skipping raw frame");
                    continue;
                }
                Err(e) => return Some(Err(e.into())),
            };
            return Some(Ok(frame));
        }
    }
}
