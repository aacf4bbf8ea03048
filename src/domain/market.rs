use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Point-in-time quote snapshot for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    /// Current (last) price
    pub price: Decimal,
    /// Absolute change against previous close
    pub change: Decimal,
    /// Percent change against previous close
    pub change_percent: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub open: Decimal,
    pub previous_close: Decimal,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub volume: Option<Decimal>,
}

impl Quote {
    /// Return a copy patched with a streamed trade.
    ///
    /// Change figures are always recomputed against `previous_close` from the
    /// last REST snapshot, never against an earlier tick.
    pub fn with_tick(&self, price: Decimal, timestamp: DateTime<Utc>) -> Quote {
        let change = price - self.previous_close;
        let change_percent = if self.previous_close.is_zero() {
            Decimal::ZERO
        } else {
            change / self.previous_close * Decimal::ONE_HUNDRED
        };

        Quote {
            price,
            change,
            change_percent,
            high: self.high.max(price),
            low: if self.low.is_zero() {
                price
            } else {
                self.low.min(price)
            },
            timestamp,
            ..self.clone()
        }
    }
}

/// Company profile; changes rarely
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub symbol: String,
    pub name: String,
    #[serde(default)]
    pub logo: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    /// Market capitalization in millions of `currency`
    #[serde(default)]
    pub market_cap: Option<f64>,
    /// Shares outstanding in millions
    #[serde(default)]
    pub shares_outstanding: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

/// Exchange trading-session status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketStatus {
    pub exchange: String,
    pub is_open: bool,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub holiday: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A single streamed trade
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub symbol: String,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Joined view of a symbol's quote and profile, rebuilt on every update.
#[derive(Debug, Clone, PartialEq)]
pub struct TickerRecord {
    pub symbol: String,
    pub quote: Option<Quote>,
    pub profile: Option<Profile>,
}

impl TickerRecord {
    pub fn display_name(&self) -> &str {
        self.profile
            .as_ref()
            .map(|p| p.name.as_str())
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.symbol)
    }

    pub fn is_empty(&self) -> bool {
        self.quote.is_none() && self.profile.is_none()
    }
}

/// Trim and upper-case a user supplied symbol.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}
