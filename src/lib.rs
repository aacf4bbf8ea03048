pub mod adapters;
pub mod cache;
pub mod cli;
pub mod clock;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod services;

pub use cache::{JsonFileStore, MarketCache, MemoryStore, ProfileStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use coordination::{Backoff, BackoffPolicy, BackoffState, RateLimitGate};
pub use domain::{
    ConnectionState, DataKind, MarketStatus, Priority, Profile, Quote, Tick, TickerRecord,
};
pub use error::{Result, TickerHubError};
pub use services::{Hub, NotificationBus, Subscription, TickerUpdate, UpdateKind};
