pub mod bus;
pub mod fetcher;
pub mod hub;
pub mod streaming;

pub use bus::{NotificationBus, Subscription, TickerUpdate, UpdateKind};
pub use fetcher::{MarketDataFetcher, Sleeper, TokioSleeper};
pub use hub::Hub;
pub use streaming::{StreamingManager, TickHandler};
