//! Quote/profile cache, in-flight ledger and durable profile store.

pub mod durable;
pub mod ledger;
pub mod store;

pub use durable::{
    persist_profiles, restore_profiles, JsonFileStore, MemoryStore, ProfileStore, StoredProfile,
    StoredProfiles, STORE_KEY,
};
pub use ledger::{Claim, InFlightLedger};
pub use store::{CacheEntry, Cached, MarketCache};
