//! Best-effort durable side-store for profiles.
//!
//! The store is a single namespaced key holding a JSON map of
//! `symbol -> {data, logo, fetchedAt}`. It is read once at startup and
//! rewritten after every profile fetch. Failures are logged and ignored.
//! Callers that persist concurrently must serialise their writes, otherwise
//! an older snapshot can land last.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::store::MarketCache;
use crate::domain::Profile;
use crate::error::Result;

/// Namespaced key of the profile map
pub const STORE_KEY: &str = "tickerhub.profiles.v1";

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredProfile {
    pub data: Profile,
    #[serde(default)]
    pub logo: Option<String>,
    /// Epoch milliseconds
    pub fetched_at: i64,
}

pub type StoredProfiles = HashMap<String, StoredProfile>;

pub trait ProfileStore: Send + Sync {
    fn load(&self) -> Result<StoredProfiles>;
    fn save(&self, profiles: &StoredProfiles) -> Result<()>;
}

/// JSON file named after [`STORE_KEY`] inside a data directory
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(format!("{}.json", STORE_KEY)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProfileStore for JsonFileStore {
    fn load(&self) -> Result<StoredProfiles> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let text = std::fs::read_to_string(&self.path)?;
        if text.trim().is_empty() {
            return Ok(HashMap::new());
        }
        Ok(serde_json::from_str(&text)?)
    }

    fn save(&self, profiles: &StoredProfiles) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // One temp file per write so concurrent saves never rename each other's file.
        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = self
            .path
            .with_extension(format!("json.{}.{}.tmp", std::process::id(), seq));
        std::fs::write(&tmp, serde_json::to_vec(profiles)?)?;
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

/// In-process store, used when durability is disabled and in tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    profiles: Mutex<StoredProfiles>,
}

impl MemoryStore {
    pub fn with_entries(entries: StoredProfiles) -> Self {
        Self {
            profiles: Mutex::new(entries),
        }
    }

    pub fn snapshot(&self) -> StoredProfiles {
        self.profiles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl ProfileStore for MemoryStore {
    fn load(&self) -> Result<StoredProfiles> {
        Ok(self.snapshot())
    }

    fn save(&self, profiles: &StoredProfiles) -> Result<()> {
        *self.profiles.lock().unwrap_or_else(|p| p.into_inner()) = profiles.clone();
        Ok(())
    }
}

/// Seed the cache from the store, discarding entries older than the profile TTL.
///
/// Returns the number of profiles restored.
pub fn restore_profiles(cache: &MarketCache, store: &dyn ProfileStore) -> usize {
    let stored = match store.load() {
        Ok(stored) => stored,
        Err(e) => {
            warn!("Failed to read profile store, starting cold: {}", e);
            return 0;
        }
    };

    let now = cache.now();
    let ttl = cache.ttl(crate::domain::DataKind::Profile);
    let mut restored = 0;
    let mut expired = 0;

    for (symbol, entry) in stored {
        let Some(fetched_at) = from_millis(entry.fetched_at) else {
            expired += 1;
            continue;
        };
        if now - fetched_at >= ttl {
            expired += 1;
            continue;
        }
        let mut profile = entry.data;
        profile.symbol = symbol;
        if profile.logo.is_none() {
            profile.logo = entry.logo;
        }
        cache.seed_profile(profile, fetched_at);
        restored += 1;
    }

    info!(restored, expired, "Restored cached profiles");
    restored
}

/// Write every cached profile back to the store.
///
/// The snapshot is taken on first poll; the write runs on the blocking pool.
pub async fn persist_profiles(cache: &MarketCache, store: Arc<dyn ProfileStore>) {
    let entries = snapshot(cache);
    let count = entries.len();

    match tokio::task::spawn_blocking(move || store.save(&entries)).await {
        Ok(Ok(())) => debug!(count, "Persisted profile store"),
        Ok(Err(e)) => warn!("Failed to persist profile store: {}", e),
        Err(e) => warn!("Profile store write task failed: {}", e),
    }
}

fn snapshot(cache: &MarketCache) -> StoredProfiles {
    cache
        .profile_entries()
        .into_iter()
        .map(|(symbol, entry)| {
            let logo = entry.data.logo.clone();
            (
                symbol,
                StoredProfile {
                    data: entry.data,
                    logo,
                    fetched_at: entry.fetched_at.timestamp_millis(),
                },
            )
        })
        .collect()
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}
