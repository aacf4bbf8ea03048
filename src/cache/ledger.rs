//! In-flight ledger: at most one outstanding fetch per (symbol, kind).

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{trace, warn};

use crate::domain::DataKind;

type Key = (String, DataKind);

#[derive(Debug, Default)]
pub struct InFlightLedger {
    claimed: Mutex<HashSet<Key>>,
}

impl InFlightLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<Key>> {
        self.claimed.lock().unwrap_or_else(|poisoned| {
            warn!("In-flight ledger mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Reserve the slot for `(symbol, kind)`.
    ///
    /// `None` means a fetch is already running; wait for its bus event
    /// instead of issuing a second call. The slot frees when the returned
    /// claim drops, whatever the fetch outcome.
    pub fn try_claim(self: &Arc<Self>, symbol: &str, kind: DataKind) -> Option<Claim> {
        let key = (symbol.to_string(), kind);
        if !self.lock().insert(key.clone()) {
            trace!(symbol, %kind, "Fetch already in flight");
            return None;
        }
        Some(Claim {
            ledger: Arc::clone(self),
            key,
        })
    }

    pub fn is_claimed(&self, symbol: &str, kind: DataKind) -> bool {
        self.lock().contains(&(symbol.to_string(), kind))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Held for the duration of one fetch
#[derive(Debug)]
pub struct Claim {
    ledger: Arc<InFlightLedger>,
    key: Key,
}

impl Claim {
    pub fn symbol(&self) -> &str {
        &self.key.0
    }

    pub fn kind(&self) -> DataKind {
        self.key.1
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.ledger.lock().remove(&self.key);
    }
}
