//! Global rate-limit cooldown shared by the fetcher and the scheduler.
//!
//! Any 429 pushes the cooldown deadline out; while it is in the future the
//! scheduler dispatches nothing. The cooldown doubles per consecutive hit.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct GateState {
    until: Option<Instant>,
    consecutive_hits: u32,
}

#[derive(Debug)]
pub struct RateLimitGate {
    state: Mutex<GateState>,
    base: Duration,
    max: Duration,
}

impl RateLimitGate {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            base,
            max,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Rate limit gate mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Record a 429 and extend the cooldown. Returns the cooldown applied.
    pub fn record_rate_limit(&self) -> Duration {
        let mut state = self.lock();
        state.consecutive_hits = state.consecutive_hits.saturating_add(1);

        let exp = (state.consecutive_hits - 1).min(30);
        let cooldown = self.base.saturating_mul(1u32 << exp).min(self.max);

        let candidate = Instant::now() + cooldown;
        state.until = Some(match state.until {
            Some(existing) if existing > candidate => existing,
            _ => candidate,
        });

        warn!(
            hits = state.consecutive_hits,
            cooldown_ms = cooldown.as_millis() as u64,
            "Rate limited; pausing all dispatch"
        );
        cooldown
    }

    /// A request went through; the next 429 starts from the base cooldown again.
    pub fn record_success(&self) {
        let mut state = self.lock();
        if state.consecutive_hits > 0 {
            debug!(hits = state.consecutive_hits, "Rate limit streak cleared");
        }
        state.consecutive_hits = 0;
    }

    pub fn consecutive_hits(&self) -> u32 {
        self.lock().consecutive_hits
    }

    pub fn cooldown_until(&self) -> Option<Instant> {
        self.lock().until
    }

    /// Time left in the current cooldown, if any.
    pub fn remaining(&self) -> Option<Duration> {
        let until = self.lock().until?;
        let now = Instant::now();
        (until > now).then(|| until - now)
    }

    pub fn is_cooling_down(&self) -> bool {
        self.remaining().is_some()
    }

    /// Sleep until no cooldown is active.
    pub async fn wait(&self) {
        while let Some(left) = self.remaining() {
            debug!(wait_ms = left.as_millis() as u64, "Waiting out rate-limit cooldown");
            tokio::time::sleep(left).await;
        }
    }
}
