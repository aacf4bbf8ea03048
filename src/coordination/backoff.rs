//! Exponential backoff as an explicit state machine.
//!
//! `Idle -> Waiting(attempt) -> Retrying -> ... -> Exhausted`. Delays are
//! computed from the attempt number and an injected jitter sample, so bounds
//! can be checked without timers.

use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry (before jitter)
    pub base: Duration,
    /// No single delay exceeds this
    pub max: Duration,
    /// Total attempts allowed, including the first. `u32::MAX` means unbounded.
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn unbounded(base: Duration, max: Duration) -> Self {
        Self::new(base, max, u32::MAX)
    }

    /// Delay before retry number `retry` (1-based) for a jitter sample in `[0, 1)`.
    ///
    /// The raw delay doubles per retry; jitter adds up to half of it. Since the
    /// next raw delay is twice the current one, delays never decrease.
    pub fn delay_for(&self, retry: u32, jitter: f64) -> Duration {
        let exp = retry.saturating_sub(1).min(30);
        let raw = self.base.saturating_mul(1u32 << exp);
        let jitter = jitter.clamp(0.0, 0.999_999);
        let extra = raw.mul_f64(jitter / 2.0);
        raw.saturating_add(extra).min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffState {
    Idle,
    Waiting { attempt: u32, delay: Duration },
    Retrying { attempt: u32 },
    Exhausted { attempts: u32 },
}

impl fmt::Display for BackoffState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffState::Idle => write!(f, "idle"),
            BackoffState::Waiting { attempt, delay } => {
                write!(f, "waiting(attempt={}, delay={:?})", attempt, delay)
            }
            BackoffState::Retrying { attempt } => write!(f, "retrying(attempt={})", attempt),
            BackoffState::Exhausted { attempts } => write!(f, "exhausted({})", attempts),
        }
    }
}

pub type JitterSource = Box<dyn FnMut() -> f64 + Send>;

pub struct Backoff {
    policy: BackoffPolicy,
    state: BackoffState,
    failures: u32,
    jitter: JitterSource,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self::with_jitter(policy, Box::new(|| rand::random::<f64>()))
    }

    pub fn with_jitter(policy: BackoffPolicy, jitter: JitterSource) -> Self {
        Self {
            policy,
            state: BackoffState::Idle,
            failures: 0,
            jitter,
        }
    }

    pub fn state(&self) -> BackoffState {
        self.state
    }

    /// Failures recorded since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failed attempt.
    ///
    /// Returns the delay to wait before retrying, or `None` once the attempt
    /// ceiling is reached.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.policy.max_attempts {
            self.state = BackoffState::Exhausted {
                attempts: self.failures,
            };
            return None;
        }
        let delay = self.policy.delay_for(self.failures, (self.jitter)());
        self.state = BackoffState::Waiting {
            attempt: self.failures,
            delay,
        };
        Some(delay)
    }

    /// The wait elapsed and the next attempt is starting.
    pub fn begin_retry(&mut self) {
        if let BackoffState::Waiting { attempt, .. } = self.state {
            self.state = BackoffState::Retrying { attempt };
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.state = BackoffState::Idle;
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backoff")
            .field("policy", &self.policy)
            .field("state", &self.state)
            .field("failures", &self.failures)
            .finish()
    }
}
