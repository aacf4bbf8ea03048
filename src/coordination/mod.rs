//! Coordination layer for network access
//!
//! - Priority scheduler with concurrency cap and dispatch spacing
//! - Global rate-limit cooldown gate
//! - Explicit backoff state machine

pub mod backoff;
pub mod rate_limit;
pub mod scheduler;

pub use backoff::{Backoff, BackoffPolicy, BackoffState};
pub use rate_limit::RateLimitGate;
pub use scheduler::{FetchJob, QueueEntry, Scheduler, WorkQueue};
