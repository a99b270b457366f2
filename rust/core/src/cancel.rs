//! Bounded waiting: cancellation tokens and deadlines
//!
//! Every blocking wait in the library (nameserver replies, full-ring
//! retries, lock acquisition) is bounded by a [`Deadline`] and may be
//! interrupted early through a [`CancelToken`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cooperative cancellation flag shared between threads
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; observed by all clones
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A fixed point in time a wait must not run past
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    end: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            end: Instant::now() + budget,
            budget,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.end
    }

    /// The original budget in milliseconds, for error reporting
    pub fn budget_ms(&self) -> u64 {
        self.budget.as_millis() as u64
    }
}
