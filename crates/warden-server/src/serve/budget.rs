//! Request-count based worker recycling.

use crate::config::WorkersConfig;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Counts served requests against a threshold fixed at worker start.
///
/// Jitter spreads the thresholds of sibling workers so they are not all
/// recycled at once.
#[derive(Debug)]
pub struct RequestBudget {
    threshold: u64,
    served: AtomicU64,
    exhausted: AtomicBool,
}

impl RequestBudget {
    /// Budget for `config`, or `None` when recycling is disabled.
    pub fn from_config(config: &WorkersConfig) -> Option<Self> {
        if config.max_requests == 0 {
            return None;
        }
        let jitter = rand::thread_rng().gen_range(0..=config.max_requests_jitter);
        Some(Self::with_threshold(config.max_requests.saturating_add(jitter)))
    }

    pub fn with_threshold(threshold: u64) -> Self {
        Self {
            threshold: threshold.max(1),
            served: AtomicU64::new(0),
            exhausted: AtomicBool::new(false),
        }
    }

    /// Count one served request. Returns `true` exactly once, on the request
    /// that reaches the threshold.
    pub fn record(&self) -> bool {
        let served = self.served.fetch_add(1, Ordering::SeqCst) + 1;
        served >= self.threshold && !self.exhausted.swap(true, Ordering::SeqCst)
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn served(&self) -> u64 {
        self.served.load(Ordering::SeqCst)
    }
}
