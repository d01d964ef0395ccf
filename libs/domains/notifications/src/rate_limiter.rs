//! Process-wide throttle on outbound sends.
//!
//! The limiter keeps the start instant of every grant inside the current
//! window. A token is granted only while fewer than `capacity` grants fall
//! within the trailing `window`, so no rolling window ever holds more than
//! `capacity` send starts.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Default number of sends allowed per window.
pub const DEFAULT_CAPACITY: usize = 100;

/// Default window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct RateLimiter {
    capacity: usize,
    window: Duration,
    grants: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            window,
            grants: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    pub fn per_minute(capacity: usize) -> Self {
        Self::new(capacity, DEFAULT_WINDOW)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn evict_expired(&self, grants: &mut VecDeque<Instant>, now: Instant) {
        while grants
            .front()
            .is_some_and(|granted| now.duration_since(*granted) >= self.window)
        {
            grants.pop_front();
        }
    }

    /// Take a token if one is available right now.
    pub async fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut grants = self.grants.lock().await;
        self.evict_expired(&mut grants, now);

        if grants.len() < self.capacity {
            grants.push_back(now);
            true
        } else {
            false
        }
    }

    /// Tokens that could be granted immediately.
    pub async fn available(&self) -> usize {
        let now = Instant::now();
        let mut grants = self.grants.lock().await;
        self.evict_expired(&mut grants, now);
        self.capacity - grants.len()
    }

    /// Earliest instant at which a token may become free.
    pub async fn next_available_at(&self) -> Instant {
        let now = Instant::now();
        let mut grants = self.grants.lock().await;
        self.evict_expired(&mut grants, now);

        match grants.front() {
            Some(oldest) if grants.len() >= self.capacity => *oldest + self.window,
            _ => now,
        }
    }

    /// Wait for a token until `deadline`. Returns `false` if none could be had in time.
    pub async fn acquire_until(&self, deadline: Instant) -> bool {
        loop {
            if self.try_acquire().await {
                return true;
            }

            let next = self.next_available_at().await;
            if next > deadline {
                debug!("Rate limit wait would exceed deadline");
                return false;
            }

            debug!(
                wait_ms = next.saturating_duration_since(Instant::now()).as_millis() as u64,
                "Rate limited, waiting for next token"
            );
            tokio::time::sleep_until(next).await;
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_WINDOW)
    }
}
