// =============================================================================
// Provider rate limiter — leaky bucket over a rolling window
// =============================================================================
//
// One bucket per upstream provider. `acquire` blocks (asynchronously) until a
// slot frees up, so callers can never exceed the provider's budget; a caller
// waits at most one full window. Draws are exclusive: the timestamp deque is
// updated under a single lock.
//
// Budget usage is exposed as a snapshot for observability.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Leaky-bucket limiter: at most `capacity` draws per rolling `window`.
pub struct RateLimiter {
    name: &'static str,
    capacity: usize,
    window: Duration,
    stamps: Mutex<VecDeque<Instant>>,
    total_draws: AtomicU64,
}

/// Point-in-time budget usage for one provider.
#[derive(Debug, Clone, Serialize)]
pub struct RateBudgetSnapshot {
    pub provider: String,
    pub in_window: usize,
    pub capacity: usize,
    pub window_secs: u64,
    pub total_draws: u64,
}

impl RateLimiter {
    pub fn new(name: &'static str, capacity: usize, window: Duration) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            window,
            stamps: Mutex::new(VecDeque::new()),
            total_draws: AtomicU64::new(0),
        }
    }

    /// Take one slot immediately if the bucket has room.
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut stamps = self.stamps.lock();
        Self::drain_expired(&mut stamps, now, self.window);

        if stamps.len() < self.capacity {
            stamps.push_back(now);
            self.total_draws.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Take one slot, sleeping until the oldest in-window draw ages out if
    /// the bucket is full. Waits at most one window per full bucket.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let now = Instant::now();
                let mut stamps = self.stamps.lock();
                Self::drain_expired(&mut stamps, now, self.window);

                if stamps.len() < self.capacity {
                    stamps.push_back(now);
                    self.total_draws.fetch_add(1, Ordering::Relaxed);
                    return;
                }

                // Oldest stamp decides when the next slot opens.
                let oldest = *stamps.front().expect("full bucket has a front");
                (oldest + self.window).saturating_duration_since(now)
            };

            warn!(
                provider = self.name,
                wait_ms = wait.as_millis() as u64,
                "rate budget exhausted — waiting for a slot"
            );
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    pub fn snapshot(&self) -> RateBudgetSnapshot {
        let now = Instant::now();
        let mut stamps = self.stamps.lock();
        Self::drain_expired(&mut stamps, now, self.window);

        let snap = RateBudgetSnapshot {
            provider: self.name.to_string(),
            in_window: stamps.len(),
            capacity: self.capacity,
            window_secs: self.window.as_secs(),
            total_draws: self.total_draws.load(Ordering::Relaxed),
        };
        debug!(provider = self.name, in_window = snap.in_window, "rate budget snapshot");
        snap
    }

    fn drain_expired(stamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(front) = stamps.front() {
            if now.duration_since(*front) >= window {
                stamps.pop_front();
            } else {
                break;
            }
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("window", &self.window)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_acquire_honours_capacity() {
        let limiter = RateLimiter::new("test", 3, Duration::from_secs(60));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_the_window_to_roll() {
        let limiter = RateLimiter::new("test", 2, Duration::from_secs(10));
        limiter.acquire().await;
        limiter.acquire().await;

        let before = Instant::now();
        limiter.acquire().await; // must sleep ~10s of virtual time
        let waited = Instant::now().duration_since(before);
        assert!(waited >= Duration::from_secs(9), "waited only {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn slots_free_up_as_stamps_age_out() {
        let limiter = RateLimiter::new("test", 1, Duration::from_secs(5));
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(limiter.try_acquire());
    }

    #[test]
    fn snapshot_reports_usage() {
        let limiter = RateLimiter::new("test", 10, Duration::from_secs(60));
        limiter.try_acquire();
        limiter.try_acquire();
        let snap = limiter.snapshot();
        assert_eq!(snap.in_window, 2);
        assert_eq!(snap.capacity, 10);
        assert_eq!(snap.total_draws, 2);
        assert_eq!(snap.provider, "test");
    }
}
