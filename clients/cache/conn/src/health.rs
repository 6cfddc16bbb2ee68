//! Connection age and idle tracking.
//!
//! Pools expire connections on a schedule; if every connection of a pool
//! were created in the same burst they would all expire in the same burst
//! too. Each tracker therefore folds a per-connection variance of up to
//! ten percent into its expiry check so teardown spreads out.
//!
//! Timestamps are millisecond offsets from a process-wide epoch stored in
//! atomics, so a background sweep can read them without taking any lock.

use once_cell::sync::Lazy;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

// keeps timestamps well above zero so ages stay subtractable even for
// trackers created right at process start
const EPOCH_BIAS_MS: u64 = 1 << 32;

/// Milliseconds since the process-wide epoch, biased away from zero
fn monotonic_millis() -> u64 {
    EPOCH_BIAS_MS + EPOCH.elapsed().as_millis() as u64
}

/// Draw this connection's expiry variance percentage, in `[-10, 10]`.
fn expiry_variance_percentage() -> i32 {
    let drawn: i32 = rand::thread_rng().gen_range(1..=21);
    if drawn > 10 {
        drawn - 21
    } else {
        drawn
    }
}

/// Tracks one connection's creation and last-use times
#[derive(Debug)]
pub struct HealthTracker {
    created_at: AtomicU64,
    last_accessed: AtomicU64,
    variance_pct: i32,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    /// New tracker with both timestamps set to now and a freshly drawn
    /// expiry variance
    pub fn new() -> Self {
        let now = monotonic_millis();
        Self {
            created_at: AtomicU64::new(now),
            last_accessed: AtomicU64::new(now),
            variance_pct: expiry_variance_percentage(),
        }
    }

    #[cfg(test)]
    fn with_variance(variance_pct: i32) -> Self {
        let now = monotonic_millis();
        Self {
            created_at: AtomicU64::new(now),
            last_accessed: AtomicU64::new(now),
            variance_pct,
        }
    }

    /// Record that the connection was just used
    pub fn touch(&self) {
        self.last_accessed.store(monotonic_millis(), Ordering::Relaxed);
    }

    /// Restart the connection's lifetime clock
    pub fn update_creation_time(&self) {
        let now = monotonic_millis();
        self.created_at.store(now, Ordering::Relaxed);
        self.last_accessed.store(now, Ordering::Relaxed);
    }

    /// Whether the connection has outlived `expiry`, with this tracker's
    /// variance applied. A zero expiry disables the check.
    pub fn has_expired(&self, expiry: Duration) -> bool {
        if expiry.is_zero() {
            return false;
        }
        let base_ms = expiry.as_millis() as i64;
        let adjusted_ms = base_ms + base_ms * i64::from(self.variance_pct) / 100;
        let age_ms = monotonic_millis().saturating_sub(self.created_at.load(Ordering::Relaxed));
        age_ms as i64 > adjusted_ms
    }

    /// Whether the connection has been unused for longer than `idle`.
    /// A zero limit disables the check.
    pub fn is_idle(&self, idle: Duration) -> bool {
        if idle.is_zero() {
            return false;
        }
        let unused_ms =
            monotonic_millis().saturating_sub(self.last_accessed.load(Ordering::Relaxed));
        unused_ms > idle.as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backdate(slot: &AtomicU64, by: Duration) {
        let now = monotonic_millis();
        slot.store(now.saturating_sub(by.as_millis() as u64), Ordering::Relaxed);
    }

    #[test]
    fn test_variance_bounds() {
        for _ in 0..1000 {
            let variance = expiry_variance_percentage();
            assert!((-10..=10).contains(&variance), "variance {variance} out of range");
        }
    }

    #[test]
    fn test_zero_durations_disable_checks() {
        let tracker = HealthTracker::new();
        backdate(&tracker.created_at, Duration::from_secs(3600));
        backdate(&tracker.last_accessed, Duration::from_secs(3600));
        assert!(!tracker.has_expired(Duration::ZERO));
        assert!(!tracker.is_idle(Duration::ZERO));
    }

    #[test]
    fn test_expiry_with_variance() {
        let tracker = HealthTracker::with_variance(10);
        backdate(&tracker.created_at, Duration::from_millis(1050));
        // adjusted expiry is 1100ms, so 1050ms of age is still fresh
        assert!(!tracker.has_expired(Duration::from_millis(1000)));

        backdate(&tracker.created_at, Duration::from_millis(1200));
        assert!(tracker.has_expired(Duration::from_millis(1000)));
    }

    #[test]
    fn test_negative_variance_shortens_expiry() {
        let tracker = HealthTracker::with_variance(-10);
        backdate(&tracker.created_at, Duration::from_millis(950));
        // adjusted expiry is 900ms
        assert!(tracker.has_expired(Duration::from_millis(1000)));
    }

    #[test]
    fn test_touch_resets_idle() {
        let tracker = HealthTracker::with_variance(0);
        backdate(&tracker.last_accessed, Duration::from_secs(60));
        assert!(tracker.is_idle(Duration::from_secs(30)));
        tracker.touch();
        assert!(!tracker.is_idle(Duration::from_secs(30)));
    }

    #[test]
    fn test_update_creation_time_resets_expiry() {
        let tracker = HealthTracker::with_variance(0);
        backdate(&tracker.created_at, Duration::from_secs(60));
        assert!(tracker.has_expired(Duration::from_secs(30)));
        tracker.update_creation_time();
        assert!(!tracker.has_expired(Duration::from_secs(30)));
    }
}
