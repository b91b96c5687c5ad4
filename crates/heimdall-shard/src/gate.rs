//! Process-wide admission control for IDENTIFY.
//!
//! Every shard shares one [`IdentifyGate`]. Check-and-decrement and window
//! roll-over happen under the same lock, so two shards racing for the last
//! slot cannot both win.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

/// Default identify window.
pub const DEFAULT_IDENTIFY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

const MIN_WINDOW: Duration = Duration::from_millis(1);

/// Identify allowance reported by the bootstrap fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentifyBudget {
    /// Identifies allowed per window.
    pub total: u32,
    /// Identifies left in the current window.
    pub remaining: u32,
    /// Time until the current window resets.
    pub reset_after: Duration,
}

#[derive(Debug)]
struct GateWindow {
    total: u32,
    remaining: u32,
    resets_at: Instant,
}

/// Shared identify counter with a rolling reset.
#[derive(Debug)]
pub struct IdentifyGate {
    window: Duration,
    inner: Mutex<GateWindow>,
}

impl IdentifyGate {
    /// Create a gate with the default 24 hour window.
    #[must_use]
    pub fn new(budget: IdentifyBudget) -> Self {
        Self::with_window(budget, DEFAULT_IDENTIFY_WINDOW)
    }

    /// Create a gate whose budget refills every `window` after the first
    /// reset.
    #[must_use]
    pub fn with_window(budget: IdentifyBudget, window: Duration) -> Self {
        let total = budget.total.max(budget.remaining);
        Self {
            window: window.max(MIN_WINDOW),
            inner: Mutex::new(GateWindow {
                total,
                remaining: budget.remaining,
                resets_at: Instant::now() + budget.reset_after,
            }),
        }
    }

    fn roll(&self, window: &mut GateWindow, now: Instant) {
        if window.resets_at > now {
            return;
        }
        let behind = now.duration_since(window.resets_at).as_nanos();
        let period = self.window.as_nanos();
        let into_period = Duration::from_nanos((behind % period) as u64);
        window.resets_at = now + (self.window - into_period);
        window.remaining = window.total;
        debug!(
            remaining = window.remaining,
            "identify window reset"
        );
    }

    /// Take one identify slot if any are left. Never waits.
    pub fn try_acquire(&self) -> bool {
        let mut window = self.inner.lock();
        self.roll(&mut window, Instant::now());
        if window.remaining == 0 {
            return false;
        }
        window.remaining -= 1;
        true
    }

    /// Take one identify slot, waiting for the window to reset if needed.
    pub async fn acquire(&self) {
        loop {
            let wake_at = {
                let mut window = self.inner.lock();
                self.roll(&mut window, Instant::now());
                if window.remaining > 0 {
                    window.remaining -= 1;
                    return;
                }
                window.resets_at
            };
            sleep_until(wake_at).await;
        }
    }

    /// Slots left in the current window.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        let mut window = self.inner.lock();
        self.roll(&mut window, Instant::now());
        window.remaining
    }

    /// When the current window resets.
    #[must_use]
    pub fn resets_at(&self) -> Instant {
        let mut window = self.inner.lock();
        self.roll(&mut window, Instant::now());
        window.resets_at
    }

    /// Length of one window.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn budget(total: u32, remaining: u32, reset_after_ms: u64) -> IdentifyBudget {
        IdentifyBudget {
            total,
            remaining,
            reset_after: Duration::from_millis(reset_after_ms),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_exhausts() {
        let gate = IdentifyGate::new(budget(1000, 2, 5000));
        assert!(gate.try_acquire());
        assert!(gate.try_acquire());
        assert!(!gate.try_acquire());
        assert_eq!(gate.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_refills_to_total() {
        let gate = IdentifyGate::with_window(budget(3, 0, 5000), Duration::from_secs(60));
        assert!(!gate.try_acquire());

        tokio::time::advance(Duration::from_millis(5000)).await;
        assert_eq!(gate.remaining(), 3);
        assert!(gate.try_acquire());

        let next = gate.resets_at();
        assert!(next > Instant::now());
        assert!(next <= Instant::now() + Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollover_skips_missed_windows() {
        let start = Instant::now();
        let gate = IdentifyGate::with_window(budget(1, 0, 100), Duration::from_millis(100));
        tokio::time::advance(Duration::from_millis(1050)).await;

        assert!(gate.try_acquire());
        assert_eq!(gate.resets_at(), start + Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_reset() {
        let start = Instant::now();
        let gate = IdentifyGate::new(budget(1, 0, 5000));
        gate.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(5000));
        assert_eq!(gate.remaining(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_burst_grants_exactly_budget() {
        let gate = Arc::new(IdentifyGate::new(budget(100, 7, 60_000)));
        let granted = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let gate = Arc::clone(&gate);
            let granted = Arc::clone(&granted);
            tasks.push(tokio::spawn(async move {
                if gate.try_acquire() {
                    granted.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(granted.load(Ordering::SeqCst), 7);
        assert_eq!(gate.remaining(), 0);
    }

    #[test]
    fn test_zero_window_is_clamped() {
        let gate = IdentifyGate::with_window(budget(1, 1, 0), Duration::ZERO);
        assert_eq!(gate.window(), Duration::from_millis(1));
    }
}
