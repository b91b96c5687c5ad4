//! Heartbeat bookkeeping.
//!
//! The tracker holds no timer of its own. The shard task owns the deadline
//! and asks the tracker what to do when it fires.

use std::time::Duration;

use tokio::time::Instant;

/// Outcome of a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatTick {
    /// Send a heartbeat now.
    Send,
    /// The previous heartbeat was never acknowledged.
    Missed,
}

/// Heartbeat state for one connection.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatTracker {
    interval: Option<Duration>,
    last_sent: Option<Instant>,
    last_ack: Option<Instant>,
    ack_pending: bool,
    latency: Option<Duration>,
}

impl HeartbeatTracker {
    /// Create a stopped tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking with the server's interval.
    pub fn start(&mut self, interval: Duration) {
        self.interval = Some(interval);
        self.ack_pending = false;
    }

    /// Stop tracking. Latency is kept.
    pub fn stop(&mut self) {
        self.interval = None;
        self.ack_pending = false;
    }

    /// Heartbeat interval while running.
    #[must_use]
    pub const fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Whether the heartbeat loop is running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    /// Whether the last heartbeat is still unacknowledged.
    #[must_use]
    pub const fn ack_pending(&self) -> bool {
        self.ack_pending
    }

    /// Decide what a tick should do.
    #[must_use]
    pub const fn tick(&self) -> HeartbeatTick {
        if self.ack_pending {
            HeartbeatTick::Missed
        } else {
            HeartbeatTick::Send
        }
    }

    /// Record that a heartbeat was sent.
    pub fn record_sent(&mut self, at: Instant) {
        self.last_sent = Some(at);
        self.ack_pending = true;
    }

    /// Record an acknowledgement and return the measured round trip.
    pub fn record_ack(&mut self, at: Instant) -> Option<Duration> {
        self.last_ack = Some(at);
        self.ack_pending = false;
        let rtt = self.last_sent.map(|sent| at.saturating_duration_since(sent));
        if rtt.is_some() {
            self.latency = rtt;
        }
        rtt
    }

    /// Last measured round trip.
    #[must_use]
    pub const fn latency(&self) -> Option<Duration> {
        self.latency
    }

    /// When the last acknowledgement arrived.
    #[must_use]
    pub const fn last_ack(&self) -> Option<Instant> {
        self.last_ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let tracker = HeartbeatTracker::new();
        assert!(!tracker.is_running());
        assert!(!tracker.ack_pending());
        assert_eq!(tracker.latency(), None);
        assert_eq!(tracker.tick(), HeartbeatTick::Send);
    }

    #[test]
    fn test_missed_ack_detected() {
        let mut tracker = HeartbeatTracker::new();
        tracker.start(Duration::from_millis(100));
        tracker.record_sent(Instant::now());
        assert_eq!(tracker.tick(), HeartbeatTick::Missed);
    }

    #[test]
    fn test_ack_measures_latency() {
        let mut tracker = HeartbeatTracker::new();
        tracker.start(Duration::from_millis(100));
        let sent = Instant::now();
        tracker.record_sent(sent);

        let rtt = tracker.record_ack(sent + Duration::from_millis(42));
        assert_eq!(rtt, Some(Duration::from_millis(42)));
        assert_eq!(tracker.latency(), Some(Duration::from_millis(42)));
        assert!(!tracker.ack_pending());
        assert_eq!(tracker.tick(), HeartbeatTick::Send);
    }

    #[test]
    fn test_stop_clears_pending_but_keeps_latency() {
        let mut tracker = HeartbeatTracker::new();
        tracker.start(Duration::from_secs(1));
        let sent = Instant::now();
        tracker.record_sent(sent);
        tracker.record_ack(sent + Duration::from_millis(5));
        tracker.record_sent(sent + Duration::from_secs(1));

        tracker.stop();
        assert!(!tracker.is_running());
        assert!(!tracker.ack_pending());
        assert_eq!(tracker.latency(), Some(Duration::from_millis(5)));
    }

    #[test]
    fn test_unsolicited_ack_has_no_latency() {
        let mut tracker = HeartbeatTracker::new();
        assert_eq!(tracker.record_ack(Instant::now()), None);
        assert_eq!(tracker.latency(), None);
    }
}
