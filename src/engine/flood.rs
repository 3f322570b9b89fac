//! Sliding-window send budget.
//!
//! The gate penalizes clients that exceed a message rate, so the engine
//! meters itself before the venue has to. Timestamps of recent sends live in
//! a fixed ring; anything older than the window is evicted on access.
//! Eviction is O(evicted), amortized O(1) per add.
//!
//! Not thread-safe. The quoting engine owns the only instance and drives it
//! from its single executor task.

pub struct FloodTracker {
    window: Vec<u64>,
    head: usize,
    count: usize,
    period_ns: u64,
}

impl FloodTracker {
    pub fn new(capacity: usize, period_ns: u64) -> Self {
        Self {
            window: vec![0; capacity],
            head: 0,
            count: 0,
            period_ns,
        }
    }

    fn evict(&mut self, now: u64) {
        let horizon = now.saturating_sub(self.period_ns);
        while self.count > 0 && self.window[self.head] < horizon {
            self.head = (self.head + 1) % self.window.len();
            self.count -= 1;
        }
    }

    /// How many more events fit in the window ending at `now`.
    pub fn available(&mut self, now: u64) -> usize {
        self.evict(now);
        self.window.len() - self.count
    }

    /// Record an event at `now`. Returns false, leaving state untouched,
    /// when the window is already full.
    pub fn add(&mut self, now: u64) -> bool {
        self.evict(now);
        if self.count == self.window.len() {
            return false;
        }
        let tail = (self.head + self.count) % self.window.len();
        self.window[tail] = now;
        self.count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: u64 = 1_000_000_000;

    #[test]
    fn test_capacity_enforced_within_window() {
        let mut tracker = FloodTracker::new(3, SECOND);
        assert!(tracker.add(0));
        assert!(tracker.add(1));
        assert!(tracker.add(2));
        assert!(!tracker.add(3));
        assert_eq!(tracker.available(3), 0);
    }

    #[test]
    fn test_eviction_frees_capacity() {
        let mut tracker = FloodTracker::new(2, SECOND);
        assert!(tracker.add(0));
        assert!(tracker.add(100));
        assert!(!tracker.add(200));

        // At t=SECOND+50 the event at t=0 has left the window.
        assert_eq!(tracker.available(SECOND + 50), 1);
        assert!(tracker.add(SECOND + 50));
        assert!(!tracker.add(SECOND + 60));
    }

    #[test]
    fn test_boundary_timestamp_still_counts() {
        let mut tracker = FloodTracker::new(1, SECOND);
        assert!(tracker.add(0));
        // Exactly one period later the old event is not yet strictly older.
        assert_eq!(tracker.available(SECOND), 0);
        assert_eq!(tracker.available(SECOND + 1), 1);
    }

    #[test]
    fn test_failed_add_leaves_state_unchanged() {
        let mut tracker = FloodTracker::new(1, SECOND);
        assert!(tracker.add(10));
        assert!(!tracker.add(20));
        assert!(!tracker.add(30));
        // The only stored event is still the one at t=10.
        assert_eq!(tracker.available(10 + SECOND + 1), 1);
    }

    #[test]
    fn test_at_most_capacity_accepted_in_any_window() {
        let mut tracker = FloodTracker::new(4, SECOND);
        let mut accepted: Vec<u64> = Vec::new();
        // Bursty deterministic schedule crossing several windows.
        let mut t = 0u64;
        for step in 0..200u64 {
            t += (step % 7) * 40_000_000;
            if tracker.add(t) {
                accepted.push(t);
            }
        }
        for (i, &ts) in accepted.iter().enumerate() {
            let in_window = accepted[..=i]
                .iter()
                .filter(|&&prev| prev + SECOND >= ts)
                .count();
            assert!(in_window <= 4, "window ending at {ts} holds {in_window}");
        }
    }

    #[test]
    fn test_never_reports_more_than_capacity() {
        let mut tracker = FloodTracker::new(3, SECOND);
        assert_eq!(tracker.available(0), 3);
        tracker.add(5);
        assert_eq!(tracker.available(10 * SECOND), 3);
    }
}
