//! Sliding-window action governor.
//!
//! Caps how many actions may happen inside a trailing window. Used to stop
//! alert storms and to bound remediation attempts.

use std::collections::VecDeque;
use tokio::time::{Duration, Instant};

#[derive(Debug)]
pub struct SlidingWindowGovernor {
    max_actions: usize,
    window: Duration,
    history: VecDeque<Instant>,
}

impl SlidingWindowGovernor {
    pub fn new(max_actions: usize, window: Duration) -> Self {
        Self {
            max_actions,
            window,
            history: VecDeque::with_capacity(max_actions),
        }
    }

    pub fn allow_action(&mut self) -> bool {
        self.allow_action_at(Instant::now())
    }

    /// Records an action at `now` if the window still has room.
    pub fn allow_action_at(&mut self, now: Instant) -> bool {
        self.evict_expired(now);
        if self.history.len() < self.max_actions {
            self.history.push_back(now);
            true
        } else {
            false
        }
    }

    /// Gives back the slot taken at `at`, for an action that never happened.
    pub fn refund(&mut self, at: Instant) -> bool {
        match self.history.iter().rposition(|&t| t == at) {
            Some(pos) => {
                self.history.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn in_window(&mut self, now: Instant) -> usize {
        self.evict_expired(now);
        self.history.len()
    }

    fn evict_expired(&mut self, now: Instant) {
        while self
            .history
            .front()
            .is_some_and(|&t| now.duration_since(t) >= self.window)
        {
            self.history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_governor_limits_bursts() {
        let mut gov = SlidingWindowGovernor::new(2, Duration::from_secs(60));
        let now = Instant::now();
        assert!(gov.allow_action_at(now));
        assert!(gov.allow_action_at(now));
        assert!(!gov.allow_action_at(now));
    }

    #[test]
    fn test_window_slides() {
        let mut gov = SlidingWindowGovernor::new(1, Duration::from_secs(60));
        let start = Instant::now();
        assert!(gov.allow_action_at(start));
        assert!(!gov.allow_action_at(start + Duration::from_secs(59)));
        assert!(gov.allow_action_at(start + Duration::from_secs(60)));
        assert_eq!(gov.in_window(start + Duration::from_secs(61)), 1);
    }

    #[test]
    fn test_refund_frees_the_slot() {
        let mut gov = SlidingWindowGovernor::new(1, Duration::from_secs(60));
        let start = Instant::now();
        assert!(gov.allow_action_at(start));
        assert!(gov.refund(start));
        assert!(!gov.refund(start));
        assert!(gov.allow_action_at(start + Duration::from_secs(1)));
        assert!(!gov.allow_action_at(start + Duration::from_secs(2)));
    }
}
