//! Per-priority sliding-window send limits

use ehub_core::Priority;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::ThrottleLimits;

/// Sliding log of send times, one per priority class.
///
/// A message is admitted only while fewer than the class limit were admitted
/// in the trailing window. Rejections are drops, never queued.
#[derive(Debug)]
pub struct PriorityThrottle {
    window: Duration,
    limits: ThrottleLimits,
    logs: [VecDeque<Instant>; 4],
}

fn slot(priority: Priority) -> usize {
    priority as usize
}

impl PriorityThrottle {
    pub fn new(limits: ThrottleLimits, window: Duration) -> Self {
        Self {
            window,
            limits,
            logs: Default::default(),
        }
    }

    pub fn limit(&self, priority: Priority) -> usize {
        match priority {
            Priority::Critical => self.limits.critical,
            Priority::High => self.limits.high,
            Priority::Normal => self.limits.normal,
            Priority::Low => self.limits.low,
        }
    }

    pub fn try_acquire(&mut self, priority: Priority, now: Instant) -> bool {
        let limit = self.limit(priority);
        let window = self.window;
        let log = &mut self.logs[slot(priority)];
        while log
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= window)
        {
            log.pop_front();
        }
        if log.len() >= limit {
            return false;
        }
        log.push_back(now);
        true
    }

    /// Sends admitted for `priority` within the trailing window
    pub fn in_window(&self, priority: Priority, now: Instant) -> usize {
        self.logs[slot(priority)]
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < self.window)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_are_per_class() {
        let mut throttle = PriorityThrottle::new(ThrottleLimits::default(), Duration::from_secs(60));
        let now = Instant::now();

        let normal = (0..40).filter(|_| throttle.try_acquire(Priority::Normal, now)).count();
        assert_eq!(normal, 30);
        // a saturated normal class leaves the others untouched
        let low = (0..40).filter(|_| throttle.try_acquire(Priority::Low, now)).count();
        assert_eq!(low, 10);
        assert!(throttle.try_acquire(Priority::Critical, now));
        assert_eq!(throttle.in_window(Priority::Normal, now), 30);
    }

    #[test]
    fn test_window_slides() {
        let mut throttle = PriorityThrottle::new(ThrottleLimits::default(), Duration::from_secs(60));
        let start = Instant::now();
        for i in 0..10 {
            assert!(throttle.try_acquire(Priority::Low, start + Duration::from_secs(i)));
        }
        assert!(!throttle.try_acquire(Priority::Low, start + Duration::from_secs(30)));
        // the first send ages out at t=60, only one slot opens
        assert!(throttle.try_acquire(Priority::Low, start + Duration::from_secs(60)));
        assert!(!throttle.try_acquire(Priority::Low, start + Duration::from_secs(60)));
    }
}
