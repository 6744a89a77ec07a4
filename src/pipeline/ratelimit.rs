use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const RATE_WINDOW: Duration = Duration::from_secs(10);
pub const RATE_CEILING_CHARS: usize = 50_000;

/// Sliding-window character budget shared by every session in the process.
/// Admission records are appended in non-decreasing time order, so expiry
/// is head truncation only. Rejected admissions leave no trace; there is no
/// queue, dropping is the backpressure policy.
pub struct RateLimiter {
    window: Duration,
    ceiling: usize,
    records: VecDeque<(Instant, usize)>,
}

impl RateLimiter {
    pub fn new(window: Duration, ceiling: usize) -> Self {
        Self {
            window,
            ceiling,
            records: VecDeque::new(),
        }
    }

    pub fn try_admit(&mut self, chars: usize) -> bool {
        self.try_admit_at(Instant::now(), chars)
    }

    pub fn remaining(&mut self) -> usize {
        self.remaining_at(Instant::now())
    }

    pub(crate) fn try_admit_at(&mut self, now: Instant, chars: usize) -> bool {
        self.truncate_head(now);
        let used: usize = self.records.iter().map(|&(_, c)| c).sum();
        if used + chars > self.ceiling {
            return false;
        }
        self.records.push_back((now, chars));
        true
    }

    pub(crate) fn remaining_at(&mut self, now: Instant) -> usize {
        self.truncate_head(now);
        let used: usize = self.records.iter().map(|&(_, c)| c).sum();
        self.ceiling.saturating_sub(used)
    }

    fn truncate_head(&mut self, now: Instant) {
        while let Some(&(t, _)) = self.records.front() {
            if now.duration_since(t) > self.window {
                self.records.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RATE_WINDOW, RATE_CEILING_CHARS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_exactly_the_admission_that_would_exceed() {
        let mut rl = RateLimiter::new(Duration::from_secs(10), 100);
        let t0 = Instant::now();
        assert!(rl.try_admit_at(t0, 60));
        assert!(!rl.try_admit_at(t0 + Duration::from_millis(10), 60));
        // A smaller admission that still fits is accepted.
        assert!(rl.try_admit_at(t0 + Duration::from_millis(20), 40));
    }

    #[test]
    fn rejection_has_no_side_effects() {
        let mut rl = RateLimiter::new(Duration::from_secs(10), 100);
        let t0 = Instant::now();
        assert!(rl.try_admit_at(t0, 80));
        assert!(!rl.try_admit_at(t0, 30));
        assert_eq!(rl.remaining_at(t0), 20);
    }

    #[test]
    fn window_expiry_restores_budget() {
        let mut rl = RateLimiter::new(Duration::from_secs(10), 100);
        let t0 = Instant::now();
        assert!(rl.try_admit_at(t0, 100));
        assert!(!rl.try_admit_at(t0 + Duration::from_secs(5), 1));
        assert!(rl.try_admit_at(t0 + Duration::from_secs(11), 100));
    }

    #[test]
    fn windowed_total_never_exceeds_ceiling() {
        let mut rl = RateLimiter::new(Duration::from_secs(10), 100);
        let t0 = Instant::now();
        let mut admitted = 0usize;
        for i in 0..50 {
            if rl.try_admit_at(t0 + Duration::from_millis(i), 7) {
                admitted += 7;
            }
        }
        assert!(admitted <= 100);
        assert_eq!(admitted, 98);
    }

    #[test]
    fn oversized_single_request_is_rejected() {
        let mut rl = RateLimiter::new(Duration::from_secs(10), 100);
        assert!(!rl.try_admit_at(Instant::now(), 101));
    }
}
