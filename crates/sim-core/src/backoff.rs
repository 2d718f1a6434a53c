use std::time::{Duration, Instant};

/// Bounded exponential backoff: the delay doubles after every consecutive
/// failure up to `cap` and resets on the first success.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    cap: Duration,
    factor: u32,
    failures: u32,
    until: Option<Instant>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl Backoff {
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            initial,
            cap,
            factor: 2,
            failures: 0,
            until: None,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Delay that the next failure will arm.
    pub fn next_delay(&self) -> Duration {
        let mut delay = self.initial;
        for _ in 0..self.failures {
            delay = delay.saturating_mul(self.factor);
            if delay >= self.cap {
                return self.cap;
            }
        }
        delay.min(self.cap)
    }

    /// Records a failure and returns the delay before the next attempt.
    pub fn fail(&mut self) -> Duration {
        let delay = self.next_delay();
        self.failures = self.failures.saturating_add(1);
        self.until = Some(Instant::now() + delay);
        delay
    }

    pub fn succeed(&mut self) {
        self.failures = 0;
        self.until = None;
    }

    /// True while the current backoff window has not elapsed.
    pub fn is_waiting(&self) -> bool {
        self.until.map(|t| Instant::now() < t).unwrap_or(false)
    }
}
