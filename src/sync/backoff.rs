//! Doubling backoff with jitter.
//!
//! Startup feed-init failures retry DC selection with delays doubling
//! from the configured minimum to the maximum, plus a small random
//! jitter so restarted mirrors do not stampede one DC in lockstep.

use std::time::Duration;

use rand::Rng;

#[derive(Debug)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let min = min.max(Duration::from_millis(1));
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    /// The next delay; doubles until pinned at the maximum.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        jittered(delay)
    }

    /// Reset after a success so the next fault starts small again.
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

fn jittered(base: Duration) -> Duration {
    // Up to +10%.
    let extra = base.as_millis() as u64 / 10;
    if extra == 0 {
        return base;
    }
    let mut rng = rand::rng();
    base + Duration::from_millis(rng.random_range(0..=extra))
}
