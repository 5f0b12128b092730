//! Reconnect delay schedule.
//!
//! `delay = min(2 * delay + step, max)`, and the delay actually slept is a
//! random 50–100% of that so that clients dropped together do not reconnect
//! in lockstep.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct Backoff {
    step: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(step: Duration, max: Duration) -> Self {
        Self {
            step,
            max,
            current: Duration::ZERO,
        }
    }

    /// Advance the schedule and return the un-jittered delay.
    pub fn advance(&mut self) -> Duration {
        self.current = (self.current * 2 + self.step).min(self.max);
        self.current
    }

    /// Advance the schedule and return the delay to sleep.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.advance();
        base.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}
