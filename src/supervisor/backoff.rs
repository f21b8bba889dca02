//! Restart pacing: exponential backoff and a sliding-window circuit breaker.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::SupervisorConfig;

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Doubling delay starting at `base`, never above `cap`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            attempt: 0,
        }
    }

    /// Delay before the next restart; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Back to `base` after a sustained healthy period.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

/// Trips once `max_restarts` restarts fall inside one `window`.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    max_restarts: u32,
    window: Duration,
    restarts: VecDeque<Instant>,
}

impl CircuitBreaker {
    pub fn new(max_restarts: u32, window: Duration) -> Self {
        Self {
            max_restarts: max_restarts.max(1),
            window,
            restarts: VecDeque::new(),
        }
    }

    /// Record a restart attempt.  Returns `true` if the breaker is now open
    /// and no further automatic restart should happen.
    pub fn record(&mut self) -> bool {
        let now = Instant::now();
        self.restarts.push_back(now);
        while let Some(first) = self.restarts.front() {
            if now.duration_since(*first) > self.window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
        self.is_open()
    }

    pub fn is_open(&self) -> bool {
        self.restarts.len() as u32 >= self.max_restarts
    }

    pub fn recent(&self) -> usize {
        self.restarts.len()
    }

    pub fn reset(&mut self) {
        self.restarts.clear();
    }
}

/// Both policies built from config.
pub fn from_config(config: &SupervisorConfig) -> (Backoff, CircuitBreaker) {
    (
        Backoff::new(config.backoff_base(), config.backoff_cap()),
        CircuitBreaker::new(config.breaker_max_restarts, config.breaker_window()),
    )
}
