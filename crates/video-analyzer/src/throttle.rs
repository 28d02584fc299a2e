//! Progress throttling.
//!
//! A pose program may report progress once per frame. Only a small share of
//! those ticks is worth a record in the event log: a tick is admitted when
//! its integer percentage moved forward and either the jump is large enough
//! or enough time has passed since the last admitted tick.

use std::time::{Duration, Instant};

/// Throttling thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottlePolicy {
    /// Percentage jump that is always admitted
    pub min_step: u32,
    /// Time after which any forward move is admitted
    pub min_interval: Duration,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            min_step: 5,
            min_interval: Duration::from_millis(1500),
        }
    }
}

/// Per-job progress throttle
#[derive(Debug)]
pub struct ProgressThrottle {
    policy: ThrottlePolicy,
    /// The queued record already reports 0%
    last_percent: u8,
    last_emit: Instant,
}

impl ProgressThrottle {
    /// Create a throttle for a job that started at `started`
    pub fn new(policy: ThrottlePolicy, started: Instant) -> Self {
        Self {
            policy,
            last_percent: 0,
            last_emit: started,
        }
    }

    /// Decide whether a tick becomes a progress record
    ///
    /// Returns the integer percentage to record. Percentages of 100 or more
    /// are never admitted; the terminal record reports completion.
    pub fn admit(&mut self, percent: f64, now: Instant) -> Option<u8> {
        if !percent.is_finite() {
            return None;
        }

        let percent = percent.trunc().max(0.0);
        if percent >= 100.0 {
            return None;
        }
        let percent = percent as u8;

        if percent <= self.last_percent {
            return None;
        }

        let jump = u32::from(percent - self.last_percent);
        let elapsed = now.saturating_duration_since(self.last_emit);
        if jump < self.policy.min_step && elapsed < self.policy.min_interval {
            return None;
        }

        self.last_percent = percent;
        self.last_emit = now;
        Some(percent)
    }

    /// Last admitted percentage
    pub fn last_percent(&self) -> u8 {
        self.last_percent
    }
}
