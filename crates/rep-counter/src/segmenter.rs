//! Repetition segmentation with hysteresis thresholds.
//!
//! The scan starts in the UP phase. A sample at or below `down_threshold`
//! opens a segment (DOWN); a later sample at or above `up_threshold` closes
//! it (UP). Samples between the two thresholds never change phase, so noise
//! around a single cutoff cannot re-trigger a repetition. A segment still
//! open when the sequence ends is dropped.

use serde::{Deserialize, Serialize};
use shared::AngleSample;
use thiserror::Error;
use tracing::debug;

/// Invalid threshold pair
#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("down threshold ({down}) must be below up threshold ({up})")]
pub struct ThresholdError {
    pub down: f64,
    pub up: f64,
}

/// Hysteresis thresholds, in degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmenterConfig {
    down_threshold: f64,
    up_threshold: f64,
}

impl SegmenterConfig {
    pub const DEFAULT_DOWN: f64 = 90.0;
    pub const DEFAULT_UP: f64 = 160.0;

    pub fn new(down_threshold: f64, up_threshold: f64) -> Result<Self, ThresholdError> {
        // Written so that NaN thresholds are rejected too
        if !(down_threshold < up_threshold) {
            return Err(ThresholdError {
                down: down_threshold,
                up: up_threshold,
            });
        }

        Ok(Self {
            down_threshold,
            up_threshold,
        })
    }

    pub fn down_threshold(&self) -> f64 {
        self.down_threshold
    }

    pub fn up_threshold(&self) -> f64 {
        self.up_threshold
    }
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            down_threshold: Self::DEFAULT_DOWN,
            up_threshold: Self::DEFAULT_UP,
        }
    }
}

/// One completed repetition
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RepSegment {
    /// Timestamp of the sample that crossed the down threshold
    pub start_time: f64,
    /// Timestamp of the first sample holding `min_angle`
    pub bottom_time: f64,
    /// Timestamp of the sample that crossed the up threshold
    pub end_time: f64,
    pub min_angle: f64,
    pub max_angle: f64,
}

enum Phase {
    Up,
    Down(OpenSegment),
}

struct OpenSegment {
    start_time: f64,
    bottom_time: f64,
    min_angle: f64,
    max_angle: f64,
}

impl OpenSegment {
    fn open(sample: &AngleSample) -> Self {
        Self {
            start_time: sample.timestamp,
            bottom_time: sample.timestamp,
            min_angle: sample.angle,
            max_angle: sample.angle,
        }
    }

    fn observe(&mut self, sample: &AngleSample) {
        // Strict comparison: on ties the first minimum keeps the bottom
        if sample.angle < self.min_angle {
            self.min_angle = sample.angle;
            self.bottom_time = sample.timestamp;
        }
        if sample.angle > self.max_angle {
            self.max_angle = sample.angle;
        }
    }

    fn close(self, end_time: f64) -> RepSegment {
        RepSegment {
            start_time: self.start_time,
            bottom_time: self.bottom_time,
            end_time,
            min_angle: self.min_angle,
            max_angle: self.max_angle,
        }
    }
}

/// Segment an angle sequence into completed repetitions, in order
pub fn segment_reps(samples: &[AngleSample], config: &SegmenterConfig) -> Vec<RepSegment> {
    let mut segments = Vec::new();
    let mut phase = Phase::Up;

    for sample in samples {
        phase = match phase {
            Phase::Up if sample.angle <= config.down_threshold => {
                Phase::Down(OpenSegment::open(sample))
            }
            Phase::Up => Phase::Up,
            Phase::Down(mut open) => {
                // The closing sample counts towards the max as well
                open.observe(sample);
                if sample.angle >= config.up_threshold {
                    segments.push(open.close(sample.timestamp));
                    Phase::Up
                } else {
                    Phase::Down(open)
                }
            }
        };
    }

    if let Phase::Down(open) = phase {
        debug!(
            start_time = open.start_time,
            min_angle = open.min_angle,
            "Dropping repetition that never returned above the up threshold"
        );
    }

    segments
}

/// Count completed repetitions without building segments
///
/// Always equal to `segment_reps(samples, config).len()`.
pub fn count_reps(samples: &[AngleSample], config: &SegmenterConfig) -> usize {
    let mut down = false;
    let mut reps = 0;

    for sample in samples {
        if !down && sample.angle <= config.down_threshold {
            down = true;
        } else if down && sample.angle >= config.up_threshold {
            reps += 1;
            down = false;
        }
    }

    reps
}
