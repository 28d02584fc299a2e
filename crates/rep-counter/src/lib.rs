//! Repetition analysis for joint-angle signals.
//!
//! This library turns a timestamped joint-angle sequence into completed
//! repetitions and a clinician-facing feedback report:
//! - `angle`: joint angle from three landmark points
//! - `segmenter`: hysteresis state machine that segments repetitions
//! - `feedback`: report synthesis with per-repetition amplitude notes

pub mod angle;
pub mod feedback;
pub mod segmenter;

pub use angle::compute_angle;
pub use feedback::{amplitude_note, synthesize};
pub use segmenter::{count_reps, segment_reps, RepSegment, SegmenterConfig, ThresholdError};
