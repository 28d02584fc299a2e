//! Feedback report synthesis.
//!
//! Overall status is a pure count threshold. Amplitude is judged per
//! repetition against fixed clinical cutoffs, independent of the segmenter
//! thresholds, and only affects that repetition's note.

use crate::segmenter::RepSegment;
use shared::{FeedbackReport, JobKey, RepDetail, ReportStatus};

/// Deepest angle that still counts as a full flexion
pub const ADEQUATE_MIN_ANGLE: f64 = 90.0;
/// Shallowest angle that still counts as a full extension
pub const ADEQUATE_MAX_ANGLE: f64 = 160.0;

/// Default minimum number of repetitions for a successful execution
pub const DEFAULT_MIN_REPS: usize = 2;

/// Amplitude note for one repetition
///
/// Angles are reported unrounded so the clinician sees the measured values.
pub fn amplitude_note(segment: &RepSegment) -> String {
    if segment.min_angle <= ADEQUATE_MIN_ANGLE && segment.max_angle >= ADEQUATE_MAX_ANGLE {
        "adequate amplitude".to_string()
    } else {
        format!(
            "reduced amplitude (min={:?}, max={:?})",
            segment.min_angle, segment.max_angle
        )
    }
}

/// Build the terminal report for a completed analysis
pub fn synthesize(segments: &[RepSegment], min_reps: usize, key: &JobKey) -> FeedbackReport {
    let reps = segments.len();

    let rep_details: Vec<RepDetail> = segments
        .iter()
        .enumerate()
        .map(|(i, segment)| RepDetail {
            rep_index: i + 1,
            start_time: segment.start_time,
            bottom_time: segment.bottom_time,
            end_time: segment.end_time,
            min_angle: segment.min_angle,
            max_angle: segment.max_angle,
            note: amplitude_note(segment),
        })
        .collect();

    let mut observations: Vec<String> = rep_details
        .iter()
        .map(|detail| format!("Rep {}: {}", detail.rep_index, detail.note))
        .collect();

    // The summary line is always shown first
    let (status, summary) = if reps >= min_reps {
        (ReportStatus::Success, format!("detected repetitions: {}", reps))
    } else {
        (
            ReportStatus::Failure,
            format!("insufficient repetitions: {} (<{})", reps, min_reps),
        )
    };
    observations.insert(0, summary);

    let mut report = FeedbackReport::queued(key);
    report.status = status;
    report.observations = observations;
    report.repetitions = reps;
    report.rep_details = rep_details;
    report.progress = 100;
    report
}
