//! Data models for the analysis pipeline.
//!
//! This module defines the structures that flow between the pose capability,
//! the repetition analysis and the event log. `FeedbackReport` is the wire
//! record of the event log: one JSON object per line, field names fixed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One observation of the joint-angle signal
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AngleSample {
    /// Seconds since the start of the video
    pub timestamp: f64,
    /// Joint angle in degrees
    pub angle: f64,
}

impl AngleSample {
    pub fn new(timestamp: f64, angle: f64) -> Self {
        Self { timestamp, angle }
    }
}

impl From<(f64, f64)> for AngleSample {
    fn from((timestamp, angle): (f64, f64)) -> Self {
        Self { timestamp, angle }
    }
}

/// Identity of an analysis job inside the event log
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub patient_id: String,
    pub exercise_id: String,
    pub video_filename: String,
}

impl JobKey {
    pub fn new(
        patient_id: impl Into<String>,
        exercise_id: impl Into<String>,
        video_filename: impl Into<String>,
    ) -> Self {
        Self {
            patient_id: patient_id.into(),
            exercise_id: exercise_id.into(),
            video_filename: video_filename.into(),
        }
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.patient_id, self.exercise_id, self.video_filename
        )
    }
}

/// A video waiting for (or undergoing) analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub patient_id: String,
    pub exercise_id: String,
    pub video_path: PathBuf,
    /// Stored filename, used as the job key together with the ids
    pub filename: String,
    pub submitted_at: DateTime<Utc>,
}

impl AnalysisJob {
    pub fn new(
        patient_id: impl Into<String>,
        exercise_id: impl Into<String>,
        video_path: impl Into<PathBuf>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            patient_id: patient_id.into(),
            exercise_id: exercise_id.into(),
            video_path: video_path.into(),
            filename: filename.into(),
            submitted_at: Utc::now(),
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(&self.patient_id, &self.exercise_id, &self.filename)
    }
}

/// Status of a report record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReportStatus {
    Success,
    Failure,
    /// Still running, or deferred because inference is unavailable
    Pending,
    Error,
}

impl ReportStatus {
    /// Whether a record with this status ends a job
    ///
    /// `Pending` is ambiguous on its own: a deferral record is terminal too.
    pub fn is_final(&self) -> bool {
        matches!(self, ReportStatus::Success | ReportStatus::Failure | ReportStatus::Error)
    }
}

impl std::fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportStatus::Success => write!(f, "Success"),
            ReportStatus::Failure => write!(f, "Failure"),
            ReportStatus::Pending => write!(f, "Pending"),
            ReportStatus::Error => write!(f, "Error"),
        }
    }
}

impl std::str::FromStr for ReportStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Success" => Ok(ReportStatus::Success),
            "Failure" => Ok(ReportStatus::Failure),
            "Pending" => Ok(ReportStatus::Pending),
            "Error" => Ok(ReportStatus::Error),
            _ => Err(anyhow::anyhow!("Invalid report status: {}", s)),
        }
    }
}

/// Per-repetition detail included in a report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepDetail {
    /// 1-based position of the repetition
    pub rep_index: usize,
    pub start_time: f64,
    pub bottom_time: f64,
    pub end_time: f64,
    pub min_angle: f64,
    pub max_angle: f64,
    /// Amplitude adequacy note
    pub note: String,
}

/// Report record appended to the event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackReport {
    pub patient_id: String,
    pub exercise_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: ReportStatus,
    pub observations: Vec<String>,
    pub repetitions: usize,
    pub rep_details: Vec<RepDetail>,
    pub video_filename: String,
    /// Completion percentage (0..=100)
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frames_done: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frames_total: Option<u64>,
}

impl FeedbackReport {
    fn base(key: &JobKey, status: ReportStatus, observations: Vec<String>, progress: u8) -> Self {
        Self {
            patient_id: key.patient_id.clone(),
            exercise_id: key.exercise_id.clone(),
            timestamp: Utc::now(),
            status,
            observations,
            repetitions: 0,
            rep_details: Vec::new(),
            video_filename: key.video_filename.clone(),
            progress,
            frames_done: None,
            frames_total: None,
        }
    }

    /// Record written at submission time, before any worker picks the job up
    pub fn queued(key: &JobKey) -> Self {
        Self::base(
            key,
            ReportStatus::Pending,
            vec!["video received; analysis queued".to_string()],
            0,
        )
    }

    /// Intermediate progress record
    pub fn progress(key: &JobKey, percent: u8, frames_done: u64, frames_total: u64) -> Self {
        let percent = percent.min(100);
        let mut report = Self::base(
            key,
            ReportStatus::Pending,
            vec![format!(
                "analyzing video: {}/{} frames ({}%)",
                frames_done, frames_total, percent
            )],
            percent,
        );
        report.frames_done = Some(frames_done);
        report.frames_total = Some(frames_total);
        report
    }

    /// Terminal record for a job that could not run because inference is unavailable
    pub fn deferred(key: &JobKey, reason: &str) -> Self {
        Self::base(
            key,
            ReportStatus::Pending,
            vec![format!(
                "inference unavailable in this environment; analysis deferred ({})",
                reason
            )],
            0,
        )
    }

    /// Terminal record for a failed analysis
    pub fn error(key: &JobKey, message: &str) -> Self {
        Self::base(
            key,
            ReportStatus::Error,
            vec![format!("analysis error: {}", message)],
            0,
        )
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(&self.patient_id, &self.exercise_id, &self.video_filename)
    }

    pub fn matches(&self, key: &JobKey) -> bool {
        self.patient_id == key.patient_id
            && self.exercise_id == key.exercise_id
            && self.video_filename == key.video_filename
    }

    /// Whether this is an intermediate progress record
    pub fn is_progress(&self) -> bool {
        self.status == ReportStatus::Pending && self.frames_total.is_some()
    }
}
