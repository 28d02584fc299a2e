//! Upload boundary: store an uploaded video and queue its analysis.

use crate::runtime::{JobHandle, JobRuntime};
use anyhow::{Context, Result};
use shared::paths::sanitized_extension;
use shared::{AnalysisJob, DataPaths, FeedbackReport};
use std::path::PathBuf;
use tracing::{info, warn};
use uuid::Uuid;

/// Result of an accepted upload
#[derive(Debug)]
pub struct UploadReceipt {
    /// Stored filename, part of the job key
    pub filename: String,
    pub saved_path: PathBuf,
    /// The `Pending` record written for the job
    pub analysis: FeedbackReport,
    pub handle: JobHandle,
}

/// Store `bytes` under the uploads directory and submit the analysis job
///
/// The stored name is a fresh UUID plus the sanitized extension of
/// `original_name`. If the job cannot be submitted the stored file is
/// removed again; a `SubmitError` can be recovered with `downcast_ref`.
pub fn accept_upload(
    runtime: &JobRuntime,
    paths: &DataPaths,
    patient_id: &str,
    exercise_id: &str,
    bytes: &[u8],
    original_name: &str,
) -> Result<UploadReceipt> {
    paths
        .create_dirs()
        .context("Failed to create uploads directory")?;

    let filename = format!(
        "{}{}",
        Uuid::new_v4().simple(),
        sanitized_extension(original_name)
    );
    let saved_path = paths.upload_file(&filename);

    std::fs::write(&saved_path, bytes)
        .with_context(|| format!("Failed to store upload: {}", saved_path.display()))?;

    info!(
        patient_id,
        exercise_id,
        original_name,
        filename = %filename,
        size = bytes.len(),
        "Stored uploaded video"
    );

    let job = AnalysisJob::new(patient_id, exercise_id, &saved_path, &filename);
    let handle = match runtime.submit(job) {
        Ok(handle) => handle,
        Err(e) => {
            if let Err(remove_err) = std::fs::remove_file(&saved_path) {
                warn!(
                    path = %saved_path.display(),
                    error = %remove_err,
                    "Failed to remove rejected upload"
                );
            }
            return Err(e.into());
        }
    };

    Ok(UploadReceipt {
        filename,
        saved_path,
        analysis: handle.pending_report().clone(),
        handle,
    })
}
