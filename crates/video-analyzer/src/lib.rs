//! Background video analysis for exercise executions.
//!
//! Uploaded videos are queued on a small worker pool. Each worker asks the
//! pose capability for the joint-angle signal, counts repetitions, and
//! appends exactly one terminal report to the event log, whatever happens
//! along the way.

pub mod error;
pub mod pose;
pub mod runtime;
pub mod throttle;
pub mod upload;

pub use error::{AnalysisError, CapabilityError, SubmitError};
pub use pose::{ExternalPoseEstimator, ExtractRequest, Joint, PoseEstimator, ProgressTick};
pub use runtime::{EstimatorFactory, JobHandle, JobRuntime, RuntimeOptions};
pub use throttle::{ProgressThrottle, ThrottlePolicy};
pub use upload::{accept_upload, UploadReceipt};
