//! Pose capability: video in, joint-angle signal out.
//!
//! The runtime only sees the `PoseEstimator` trait. The production adapter,
//! `ExternalPoseEstimator`, runs an external pose program that streams one
//! JSON frame per line on stdout:
//!
//! ```text
//! {"frame": 0, "frames_total": 240, "timestamp": 0.0,
//!  "keypoints": {"left_hip": [0.41, 0.52, 0.93], "left_knee": [0.44, 0.71, 0.88], ...}}
//! ```
//!
//! Keypoints are `[x, y]` or `[x, y, confidence]`.

use crate::error::CapabilityError;
use crate::runtime::EstimatorFactory;
use rep_counter::compute_angle;
use serde::Deserialize;
use shared::config::PoseConfig;
use shared::AngleSample;
use std::collections::HashMap;
use std::ffi::OsString;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Body side of a landmark triple
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    fn prefix(&self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

/// Joint whose angle is tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Joint {
    Knee,
    Elbow,
    Hip,
}

impl Joint {
    /// Landmark names `(a, vertex, c)` for this joint on one side
    pub fn landmarks(&self, side: Side) -> [String; 3] {
        let [a, vertex, c] = match self {
            Joint::Knee => ["hip", "knee", "ankle"],
            Joint::Elbow => ["shoulder", "elbow", "wrist"],
            Joint::Hip => ["shoulder", "hip", "knee"],
        };
        let prefix = side.prefix();
        [
            format!("{}_{}", prefix, a),
            format!("{}_{}", prefix, vertex),
            format!("{}_{}", prefix, c),
        ]
    }
}

impl std::fmt::Display for Joint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Joint::Knee => write!(f, "knee"),
            Joint::Elbow => write!(f, "elbow"),
            Joint::Hip => write!(f, "hip"),
        }
    }
}

impl std::str::FromStr for Joint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "knee" => Ok(Joint::Knee),
            "elbow" => Ok(Joint::Elbow),
            "hip" => Ok(Joint::Hip),
            _ => Err(anyhow::anyhow!("Invalid joint: {}", s)),
        }
    }
}

/// Progress notification from inside an extraction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressTick {
    pub percent: f64,
    pub frames_done: u64,
    pub frames_total: u64,
}

/// Parameters of one extraction
pub struct ExtractRequest<'a> {
    pub video_path: &'a Path,
    pub joint: Joint,
    /// Set when the job is cancelled or timed out; checking it is optional
    pub cancel: &'a CancellationToken,
}

/// External pose estimation capability
///
/// One instance is shared by every worker of a runtime, so `extract` may be
/// called concurrently.
pub trait PoseEstimator: Send + Sync {
    /// Extract the ordered angle sequence of `request.joint` from a video
    ///
    /// `on_progress` may be called any number of times.
    fn extract(
        &self,
        request: &ExtractRequest<'_>,
        on_progress: &mut dyn FnMut(ProgressTick),
    ) -> Result<Vec<AngleSample>, CapabilityError>;
}

/// One line of pose program output
#[derive(Debug, Deserialize)]
struct PoseFrame {
    frame: u64,
    frames_total: u64,
    timestamp: f64,
    #[serde(default)]
    keypoints: HashMap<String, Vec<f64>>,
}

impl PoseFrame {
    fn landmark(&self, name: &str, min_confidence: f64) -> Option<(f64, f64)> {
        match self.keypoints.get(name)?.as_slice() {
            [x, y] => Some((*x, *y)),
            [x, y, confidence, ..] if *confidence >= min_confidence => Some((*x, *y)),
            _ => None,
        }
    }

    /// Joint angle, left side first
    fn joint_angle(&self, joint: Joint, min_confidence: f64) -> Option<f64> {
        [Side::Left, Side::Right].iter().find_map(|&side| {
            let [a, vertex, c] = joint.landmarks(side);
            Some(compute_angle(
                self.landmark(&a, min_confidence)?,
                self.landmark(&vertex, min_confidence)?,
                self.landmark(&c, min_confidence)?,
            ))
        })
    }

    fn progress(&self) -> ProgressTick {
        let frames_done = self.frame + 1;
        let percent = if self.frames_total == 0 {
            0.0
        } else {
            frames_done as f64 * 100.0 / self.frames_total as f64
        };

        ProgressTick {
            percent,
            frames_done,
            frames_total: self.frames_total,
        }
    }
}

/// Pose estimation through an external program
#[derive(Debug, Clone)]
pub struct ExternalPoseEstimator {
    program: String,
    args: Vec<String>,
    model: String,
    min_confidence: f64,
}

impl ExternalPoseEstimator {
    /// Build the estimator, checking that inference can run here at all
    pub fn from_config(
        config: &PoseConfig,
        model_path: Option<&Path>,
    ) -> Result<Self, CapabilityError> {
        let program = config
            .command
            .clone()
            .ok_or_else(|| CapabilityError::Unavailable("no pose command configured".to_string()))?;

        if let Some(path) = model_path {
            if !path.exists() {
                return Err(CapabilityError::Unavailable(format!(
                    "model file not found: {}",
                    path.display()
                )));
            }
        }

        info!(
            program = %program,
            model = %config.model,
            "Pose estimator ready"
        );

        Ok(Self {
            program,
            args: config.args.clone(),
            model: config.model.clone(),
            min_confidence: config.min_confidence,
        })
    }

    /// Factory for the runtime's lazily initialized estimator handle
    pub fn factory(config: PoseConfig, model_path: Option<PathBuf>) -> EstimatorFactory {
        Arc::new(move || {
            let estimator = Self::from_config(&config, model_path.as_deref())?;
            Ok(Arc::new(estimator) as Arc<dyn PoseEstimator>)
        })
    }

    fn command_args(&self, video_path: &Path) -> Vec<OsString> {
        self.args
            .iter()
            .map(|arg| match arg.as_str() {
                "{video}" => video_path.as_os_str().to_owned(),
                "{model}" => OsString::from(&self.model),
                _ => OsString::from(arg),
            })
            .collect()
    }

    fn spawn(&self, video_path: &Path) -> Result<Child, CapabilityError> {
        Command::new(&self.program)
            .args(self.command_args(video_path))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => CapabilityError::Unavailable(format!(
                    "pose command not found: {}",
                    self.program
                )),
                _ => CapabilityError::Io(e),
            })
    }
}

/// How often a running extraction checks for cancellation
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(20);

fn cancelled() -> CapabilityError {
    CapabilityError::Failed("extraction cancelled".to_string())
}

/// Kill the child and reap it; it may already have exited
fn stop(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!(error = %e, "Pose process already exited");
    }
    let _ = child.wait();
}

/// Wait for the child to exit, killing it if the job is cancelled first
fn wait_for_exit(
    child: &mut Child,
    cancel: &CancellationToken,
) -> Result<ExitStatus, CapabilityError> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if cancel.is_cancelled() {
            stop(child);
            return Err(cancelled());
        }
        std::thread::sleep(CANCEL_POLL_INTERVAL);
    }
}

impl PoseEstimator for ExternalPoseEstimator {
    fn extract(
        &self,
        request: &ExtractRequest<'_>,
        on_progress: &mut dyn FnMut(ProgressTick),
    ) -> Result<Vec<AngleSample>, CapabilityError> {
        if !request.video_path.exists() {
            return Err(CapabilityError::Failed(format!(
                "video file not found: {}",
                request.video_path.display()
            )));
        }

        debug!(
            program = %self.program,
            video = %request.video_path.display(),
            joint = %request.joint,
            "Starting pose extraction"
        );

        let mut child = self.spawn(request.video_path)?;
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                stop(&mut child);
                return Err(CapabilityError::Failed("pose process has no stdout".to_string()));
            }
        };

        // Lines arrive through a channel so a silent program cannot block cancellation
        let (line_tx, line_rx) = mpsc::channel();
        std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                if line_tx.send(line).is_err() {
                    break;
                }
            }
        });

        let mut samples = Vec::new();
        let mut skipped = 0usize;
        let mut line_no = 0usize;

        loop {
            if request.cancel.is_cancelled() {
                stop(&mut child);
                return Err(cancelled());
            }

            let line = match line_rx.recv_timeout(CANCEL_POLL_INTERVAL) {
                Ok(Ok(line)) => line,
                Ok(Err(e)) => {
                    stop(&mut child);
                    return Err(CapabilityError::Io(e));
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }

            let frame: PoseFrame = match serde_json::from_str(&line) {
                Ok(frame) => frame,
                Err(e) => {
                    stop(&mut child);
                    return Err(CapabilityError::Failed(format!(
                        "invalid pose frame on line {}: {}",
                        line_no, e
                    )));
                }
            };

            match frame.joint_angle(request.joint, self.min_confidence) {
                Some(angle) => samples.push(AngleSample::new(frame.timestamp, angle)),
                None => skipped += 1,
            }

            on_progress(frame.progress());
        }

        let status = wait_for_exit(&mut child, request.cancel)?;
        if request.cancel.is_cancelled() {
            return Err(cancelled());
        }
        if !status.success() {
            return Err(CapabilityError::Failed(format!(
                "pose command exited with {}",
                status
            )));
        }

        if skipped > 0 {
            warn!(
                video = %request.video_path.display(),
                joint = %request.joint,
                skipped,
                "Skipped frames without confident landmarks"
            );
        }

        Ok(samples)
    }
}
