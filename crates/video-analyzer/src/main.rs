//! Video analyzer - count exercise repetitions in recorded videos.
//!
//! `analyze` ingests videos through the upload boundary, runs them on the
//! background runtime and prints the terminal report of each one as a JSON
//! line. `status` prints the current status of recorded jobs from the event
//! log.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shared::{open_event_log, Config, DataPaths, FeedbackReport, JobKey, LogConfig};
use std::path::PathBuf;
use tracing::{error, info, warn};
use video_analyzer::{accept_upload, ExternalPoseEstimator, JobRuntime, RuntimeOptions};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Analyze exercise videos and print their reports
    Analyze {
        /// Patient identifier
        #[arg(short, long)]
        patient: String,

        /// Exercise identifier
        #[arg(short, long)]
        exercise: String,

        /// Number of concurrent analysis workers
        #[arg(short, long, env = "MOVEON_ANALYSIS_WORKERS")]
        workers: Option<usize>,

        /// Pose model passed to the pose command
        #[arg(short, long, env = "MOVEON_YOLO_MODEL")]
        model: Option<String>,

        /// Video files to analyze
        #[arg(required = true)]
        videos: Vec<PathBuf>,
    },

    /// Print the latest recorded status of analysis jobs
    Status {
        /// Patient identifier
        #[arg(short, long)]
        patient: String,

        /// Only jobs for this exercise
        #[arg(short, long)]
        exercise: Option<String>,

        /// Stored video filename (requires --exercise)
        #[arg(long, requires = "exercise")]
        video: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    // Initialize logging
    shared::logging::init(LogConfig::from_config(&config, "video-analyzer", args.verbose))?;

    info!(config_file = %args.config.display(), "Loaded configuration");

    match args.command {
        Commands::Analyze {
            patient,
            exercise,
            workers,
            model,
            videos,
        } => {
            if let Some(workers) = workers {
                config.runtime.workers = workers;
            }
            if let Some(model) = model {
                config.pose.model = model;
            }
            analyze(&config, &patient, &exercise, &videos).await
        }
        Commands::Status {
            patient,
            exercise,
            video,
        } => status(&config, &patient, exercise.as_deref(), video.as_deref()),
    }
}

async fn analyze(config: &Config, patient: &str, exercise: &str, videos: &[PathBuf]) -> Result<()> {
    let options = RuntimeOptions::from_config(config)?;
    let event_log = open_event_log(config).context("Failed to open event log")?;
    let data_paths = DataPaths::new(config.data_dir());

    info!(
        workers = options.workers,
        model = %config.pose.model,
        videos = videos.len(),
        "Runtime configuration"
    );

    let factory = ExternalPoseEstimator::factory(config.pose.clone(), config.model_path());
    let runtime = JobRuntime::start(options, factory, event_log);

    // Ctrl-C cancels every job; each still gets its terminal record
    let shutdown = runtime.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling analysis jobs");
            shutdown.cancel();
        }
    });

    let mut handles = Vec::new();
    for video in videos {
        let bytes = match std::fs::read(video) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(video = %video.display(), error = %e, "Failed to read video");
                continue;
            }
        };
        let original_name = video
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        match accept_upload(&runtime, &data_paths, patient, exercise, &bytes, &original_name) {
            Ok(receipt) => {
                info!(
                    video = %video.display(),
                    filename = %receipt.filename,
                    "Video submitted"
                );
                handles.push(receipt.handle);
            }
            Err(e) => {
                error!(video = %video.display(), error = %e, "Failed to submit video");
            }
        }
    }

    let submitted = handles.len();
    let mut completed = 0;
    for handle in handles {
        let key = handle.key().clone();
        match handle.wait().await {
            Some(report) => {
                print_report(&report)?;
                completed += 1;
            }
            None => error!(job = %key, "Analysis job ended without a report"),
        }
    }

    runtime.shutdown().await;

    info!(submitted, completed, "Video analyzer finished");

    Ok(())
}

fn status(config: &Config, patient: &str, exercise: Option<&str>, video: Option<&str>) -> Result<()> {
    let event_log = open_event_log(config).context("Failed to open event log")?;

    let reports: Vec<FeedbackReport> = match (exercise, video) {
        (Some(exercise), Some(video)) => event_log
            .latest_for(&JobKey::new(patient, exercise, video))?
            .into_iter()
            .collect(),
        _ => event_log
            .latest_for_patient(patient)?
            .into_iter()
            .filter(|report| exercise.map_or(true, |e| report.exercise_id == e))
            .collect(),
    };

    if reports.is_empty() {
        info!(patient, exercise, video, "No analysis records found");
    }

    for report in &reports {
        print_report(report)?;
    }

    Ok(())
}

fn print_report(report: &FeedbackReport) -> Result<()> {
    let line = serde_json::to_string(report).context("Failed to serialize report")?;
    println!("{}", line);
    Ok(())
}
