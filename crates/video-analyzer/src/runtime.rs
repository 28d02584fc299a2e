//! Background analysis runtime.
//!
//! A `JobRuntime` owns everything a job needs: the lazily constructed pose
//! estimator, a bounded submission queue, a fixed pool of workers and the
//! event log. Each submitted job gets a `Pending` record immediately and
//! exactly one terminal record later, whatever happens in between:
//!
//! | outcome                          | terminal record                  |
//! |----------------------------------|----------------------------------|
//! | analysis completed               | `Success` or `Failure`           |
//! | pose estimation unavailable      | `Pending` with a deferral note   |
//! | estimator error, panic, timeout  | `Error` with the failure message |
//! | job cancelled                    | `Error` ("analysis cancelled")   |

use crate::error::{AnalysisError, CapabilityError, SubmitError};
use crate::pose::{ExtractRequest, Joint, PoseEstimator, ProgressTick};
use crate::throttle::{ProgressThrottle, ThrottlePolicy};
use anyhow::Context;
use once_cell::sync::OnceCell;
use rep_counter::{feedback::DEFAULT_MIN_REPS, segment_reps, synthesize, SegmenterConfig};
use shared::{AnalysisJob, Config, EventLog, FeedbackReport, JobKey};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// Constructor of the shared pose estimator
///
/// Called at most once per runtime on success. A failed call leaves the
/// runtime without an estimator, so the next job tries again.
pub type EstimatorFactory =
    Arc<dyn Fn() -> Result<Arc<dyn PoseEstimator>, CapabilityError> + Send + Sync>;

/// Runtime settings
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Number of concurrent analyses
    pub workers: usize,
    /// Jobs that may wait for a worker before submissions are rejected
    pub queue_capacity: usize,
    /// Per-job time limit (None = unlimited)
    pub job_timeout: Option<Duration>,
    pub joint: Joint,
    pub segmenter: SegmenterConfig,
    pub min_reps: usize,
    pub throttle: ThrottlePolicy,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            queue_capacity: 64,
            job_timeout: Some(Duration::from_secs(600)),
            joint: Joint::Knee,
            segmenter: SegmenterConfig::default(),
            min_reps: DEFAULT_MIN_REPS,
            throttle: ThrottlePolicy::default(),
        }
    }
}

impl RuntimeOptions {
    /// Build runtime options from the `[analysis]` and `[runtime]` sections
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let joint = config
            .analysis
            .joint
            .parse::<Joint>()
            .context("Invalid analysis joint")?;
        let segmenter =
            SegmenterConfig::new(config.analysis.down_threshold, config.analysis.up_threshold)
                .context("Invalid analysis thresholds")?;

        Ok(Self {
            workers: config.runtime.workers.max(1),
            queue_capacity: config.runtime.queue_capacity.max(1),
            job_timeout: config.runtime.job_timeout_seconds.map(Duration::from_secs),
            joint,
            segmenter,
            min_reps: config.analysis.min_reps,
            throttle: ThrottlePolicy {
                min_step: config.runtime.progress_min_step,
                min_interval: Duration::from_millis(config.runtime.progress_min_interval_ms),
            },
        })
    }
}

/// Lazily initialized estimator handle, owned by one runtime
struct EstimatorCell {
    cell: OnceCell<Arc<dyn PoseEstimator>>,
    factory: EstimatorFactory,
}

impl EstimatorCell {
    fn new(factory: EstimatorFactory) -> Self {
        Self {
            cell: OnceCell::new(),
            factory,
        }
    }

    /// Concurrent callers block until the first initialization finishes
    fn get(&self) -> Result<Arc<dyn PoseEstimator>, CapabilityError> {
        self.cell
            .get_or_try_init(|| {
                info!("Initializing pose estimator");
                (self.factory)()
            })
            .map(Arc::clone)
    }
}

struct Shared {
    options: RuntimeOptions,
    estimator: EstimatorCell,
    event_log: Arc<dyn EventLog>,
}

struct QueuedJob {
    job: AnalysisJob,
    cancel: CancellationToken,
    done: oneshot::Sender<FeedbackReport>,
}

/// Handle to a submitted job
#[derive(Debug)]
pub struct JobHandle {
    key: JobKey,
    cancel: CancellationToken,
    pending: FeedbackReport,
    done: oneshot::Receiver<FeedbackReport>,
}

impl JobHandle {
    pub fn key(&self) -> &JobKey {
        &self.key
    }

    /// The `Pending` record appended at submission
    pub fn pending_report(&self) -> &FeedbackReport {
        &self.pending
    }

    /// Request cancellation; the job ends with an `Error` record
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the terminal report
    ///
    /// Returns `None` if the runtime went away before running the job.
    pub async fn wait(self) -> Option<FeedbackReport> {
        self.done.await.ok()
    }
}

/// Bounded worker pool running analysis jobs
pub struct JobRuntime {
    shared: Arc<Shared>,
    sender: mpsc::Sender<QueuedJob>,
    workers: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl JobRuntime {
    /// Start the worker pool
    ///
    /// Must be called from within a tokio runtime. The estimator is not
    /// constructed until the first job needs it.
    pub fn start(
        options: RuntimeOptions,
        factory: EstimatorFactory,
        event_log: Arc<dyn EventLog>,
    ) -> Self {
        let workers = options.workers.max(1);
        let (sender, receiver) = mpsc::channel(options.queue_capacity.max(1));
        let queue = Arc::new(AsyncMutex::new(receiver));

        info!(
            workers,
            queue_capacity = options.queue_capacity,
            timeout_secs = options.job_timeout.map(|t| t.as_secs()),
            joint = %options.joint,
            "Starting analysis runtime"
        );

        let shared = Arc::new(Shared {
            options,
            estimator: EstimatorCell::new(factory),
            event_log,
        });

        let handles = (0..workers)
            .map(|worker_id| {
                let shared = Arc::clone(&shared);
                let queue = Arc::clone(&queue);
                tokio::spawn(worker_loop(worker_id, shared, queue))
            })
            .collect();

        Self {
            shared,
            sender,
            workers: handles,
            shutdown: CancellationToken::new(),
        }
    }

    /// Queue a job and record its `Pending` status
    ///
    /// Never blocks. A full queue rejects the job without writing anything.
    pub fn submit(&self, job: AnalysisJob) -> Result<JobHandle, SubmitError> {
        if self.shutdown.is_cancelled() {
            return Err(SubmitError::Closed);
        }

        let permit = self.sender.try_reserve().map_err(|e| match e {
            TrySendError::Full(()) => SubmitError::QueueFull {
                capacity: self.shared.options.queue_capacity,
            },
            TrySendError::Closed(()) => SubmitError::Closed,
        })?;

        let key = job.key();
        let pending = FeedbackReport::queued(&key);
        self.shared
            .event_log
            .append(&pending)
            .map_err(SubmitError::EventLog)?;

        let cancel = self.shutdown.child_token();
        let (done_tx, done_rx) = oneshot::channel();
        permit.send(QueuedJob {
            job,
            cancel: cancel.clone(),
            done: done_tx,
        });

        info!(job = %key, "Analysis job queued");

        Ok(JobHandle {
            key,
            cancel,
            pending,
            done: done_rx,
        })
    }

    pub fn event_log(&self) -> &Arc<dyn EventLog> {
        &self.shared.event_log
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.shared.options
    }

    /// Token cancelled by `cancel_all`; every job token is a child of it
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel running and queued jobs and reject new submissions
    pub fn cancel_all(&self) {
        info!("Cancelling all analysis jobs");
        self.shutdown.cancel();
    }

    /// Stop accepting jobs, drain the queue and wait for the workers
    pub async fn shutdown(self) {
        let JobRuntime {
            sender, workers, ..
        } = self;
        drop(sender);

        for (worker_id, handle) in workers.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!(worker_id, error = %e, "Analysis worker panicked");
            }
        }

        info!("Analysis runtime stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    shared: Arc<Shared>,
    queue: Arc<AsyncMutex<mpsc::Receiver<QueuedJob>>>,
) {
    debug!(worker_id, "Analysis worker started");

    loop {
        let next = queue.lock().await.recv().await;
        let Some(queued) = next else {
            break;
        };

        let key = queued.job.key();
        let span = info_span!(
            "analysis",
            worker_id,
            patient_id = %key.patient_id,
            exercise_id = %key.exercise_id,
            video_filename = %key.video_filename
        );
        let (report, abandoned) = run_job(&shared, &queued.job, &queued.cancel)
            .instrument(span.clone())
            .await;

        // Nobody may be waiting on the handle
        let _ = queued.done.send(report);

        // A cancelled or timed-out extraction still occupies this worker
        if let Some(task) = abandoned {
            async {
                debug!("Waiting for abandoned extraction to stop");
                if let Err(e) = task.await {
                    warn!(error = %e, "Abandoned extraction ended abnormally");
                }
            }
            .instrument(span)
            .await;
        }
    }

    debug!(worker_id, "Analysis worker stopped");
}

type ExtractionTask = JoinHandle<Result<FeedbackReport, AnalysisError>>;

/// Run one job to its terminal record
///
/// Also returns the extraction task when the job ended before it did.
async fn run_job(
    shared: &Arc<Shared>,
    job: &AnalysisJob,
    cancel: &CancellationToken,
) -> (FeedbackReport, Option<ExtractionTask>) {
    let key = job.key();
    let started = Instant::now();
    let gate = Arc::new(ProgressGate::new(
        Arc::clone(&shared.event_log),
        key.clone(),
        ProgressThrottle::new(shared.options.throttle, started),
    ));

    info!(video = %job.video_path.display(), "Starting analysis");

    let (outcome, abandoned) = if cancel.is_cancelled() {
        (Err(AnalysisError::Cancelled), None)
    } else {
        let mut task = {
            let shared = Arc::clone(shared);
            let job = job.clone();
            let cancel = cancel.clone();
            let gate = Arc::clone(&gate);
            let span = Span::current();
            tokio::task::spawn_blocking(move || {
                span.in_scope(|| analyze(&shared, &job, &cancel, &gate))
            })
        };

        let timeout = shared.options.job_timeout;
        let deadline = async move {
            match timeout {
                Some(limit) => {
                    tokio::time::sleep(limit).await;
                    limit
                }
                None => std::future::pending().await,
            }
        };

        let (outcome, finished) = tokio::select! {
            biased;
            _ = cancel.cancelled() => (Err(AnalysisError::Cancelled), false),
            joined = &mut task => {
                let outcome = match joined {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => {
                        Err(AnalysisError::Panicked(panic_message(e.into_panic())))
                    }
                    Err(_) => Err(AnalysisError::Aborted),
                };
                (outcome, true)
            }
            limit = deadline => {
                // Let the estimator notice and stop early
                cancel.cancel();
                (Err(AnalysisError::Timeout(limit)), false)
            }
        };

        (outcome, if finished { None } else { Some(task) })
    };

    // No progress record may follow the terminal one
    gate.close();

    let report = match outcome {
        Ok(report) => {
            info!(
                status = %report.status,
                repetitions = report.repetitions,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Analysis completed"
            );
            report
        }
        Err(AnalysisError::Capability(CapabilityError::Unavailable(reason))) => {
            warn!(reason = %reason, "Analysis deferred");
            FeedbackReport::deferred(&key, &reason)
        }
        Err(e) => {
            error!(error = %e, "Analysis failed");
            FeedbackReport::error(&key, &e.to_string())
        }
    };

    if let Err(e) = shared.event_log.append(&report) {
        error!(error = %e, "Failed to record terminal report");
    }

    (report, abandoned)
}

/// The blocking part of a job: extraction, segmentation, synthesis
fn analyze(
    shared: &Shared,
    job: &AnalysisJob,
    cancel: &CancellationToken,
    gate: &ProgressGate,
) -> Result<FeedbackReport, AnalysisError> {
    let estimator = shared.estimator.get()?;

    let request = ExtractRequest {
        video_path: &job.video_path,
        joint: shared.options.joint,
        cancel,
    };
    let samples = estimator.extract(&request, &mut |tick| gate.emit(tick))?;

    let segments = segment_reps(&samples, &shared.options.segmenter);
    debug!(
        samples = samples.len(),
        segments = segments.len(),
        "Segmented angle signal"
    );

    Ok(synthesize(&segments, shared.options.min_reps, &job.key()))
}

struct GateState {
    throttle: ProgressThrottle,
    closed: bool,
}

/// Throttled, fire-and-forget progress reporting for one job
struct ProgressGate {
    event_log: Arc<dyn EventLog>,
    key: JobKey,
    state: Mutex<GateState>,
}

impl ProgressGate {
    fn new(event_log: Arc<dyn EventLog>, key: JobKey, throttle: ProgressThrottle) -> Self {
        Self {
            event_log,
            key,
            state: Mutex::new(GateState {
                throttle,
                closed: false,
            }),
        }
    }

    /// Report a tick; failures and panics stay in here
    fn emit(&self, tick: ProgressTick) {
        match panic::catch_unwind(AssertUnwindSafe(|| self.try_emit(tick))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "Dropped progress report");
            }
            Err(payload) => {
                warn!(
                    panic = %panic_message(payload),
                    "Progress reporting panicked"
                );
            }
        }
    }

    fn try_emit(&self, tick: ProgressTick) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Ok(());
        }

        let Some(percent) = state.throttle.admit(tick.percent, Instant::now()) else {
            return Ok(());
        };

        // Appended under the lock so `close` waits for an in-flight record
        let report =
            FeedbackReport::progress(&self.key, percent, tick.frames_done, tick.frames_total);
        self.event_log.append(&report)
    }

    fn close(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{AngleSample, MemoryEventLog, ReportStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FnEstimator<F>(F);

    impl<F> PoseEstimator for FnEstimator<F>
    where
        F: Fn(
                &ExtractRequest<'_>,
                &mut dyn FnMut(ProgressTick),
            ) -> Result<Vec<AngleSample>, CapabilityError>
            + Send
            + Sync,
    {
        fn extract(
            &self,
            request: &ExtractRequest<'_>,
            on_progress: &mut dyn FnMut(ProgressTick),
        ) -> Result<Vec<AngleSample>, CapabilityError> {
            (self.0)(request, on_progress)
        }
    }

    fn estimator<F>(extract: F) -> Arc<dyn PoseEstimator>
    where
        F: Fn(
                &ExtractRequest<'_>,
                &mut dyn FnMut(ProgressTick),
            ) -> Result<Vec<AngleSample>, CapabilityError>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(FnEstimator(extract))
    }

    fn factory<F>(extract: F) -> EstimatorFactory
    where
        F: Fn(
                &ExtractRequest<'_>,
                &mut dyn FnMut(ProgressTick),
            ) -> Result<Vec<AngleSample>, CapabilityError>
            + Send
            + Sync
            + 'static,
    {
        let estimator = estimator(extract);
        Arc::new(move || Ok(Arc::clone(&estimator)))
    }

    fn two_reps() -> Vec<AngleSample> {
        [(0.0, 170.0), (0.5, 80.0), (1.0, 170.0), (1.5, 75.0), (2.0, 170.0)]
            .into_iter()
            .map(AngleSample::from)
            .collect()
    }

    fn tick(percent: f64) -> ProgressTick {
        ProgressTick {
            percent,
            frames_done: percent as u64,
            frames_total: 100,
        }
    }

    /// Deterministic throttling: only percentage jumps count
    fn options(workers: usize) -> RuntimeOptions {
        RuntimeOptions {
            workers,
            throttle: ThrottlePolicy {
                min_step: 5,
                min_interval: Duration::from_secs(3600),
            },
            ..Default::default()
        }
    }

    fn job(name: &str) -> AnalysisJob {
        AnalysisJob::new("p1", "squat", format!("/videos/{}", name), name)
    }

    /// Blocks until the job is cancelled, announcing that it started
    fn blocking_factory(started: mpsc::UnboundedSender<()>) -> EstimatorFactory {
        factory(move |request, _| {
            let _ = started.send(());
            while !request.cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(CapabilityError::Failed("extraction cancelled".to_string()))
        })
    }

    #[tokio::test]
    async fn test_successful_analysis() {
        let log = Arc::new(MemoryEventLog::new());
        let runtime = JobRuntime::start(options(1), factory(|_, _| Ok(two_reps())), log.clone());

        let handle = runtime.submit(job("a.mp4")).unwrap();
        assert_eq!(handle.pending_report().status, ReportStatus::Pending);
        assert_eq!(handle.pending_report().progress, 0);
        let key = handle.key().clone();

        let report = handle.wait().await.unwrap();
        assert_eq!(report.status, ReportStatus::Success);
        assert_eq!(report.repetitions, 2);
        assert_eq!(report.progress, 100);
        assert_eq!(report.observations[0], "detected repetitions: 2");

        let history = log.history_for(&key).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, ReportStatus::Pending);
        assert_eq!(log.latest_for(&key).unwrap().unwrap().status, ReportStatus::Success);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_pending_record_is_written_at_submission() {
        let log = Arc::new(MemoryEventLog::new());
        let (started_tx, _started_rx) = mpsc::unbounded_channel();
        let runtime = JobRuntime::start(options(1), blocking_factory(started_tx), log.clone());

        let handle = runtime.submit(job("a.mp4")).unwrap();
        let latest = log.latest_for(handle.key()).unwrap().unwrap();
        assert_eq!(latest.status, ReportStatus::Pending);
        assert_eq!(latest.observations, vec!["video received; analysis queued"]);

        runtime.cancel_all();
        handle.wait().await.unwrap();
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_unavailable_capability_defers() {
        let log = Arc::new(MemoryEventLog::new());
        let unavailable: EstimatorFactory =
            Arc::new(|| Err(CapabilityError::Unavailable("model missing".to_string())));
        let runtime = JobRuntime::start(options(1), unavailable, log.clone());

        let handle = runtime.submit(job("a.mp4")).unwrap();
        let key = handle.key().clone();
        let report = handle.wait().await.unwrap();

        assert_eq!(report.status, ReportStatus::Pending);
        assert_eq!(report.repetitions, 0);
        assert!(report.observations[0].contains("deferred"));
        assert!(report.observations[0].contains("model missing"));

        // Queued record plus exactly one terminal record
        assert_eq!(log.history_for(&key).unwrap().len(), 2);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_estimator_error_is_recorded() {
        let log = Arc::new(MemoryEventLog::new());
        let runtime = JobRuntime::start(
            options(1),
            factory(|_, _| Err(CapabilityError::Failed("decoder exploded".to_string()))),
            log.clone(),
        );

        let handle = runtime.submit(job("a.mp4")).unwrap();
        let key = handle.key().clone();
        let report = handle.wait().await.unwrap();

        assert_eq!(report.status, ReportStatus::Error);
        assert!(report.observations[0].contains("decoder exploded"));
        assert_eq!(log.history_for(&key).unwrap().len(), 2);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_panic_is_recorded() {
        let log = Arc::new(MemoryEventLog::new());
        let runtime = JobRuntime::start(
            options(1),
            factory(|_, _| panic!("pose model exploded")),
            log.clone(),
        );

        let report = runtime.submit(job("a.mp4")).unwrap().wait().await.unwrap();
        assert_eq!(report.status, ReportStatus::Error);
        assert!(report.observations[0].contains("pose model exploded"));

        // The worker survives the panic
        let report = runtime.submit(job("b.mp4")).unwrap().wait().await.unwrap();
        assert_eq!(report.status, ReportStatus::Error);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_progress_is_throttled_and_increasing() {
        let log = Arc::new(MemoryEventLog::new());
        let runtime = JobRuntime::start(
            options(1),
            factory(|_, on_progress| {
                for i in 0..=200 {
                    on_progress(tick(i as f64 / 2.0));
                }
                on_progress(tick(42.0));
                on_progress(tick(100.0));
                Ok(two_reps())
            }),
            log.clone(),
        );

        let handle = runtime.submit(job("a.mp4")).unwrap();
        let key = handle.key().clone();
        handle.wait().await.unwrap();

        let progress: Vec<u8> = log
            .history_for(&key)
            .unwrap()
            .iter()
            .filter(|r| r.is_progress())
            .map(|r| r.progress)
            .collect();

        let expected: Vec<u8> = (1..20).map(|i| i * 5).collect();
        assert_eq!(progress, expected);

        let history = log.history_for(&key).unwrap();
        assert_eq!(history.last().unwrap().status, ReportStatus::Success);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_single_worker_runs_jobs_sequentially() {
        let log = Arc::new(MemoryEventLog::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let runtime = {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            JobRuntime::start(
                options(1),
                factory(move |_, on_progress| {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    for i in 1..10 {
                        on_progress(tick(i as f64 * 10.0));
                        std::thread::sleep(Duration::from_millis(2));
                    }
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(two_reps())
                }),
                log.clone(),
            )
        };

        let first = runtime.submit(job("a.mp4")).unwrap();
        let second = runtime.submit(job("b.mp4")).unwrap();
        let first_key = first.key().clone();
        first.wait().await.unwrap();
        second.wait().await.unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 1);

        // Skip the two queued records; the rest must not interleave
        let worked: Vec<bool> = log
            .records()
            .iter()
            .filter(|r| r.progress > 0)
            .map(|r| r.matches(&first_key))
            .collect();
        assert_eq!(worked.len(), 20);
        assert!(worked[..10].iter().all(|&is_first| is_first));
        assert!(worked[10..].iter().all(|&is_first| !is_first));

        runtime.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_estimator_is_constructed_once() {
        let log = Arc::new(MemoryEventLog::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let counting: EstimatorFactory = {
            let calls = Arc::clone(&calls);
            let estimator = estimator(|_, _| {
                std::thread::sleep(Duration::from_millis(10));
                Ok(two_reps())
            });
            Arc::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                Ok(Arc::clone(&estimator))
            })
        };
        let runtime = JobRuntime::start(options(3), counting, log.clone());

        let handles: Vec<JobHandle> = (0..6)
            .map(|i| runtime.submit(job(&format!("{}.mp4", i))).unwrap())
            .collect();
        for handle in handles {
            assert_eq!(handle.wait().await.unwrap().status, ReportStatus::Success);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_initialization_is_retried() {
        let log = Arc::new(MemoryEventLog::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let flaky: EstimatorFactory = {
            let calls = Arc::clone(&calls);
            let estimator = estimator(|_, _| Ok(two_reps()));
            Arc::new(move || {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(CapabilityError::Unavailable("weights still downloading".to_string()))
                } else {
                    Ok(Arc::clone(&estimator))
                }
            })
        };
        let runtime = JobRuntime::start(options(1), flaky, log.clone());

        let first = runtime.submit(job("a.mp4")).unwrap().wait().await.unwrap();
        assert_eq!(first.status, ReportStatus::Pending);

        let second = runtime.submit(job("b.mp4")).unwrap().wait().await.unwrap();
        assert_eq!(second.status, ReportStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_record() {
        let log = Arc::new(MemoryEventLog::new());
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let runtime = JobRuntime::start(
            RuntimeOptions {
                queue_capacity: 1,
                job_timeout: None,
                ..options(1)
            },
            blocking_factory(started_tx),
            log.clone(),
        );

        let running = runtime.submit(job("a.mp4")).unwrap();
        started_rx.recv().await.unwrap();

        let waiting = runtime.submit(job("b.mp4")).unwrap();
        let rejected = runtime.submit(job("c.mp4"));
        assert!(matches!(rejected, Err(SubmitError::QueueFull { capacity: 1 })));
        assert!(log
            .history_for(&job("c.mp4").key())
            .unwrap()
            .is_empty());

        runtime.cancel_all();
        assert!(matches!(runtime.submit(job("d.mp4")), Err(SubmitError::Closed)));

        let running = running.wait().await.unwrap();
        assert_eq!(running.status, ReportStatus::Error);
        assert_eq!(running.observations, vec!["analysis error: analysis cancelled"]);
        assert_eq!(waiting.wait().await.unwrap().status, ReportStatus::Error);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_single_job() {
        let log = Arc::new(MemoryEventLog::new());
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let runtime = JobRuntime::start(options(1), blocking_factory(started_tx), log.clone());

        let handle = runtime.submit(job("a.mp4")).unwrap();
        started_rx.recv().await.unwrap();
        handle.cancel();

        let report = handle.wait().await.unwrap();
        assert_eq!(report.status, ReportStatus::Error);
        assert!(report.observations[0].contains("cancelled"));

        // Other jobs are unaffected
        let next = runtime.submit(job("b.mp4")).unwrap();
        started_rx.recv().await.unwrap();
        runtime.cancel_all();
        next.wait().await.unwrap();

        runtime.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_out_extraction_still_occupies_worker() {
        let log = Arc::new(MemoryEventLog::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let runtime = {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            JobRuntime::start(
                RuntimeOptions {
                    job_timeout: Some(Duration::from_millis(30)),
                    ..options(1)
                },
                // Ignores cancellation entirely
                factory(move |_, _| {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(150));
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(two_reps())
                }),
                log.clone(),
            )
        };

        let handles: Vec<JobHandle> = (0..3)
            .map(|i| runtime.submit(job(&format!("{}.mp4", i))).unwrap())
            .collect();
        for handle in handles {
            let report = handle.wait().await.unwrap();
            assert_eq!(report.status, ReportStatus::Error);
            assert!(report.observations[0].contains("timed out"));
        }

        runtime.shutdown().await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timeout_is_recorded() {
        let log = Arc::new(MemoryEventLog::new());
        let (started_tx, _started_rx) = mpsc::unbounded_channel();
        let runtime = JobRuntime::start(
            RuntimeOptions {
                job_timeout: Some(Duration::from_millis(50)),
                ..options(1)
            },
            blocking_factory(started_tx),
            log.clone(),
        );

        let report = runtime.submit(job("a.mp4")).unwrap().wait().await.unwrap();
        assert_eq!(report.status, ReportStatus::Error);
        assert!(report.observations[0].contains("timed out"));

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_progress_after_terminal_record() {
        let log = Arc::new(MemoryEventLog::new());
        let (finished_tx, mut finished_rx) = mpsc::unbounded_channel();
        let runtime = JobRuntime::start(
            RuntimeOptions {
                job_timeout: Some(Duration::from_millis(30)),
                throttle: ThrottlePolicy {
                    min_step: 1,
                    min_interval: Duration::from_secs(3600),
                },
                ..options(1)
            },
            // Ignores cancellation and keeps reporting after the deadline
            factory(move |_, on_progress| {
                for i in 1..40 {
                    on_progress(tick(i as f64));
                    std::thread::sleep(Duration::from_millis(3));
                }
                let _ = finished_tx.send(());
                Ok(two_reps())
            }),
            log.clone(),
        );

        let handle = runtime.submit(job("a.mp4")).unwrap();
        let key = handle.key().clone();
        let report = handle.wait().await.unwrap();
        assert!(report.observations[0].contains("timed out"));

        finished_rx.recv().await.unwrap();
        let history = log.history_for(&key).unwrap();
        assert_eq!(history.last().unwrap(), &report);
        assert_eq!(history.iter().filter(|r| r.status.is_final()).count(), 1);

        runtime.shutdown().await;
    }

    /// Accepts every record except progress ones
    struct BrokenProgressLog {
        inner: MemoryEventLog,
        panic: bool,
    }

    impl EventLog for BrokenProgressLog {
        fn append(&self, report: &FeedbackReport) -> anyhow::Result<()> {
            if report.is_progress() {
                if self.panic {
                    panic!("progress sink crashed");
                }
                anyhow::bail!("disk full");
            }
            self.inner.append(report)
        }

        fn history_for(&self, key: &JobKey) -> anyhow::Result<Vec<FeedbackReport>> {
            self.inner.history_for(key)
        }

        fn latest_for_patient(&self, patient_id: &str) -> anyhow::Result<Vec<FeedbackReport>> {
            self.inner.latest_for_patient(patient_id)
        }
    }

    #[tokio::test]
    async fn test_progress_failures_do_not_abort_analysis() {
        for panic in [false, true] {
            let log = Arc::new(BrokenProgressLog {
                inner: MemoryEventLog::new(),
                panic,
            });
            let runtime = JobRuntime::start(
                options(1),
                factory(|_, on_progress| {
                    for i in 1..10 {
                        on_progress(tick(i as f64 * 10.0));
                    }
                    Ok(two_reps())
                }),
                log.clone(),
            );

            let report = runtime.submit(job("a.mp4")).unwrap().wait().await.unwrap();
            assert_eq!(report.status, ReportStatus::Success);
            assert_eq!(report.repetitions, 2);

            runtime.shutdown().await;
        }
    }

    #[test]
    fn test_options_from_config() {
        let mut config = Config::default();
        config.analysis.joint = "elbow".to_string();
        config.runtime.workers = 0;
        config.runtime.job_timeout_seconds = None;

        let options = RuntimeOptions::from_config(&config).unwrap();
        assert_eq!(options.joint, Joint::Elbow);
        assert_eq!(options.workers, 1);
        assert_eq!(options.job_timeout, None);
        assert_eq!(options.throttle, ThrottlePolicy::default());

        config.analysis.down_threshold = 170.0;
        assert!(RuntimeOptions::from_config(&config).is_err());
    }
}
