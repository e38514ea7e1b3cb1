//! Job admission, priority dispatch onto a bounded worker pool, and lifecycle
//! control (cancellation, timeouts, shutdown).
//!
//! All queue and job-map mutation happens under one coarse lock. The lock is
//! never held across an await point or while a pipeline runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::models::format::FormatRegistry;
use crate::models::issue::{Issue, IssueCategory};
use crate::models::job::{AuthContext, Job, JobId, MAX_PRIORITY, MIN_PRIORITY};
use crate::models::report::{ProcessingReport, Termination};
use crate::models::status::{CompletionSummary, JobStatus, ProcessingStats, QueueStatus};
use crate::services::pipeline::{Collaborators, JobProgress, PipelineConfig, PipelineStageRunner};
use crate::services::queue::{JobQueue, QueueError};
use crate::services::resources::ResourceMonitor;
use crate::services::security::{
    AuditEvent, AuditSink, AuthorizationCheck, SecuritySigner, ACTION_ADMIN, ACTION_CANCEL, ACTION_SUBMIT,
    RESOURCE_JOBS, RESOURCE_SYSTEM,
};

pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 50;

pub const CODE_PROCESSING_ERROR: &str = "PROCESSING_ERROR";
pub const CODE_TIMEOUT: &str = "PROCESSING_TIMEOUT";

/// Assumed job duration before any job has finished.
const DEFAULT_JOB_SECS: f64 = 30.0;

/// How often graceful shutdown re-checks whether work has drained.
const DRAIN_CHECK_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub max_concurrent_jobs: usize,
    pub max_queue_size: usize,
    /// Measured from the moment a job becomes Active.
    pub processing_timeout: Duration,
    pub poll_interval: Duration,
    pub admission_retry_delay: Duration,
    pub max_input_bytes: u64,
    pub completed_retention: usize,
    pub failed_retention: usize,
    pub cancelled_retention: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 10,
            max_queue_size: 1000,
            processing_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(1000),
            admission_retry_delay: Duration::from_millis(100),
            max_input_bytes: 50 * 1024 * 1024,
            completed_retention: 100,
            failed_retention: 50,
            cancelled_retention: 100,
        }
    }
}

/// Collaborators and policies injected into the controller.
#[derive(Clone)]
pub struct ControllerDeps {
    pub stages: Collaborators,
    pub pipeline: PipelineConfig,
    pub monitor: ResourceMonitor,
    pub formats: FormatRegistry,
    pub authorizer: Arc<dyn AuthorizationCheck>,
    pub signer: Arc<dyn SecuritySigner>,
    pub audit: Arc<dyn AuditSink>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum SubmitError {
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Queue is full ({capacity} jobs pending)")]
    QueueFull { capacity: usize },

    #[error("Insufficient capacity, retry later")]
    CapacityExceeded,

    #[error("Not authorized to submit jobs")]
    Unauthorized,

    #[error("Controller is shutting down")]
    ShuttingDown,
}

impl SubmitError {
    /// Metric label for the rejection.
    pub fn reason(&self) -> &'static str {
        self.into()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConcurrencyError {
    #[error("Concurrency limit {requested} outside 1..=50")]
    OutOfRange { requested: usize },
}

/// Insertion-ordered map that evicts its oldest entry beyond `cap`.
#[derive(Debug)]
struct Retained<T> {
    cap: usize,
    order: VecDeque<JobId>,
    entries: HashMap<JobId, T>,
}

impl<T> Retained<T> {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    fn insert(&mut self, id: JobId, value: T) {
        if self.entries.insert(id, value).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn get(&self, id: &JobId) -> Option<&T> {
        self.entries.get(id)
    }

    fn contains(&self, id: &JobId) -> bool {
        self.entries.contains_key(id)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct ActiveJob {
    job: Job,
    started_at: DateTime<Utc>,
    started: Instant,
    progress: Arc<JobProgress>,
}

#[derive(Debug, Default)]
struct StatsAccumulator {
    completed: u64,
    failed: u64,
    cancelled: u64,
    runs: u64,
    total_ms: f64,
    total_iterations: u64,
}

impl StatsAccumulator {
    fn record_run(&mut self, report: &ProcessingReport) {
        self.runs += 1;
        self.total_ms += report.total_time_ms;
        self.total_iterations += report.stats.iterations_run as u64;
    }

    fn average_ms(&self) -> Option<f64> {
        (self.runs > 0).then(|| self.total_ms / self.runs as f64)
    }
}

struct SchedulerState {
    queue: JobQueue,
    active: HashMap<JobId, ActiveJob>,
    completed: Retained<ProcessingReport>,
    failed: Retained<ProcessingReport>,
    cancelled: Retained<DateTime<Utc>>,
    max_concurrent: usize,
    stats: StatsAccumulator,
}

impl SchedulerState {
    fn knows(&self, id: &JobId) -> bool {
        self.queue.contains(*id)
            || self.active.contains_key(id)
            || self.completed.contains(id)
            || self.failed.contains(id)
            || self.cancelled.contains(id)
    }

    fn average_secs(&self) -> f64 {
        self.stats.average_ms().map_or(DEFAULT_JOB_SECS, |ms| ms / 1000.0)
    }

    fn record_cancelled(&mut self, id: JobId) {
        self.cancelled.insert(id, Utc::now());
        self.stats.cancelled += 1;
    }
}

/// Where a finished report was filed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Filed {
    Completed,
    Failed,
    Cancelled,
}

struct Inner {
    config: ControllerConfig,
    runner: Arc<PipelineStageRunner>,
    monitor: ResourceMonitor,
    formats: FormatRegistry,
    authorizer: Arc<dyn AuthorizationCheck>,
    signer: Arc<dyn SecuritySigner>,
    audit: Arc<dyn AuditSink>,
    state: Mutex<SchedulerState>,
    wake: Notify,
    stop: CancellationToken,
    closed: AtomicBool,
    started: AtomicBool,
    created: Instant,
}

/// Owns the queue and worker pool. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    pub fn new(config: ControllerConfig, deps: ControllerDeps) -> Self {
        let max_concurrent = config.max_concurrent_jobs.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY);
        if max_concurrent != config.max_concurrent_jobs {
            tracing::warn!(
                requested = config.max_concurrent_jobs,
                applied = max_concurrent,
                "Concurrency limit clamped"
            );
        }
        let state = SchedulerState {
            queue: JobQueue::new(config.max_queue_size),
            active: HashMap::new(),
            completed: Retained::new(config.completed_retention),
            failed: Retained::new(config.failed_retention),
            cancelled: Retained::new(config.cancelled_retention),
            max_concurrent,
            stats: StatsAccumulator::default(),
        };
        Self {
            inner: Arc::new(Inner {
                runner: Arc::new(PipelineStageRunner::new(deps.stages, deps.pipeline)),
                monitor: deps.monitor,
                formats: deps.formats,
                authorizer: deps.authorizer,
                signer: deps.signer,
                audit: deps.audit,
                state: Mutex::new(state),
                wake: Notify::new(),
                stop: CancellationToken::new(),
                closed: AtomicBool::new(false),
                started: AtomicBool::new(false),
                created: Instant::now(),
                config,
            }),
        }
    }

    pub fn formats(&self) -> &FormatRegistry {
        &self.inner.formats
    }

    /// Spawn the dispatch loop. Must be called from within a tokio runtime;
    /// calling it again returns a handle to a task that exits immediately.
    pub fn start(&self) -> JoinHandle<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("Dispatch loop already running");
            return tokio::spawn(async {});
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run_dispatch_loop().await })
    }

    /// Admit a job: structural validation, then authorization, then capacity.
    pub async fn submit_job(&self, job: Job) -> Result<JobId, SubmitError> {
        let result = self.inner.admit(job.clone()).await;
        match &result {
            Ok(id) => {
                metrics::counter!("verify_jobs_submitted_total").increment(1);
                self.inner.audit.record(AuditEvent::Admitted {
                    job_id: *id,
                    subject: job.context.subject.clone(),
                    priority: job.priority,
                });
                tracing::info!(job_id = %id, priority = job.priority, format = %job.format_id, "Job queued");
                self.inner.wake.notify_one();
            }
            Err(e) => {
                metrics::counter!("verify_admission_rejected_total", "reason" => e.reason()).increment(1);
                self.inner.audit.record(AuditEvent::Rejected {
                    subject: job.context.subject.clone(),
                    reason: e.to_string(),
                });
                tracing::warn!(job_id = %job.job_id, reason = e.reason(), error = %e, "Job rejected");
            }
        }
        result
    }

    pub fn get_processing_status(&self, job_id: JobId) -> JobStatus {
        self.inner.sweep_timeouts();
        let state = self.inner.lock();
        let average = state.average_secs();

        if let Some(active) = state.active.get(&job_id) {
            let progress = active.progress.fraction();
            return JobStatus::Active {
                progress,
                eta_secs: average * (1.0 - progress),
                iteration: active.progress.iteration(),
                started_at: active.started_at,
            };
        }
        if let Some((position, job)) = state.queue.position(job_id) {
            return JobStatus::Queued {
                position,
                eta_secs: average * position as f64 / state.max_concurrent as f64,
                submitted_at: job.created_at,
            };
        }
        if let Some(report) = state.completed.get(&job_id) {
            return JobStatus::Completed {
                summary: summarize(report),
            };
        }
        if let Some(report) = state.failed.get(&job_id) {
            return JobStatus::Failed {
                reason: report.failure_reason(),
                issues: report.issues.clone(),
            };
        }
        if let Some(at) = state.cancelled.get(&job_id) {
            return JobStatus::Cancelled { cancelled_at: *at };
        }
        JobStatus::NotFound
    }

    /// Full report of a finished (completed or failed) job still in retention.
    pub fn get_report(&self, job_id: JobId) -> Option<ProcessingReport> {
        let state = self.inner.lock();
        state
            .completed
            .get(&job_id)
            .or_else(|| state.failed.get(&job_id))
            .cloned()
    }

    pub fn get_queue_status(&self) -> QueueStatus {
        let system = self.inner.monitor.snapshot();
        let state = self.inner.lock();
        let utilization = state.queue.utilization();
        let stats = self.inner.stats(&state);
        QueueStatus {
            timestamp: Utc::now(),
            pending: state.queue.len(),
            active: state.active.len(),
            max_queue_size: state.queue.capacity(),
            max_concurrent_jobs: state.max_concurrent,
            queue_utilization: utilization,
            stats,
            system,
            health: self
                .inner
                .monitor
                .health(&system, utilization, self.inner.closed.load(Ordering::SeqCst)),
        }
    }

    /// Cancel a queued job outright, or flag an active one to stop at its next
    /// iteration boundary. Returns false when the job is unknown, already
    /// terminal, or the caller is not authorized.
    pub fn cancel_job(&self, job_id: JobId, context: &AuthContext) -> bool {
        if !self.inner.authorizer.authorize(context, RESOURCE_JOBS, ACTION_CANCEL) {
            tracing::warn!(job_id = %job_id, subject = %context.subject, "Cancel not authorized");
            return false;
        }

        let mut state = self.inner.lock();
        let removed = state.queue.remove(job_id);
        if let Some(job) = removed {
            job.cancel();
            state.record_cancelled(job_id);
            drop(state);
            metrics::counter!("verify_jobs_cancelled_total").increment(1);
            self.inner.audit.record(AuditEvent::Cancelled { job_id });
            tracing::info!(job_id = %job_id, "Queued job cancelled");
            return true;
        }
        if let Some(active) = state.active.get(&job_id) {
            active.job.cancel();
            tracing::info!(job_id = %job_id, "Cancellation requested for active job");
            return true;
        }
        false
    }

    /// Applies to future dispatches; running jobs are not preempted.
    pub fn set_concurrency_limit(&self, limit: usize) -> Result<(), ConcurrencyError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&limit) {
            return Err(ConcurrencyError::OutOfRange { requested: limit });
        }
        self.inner.lock().max_concurrent = limit;
        tracing::info!(limit, "Concurrency limit updated");
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Stop admissions, cancel every active job and drop the queue. Returns
    /// false only when the caller is not authorized.
    pub fn emergency_shutdown(&self, context: &AuthContext) -> bool {
        if !self.inner.authorizer.authorize(context, RESOURCE_SYSTEM, ACTION_ADMIN) {
            tracing::warn!(subject = %context.subject, "Emergency shutdown not authorized");
            return false;
        }
        tracing::warn!(subject = %context.subject, "Emergency shutdown requested");
        self.inner.terminate(true);
        true
    }

    /// Stop admissions and let queued and active work finish within `grace`;
    /// whatever remains afterwards is cancelled. Returns true when everything
    /// drained in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.inner.closed.store(true, Ordering::SeqCst);
        tracing::info!(grace_secs = grace.as_secs_f64(), "Graceful shutdown started");

        let deadline = tokio::time::Instant::now() + grace;
        let drained = loop {
            let idle = {
                let state = self.inner.lock();
                state.queue.is_empty() && state.active.is_empty()
            };
            if idle {
                break true;
            }
            if tokio::time::Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(DRAIN_CHECK_INTERVAL).await;
        };

        if !drained {
            tracing::warn!("Grace period expired, cancelling remaining jobs");
        }
        self.inner.terminate(!drained);
        drained
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn admit(&self, job: Job) -> Result<JobId, SubmitError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SubmitError::ShuttingDown);
        }
        self.validate(&job).await?;

        if !self.authorizer.authorize(&job.context, RESOURCE_JOBS, ACTION_SUBMIT) {
            return Err(SubmitError::Unauthorized);
        }

        let utilization = {
            let state = self.lock();
            if state.queue.len() >= state.queue.capacity() {
                return Err(SubmitError::QueueFull {
                    capacity: state.queue.capacity(),
                });
            }
            state.queue.utilization()
        };

        if self.monitor.back_pressure_active(utilization) {
            tracing::debug!(utilization, "Back-pressure delay");
            tokio::time::sleep(self.config.admission_retry_delay).await;
        }

        let utilization = self.lock().queue.utilization();
        if !self.monitor.check_capacity(utilization) {
            tokio::time::sleep(self.config.admission_retry_delay).await;
            let utilization = self.lock().queue.utilization();
            if !self.monitor.check_capacity(utilization) {
                return Err(SubmitError::CapacityExceeded);
            }
        }

        let job_id = job.job_id;
        let mut state = self.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(SubmitError::ShuttingDown);
        }
        if state.knows(&job_id) {
            return Err(SubmitError::InvalidJob(format!("duplicate job id {job_id}")));
        }
        state.queue.enqueue(job).map_err(|e| match e {
            QueueError::Full { capacity } => SubmitError::QueueFull { capacity },
        })?;
        metrics::gauge!("verify_queue_depth").set(state.queue.len() as f64);
        Ok(job_id)
    }

    async fn validate(&self, job: &Job) -> Result<(), SubmitError> {
        let invalid = |msg: String| Err(SubmitError::InvalidJob(msg));

        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&job.priority) {
            return invalid(format!(
                "priority {} outside {MIN_PRIORITY}..={MAX_PRIORITY}",
                job.priority
            ));
        }
        if !self.formats.contains(&job.format_id) {
            return invalid(format!("unknown format '{}'", job.format_id));
        }

        let meta = match tokio::fs::metadata(&job.input_path).await {
            Ok(meta) => meta,
            Err(e) => return invalid(format!("input {} not readable: {e}", job.input_path.display())),
        };
        if !meta.is_file() {
            return invalid(format!("input {} is not a file", job.input_path.display()));
        }
        if meta.len() > self.config.max_input_bytes {
            return invalid(format!(
                "input is {} bytes, limit is {}",
                meta.len(),
                self.config.max_input_bytes
            ));
        }

        if job.output_path.as_os_str().is_empty() {
            return invalid("output path is empty".to_string());
        }
        if let Some(parent) = job.output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return invalid(format!("output directory {} not creatable: {e}", parent.display()));
            }
        }
        Ok(())
    }

    async fn run_dispatch_loop(self: Arc<Self>) {
        tracing::info!(
            max_concurrent = self.lock().max_concurrent,
            poll_ms = self.config.poll_interval.as_millis() as u64,
            "Dispatch loop started"
        );
        let mut tick = tokio::time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            self.sweep_timeouts();
            if self.stop.is_cancelled() {
                break;
            }
            self.dispatch_ready();

            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tick.tick() => self.monitor_tick(),
            }
        }
        tracing::info!("Dispatch loop stopped");
    }

    /// Start queued jobs while slots and system capacity allow.
    fn dispatch_ready(self: &Arc<Self>) {
        loop {
            {
                let state = self.lock();
                if state.queue.is_empty() || state.active.len() >= state.max_concurrent {
                    return;
                }
            }
            if !self.monitor.check_system_capacity() {
                tracing::debug!("Dispatch deferred: system over capacity");
                return;
            }

            let (job, progress) = {
                let mut state = self.lock();
                if self.stop.is_cancelled() || state.active.len() >= state.max_concurrent {
                    return;
                }
                let Some(job) = state.queue.dequeue_highest_priority() else {
                    return;
                };
                let progress = Arc::new(JobProgress::new());
                state.active.insert(
                    job.job_id,
                    ActiveJob {
                        job: job.clone(),
                        started_at: Utc::now(),
                        started: Instant::now(),
                        progress: Arc::clone(&progress),
                    },
                );
                metrics::gauge!("verify_queue_depth").set(state.queue.len() as f64);
                metrics::gauge!("verify_active_jobs").set(state.active.len() as f64);
                (job, progress)
            };

            tracing::info!(job_id = %job.job_id, priority = job.priority, "Job started");
            self.audit.record(AuditEvent::Started { job_id: job.job_id });
            self.spawn_worker(job, progress);
        }
    }

    fn spawn_worker(self: &Arc<Self>, job: Job, progress: Arc<JobProgress>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let started = Instant::now();
            let runner = Arc::clone(&inner.runner);
            let rules = inner.formats.get(&job.format_id).cloned();
            let worker_job = job.clone();

            let joined = tokio::task::spawn_blocking(move || match rules {
                Some(rules) => runner.process(&worker_job, &rules, &progress),
                None => ProcessingReport::failure(
                    worker_job.job_id,
                    Termination::ProcessingError,
                    Issue::error(
                        IssueCategory::Processing,
                        CODE_PROCESSING_ERROR,
                        format!("format '{}' disappeared", worker_job.format_id),
                    ),
                    0.0,
                ),
            })
            .await;

            let report = match joined {
                Ok(report) => report,
                Err(e) => {
                    let detail = if e.is_panic() { "worker panicked" } else { "worker aborted" };
                    tracing::error!(job_id = %job.job_id, error = %e, "{detail}");
                    ProcessingReport::failure(
                        job.job_id,
                        Termination::ProcessingError,
                        Issue::error(
                            IssueCategory::Processing,
                            CODE_PROCESSING_ERROR,
                            format!("Unexpected processing error: {detail}"),
                        ),
                        started.elapsed().as_secs_f64() * 1000.0,
                    )
                }
            };
            inner.finish_job(&job, report);
        });
    }

    fn sign(&self, report: &mut ProcessingReport, context: &AuthContext) {
        let signed = report
            .signing_payload()
            .map_err(Into::into)
            .and_then(|payload| self.signer.sign(&payload, context));
        match signed {
            Ok(signature) => report.signature = signature,
            Err(e) => tracing::warn!(job_id = %report.job_id, error = %e, "Report left unsigned"),
        }
    }

    fn finish_job(&self, job: &Job, mut report: ProcessingReport) {
        self.sign(&mut report, &job.context);

        let filed = {
            let mut state = self.lock();
            if state.active.remove(&job.job_id).is_none() {
                tracing::debug!(job_id = %job.job_id, "Discarding result of job already terminated");
                return;
            }
            let filed = if report.success {
                Filed::Completed
            } else if report.termination == Termination::Cancelled {
                Filed::Cancelled
            } else {
                Filed::Failed
            };
            match filed {
                Filed::Completed => {
                    state.stats.completed += 1;
                    state.stats.record_run(&report);
                    state.completed.insert(job.job_id, report.clone());
                }
                Filed::Failed => {
                    state.stats.failed += 1;
                    state.stats.record_run(&report);
                    state.failed.insert(job.job_id, report.clone());
                }
                Filed::Cancelled => state.record_cancelled(job.job_id),
            }
            metrics::gauge!("verify_active_jobs").set(state.active.len() as f64);
            filed
        };

        metrics::histogram!("verify_processing_seconds").record(report.total_time_ms / 1000.0);
        match filed {
            Filed::Completed | Filed::Failed => {
                if filed == Filed::Completed {
                    metrics::counter!("verify_jobs_completed_total").increment(1);
                } else {
                    metrics::counter!("verify_jobs_failed_total").increment(1);
                }
                self.audit.record(AuditEvent::Completed {
                    job_id: job.job_id,
                    success: report.success,
                    iterations: report.stats.iterations_run,
                });
                if filed == Filed::Failed {
                    self.audit.record(AuditEvent::Failed {
                        job_id: job.job_id,
                        reason: report.failure_reason(),
                    });
                }
            }
            Filed::Cancelled => {
                metrics::counter!("verify_jobs_cancelled_total").increment(1);
                self.audit.record(AuditEvent::Cancelled { job_id: job.job_id });
            }
        }
        tracing::info!(job_id = %job.job_id, outcome = ?filed, termination = ?report.termination, "Job finished");
        self.wake.notify_one();
    }

    /// Fail every active job that has run past the processing timeout.
    fn sweep_timeouts(&self) {
        let timeout = self.config.processing_timeout;
        let mut expired: Vec<(JobId, f64)> = Vec::new();
        {
            let mut state = self.lock();
            let ids: Vec<JobId> = state
                .active
                .iter()
                .filter(|(_, a)| a.started.elapsed() > timeout)
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                let Some(active) = state.active.remove(&id) else {
                    continue;
                };
                active.job.cancel();
                let elapsed_ms = active.started.elapsed().as_secs_f64() * 1000.0;
                let report = ProcessingReport::failure(
                    id,
                    Termination::TimedOut,
                    Issue::error(
                        IssueCategory::Timeout,
                        CODE_TIMEOUT,
                        format!("Processing exceeded {}s", timeout.as_secs_f64()),
                    ),
                    elapsed_ms,
                );
                state.stats.failed += 1;
                state.stats.record_run(&report);
                state.failed.insert(id, report);
                expired.push((id, elapsed_ms));
            }
        }

        if expired.is_empty() {
            return;
        }
        for (job_id, elapsed_ms) in &expired {
            tracing::warn!(job_id = %job_id, elapsed_ms, "Job timed out");
            metrics::counter!("verify_jobs_failed_total").increment(1);
            self.audit.record(AuditEvent::TimedOut { job_id: *job_id });
        }
        metrics::gauge!("verify_active_jobs").set(self.lock().active.len() as f64);
        self.wake.notify_one();
    }

    fn monitor_tick(&self) {
        let snapshot = self.monitor.snapshot();
        let (pending, active, utilization) = {
            let state = self.lock();
            (state.queue.len(), state.active.len(), state.queue.utilization())
        };
        metrics::gauge!("verify_queue_depth").set(pending as f64);
        metrics::gauge!("verify_active_jobs").set(active as f64);

        let warnings = self.monitor.warnings(&snapshot, utilization);
        if !warnings.is_empty() {
            tracing::warn!(?warnings, pending, active, "Resource warnings");
        }
    }

    /// Close admissions, drop the queue and cancel every active job.
    fn terminate(&self, emergency: bool) {
        self.closed.store(true, Ordering::SeqCst);
        let cancelled_jobs = {
            let mut state = self.lock();
            let mut ids = Vec::new();
            for job in state.queue.drain() {
                job.cancel();
                ids.push(job.job_id);
            }
            let active: Vec<JobId> = state.active.keys().copied().collect();
            for id in active {
                if let Some(a) = state.active.remove(&id) {
                    a.job.cancel();
                    ids.push(id);
                }
            }
            for id in &ids {
                state.record_cancelled(*id);
            }
            ids.len()
        };
        self.stop.cancel();

        metrics::counter!("verify_jobs_cancelled_total").increment(cancelled_jobs as u64);
        metrics::gauge!("verify_queue_depth").set(0.0);
        metrics::gauge!("verify_active_jobs").set(0.0);
        self.audit.record(AuditEvent::Shutdown {
            emergency,
            cancelled_jobs,
        });
        tracing::warn!(emergency, cancelled_jobs, "Controller shut down");
    }

    fn stats(&self, state: &SchedulerState) -> ProcessingStats {
        let s = &state.stats;
        let uptime_secs = self.created.elapsed().as_secs_f64();
        let finished = s.completed + s.failed;
        ProcessingStats {
            total_submitted: state.queue.total_submitted(),
            total_completed: s.completed,
            total_failed: s.failed,
            total_cancelled: s.cancelled,
            average_processing_ms: s.average_ms().unwrap_or(0.0),
            average_iterations: if s.runs == 0 {
                0.0
            } else {
                s.total_iterations as f64 / s.runs as f64
            },
            throughput_per_minute: if uptime_secs > 0.0 {
                finished as f64 / (uptime_secs / 60.0)
            } else {
                0.0
            },
            success_rate: if finished == 0 {
                0.0
            } else {
                s.completed as f64 / finished as f64
            },
            uptime_secs,
        }
    }
}

fn summarize(report: &ProcessingReport) -> CompletionSummary {
    CompletionSummary {
        job_id: report.job_id,
        success: report.success,
        total_time_ms: report.total_time_ms,
        iterations: report.stats.iterations_run,
        issues: report.issues.clone(),
        finished_at: report.finished_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retained_evicts_oldest() {
        let mut retained = Retained::new(2);
        let ids: Vec<JobId> = (0..3).map(|_| JobId::new()).collect();
        for (i, id) in ids.iter().enumerate() {
            retained.insert(*id, i);
        }
        assert_eq!(retained.len(), 2);
        assert!(!retained.contains(&ids[0]));
        assert_eq!(retained.get(&ids[2]), Some(&2));
    }

    #[test]
    fn test_submit_error_reasons() {
        assert_eq!(SubmitError::InvalidJob("x".into()).reason(), "invalid_job");
        assert_eq!(SubmitError::QueueFull { capacity: 1 }.reason(), "queue_full");
        assert_eq!(SubmitError::CapacityExceeded.reason(), "capacity_exceeded");
        assert_eq!(SubmitError::ShuttingDown.reason(), "shutting_down");
    }

    #[test]
    fn test_stats_average() {
        let mut stats = StatsAccumulator::default();
        assert_eq!(stats.average_ms(), None);
        let mut report = ProcessingReport::failure(
            JobId::new(),
            Termination::Exhausted,
            Issue::warning(IssueCategory::Quality, "X", "x"),
            100.0,
        );
        report.stats.iterations_run = 3;
        stats.record_run(&report);
        report.total_time_ms = 300.0;
        stats.record_run(&report);
        assert_eq!(stats.average_ms(), Some(200.0));
        assert_eq!(stats.total_iterations, 6);
    }
}
