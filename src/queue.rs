//! # Job Queue
//!
//! Runs jobs on a fixed pool of worker threads while honouring declared
//! predecessor jobs, dropping equivalent duplicates and serializing jobs that
//! conflict with one another.
//!
//! Every state transition happens under the queue's single state lock, and
//! ready jobs are handed to workers through a crossbeam channel. Readers
//! (`QueuedJob::state`, `JobInfo`) lock only the job they inspect, so polling
//! never observes a half-applied transition.
//!
//! Failure propagates forward: when a predecessor fails, every job depending
//! on it is marked `Failure` without running. A job that waits on a
//! conflicting job is released however that job ends.

use crate::config::QueueConfig;
use crate::error::{Result, SmartfireError};
use crate::temporal::{format_elapsed, now};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::{debug, warn};

/// A unit of work executed by the [`JobQueue`]
pub trait Job: Send + Sync + 'static {
    /// Run the job, reporting progress as it goes
    fn execute(&self, progress: &ProgressReporter) -> anyhow::Result<()>;

    /// True if running `other` would make this job redundant
    fn is_equivalent_to(&self, _other: &dyn Job) -> bool {
        false
    }

    /// True if this job must not run at the same time as `other`
    fn is_conflicting_with(&self, _other: &dyn Job) -> bool {
        false
    }

    /// Downcasting hook for equivalence and conflict checks
    fn as_any(&self) -> &dyn Any;
}

/// Adapter turning a closure into a [`Job`]
pub struct FnJob<F> {
    body: F,
}

/// Wrap a closure as a job with no equivalence or conflict rules
pub fn job_fn<F>(body: F) -> FnJob<F>
where
    F: Fn(&ProgressReporter) -> anyhow::Result<()> + Send + Sync + 'static,
{
    FnJob { body }
}

impl<F> Job for FnJob<F>
where
    F: Fn(&ProgressReporter) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn execute(&self, progress: &ProgressReporter) -> anyhow::Result<()> {
        (self.body)(progress)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Lifecycle state of a queued job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Queued,
    Running,
    Success,
    Failure,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Success | JobState::Failure)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::Success => "SUCCESS",
            JobState::Failure => "FAILURE",
        })
    }
}

/// Percent complete plus a status line
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub percent: u8,
    pub status: String,
}

/// Shared, thread-safe progress cell handed to a running job
#[derive(Clone)]
pub struct ProgressReporter {
    job: Arc<str>,
    current: Arc<Mutex<Progress>>,
}

impl ProgressReporter {
    pub fn new(job: &str) -> Self {
        Self {
            job: Arc::from(job),
            current: Arc::new(Mutex::new(Progress::default())),
        }
    }

    /// Reporter not attached to any queued job
    pub fn detached() -> Self {
        Self::new("detached")
    }

    pub fn set(&self, percent: u8, status: impl Into<String>) {
        let status = status.into();
        let percent = percent.min(100);
        debug!(job = %self.job, "{}% : {}", percent, status);
        *self.current.lock() = Progress { percent, status };
    }

    pub fn get(&self) -> Progress {
        self.current.lock().clone()
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("job", &self.job)
            .field("current", &self.get())
            .finish()
    }
}

/// Point-in-time snapshot of a queued job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub name: String,
    pub state: JobState,
    pub progress: Progress,
    #[serde(with = "time::serde::rfc3339")]
    pub submitted: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed: Option<OffsetDateTime>,
    pub error: Option<String>,
}

impl JobInfo {
    /// Time since the job started, up to completion if it has finished
    pub fn elapsed(&self) -> Option<time::Duration> {
        let started = self.started?;
        Some(self.completed.unwrap_or_else(now) - started)
    }

    /// Elapsed time as `1h 2m 3s`, empty if the job has not started
    pub fn elapsed_string(&self) -> String {
        self.elapsed().map(format_elapsed).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    /// Downstream runs only if the upstream succeeds
    Dependency,
    /// Downstream waits for the upstream to end, whatever the outcome
    Conflict,
}

struct JobStatus {
    state: JobState,
    upstream: Vec<QueuedJob>,
    downstream: Vec<(QueuedJob, Edge)>,
    dispatched: bool,
    started: Option<OffsetDateTime>,
    completed: Option<OffsetDateTime>,
    error: Option<String>,
}

struct JobEntry {
    name: String,
    job: Arc<dyn Job>,
    progress: ProgressReporter,
    submitted: OffsetDateTime,
    status: Mutex<JobStatus>,
    finished: Condvar,
}

/// Handle to a job registered with a [`JobQueue`]
#[derive(Clone)]
pub struct QueuedJob {
    entry: Arc<JobEntry>,
}

impl QueuedJob {
    fn new(job: Arc<dyn Job>, name: String) -> Self {
        let progress = ProgressReporter::new(&name);
        Self {
            entry: Arc::new(JobEntry {
                name,
                job,
                progress,
                submitted: now(),
                status: Mutex::new(JobStatus {
                    state: JobState::Queued,
                    upstream: Vec::new(),
                    downstream: Vec::new(),
                    dispatched: false,
                    started: None,
                    completed: None,
                    error: None,
                }),
                finished: Condvar::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn job(&self) -> &dyn Job {
        self.entry.job.as_ref()
    }

    pub fn state(&self) -> JobState {
        self.entry.status.lock().state
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn progress(&self) -> Progress {
        self.entry.progress.get()
    }

    /// Error recorded when the job failed
    pub fn error(&self) -> Option<String> {
        self.entry.status.lock().error.clone()
    }

    /// Names of predecessors that have not finished yet
    pub fn pending_upstream(&self) -> Vec<String> {
        self.entry
            .status
            .lock()
            .upstream
            .iter()
            .map(|job| job.name().to_string())
            .collect()
    }

    pub fn info(&self) -> JobInfo {
        let status = self.entry.status.lock();
        JobInfo {
            name: self.entry.name.clone(),
            state: status.state,
            progress: self.entry.progress.get(),
            submitted: self.entry.submitted,
            started: status.started,
            completed: status.completed,
            error: status.error.clone(),
        }
    }

    /// Block until the job reaches a terminal state or the timeout passes
    pub fn wait(&self, timeout: Duration) -> JobState {
        let deadline = Instant::now() + timeout;
        let mut status = self.entry.status.lock();
        while !status.state.is_terminal() {
            if self.entry.finished.wait_until(&mut status, deadline).timed_out() {
                break;
            }
        }
        status.state
    }

    fn same(&self, other: &QueuedJob) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }

    /// True when `target` is an unfinished predecessor of this job, directly or transitively
    fn waits_on(&self, target: &QueuedJob) -> bool {
        let mut stack = vec![self.clone()];
        let mut seen: Vec<QueuedJob> = Vec::new();
        while let Some(job) = stack.pop() {
            if job.same(target) {
                return true;
            }
            if seen.contains(&job) {
                continue;
            }
            let upstream = job.entry.status.lock().upstream.clone();
            seen.push(job);
            stack.extend(upstream);
        }
        false
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl Eq for QueuedJob {}

impl fmt::Debug for QueuedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedJob")
            .field("name", &self.entry.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Scheduler bookkeeping guarded by the single queue lock
struct QueueState {
    jobs: Vec<QueuedJob>,
    running: Vec<QueuedJob>,
    accepting: bool,
    sender: Option<Sender<QueuedJob>>,
}

impl QueueState {
    /// Record `upstream` as a predecessor of `downstream`
    fn link(&mut self, downstream: &QueuedJob, upstream: &QueuedJob, edge: Edge) {
        if downstream.same(upstream) {
            return;
        }
        if upstream.waits_on(downstream) {
            debug!(
                "Not making {} wait on {}; it would wait on itself",
                downstream.name(),
                upstream.name()
            );
            return;
        }
        let upstream_state = {
            let mut up = upstream.entry.status.lock();
            if !up.state.is_terminal() {
                up.downstream.push((downstream.clone(), edge));
            }
            up.state
        };
        match upstream_state {
            JobState::Queued | JobState::Running => {
                downstream.entry.status.lock().upstream.push(upstream.clone());
            }
            JobState::Failure if edge == Edge::Dependency => {
                self.fail(downstream, format!("Upstream job {} failed", upstream.name()));
            }
            JobState::Success | JobState::Failure => {}
        }
    }

    /// Hand the job to the workers if it is queued with nothing left to wait for
    fn try_dispatch(&mut self, queued: &QueuedJob) {
        let ready = {
            let mut status = queued.entry.status.lock();
            let ready =
                status.state == JobState::Queued && status.upstream.is_empty() && !status.dispatched;
            if ready {
                status.dispatched = true;
            }
            ready
        };
        if !ready {
            debug!("Job {} is not yet ready to run", queued.name());
            return;
        }
        match &self.sender {
            Some(sender) => {
                debug!("Adding job {} to the worker queue", queued.name());
                if sender.send(queued.clone()).is_err() {
                    queued.entry.status.lock().dispatched = false;
                }
            }
            None => queued.entry.status.lock().dispatched = false,
        }
    }

    /// Fail a job that has not started, then everything that depends on it
    fn fail(&mut self, queued: &QueuedJob, reason: String) {
        let downstream = {
            let mut status = queued.entry.status.lock();
            if status.state != JobState::Queued {
                return;
            }
            status.state = JobState::Failure;
            status.completed = Some(now());
            status.error = Some(reason.clone());
            status.upstream.clear();
            queued.entry.progress.set(100, reason);
            std::mem::take(&mut status.downstream)
        };
        queued.entry.finished.notify_all();
        self.release_downstream(queued, JobState::Failure, downstream);
    }

    fn release_downstream(
        &mut self,
        upstream: &QueuedJob,
        outcome: JobState,
        downstream: Vec<(QueuedJob, Edge)>,
    ) {
        for (job, edge) in downstream {
            job.entry
                .status
                .lock()
                .upstream
                .retain(|pending| !pending.same(upstream));
            if outcome == JobState::Failure && edge == Edge::Dependency {
                self.fail(&job, format!("Upstream job {} failed", upstream.name()));
            } else {
                self.try_dispatch(&job);
            }
        }
    }

    /// Called by a worker before executing; false means the job must not run now
    fn begin(&mut self, queued: &QueuedJob) -> bool {
        {
            let mut status = queued.entry.status.lock();
            status.dispatched = false;
            if !self.accepting {
                return false;
            }
            if status.state != JobState::Queued || !status.upstream.is_empty() {
                debug!(
                    "Ready to execute job {}, but it is not ready to run; abort",
                    queued.name()
                );
                return false;
            }
        }

        let conflicting = self
            .running
            .iter()
            .find(|running| queued.job().is_conflicting_with(running.job()))
            .cloned();
        if let Some(running) = conflicting {
            debug!(
                "Waiting to execute job {} until job {} is done",
                queued.name(),
                running.name()
            );
            self.link(queued, &running, Edge::Conflict);
            return false;
        }

        {
            let mut status = queued.entry.status.lock();
            status.state = JobState::Running;
            status.started = Some(now());
        }
        self.running.push(queued.clone());
        true
    }

    /// Record the outcome of an executed job and release its dependents
    fn finish(&mut self, queued: &QueuedJob, outcome: std::result::Result<(), String>) {
        self.running.retain(|running| !running.same(queued));

        let progress = &queued.entry.progress;
        let (state, error, summary) = match outcome {
            Ok(()) => (JobState::Success, None, progress.get().status),
            Err(message) => {
                debug!("Exception while executing job \"{}\": {}", queued.name(), message);
                let summary = format!("Exception while executing job: {}", message);
                (JobState::Failure, Some(message), summary)
            }
        };

        // State, error and final progress change together under the status lock
        let downstream = {
            let mut status = queued.entry.status.lock();
            status.state = state;
            status.completed = Some(now());
            status.error = error;
            progress.set(100, summary);
            std::mem::take(&mut status.downstream)
        };
        queued.entry.finished.notify_all();
        self.release_downstream(queued, state, downstream);
    }
}

struct Shared {
    state: Mutex<QueueState>,
}

/// Fixed-size worker pool executing jobs in dependency order
pub struct JobQueue {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    shutdown_timeout: Duration,
}

/// Default worker count: one per available CPU
pub fn default_worker_count() -> usize {
    thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

impl JobQueue {
    /// Create a queue with `workers` threads (0 means one per CPU)
    pub fn new(workers: usize) -> Result<Self> {
        Self::with_shutdown_timeout(workers, Duration::from_secs(5))
    }

    pub fn from_config(config: &QueueConfig) -> Result<Self> {
        Self::with_shutdown_timeout(
            config.workers,
            Duration::from_millis(config.shutdown_timeout_ms),
        )
    }

    pub fn with_shutdown_timeout(workers: usize, shutdown_timeout: Duration) -> Result<Self> {
        let worker_count = if workers == 0 {
            default_worker_count()
        } else {
            workers
        };
        let (sender, receiver) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                jobs: Vec::new(),
                running: Vec::new(),
                accepting: true,
                sender: Some(sender),
            }),
        });

        let mut handles = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let worker_shared = Arc::clone(&shared);
            let worker_receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("smartfire-worker-{}", index))
                .spawn(move || worker_loop(worker_shared, worker_receiver))
                .map_err(|e| SmartfireError::Store(format!("failed to spawn worker: {}", e)))?;
            handles.push(handle);
        }

        Ok(Self {
            shared,
            workers: Mutex::new(handles),
            worker_count,
            shutdown_timeout,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Register a job that runs once every predecessor has succeeded
    pub fn enqueue<J: Job>(
        &self,
        job: J,
        name: impl Into<String>,
        predecessors: &[QueuedJob],
    ) -> Result<QueuedJob> {
        let mut state = self.shared.state.lock();
        if !state.accepting {
            return Err(SmartfireError::QueueDisposed);
        }
        let queued = QueuedJob::new(Arc::new(job), name.into());
        register(&mut state, &queued, predecessors);
        Ok(queued)
    }

    /// Like [`enqueue`](Self::enqueue), unless an equivalent job already exists
    ///
    /// An equivalent job that is still queued is returned instead, after gaining
    /// the new predecessors. An equivalent job that is already running becomes
    /// a predecessor of the new job.
    pub fn enqueue_if_none_equivalent<J: Job>(
        &self,
        job: J,
        name: impl Into<String>,
        predecessors: &[QueuedJob],
    ) -> Result<QueuedJob> {
        let name = name.into();
        let mut state = self.shared.state.lock();
        if !state.accepting {
            return Err(SmartfireError::QueueDisposed);
        }

        let mut predecessors = predecessors.to_vec();
        let existing_jobs = state.jobs.clone();
        for existing in existing_jobs {
            if !job.is_equivalent_to(existing.job()) {
                continue;
            }
            match existing.state() {
                JobState::Queued => {
                    debug!(
                        "Ignoring new job {} because it is equivalent to existing job {}",
                        name,
                        existing.name()
                    );
                    for upstream in &predecessors {
                        state.link(&existing, upstream, Edge::Dependency);
                    }
                    return Ok(existing);
                }
                JobState::Running => {
                    debug!(
                        "Existing job {} is already running; marking it as upstream of new job {}",
                        existing.name(),
                        name
                    );
                    predecessors.push(existing);
                }
                JobState::Success | JobState::Failure => {}
            }
        }

        let queued = QueuedJob::new(Arc::new(job), name);
        register(&mut state, &queued, &predecessors);
        Ok(queued)
    }

    /// Every job registered since the queue was created
    pub fn queued_jobs(&self) -> Vec<QueuedJob> {
        self.shared.state.lock().jobs.clone()
    }

    pub fn jobs_info(&self) -> Vec<JobInfo> {
        self.queued_jobs().iter().map(QueuedJob::info).collect()
    }

    /// Snapshot of the most recently registered job with this name
    pub fn job_info(&self, name: &str) -> Option<JobInfo> {
        self.queued_jobs()
            .iter()
            .rev()
            .find(|job| job.name() == name)
            .map(QueuedJob::info)
    }

    pub fn is_disposed(&self) -> bool {
        !self.shared.state.lock().accepting
    }

    /// Stop accepting work, fail jobs that never started and stop the workers
    ///
    /// Running jobs may finish; workers still busy after the shutdown timeout are
    /// abandoned. Calling this more than once is harmless.
    pub fn dispose(&self) {
        let handles = {
            let mut state = self.shared.state.lock();
            if !state.accepting {
                return;
            }
            state.accepting = false;
            state.sender = None;
            let pending: Vec<QueuedJob> = state
                .jobs
                .iter()
                .filter(|job| job.state() == JobState::Queued)
                .cloned()
                .collect();
            for job in &pending {
                state.fail(job, "Job queue disposed".to_string());
            }
            state.jobs.clear();
            std::mem::take(&mut *self.workers.lock())
        };

        let deadline = Instant::now() + self.shutdown_timeout;
        for handle in handles {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("Worker still busy after the shutdown timeout; abandoning it");
            }
        }
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn register(state: &mut QueueState, queued: &QueuedJob, predecessors: &[QueuedJob]) {
    for upstream in predecessors {
        state.link(queued, upstream, Edge::Dependency);
    }
    state.jobs.push(queued.clone());
    state.try_dispatch(queued);
}

fn worker_loop(shared: Arc<Shared>, receiver: Receiver<QueuedJob>) {
    while let Ok(queued) = receiver.recv() {
        if !shared.state.lock().begin(&queued) {
            continue;
        }

        let entry = &queued.entry;
        let outcome = match catch_unwind(AssertUnwindSafe(|| entry.job.execute(&entry.progress))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(format!("{:#}", error)),
            Err(panic) => Err(panic_message(panic.as_ref())),
        };

        shared.state.lock().finish(&queued, outcome);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("job panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("job panicked: {}", message)
    } else {
        "job panicked".to_string()
    }
}
