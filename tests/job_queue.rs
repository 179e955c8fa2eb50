//! Scheduling behaviour of the job queue under real worker threads.
//!
//! 1. Predecessors finish before their dependents start, even when the pool
//!    is flooded with unrelated work
//! 2. Failures propagate to every transitive dependent
//! 3. Equivalent jobs are deduplicated and conflicting jobs never overlap
//! 4. Disposal fails pending work and refuses new work
//! 5. Observers never see a half-finished job

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use smartfire_rs::queue::{default_worker_count, job_fn};
use smartfire_rs::{Job, JobInfo, JobQueue, JobState, ProgressReporter, SmartfireError};

mod support;

use support::{wait_all, wait_finished, Gate};

const TIMEOUT: Duration = Duration::from_secs(20);

/// Job keyed by a number; equal keys are equivalent and conflicting
struct KeyedJob {
    key: u32,
    gate: Option<Gate>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl KeyedJob {
    fn new(key: u32) -> Self {
        Self {
            key,
            gate: None,
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Job for KeyedJob {
    fn execute(&self, progress: &ProgressReporter) -> anyhow::Result<()> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        thread::sleep(Duration::from_millis(20));
        progress.set(100, format!("key {} done", self.key));
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_equivalent_to(&self, other: &dyn Job) -> bool {
        other
            .as_any()
            .downcast_ref::<KeyedJob>()
            .is_some_and(|other| other.key == self.key)
    }

    fn is_conflicting_with(&self, other: &dyn Job) -> bool {
        self.is_equivalent_to(other)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn gated(gate: &Gate) -> impl Fn(&ProgressReporter) -> anyhow::Result<()> + Send + Sync + 'static {
    let gate = gate.clone();
    move |_: &ProgressReporter| {
        gate.wait();
        Ok(())
    }
}

#[test]
fn single_job_runs_to_success() -> anyhow::Result<()> {
    let queue = JobQueue::new(2)?;
    let job = queue.enqueue(job_fn(|_| Ok(())), "noop", &[])?;
    assert_eq!(wait_finished(&job, TIMEOUT), JobState::Success);
    assert!(job.info().completed.is_some());
    Ok(())
}

#[test]
fn dependent_waits_for_predecessor_under_load() -> anyhow::Result<()> {
    let queue = JobQueue::new(4)?;
    let first_done = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&first_done);
    let first = queue.enqueue(
        job_fn(move |_| {
            thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }),
        "first",
        &[],
    )?;

    let mut fillers = Vec::new();
    for i in 0..default_worker_count() * 2 {
        fillers.push(queue.enqueue(
            job_fn(|_| {
                thread::sleep(Duration::from_millis(5));
                Ok(())
            }),
            format!("filler {}", i),
            &[],
        )?);
    }

    let flag = Arc::clone(&first_done);
    let second = queue.enqueue(
        job_fn(move |_| {
            anyhow::ensure!(flag.load(Ordering::SeqCst), "ran before its predecessor");
            Ok(())
        }),
        "second",
        &[first.clone()],
    )?;

    assert_eq!(wait_finished(&second, TIMEOUT), JobState::Success);
    assert_eq!(first.state(), JobState::Success);
    assert!(wait_all(&fillers, TIMEOUT)
        .into_iter()
        .all(|state| state == JobState::Success));
    Ok(())
}

#[test]
fn failing_job_records_its_error() -> anyhow::Result<()> {
    let queue = JobQueue::new(1)?;
    let job = queue.enqueue(job_fn(|_| anyhow::bail!("no fires found")), "broken", &[])?;
    assert_eq!(wait_finished(&job, TIMEOUT), JobState::Failure);
    assert_eq!(job.error().as_deref(), Some("no fires found"));
    assert_eq!(
        job.progress().status,
        "Exception while executing job: no fires found"
    );
    Ok(())
}

#[test]
fn diamond_runs_in_dependency_order() -> anyhow::Result<()> {
    let queue = JobQueue::new(4)?;
    let order = Arc::new(Mutex::new(Vec::new()));
    let step = |name: &'static str| {
        let order = Arc::clone(&order);
        job_fn(move |_| {
            thread::sleep(Duration::from_millis(10));
            order.lock().push(name);
            Ok(())
        })
    };

    let top = queue.enqueue(step("top"), "top", &[])?;
    let left = queue.enqueue(step("left"), "left", &[top.clone()])?;
    let right = queue.enqueue(step("right"), "right", &[top.clone()])?;
    let bottom = queue.enqueue(step("bottom"), "bottom", &[left, right])?;

    assert_eq!(wait_finished(&bottom, TIMEOUT), JobState::Success);
    let order = order.lock();
    assert_eq!(order.len(), 4);
    assert_eq!(order[0], "top");
    assert_eq!(order[3], "bottom");
    Ok(())
}

#[test]
fn failure_propagates_transitively() -> anyhow::Result<()> {
    let queue = JobQueue::new(2)?;
    let ran = Arc::new(AtomicUsize::new(0));

    let root = queue.enqueue(job_fn(|_| anyhow::bail!("boom")), "root", &[])?;
    let counter = Arc::clone(&ran);
    let middle = queue.enqueue(
        job_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
        "middle",
        &[root.clone()],
    )?;
    let counter = Arc::clone(&ran);
    let leaf = queue.enqueue(
        job_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
        "leaf",
        &[middle.clone()],
    )?;

    assert_eq!(wait_finished(&leaf, TIMEOUT), JobState::Failure);
    assert_eq!(middle.error().as_deref(), Some("Upstream job root failed"));
    assert_eq!(leaf.error().as_deref(), Some("Upstream job middle failed"));
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    // Jobs added after the failure fail immediately
    let late = queue.enqueue(job_fn(|_| Ok(())), "late", &[root])?;
    assert_eq!(late.state(), JobState::Failure);
    Ok(())
}

#[test]
fn equivalent_queued_job_is_reused() -> anyhow::Result<()> {
    let queue = JobQueue::new(2)?;
    let gate = Gate::new();
    let blocker = queue.enqueue(job_fn(gated(&gate)), "blocker", &[])?;

    let original = queue.enqueue_if_none_equivalent(KeyedJob::new(7), "key 7", &[blocker.clone()])?;
    let duplicate = queue.enqueue_if_none_equivalent(KeyedJob::new(7), "key 7 again", &[])?;
    let different = queue.enqueue_if_none_equivalent(KeyedJob::new(8), "key 8", &[blocker.clone()])?;

    assert_eq!(original, duplicate);
    assert_ne!(original, different);
    assert_eq!(original.pending_upstream(), vec!["blocker".to_string()]);

    gate.open();
    assert_eq!(
        wait_all(&[original, different, blocker], TIMEOUT),
        vec![JobState::Success; 3]
    );
    assert_eq!(queue.queued_jobs().len(), 3);
    Ok(())
}

#[test]
fn running_equivalent_job_becomes_predecessor() -> anyhow::Result<()> {
    let queue = JobQueue::new(2)?;
    let gate = Gate::new();
    let mut running = KeyedJob::new(3);
    running.gate = Some(gate.clone());
    let running = queue.enqueue(running, "running", &[])?;
    while running.state() != JobState::Running {
        thread::sleep(Duration::from_millis(2));
    }

    let follower = queue.enqueue_if_none_equivalent(KeyedJob::new(3), "follower", &[])?;
    assert_ne!(running, follower);
    assert_eq!(follower.pending_upstream(), vec!["running".to_string()]);

    gate.open();
    assert_eq!(wait_finished(&follower, TIMEOUT), JobState::Success);
    Ok(())
}

#[test]
fn conflicting_jobs_never_overlap() -> anyhow::Result<()> {
    let queue = JobQueue::new(4)?;
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut jobs = Vec::new();
    for i in 0..6 {
        let job = KeyedJob {
            key: 1,
            gate: None,
            active: Arc::clone(&active),
            peak: Arc::clone(&peak),
        };
        jobs.push(queue.enqueue(job, format!("conflict {}", i), &[])?);
    }

    assert!(wait_all(&jobs, TIMEOUT)
        .into_iter()
        .all(|state| state == JobState::Success));
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn dispose_fails_pending_and_rejects_new_work() -> anyhow::Result<()> {
    let queue = JobQueue::with_shutdown_timeout(1, Duration::from_secs(5))?;
    let gate = Gate::new();
    let blocker = queue.enqueue(job_fn(gated(&gate)), "blocker", &[])?;
    let pending = queue.enqueue(job_fn(|_| Ok(())), "pending", &[blocker.clone()])?;
    while blocker.state() != JobState::Running {
        thread::sleep(Duration::from_millis(2));
    }

    let opener = {
        let gate = gate.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            gate.open();
        })
    };
    queue.dispose();
    let _ = opener.join();

    assert!(queue.is_disposed());
    assert_eq!(pending.state(), JobState::Failure);
    assert_eq!(pending.error().as_deref(), Some("Job queue disposed"));
    assert!(queue.queued_jobs().is_empty());
    assert!(matches!(
        queue.enqueue(job_fn(|_| Ok(())), "too late", &[]),
        Err(SmartfireError::QueueDisposed)
    ));
    Ok(())
}

/// A terminal state, its timestamp, error and final progress appear together
fn assert_consistent(info: &JobInfo) {
    match info.state {
        JobState::Queued | JobState::Running => {
            assert!(info.error.is_none(), "{} is {} with error {:?}", info.name, info.state, info.error);
            assert!(info.completed.is_none(), "{} is {} but completed", info.name, info.state);
        }
        JobState::Failure => {
            let error = info.error.as_deref().unwrap_or_else(|| panic!("{} failed without an error", info.name));
            assert!(info.completed.is_some());
            assert_eq!(info.progress.percent, 100);
            assert!(info.progress.status.contains(error), "{:?} lacks {:?}", info.progress.status, error);
        }
        JobState::Success => {
            assert!(info.error.is_none());
            assert!(info.completed.is_some());
            assert_eq!(info.progress.percent, 100);
        }
    }
}

#[test]
fn finished_jobs_publish_state_error_and_progress_together() -> anyhow::Result<()> {
    let queue = JobQueue::new(4)?;
    let mut jobs = Vec::new();
    for i in 0..40 {
        let failing = queue.enqueue(
            job_fn(move |progress| {
                progress.set(50, "halfway");
                thread::sleep(Duration::from_millis(2));
                anyhow::bail!("broken batch {}", i)
            }),
            format!("failing {}", i),
            &[],
        )?;
        let dependent = queue.enqueue(job_fn(|_| Ok(())), format!("dependent {}", i), &[failing.clone()])?;
        let passing = queue.enqueue(job_fn(|_| Ok(())), format!("passing {}", i), &[])?;
        jobs.extend([failing, dependent, passing]);
    }

    while !jobs.iter().all(|job| job.is_finished()) {
        for job in &jobs {
            assert_consistent(&job.info());
        }
    }
    for job in &jobs {
        assert_consistent(&job.info());
    }
    assert_eq!(jobs[1].error().as_deref(), Some("Upstream job failing 0 failed"));
    Ok(())
}
