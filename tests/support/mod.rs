use std::sync::Arc;
use std::time::{Duration, Instant};

use smartfire_rs::config::{QueueConfig, SmartfireConfig};
use smartfire_rs::{
    JobState, QueuedJob, ReconciliationStream, ReconciliationWeighting, Source, SourceId, StreamId,
};

pub const ICS_209: u32 = 1;
pub const HMS: u32 = 2;

#[allow(dead_code)]
pub fn weighting(source: u32, name: f64, size: f64) -> ReconciliationWeighting {
    let mut weighting = ReconciliationWeighting::new(SourceId(source));
    weighting.name_weight = name;
    weighting.type_weight = name;
    weighting.size_weight = size;
    weighting.shape_weight = size;
    weighting.growth_weight = size;
    weighting
}

/// Stream where ICS-209 wins names and types and HMS wins shapes and sizes
#[allow(dead_code)]
pub fn national_stream(id: u32) -> ReconciliationStream {
    ReconciliationStream::new(StreamId(id), "National")
        .with_source(
            Source::new(SourceId(ICS_209), "ICS-209").with_false_alarm_rate(0.1),
            weighting(ICS_209, 0.9, 0.1),
        )
        .with_source(
            Source::new(SourceId(HMS), "HMS").with_false_alarm_rate(0.2),
            weighting(HMS, 0.1, 0.9),
        )
}

#[allow(dead_code)]
pub fn test_config(workers: usize) -> SmartfireConfig {
    SmartfireConfig {
        queue: QueueConfig {
            workers,
            shutdown_timeout_ms: 2_000,
        },
        ..SmartfireConfig::default()
    }
}

/// Poll until `job` reaches a terminal state, panicking after `timeout`
#[allow(dead_code)]
pub fn wait_finished(job: &QueuedJob, timeout: Duration) -> JobState {
    let deadline = Instant::now() + timeout;
    while !job.is_finished() {
        assert!(
            Instant::now() < deadline,
            "job {} did not finish within {:?}",
            job.name(),
            timeout
        );
        std::thread::sleep(Duration::from_millis(5));
    }
    job.state()
}

#[allow(dead_code)]
pub fn wait_all(jobs: &[QueuedJob], timeout: Duration) -> Vec<JobState> {
    jobs.iter().map(|job| wait_finished(job, timeout)).collect()
}

/// Closed flag that jobs can block on until a test opens it
#[allow(dead_code)]
#[derive(Clone, Default)]
pub struct Gate {
    open: Arc<(parking_lot::Mutex<bool>, parking_lot::Condvar)>,
}

#[allow(dead_code)]
impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        let (lock, cvar) = &*self.open;
        *lock.lock() = true;
        cvar.notify_all();
    }

    pub fn wait(&self) {
        let (lock, cvar) = &*self.open;
        let mut open = lock.lock();
        while !*open {
            cvar.wait(&mut open);
        }
    }
}
