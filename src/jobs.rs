//! # Reconciliation Jobs
//!
//! A [`ReconciliationJob`] reconciles every fire of a stream's sources inside
//! a date window. Two jobs for the same stream conflict when their windows
//! overlap, and a job is redundant when a queued job already covers its window.

use crate::config::ReconciliationConfig;
use crate::layers::LayerReader;
use crate::methods::{MethodContext, MethodRegistry};
use crate::model::{Fire, ReconciliationStream, StreamId};
use crate::queue::{Job, ProgressReporter};
use crate::store::{EventStore, FireStore, StreamEventSet};
use crate::temporal::Window;
use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::sync::Arc;
use tracing::{debug, info};

/// Job name shown in the queue, e.g. `Reconcile National for 2024-07-01`
pub fn job_name(stream: &ReconciliationStream, window: &Window) -> String {
    format!("Reconcile {} {}", stream.name, window.describe())
}

/// Reconcile one stream over one window
pub struct ReconciliationJob {
    stream: Arc<ReconciliationStream>,
    window: Window,
    fires: Arc<RwLock<FireStore>>,
    events: Arc<Mutex<EventStore>>,
    methods: Arc<MethodRegistry>,
    layers: Arc<dyn LayerReader>,
    settings: ReconciliationConfig,
}

impl ReconciliationJob {
    pub fn new(
        stream: Arc<ReconciliationStream>,
        window: Window,
        fires: Arc<RwLock<FireStore>>,
        events: Arc<Mutex<EventStore>>,
        methods: Arc<MethodRegistry>,
        layers: Arc<dyn LayerReader>,
        settings: ReconciliationConfig,
    ) -> Self {
        Self {
            stream,
            window,
            fires,
            events,
            methods,
            layers,
            settings,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream.id
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn name(&self) -> String {
        job_name(&self.stream, &self.window)
    }

    /// Fires of every stream source in the window, with probabilities filled in
    fn collect_fires(&self) -> anyhow::Result<Vec<Fire>> {
        let store = self.fires.read();
        let mut fires = Vec::new();
        for source in &self.stream.sources {
            let method = self
                .methods
                .new_probability_method(&source.probability_method, source)?;
            for mut fire in store.by_date(source.id, self.window.start, self.window.end) {
                if fire.probability.is_none() {
                    fire.probability = Some(method.fire_probability(&fire));
                }
                fires.push(fire);
            }
        }
        Ok(fires)
    }

    fn same_stream<'a>(&self, other: &'a dyn Job) -> Option<&'a ReconciliationJob> {
        other
            .as_any()
            .downcast_ref::<ReconciliationJob>()
            .filter(|other| other.stream.id == self.stream.id)
    }
}

impl Job for ReconciliationJob {
    fn execute(&self, progress: &ProgressReporter) -> anyhow::Result<()> {
        progress.set(10, "Setting up reconciliation");
        let context = MethodContext {
            stream: Arc::clone(&self.stream),
            layers: Arc::clone(&self.layers),
            settings: self.settings.clone(),
        };
        let name = self
            .stream
            .method
            .as_deref()
            .unwrap_or(&self.settings.method);
        let method = self.methods.new_reconciliation_method(name, &context)?;

        let mut fires = self.collect_fires()?;
        let unshaped = fires.iter().filter(|fire| fire.shape.is_none()).count();
        if unshaped > 0 {
            debug!("Skipping {} fires without a shape", unshaped);
            fires.retain(|fire| fire.shape.is_some());
        }
        if fires.is_empty() {
            progress.set(100, "Zero events created");
            return Ok(());
        }

        progress.set(30, "Reconciling fires");
        let total = fires.len();
        let mut events = self.events.lock();
        let mut view = StreamEventSet::new(&mut events, self.stream.id);
        for (index, fire) in fires.iter().enumerate() {
            method
                .reconcile(fire, &mut view)
                .with_context(|| format!("failed to reconcile fire {}", fire.id))?;
            let percent = 30 + ((index + 1) * 65 / total) as u8;
            progress.set(percent, format!("Reconciling fire {} of {}", index + 1, total));
        }

        let created = view.created();
        info!(
            stream = %self.stream.id,
            "Reconciled {} fires {}, creating {} new events",
            total,
            self.window.describe(),
            created
        );
        progress.set(
            100,
            format!(
                "Successfully reconciled {} fires, creating {} new events",
                total, created
            ),
        );
        Ok(())
    }

    /// Redundant when `other` reconciles the same stream over a window containing this one
    fn is_equivalent_to(&self, other: &dyn Job) -> bool {
        self.same_stream(other)
            .is_some_and(|other| other.window.contains(&self.window))
    }

    fn is_conflicting_with(&self, other: &dyn Job) -> bool {
        self.same_stream(other)
            .is_some_and(|other| other.window.overlaps(&self.window))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::NoLayers;
    use crate::model::{FireId, ReconciliationWeighting, Source, SourceId};
    use crate::queue::job_fn;
    use crate::test_support::square;
    use time::macros::{date, datetime};

    struct Fixture {
        stream: Arc<ReconciliationStream>,
        fires: Arc<RwLock<FireStore>>,
        events: Arc<Mutex<EventStore>>,
    }

    impl Fixture {
        fn new() -> Self {
            let stream = ReconciliationStream::new(StreamId(1), "National").with_source(
                Source::new(SourceId(1), "HMS").with_false_alarm_rate(0.2),
                ReconciliationWeighting::new(SourceId(1)),
            );
            Self {
                stream: Arc::new(stream),
                fires: Arc::new(RwLock::new(FireStore::new())),
                events: Arc::new(Mutex::new(EventStore::new())),
            }
        }

        fn job(&self, first: time::Date, last: time::Date) -> ReconciliationJob {
            ReconciliationJob::new(
                Arc::clone(&self.stream),
                Window::from_dates(first, last).unwrap(),
                Arc::clone(&self.fires),
                Arc::clone(&self.events),
                Arc::new(MethodRegistry::with_defaults()),
                Arc::new(NoLayers),
                ReconciliationConfig::default(),
            )
        }
    }

    #[test]
    fn test_job_names() {
        let fixture = Fixture::new();
        let single = fixture.job(date!(2024-07-01), date!(2024-07-01));
        assert_eq!(single.name(), "Reconcile National for 2024-07-01");
        let range = fixture.job(date!(2024-07-01), date!(2024-07-03));
        assert_eq!(range.name(), "Reconcile National between 2024-07-01 and 2024-07-03");
    }

    #[test]
    fn test_equivalence_and_conflicts() {
        let fixture = Fixture::new();
        let day = fixture.job(date!(2024-07-02), date!(2024-07-02));
        let week = fixture.job(date!(2024-07-01), date!(2024-07-07));
        let later = fixture.job(date!(2024-07-10), date!(2024-07-11));

        assert!(day.is_equivalent_to(&week));
        assert!(!week.is_equivalent_to(&day));
        assert!(day.is_conflicting_with(&week));
        assert!(!later.is_conflicting_with(&week));

        let other = job_fn(|_| Ok(()));
        assert!(!day.is_equivalent_to(&other));
        assert!(!day.is_conflicting_with(&other));
    }

    #[test]
    fn test_execute_reconciles_window() {
        let fixture = Fixture::new();
        fixture.fires.write().extend([
            Fire::new(
                FireId(1),
                SourceId(1),
                square(0.0, 0.0, 10.0),
                datetime!(2024-07-01 10:00 UTC),
                datetime!(2024-07-01 12:00 UTC),
            ),
            Fire::new(
                FireId(2),
                SourceId(1),
                square(5.0, 0.0, 10.0),
                datetime!(2024-07-01 11:00 UTC),
                datetime!(2024-07-01 16:00 UTC),
            ),
            Fire::new(
                FireId(3),
                SourceId(1),
                square(500.0, 0.0, 10.0),
                datetime!(2024-07-01 14:00 UTC),
                datetime!(2024-07-01 16:00 UTC),
            ),
        ]);

        let job = fixture.job(date!(2024-07-01), date!(2024-07-01));
        let progress = ProgressReporter::detached();
        job.execute(&progress).unwrap();

        let current = progress.get();
        assert_eq!(current.percent, 100);
        assert_eq!(
            current.status,
            "Successfully reconciled 3 fires, creating 2 new events"
        );

        let events = fixture.events.lock();
        let stream_events = events.events_for_stream(StreamId(1));
        assert_eq!(stream_events.len(), 2);
        let merged = stream_events.iter().find(|e| e.fires.len() == 2).unwrap();
        // Two fires at 0.8 each: 1 - 0.2 * 0.2
        assert!((merged.probability - 0.96).abs() < 1e-9);
    }

    #[test]
    fn test_execute_without_fires() {
        let fixture = Fixture::new();
        let job = fixture.job(date!(2024-07-01), date!(2024-07-01));
        let progress = ProgressReporter::detached();
        job.execute(&progress).unwrap();
        assert_eq!(progress.get().status, "Zero events created");
    }
}
