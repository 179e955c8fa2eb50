//! # Smartfire
//!
//! Multi-source wildfire reconciliation. Fire detections from many sources are
//! folded into canonical events by spatial and temporal association, with
//! per-source weightings deciding which source wins each event field.
//!
//! The crate provides the spatial dissolve engine, the union utilities,
//! the reconciliation engine and a dependency-aware job queue that runs
//! reconciliation batches in parallel across streams.

pub mod config;
pub mod dissolve;
pub mod dsu;
pub mod error;
pub mod geometry;
pub mod jobs;
pub mod layers;
pub mod methods;
pub mod model;
pub mod queue;
pub mod reconcile;
pub mod store;
pub mod temporal;

#[doc(hidden)]
pub mod test_support;

// Re-export main types for convenience
pub use config::{ConfigError, ConfigOverrides, SmartfireConfig};
pub use dissolve::{dissolve, dissolve_with_progress, DissolvedEntity};
pub use error::{Result, SmartfireError};
pub use geometry::{to_multi_polygon, union_all, union_all_shapes, HasShape, Shape};
pub use jobs::ReconciliationJob;
pub use layers::{FeatureLayer, FeatureLayerReader, LayerAttributes, LayerReader, NoLayers};
pub use methods::{MethodContext, MethodRegistry};
pub use model::{
    Event, EventId, Fire, FireId, ReconciliationStream, ReconciliationWeighting, Source, SourceId,
    StreamId, SummaryDataLayer,
};
pub use queue::{Job, JobInfo, JobQueue, JobState, Progress, ProgressReporter, QueuedJob};
pub use reconcile::{DefaultReconciliation, ReconcileOutcome, ReconciliationMethod};
pub use store::{EventStore, FireStore, QueryableEventStore, StreamEventSet};
pub use temporal::Window;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use time::{Date, OffsetDateTime};

/// Main API: streams, stores and the job queue wired together
///
/// Each stream owns its event store, so jobs of different streams reconcile
/// in parallel while jobs of one stream are kept apart by the queue.
pub struct Smartfire {
    config: SmartfireConfig,
    queue: JobQueue,
    fires: Arc<RwLock<FireStore>>,
    events: RwLock<HashMap<StreamId, Arc<Mutex<EventStore>>>>,
    methods: Arc<MethodRegistry>,
    layers: Arc<dyn LayerReader>,
    streams: RwLock<HashMap<StreamId, Arc<ReconciliationStream>>>,
    chains: Mutex<HashMap<StreamId, Vec<QueuedJob>>>,
}

impl Smartfire {
    /// Create an instance with the built-in methods and no summary layers
    pub fn new(config: SmartfireConfig) -> Result<Self> {
        Self::with_components(config, MethodRegistry::with_defaults(), Arc::new(NoLayers))
    }

    pub fn with_components(
        config: SmartfireConfig,
        methods: MethodRegistry,
        layers: Arc<dyn LayerReader>,
    ) -> Result<Self> {
        let queue = JobQueue::from_config(&config.queue)?;
        Ok(Self {
            config,
            queue,
            fires: Arc::new(RwLock::new(FireStore::new())),
            events: RwLock::new(HashMap::new()),
            methods: Arc::new(methods),
            layers,
            streams: RwLock::new(HashMap::new()),
            chains: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &SmartfireConfig {
        &self.config
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Register or replace a reconciliation stream
    ///
    /// A stream without a method of its own gets the configured one.
    pub fn add_stream(&self, mut stream: ReconciliationStream) {
        if stream.method.is_none() {
            stream.method = Some(self.config.reconciliation.method.clone());
        }
        self.events.write().entry(stream.id).or_default();
        self.streams.write().insert(stream.id, Arc::new(stream));
    }

    fn event_store(&self, stream: StreamId) -> Option<Arc<Mutex<EventStore>>> {
        self.events.read().get(&stream).cloned()
    }

    pub fn stream(&self, id: StreamId) -> Option<Arc<ReconciliationStream>> {
        self.streams.read().get(&id).cloned()
    }

    /// Add fires to the fire store
    pub fn ingest(&self, fires: impl IntoIterator<Item = Fire>) {
        self.fires.write().extend(fires);
    }

    pub fn fire_count(&self) -> usize {
        self.fires.read().len()
    }

    /// Queue reconciliation of `stream` over `[start, end]`
    ///
    /// Returns the already queued job instead when one covers the same window.
    /// With `auto_chain` set, the job also waits for earlier unfinished jobs of
    /// the same stream.
    pub fn reconcile_stream(
        &self,
        stream: StreamId,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<QueuedJob> {
        let stream = self
            .stream(stream)
            .ok_or_else(|| SmartfireError::invalid(format!("No such reconciliation stream {}", stream)))?;
        let events = self
            .event_store(stream.id)
            .ok_or_else(|| SmartfireError::invalid(format!("No event store for stream {}", stream.id)))?;
        let window = Window::new(start, end)?;
        let job = ReconciliationJob::new(
            Arc::clone(&stream),
            window,
            Arc::clone(&self.fires),
            events,
            Arc::clone(&self.methods),
            Arc::clone(&self.layers),
            self.config.reconciliation.clone(),
        );
        let name = job.name();

        let mut chains = self.chains.lock();
        let chain = chains.entry(stream.id).or_default();
        chain.retain(|queued| !queued.is_finished());
        let predecessors: Vec<QueuedJob> = if self.config.reconciliation.auto_chain {
            chain.clone()
        } else {
            Vec::new()
        };

        let queued = self
            .queue
            .enqueue_if_none_equivalent(job, name, &predecessors)?;
        if !chain.contains(&queued) {
            chain.push(queued.clone());
        }
        Ok(queued)
    }

    /// Queue reconciliation of whole UTC days `first` through `last`
    pub fn reconcile_days(&self, stream: StreamId, first: Date, last: Date) -> Result<QueuedJob> {
        let window = Window::from_dates(first, last)?;
        self.reconcile_stream(stream, window.start, window.end)
    }

    /// Snapshot of a stream's events, oldest first
    pub fn events_for_stream(&self, stream: StreamId) -> Vec<Event> {
        let Some(events) = self.event_store(stream) else {
            return Vec::new();
        };
        let events = events.lock();
        events.events_for_stream(stream).into_iter().cloned().collect()
    }

    /// Events across every stream
    pub fn event_count(&self) -> usize {
        self.events.read().values().map(|events| events.lock().len()).sum()
    }

    pub fn jobs_info(&self) -> Vec<JobInfo> {
        self.queue.jobs_info()
    }

    /// Stop the job queue; queued jobs fail and no new work is accepted
    pub fn dispose(&self) {
        self.queue.dispose();
        self.chains.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::test_support::{fire_on, square};
    use std::time::Duration;
    use time::macros::date;

    fn config() -> SmartfireConfig {
        SmartfireConfig {
            queue: QueueConfig {
                workers: 2,
                shutdown_timeout_ms: 1_000,
            },
            ..SmartfireConfig::default()
        }
    }

    fn stream() -> ReconciliationStream {
        ReconciliationStream::new(StreamId(1), "National").with_source(
            Source::new(SourceId(1), "HMS"),
            ReconciliationWeighting::new(SourceId(1)),
        )
    }

    #[test]
    fn test_reconcile_stream_end_to_end() {
        let smartfire = Smartfire::new(config()).unwrap();
        smartfire.add_stream(stream());
        smartfire.ingest([
            fire_on(1, 1, square(0.0, 0.0, 10.0), date!(2024-07-01)),
            fire_on(2, 1, square(5.0, 5.0, 10.0), date!(2024-07-01)),
        ]);

        let job = smartfire
            .reconcile_days(StreamId(1), date!(2024-07-01), date!(2024-07-01))
            .unwrap();
        assert_eq!(job.name(), "Reconcile National for 2024-07-01");
        assert_eq!(job.wait(Duration::from_secs(10)), JobState::Success);

        let events = smartfire.events_for_stream(StreamId(1));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fires.len(), 2);
        smartfire.dispose();
    }

    #[test]
    fn test_stream_without_method_uses_configured_method() {
        let mut config = config();
        config.reconciliation.method = "tracked".to_string();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut methods = MethodRegistry::with_defaults();
        let counter = Arc::clone(&calls);
        methods.register_reconciliation("tracked", move |context| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Box::new(DefaultReconciliation::new(context))
        });
        let smartfire = Smartfire::with_components(config, methods, Arc::new(NoLayers)).unwrap();

        let deserialized: ReconciliationStream = serde_json::from_str(
            r#"{
                "id": 2,
                "name": "Regional",
                "sources": [{ "id": 1, "name": "HMS" }],
                "weightings": [{ "source": 1 }]
            }"#,
        )
        .unwrap();
        assert_eq!(deserialized.method, None);
        smartfire.add_stream(deserialized);
        smartfire.add_stream(stream().with_method("default"));
        assert_eq!(
            smartfire.stream(StreamId(1)).unwrap().method.as_deref(),
            Some("default")
        );
        assert_eq!(
            smartfire.stream(StreamId(2)).unwrap().method.as_deref(),
            Some("tracked")
        );

        smartfire.ingest([fire_on(1, 1, square(0.0, 0.0, 10.0), date!(2024-07-01))]);
        let job = smartfire
            .reconcile_days(StreamId(2), date!(2024-07-01), date!(2024-07-01))
            .unwrap();
        let explicit = smartfire
            .reconcile_days(StreamId(1), date!(2024-07-01), date!(2024-07-01))
            .unwrap();
        assert_eq!(job.wait(Duration::from_secs(10)), JobState::Success);
        assert_eq!(explicit.wait(Duration::from_secs(10)), JobState::Success);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(smartfire.events_for_stream(StreamId(2)).len(), 1);
        smartfire.dispose();
    }

    #[test]
    fn test_unknown_stream_is_rejected() {
        let smartfire = Smartfire::new(config()).unwrap();
        let err = smartfire
            .reconcile_days(StreamId(9), date!(2024-07-01), date!(2024-07-01))
            .unwrap_err();
        assert!(matches!(err, SmartfireError::InvalidArgument(_)));
    }
}
