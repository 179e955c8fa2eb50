//! # Store Module
//!
//! In-memory fire and event storage. Events are indexed by envelope in an
//! R-tree so association queries only test shapes near the query.
//!
//! [`StreamEventSet`] is the per-stream view handed to reconciliation methods.
//! It does not lock anything itself: callers hold the stream's event store
//! exclusively for the whole resolve-merge-write cycle of a fire. A merge only
//! retires its inputs once the merged event is added, so a fire that fails
//! between the two leaves the store as it was.

use crate::error::{Result, SmartfireError};
use crate::geometry::{
    envelope, envelope_rectangle, intersects, to_multi_polygon, union_all_shapes, Shape,
};
use crate::model::{Event, EventId, Fire, FireId, SourceId, StreamId};
use crate::temporal::overlaps;
use hashbrown::HashMap;
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::{RTree, AABB};
use time::OffsetDateTime;

type IndexedEvent = GeomWithData<Rectangle<[f64; 2]>, EventId>;

/// Event persistence operations reconciliation depends on
pub trait QueryableEventStore {
    /// Events whose shape intersects `shape` and whose dates overlap `[start, end]`
    fn get_associated(
        &self,
        shape: &Shape,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<Event>>;

    /// Collapse several events into one new event
    ///
    /// The originals stay stored until the merged event is passed to [`add`](Self::add).
    fn merge(&mut self, events: Vec<Event>) -> Result<Event>;

    /// Insert or replace an event, retiring the events it was merged from
    fn add(&mut self, event: Event) -> Result<()>;
}

/// Fires keyed by source
#[derive(Debug, Clone, Default)]
pub struct FireStore {
    by_source: HashMap<SourceId, Vec<Fire>>,
    len: usize,
}

impl FireStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fire, replacing an earlier fire with the same id from the same source
    pub fn insert(&mut self, fire: Fire) {
        let fires = self.by_source.entry(fire.source).or_default();
        match fires.iter_mut().find(|f| f.id == fire.id) {
            Some(existing) => *existing = fire,
            None => {
                fires.push(fire);
                self.len += 1;
            }
        }
    }

    pub fn extend(&mut self, fires: impl IntoIterator<Item = Fire>) {
        for fire in fires {
            self.insert(fire);
        }
    }

    pub fn get(&self, source: SourceId, id: FireId) -> Option<&Fire> {
        self.by_source.get(&source)?.iter().find(|f| f.id == id)
    }

    /// Fires from `source` whose time span overlaps the inclusive window, oldest first
    pub fn by_date(&self, source: SourceId, start: OffsetDateTime, end: OffsetDateTime) -> Vec<Fire> {
        let mut fires: Vec<Fire> = self
            .by_source
            .get(&source)
            .map(|fires| {
                fires
                    .iter()
                    .filter(|f| overlaps(f.start, f.end, start, end))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        fires.sort_by(|a, b| a.start.cmp(&b.start).then(a.id.cmp(&b.id)));
        fires
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// All events, spatially indexed by envelope
#[derive(Debug, Clone)]
pub struct EventStore {
    events: HashMap<EventId, Event>,
    envelopes: HashMap<EventId, Rectangle<[f64; 2]>>,
    index: RTree<IndexedEvent>,
}

impl EventStore {
    pub fn new() -> Self {
        Self {
            events: HashMap::new(),
            envelopes: HashMap::new(),
            index: RTree::new(),
        }
    }

    pub fn get(&self, id: EventId) -> Option<&Event> {
        self.events.get(&id)
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.events.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events of one stream, oldest first
    pub fn events_for_stream(&self, stream: StreamId) -> Vec<&Event> {
        let mut events: Vec<&Event> = self
            .events
            .values()
            .filter(|e| e.stream == Some(stream))
            .collect();
        events.sort_by(|a, b| a.created.cmp(&b.created).then(a.id.cmp(&b.id)));
        events
    }

    /// Insert or replace an event; returns true if it was not stored before
    pub fn upsert(&mut self, event: Event) -> bool {
        let id = event.id;
        let existed = self.unindex(id);
        if let Some(rect) = event.shape.as_ref().and_then(envelope) {
            let rectangle = envelope_rectangle(&rect);
            self.index.insert(GeomWithData::new(rectangle, id));
            self.envelopes.insert(id, rectangle);
        }
        let replaced = self.events.insert(id, event).is_some();
        !(existed || replaced)
    }

    pub fn remove(&mut self, id: EventId) -> Option<Event> {
        self.unindex(id);
        self.events.remove(&id)
    }

    fn unindex(&mut self, id: EventId) -> bool {
        match self.envelopes.remove(&id) {
            Some(rectangle) => {
                self.index.remove(&GeomWithData::new(rectangle, id));
                true
            }
            None => false,
        }
    }

    /// Events whose envelope intersects the envelope of `shape`
    fn envelope_candidates(&self, shape: &Shape) -> Vec<EventId> {
        let Some(rect) = envelope(shape) else {
            return Vec::new();
        };
        let query = AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]);
        self.index
            .locate_in_envelope_intersecting(&query)
            .map(|indexed| indexed.data)
            .collect()
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

/// One stream's events inside an [`EventStore`]
pub struct StreamEventSet<'a> {
    store: &'a mut EventStore,
    stream: StreamId,
    created: usize,
    // merged event id -> ids it replaces once added
    retiring: HashMap<EventId, Vec<EventId>>,
}

impl<'a> StreamEventSet<'a> {
    pub fn new(store: &'a mut EventStore, stream: StreamId) -> Self {
        Self {
            store,
            stream,
            created: 0,
            retiring: HashMap::new(),
        }
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// Events added through this view that were not stored before
    pub fn created(&self) -> usize {
        self.created
    }
}

impl QueryableEventStore for StreamEventSet<'_> {
    fn get_associated(
        &self,
        shape: &Shape,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<Event>> {
        let mut found: Vec<&Event> = self
            .store
            .envelope_candidates(shape)
            .into_iter()
            .filter_map(|id| self.store.get(id))
            .filter(|event| event.stream == Some(self.stream))
            .filter(|event| match (event.start, event.end) {
                (Some(event_start), Some(event_end)) => overlaps(event_start, event_end, start, end),
                _ => false,
            })
            .filter(|event| {
                event
                    .shape
                    .as_ref()
                    .is_some_and(|event_shape| intersects(event_shape, shape))
            })
            .collect();
        found.sort_by(|a, b| a.created.cmp(&b.created).then(a.id.cmp(&b.id)));
        Ok(found.into_iter().cloned().collect())
    }

    fn merge(&mut self, events: Vec<Event>) -> Result<Event> {
        if events.is_empty() {
            return Err(SmartfireError::invalid(
                "Cannot merge an iterable containing zero events",
            ));
        }

        let mut stream: Option<StreamId> = None;
        for event in &events {
            match (stream, event.stream) {
                (Some(a), Some(b)) if a != b => {
                    return Err(SmartfireError::IncompatibleStreams(a.to_string(), b.to_string()))
                }
                (None, Some(b)) => stream = Some(b),
                _ => {}
            }
        }

        let shaped: Vec<&Event> = events.iter().filter(|e| e.shape.is_some()).collect();
        let outline = if shaped.is_empty() {
            None
        } else {
            to_multi_polygon(Some(union_all_shapes(shaped)?.into_owned()))?
        };

        let mut merged = Event::new();
        merged.stream = stream.or(Some(self.stream));
        merged.set_outline(outline);

        let largest = events
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| a.total_area.total_cmp(&b.total_area).then(ib.cmp(ia)))
            .map(|(index, _)| index)
            .unwrap_or(0);
        merged.name = events[largest].name.clone();
        merged.total_area = events[largest].total_area;
        merged.days = events[largest].days.clone();
        merged.fire_type = events[largest].fire_type.clone();

        merged.start = events.iter().filter_map(|e| e.start).min();
        merged.end = events.iter().filter_map(|e| e.end).max();

        let mut replaced = Vec::with_capacity(events.len());
        for event in events {
            replaced.push(event.id);
            for (key, value) in event.attributes {
                merged.attributes.insert(key, value);
            }
            merged.add_fires(event.fires);
        }
        self.retiring.insert(merged.id, replaced);
        Ok(merged)
    }

    fn add(&mut self, mut event: Event) -> Result<()> {
        if event.stream.is_none() {
            event.stream = Some(self.stream);
        }
        let id = event.id;
        if self.store.upsert(event) {
            self.created += 1;
        }
        for retired in self.retiring.remove(&id).unwrap_or_default() {
            if retired != id {
                self.store.remove(retired);
            }
        }
        Ok(())
    }
}
