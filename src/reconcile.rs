//! # Reconciliation
//!
//! Folds one fire at a time into a stream's event set. A fire is attached to
//! the event its (buffered) shape and widened dates touch, creating a new
//! event when nothing matches and merging events when several do.
//!
//! After every membership change [`DefaultReconciliation::populate_event_fields`]
//! recomputes every derived field of the event from its full fire list, so
//! the result depends only on membership and never on update order.

use crate::config::ReconciliationConfig;
use crate::error::{Result, SmartfireError};
use crate::geometry::{buffer, num_geometries, to_multi_polygon, union_all_shapes, Shape};
use crate::layers::LayerReader;
use crate::methods::MethodContext;
use crate::model::{
    by_weight_asc, by_weight_desc, format_location, format_percent, Event, EventDay, EventId,
    EventSlice, Fire, ReconciliationStream, WeightField, UNKNOWN_FIRE_NAME, UNKNOWN_SOURCE_NAME,
};
use crate::store::QueryableEventStore;
use geo::MultiPolygon;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;
use time::{Date, OffsetDateTime};
use tracing::{info, warn};

/// What reconciling one fire did to the event set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The fire's source has no weighting in the stream
    Skipped,
    /// No event matched; a new one was created
    Created(EventId),
    /// The fire joined the single matching event
    Attached(EventId),
    /// Several matching events were collapsed into one
    Merged { event: EventId, merged: usize },
}

impl ReconcileOutcome {
    pub fn event(&self) -> Option<EventId> {
        match self {
            ReconcileOutcome::Skipped => None,
            ReconcileOutcome::Created(id) | ReconcileOutcome::Attached(id) => Some(*id),
            ReconcileOutcome::Merged { event, .. } => Some(*event),
        }
    }
}

/// Strategy that folds a fire into an event set
pub trait ReconciliationMethod: Send + Sync {
    fn reconcile(&self, fire: &Fire, events: &mut dyn QueryableEventStore)
        -> Result<ReconcileOutcome>;
}

/// Weighted-precedence reconciliation
pub struct DefaultReconciliation {
    stream: Arc<ReconciliationStream>,
    layers: Arc<dyn LayerReader>,
    complexity_threshold: usize,
    wildfire_type: String,
}

impl DefaultReconciliation {
    pub fn new(context: &MethodContext) -> Self {
        Self::with_settings(
            Arc::clone(&context.stream),
            Arc::clone(&context.layers),
            &context.settings,
        )
    }

    pub fn with_settings(
        stream: Arc<ReconciliationStream>,
        layers: Arc<dyn LayerReader>,
        settings: &ReconciliationConfig,
    ) -> Self {
        Self {
            stream,
            layers,
            complexity_threshold: settings.complexity_threshold,
            wildfire_type: settings.wildfire_type.clone(),
        }
    }

    fn query_shape<'a>(&self, fire: &Fire, shape: &'a Shape, distance: f64) -> Cow<'a, Shape> {
        let parts = num_geometries(shape);
        if parts > self.complexity_threshold {
            info!(
                fire = %fire.id,
                "This geometry has exceeded the multipolygon complexity threshold with {} independent polygons. Using unbuffered shape.",
                parts
            );
            Cow::Borrowed(shape)
        } else if distance == 0.0 {
            Cow::Borrowed(shape)
        } else {
            Cow::Owned(buffer(shape, distance))
        }
    }

    /// Recompute every derived field of `event` from its current fires
    ///
    /// # Errors
    /// `InvalidArgument` when no fire of the event comes from a weighted source;
    /// geometry errors from the outline union.
    pub fn populate_event_fields(&self, event: &mut Event) -> Result<()> {
        let slices = event.slices(&self.stream);
        if slices.is_empty() {
            return Err(SmartfireError::invalid(format!(
                "Event {} has no fires from weighted sources",
                event.id
            )));
        }
        let mut winners: Vec<(WeightField, String)> = Vec::new();

        let outline = self.outline(&slices, &mut winners)?;
        let mut attributes = merged_fire_attributes(&slices);
        if let Some(outline) = &outline {
            self.associate_summary_data(outline, &mut attributes)?;
        }
        let name = display_name(&slices, &attributes, &mut winners);
        let start = start_date(&slices, &mut winners);
        let end = end_date(&slices, &mut winners);
        let total_area = total_area(&slices, &mut winners);
        let probability = probability(&event.fires);
        let fire_type = self.fire_type(&slices, &mut winners);
        let days = event_days(&slices, total_area, &mut winners);
        drop(slices);

        event.stream = Some(self.stream.id);
        event.set_outline(outline);
        event.attributes = attributes;
        event.name = name;
        event.start = start;
        event.end = end;
        event.total_area = total_area;
        event.probability = probability;
        event.fire_type = fire_type;
        event.days = days;
        event.weighting_sources.clear();
        for (field, source) in winners {
            event.set_weighting_source(field, source);
        }
        Ok(())
    }

    fn outline(
        &self,
        slices: &[EventSlice<'_>],
        winners: &mut Vec<(WeightField, String)>,
    ) -> Result<Option<MultiPolygon<f64>>> {
        let slice = by_weight_desc(slices, WeightField::ShapeWeight)[0];
        winners.push((WeightField::ShapeWeight, slice.source_name.clone()));
        let shape = union_all_shapes(slice.fires.iter().copied())?.into_owned();
        to_multi_polygon(Some(shape))
    }

    fn associate_summary_data(
        &self,
        outline: &MultiPolygon<f64>,
        attributes: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        if self.stream.summary_layers.is_empty() {
            return Ok(());
        }
        let shape = Shape::MultiPolygon(outline.clone());
        for layer in &self.stream.summary_layers {
            let read = self.layers.read_attributes(layer, &shape)?;
            if read.representative_fraction > 0.0 {
                attributes.extend(read.attributes);
                attributes.insert(
                    format!("{}_representative_fraction", layer.name),
                    format_percent(read.representative_fraction),
                );
            }
        }
        Ok(())
    }

    fn fire_type(&self, slices: &[EventSlice<'_>], winners: &mut Vec<(WeightField, String)>) -> String {
        let slice = by_weight_desc(slices, WeightField::TypeWeight)[0];
        winners.push((WeightField::TypeWeight, slice.source_name.clone()));
        let mut fire_type = String::new();
        for fire in &slice.fires {
            if fire.fire_type == self.wildfire_type {
                return fire.fire_type.clone();
            }
            fire_type = fire.fire_type.clone();
        }
        fire_type
    }
}

impl ReconciliationMethod for DefaultReconciliation {
    fn reconcile(
        &self,
        fire: &Fire,
        events: &mut dyn QueryableEventStore,
    ) -> Result<ReconcileOutcome> {
        let Some(weights) = self.stream.weighting_for_source(fire.source) else {
            warn!(
                "Reconciliation weightings are missing for source {}. Skipping fire.",
                self.stream.source_name(fire.source)
            );
            return Ok(ReconcileOutcome::Skipped);
        };
        let shape = fire.shape.as_ref().ok_or_else(|| {
            SmartfireError::invalid(format!("Geometry of Fire {} is null", fire.id))
        })?;
        info!(fire = %fire.id, stream = %self.stream.id, "Processing fire: {}", fire.id);

        let query = self.query_shape(fire, shape, weights.buffer_distance());
        let window = fire
            .window()
            .widen(weights.start_date_uncertainty, weights.end_date_uncertainty)?;
        let mut associated = events.get_associated(&query, window.start, window.end)?;

        let (mut event, matched) = match associated.len() {
            0 => (Event::new(), 0),
            1 => (associated.remove(0), 1),
            count => {
                let merged = events.merge(associated)?;
                info!(event = %merged.id, "Merged {} events", count);
                (merged, count)
            }
        };
        event.add_fire(fire.clone());
        self.populate_event_fields(&mut event)?;
        let id = event.id;
        events.add(event)?;

        Ok(match matched {
            0 => ReconcileOutcome::Created(id),
            1 => ReconcileOutcome::Attached(id),
            merged => ReconcileOutcome::Merged { event: id, merged },
        })
    }
}

/// All fire attributes, lowest name weight first and smallest fire first, so
/// heavier and larger fires overwrite shared keys
fn merged_fire_attributes(slices: &[EventSlice<'_>]) -> BTreeMap<String, String> {
    let mut attributes = BTreeMap::new();
    for slice in by_weight_asc(slices, WeightField::NameWeight) {
        let mut fires = slice.fires.clone();
        fires.sort_by(|a, b| a.area.total_cmp(&b.area));
        for fire in fires {
            attributes.extend(fire.attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }
    attributes
}

fn display_name(
    slices: &[EventSlice<'_>],
    attributes: &BTreeMap<String, String>,
    winners: &mut Vec<(WeightField, String)>,
) -> String {
    for slice in by_weight_desc(slices, WeightField::NameWeight) {
        let mut latest: Option<&Fire> = None;
        for &fire in &slice.fires {
            if latest.map_or(true, |current| current.end < fire.end) {
                latest = Some(fire);
            }
        }
        if let Some(fire) = latest.filter(|fire| fire.name != UNKNOWN_FIRE_NAME) {
            winners.push((WeightField::NameWeight, slice.source_name.clone()));
            return fire.name.clone();
        }
    }

    winners.push((WeightField::NameWeight, UNKNOWN_SOURCE_NAME.to_string()));
    let location = format_location(attributes);
    if location == "Unknown" {
        UNKNOWN_FIRE_NAME.to_string()
    } else {
        format!("Unnamed fire in {}", location)
    }
}

fn start_date(
    slices: &[EventSlice<'_>],
    winners: &mut Vec<(WeightField, String)>,
) -> Option<OffsetDateTime> {
    let slice = by_weight_asc(slices, WeightField::StartDateUncertainty)[0];
    winners.push((WeightField::StartDateUncertainty, slice.source_name.clone()));
    slices
        .iter()
        .flat_map(|slice| slice.fires.iter())
        .map(|fire| fire.start)
        .min()
}

fn end_date(
    slices: &[EventSlice<'_>],
    winners: &mut Vec<(WeightField, String)>,
) -> Option<OffsetDateTime> {
    let slice = by_weight_asc(slices, WeightField::EndDateUncertainty)[0];
    winners.push((WeightField::EndDateUncertainty, slice.source_name.clone()));
    slices
        .iter()
        .flat_map(|slice| slice.fires.iter())
        .map(|fire| fire.end)
        .max()
}

fn total_area(slices: &[EventSlice<'_>], winners: &mut Vec<(WeightField, String)>) -> f64 {
    let slice = by_weight_desc(slices, WeightField::SizeWeight)[0];
    winners.push((WeightField::SizeWeight, slice.source_name.clone()));
    slice.fires.iter().map(|fire| fire.area).sum()
}

/// Chance at least one fire is real, treating detections as independent
fn probability(fires: &[Fire]) -> f64 {
    let missed: f64 = fires
        .iter()
        .filter_map(|fire| fire.probability)
        .map(|p| 1.0 - p)
        .product();
    1.0 - missed
}

/// Daily areas of the growth slice, rescaled to sum to the event's total area
fn event_days(
    slices: &[EventSlice<'_>],
    total_area: f64,
    winners: &mut Vec<(WeightField, String)>,
) -> Vec<EventDay> {
    let slice = by_weight_desc(slices, WeightField::GrowthWeight)[0];
    winners.push((WeightField::GrowthWeight, slice.source_name.clone()));

    let mut by_date: BTreeMap<Date, f64> = BTreeMap::new();
    let mut summed = 0.0;
    for fire in &slice.fires {
        for day in &fire.fire_days {
            *by_date.entry(day.date).or_insert(0.0) += day.area;
            summed += day.area;
        }
    }

    let scale = if summed > 0.0 { total_area / summed } else { 0.0 };
    by_date
        .into_iter()
        .map(|(date, area)| EventDay {
            date,
            daily_area: area * scale,
        })
        .collect()
}
