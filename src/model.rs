//! # Data Model
//!
//! Fires, events, sources and reconciliation streams.
//! Events are rebuilt wholesale from their fire membership; slices are a derived view.

use crate::geometry::{HasShape, Shape};
use crate::temporal::Window;
use geo::{Area, MultiPolygon};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

/// Display name for a fire whose name could not be determined
pub const UNKNOWN_FIRE_NAME: &str = "Unknown Fire";

/// Source name recorded when no source won a weighted field
pub const UNKNOWN_SOURCE_NAME: &str = "N/A";

/// Default method name for reconciliation and probability strategies
pub const DEFAULT_METHOD: &str = "default";

fn default_method() -> String {
    DEFAULT_METHOD.to_string()
}

/// Identifier for an ingested fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FireId(pub u64);

impl fmt::Display for FireId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F{}", self.0)
    }
}

/// Identifier for a data source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(pub u32);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// Identifier for a reconciliation stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RS{}", self.0)
    }
}

/// Globally unique event identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A producer of fire detections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub name: String,
    /// Name of the probability method in the method registry
    #[serde(default = "default_method")]
    pub probability_method: String,
    /// Default false-alarm rate of the source, used by the default probability method
    #[serde(default)]
    pub false_alarm_rate: f64,
}

impl Source {
    pub fn new(id: SourceId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            probability_method: default_method(),
            false_alarm_rate: 0.0,
        }
    }

    pub fn with_false_alarm_rate(mut self, rate: f64) -> Self {
        self.false_alarm_rate = rate;
        self
    }
}

/// Area burned by a fire on one calendar day
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FireDay {
    pub date: Date,
    pub area: f64,
}

impl FireDay {
    pub fn new(date: Date, area: f64) -> Self {
        Self { date, area }
    }
}

/// One source's detection of a single incident
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fire {
    pub id: FireId,
    pub source: SourceId,
    #[serde(default = "unknown_fire_name")]
    pub name: String,
    #[serde(default)]
    pub shape: Option<Shape>,
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
    #[serde(default)]
    pub area: f64,
    #[serde(default)]
    pub fire_type: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Detection probability, assigned by a probability method
    #[serde(default)]
    pub probability: Option<f64>,
    #[serde(default)]
    pub fire_days: Vec<FireDay>,
}

fn unknown_fire_name() -> String {
    UNKNOWN_FIRE_NAME.to_string()
}

impl Fire {
    /// Create a fire whose area is the planar area of its shape
    pub fn new(
        id: FireId,
        source: SourceId,
        shape: Shape,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Self {
        let area = shape.unsigned_area();
        Self {
            id,
            source,
            name: unknown_fire_name(),
            shape: Some(shape),
            start,
            end,
            area,
            fire_type: String::new(),
            attributes: BTreeMap::new(),
            probability: None,
            fire_days: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_area(mut self, area: f64) -> Self {
        self.area = area;
        self
    }

    pub fn with_type(mut self, fire_type: impl Into<String>) -> Self {
        self.fire_type = fire_type.into();
        self
    }

    pub fn with_probability(mut self, probability: f64) -> Self {
        self.probability = Some(probability);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_fire_day(mut self, date: Date, area: f64) -> Self {
        self.fire_days.push(FireDay::new(date, area));
        self
    }

    /// Detection time span
    pub fn window(&self) -> Window {
        Window {
            start: self.start.min(self.end),
            end: self.end.max(self.start),
        }
    }
}

impl HasShape for Fire {
    fn shape(&self) -> Option<&Shape> {
        self.shape.as_ref()
    }

    fn shape_name(&self) -> String {
        format!("Fire {}", self.id)
    }
}

/// Fields a reconciliation weighting ranks sources by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightField {
    DetectionRate,
    FalseAlarmRate,
    GrowthWeight,
    LocationWeight,
    ShapeWeight,
    SizeWeight,
    LocationUncertainty,
    StartDateUncertainty,
    EndDateUncertainty,
    NameWeight,
    TypeWeight,
}

impl WeightField {
    pub const ALL: [WeightField; 11] = [
        WeightField::DetectionRate,
        WeightField::FalseAlarmRate,
        WeightField::GrowthWeight,
        WeightField::LocationWeight,
        WeightField::ShapeWeight,
        WeightField::SizeWeight,
        WeightField::LocationUncertainty,
        WeightField::StartDateUncertainty,
        WeightField::EndDateUncertainty,
        WeightField::NameWeight,
        WeightField::TypeWeight,
    ];

    pub fn key(self) -> &'static str {
        match self {
            WeightField::DetectionRate => "detection_rate",
            WeightField::FalseAlarmRate => "false_alarm_rate",
            WeightField::GrowthWeight => "growth_weight",
            WeightField::LocationWeight => "location_weight",
            WeightField::ShapeWeight => "shape_weight",
            WeightField::SizeWeight => "size_weight",
            WeightField::LocationUncertainty => "location_uncertainty",
            WeightField::StartDateUncertainty => "start_date_uncertainty",
            WeightField::EndDateUncertainty => "end_date_uncertainty",
            WeightField::NameWeight => "name_weight",
            WeightField::TypeWeight => "type_weight",
        }
    }
}

impl fmt::Display for WeightField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Per-source, per-stream reconciliation settings
///
/// Uncertainties widen the search (kilometres for location, days for dates);
/// the weights decide which source's slice wins each derived event field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationWeighting {
    pub source: SourceId,
    #[serde(default)]
    pub detection_rate: f64,
    #[serde(default)]
    pub false_alarm_rate: f64,
    #[serde(default)]
    pub location_weight: f64,
    #[serde(default)]
    pub size_weight: f64,
    #[serde(default)]
    pub shape_weight: f64,
    #[serde(default)]
    pub growth_weight: f64,
    #[serde(default)]
    pub name_weight: f64,
    #[serde(default)]
    pub type_weight: f64,
    /// Location uncertainty in kilometres
    #[serde(default)]
    pub location_uncertainty: f64,
    /// Start date uncertainty in days
    #[serde(default)]
    pub start_date_uncertainty: i64,
    /// End date uncertainty in days
    #[serde(default)]
    pub end_date_uncertainty: i64,
}

impl ReconciliationWeighting {
    /// A weighting with every weight and uncertainty at zero
    pub fn new(source: SourceId) -> Self {
        Self {
            source,
            detection_rate: 0.0,
            false_alarm_rate: 0.0,
            location_weight: 0.0,
            size_weight: 0.0,
            shape_weight: 0.0,
            growth_weight: 0.0,
            name_weight: 0.0,
            type_weight: 0.0,
            location_uncertainty: 0.0,
            start_date_uncertainty: 0,
            end_date_uncertainty: 0,
        }
    }

    /// Numeric value of a weighted field
    pub fn weight(&self, field: WeightField) -> f64 {
        match field {
            WeightField::DetectionRate => self.detection_rate,
            WeightField::FalseAlarmRate => self.false_alarm_rate,
            WeightField::GrowthWeight => self.growth_weight,
            WeightField::LocationWeight => self.location_weight,
            WeightField::ShapeWeight => self.shape_weight,
            WeightField::SizeWeight => self.size_weight,
            WeightField::LocationUncertainty => self.location_uncertainty,
            WeightField::StartDateUncertainty => self.start_date_uncertainty as f64,
            WeightField::EndDateUncertainty => self.end_date_uncertainty as f64,
            WeightField::NameWeight => self.name_weight,
            WeightField::TypeWeight => self.type_weight,
        }
    }

    /// Symmetric buffer distance in metres (uncertainty of 10 km is plus or minus 5000 m)
    pub fn buffer_distance(&self) -> f64 {
        self.location_uncertainty * 1000.0 / 2.0
    }
}

/// Reference to a summary-data layer consulted for every reconciled event
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SummaryDataLayer {
    pub name: String,
}

impl SummaryDataLayer {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A named set of sources reconciled together into one event set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationStream {
    pub id: StreamId,
    pub name: String,
    /// Name of the reconciliation method in the method registry; unset streams
    /// use the configured default
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub auto_reconcile: bool,
    #[serde(default)]
    pub sources: Vec<Source>,
    /// Weightings in precedence order; slices follow this order
    #[serde(default)]
    pub weightings: Vec<ReconciliationWeighting>,
    #[serde(default)]
    pub summary_layers: Vec<SummaryDataLayer>,
}

impl ReconciliationStream {
    pub fn new(id: StreamId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            method: None,
            auto_reconcile: true,
            sources: Vec::new(),
            weightings: Vec::new(),
            summary_layers: Vec::new(),
        }
    }

    /// Register a source together with its weighting
    pub fn with_source(mut self, source: Source, weighting: ReconciliationWeighting) -> Self {
        self.sources.push(source);
        self.weightings.push(weighting);
        self
    }

    /// Register a source that has no weighting in this stream
    pub fn with_unweighted_source(mut self, source: Source) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_summary_layer(mut self, layer: SummaryDataLayer) -> Self {
        self.summary_layers.push(layer);
        self
    }

    pub fn weighting_for_source(&self, source: SourceId) -> Option<&ReconciliationWeighting> {
        self.weightings.iter().find(|w| w.source == source)
    }

    pub fn source(&self, id: SourceId) -> Option<&Source> {
        self.sources.iter().find(|s| s.id == id)
    }

    /// Source name, falling back to the id when the source is not registered
    pub fn source_name(&self, id: SourceId) -> String {
        self.source(id)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| id.to_string())
    }
}

/// Scaled area of an event on one calendar day
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EventDay {
    pub date: Date,
    pub daily_area: f64,
}

/// Canonical merged wildfire record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub stream: Option<StreamId>,
    pub name: String,
    /// Outline, always stored as a multipolygon
    pub shape: Option<Shape>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end: Option<OffsetDateTime>,
    pub total_area: f64,
    pub fire_type: String,
    pub probability: f64,
    pub fires: Vec<Fire>,
    pub days: Vec<EventDay>,
    pub attributes: BTreeMap<String, String>,
    /// Which source won each weighted field
    pub weighting_sources: BTreeMap<WeightField, String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl Event {
    pub fn new() -> Self {
        Self {
            id: EventId::new(),
            stream: None,
            name: UNKNOWN_FIRE_NAME.to_string(),
            shape: None,
            start: None,
            end: None,
            total_area: 0.0,
            fire_type: String::new(),
            probability: 0.0,
            fires: Vec::new(),
            days: Vec::new(),
            attributes: BTreeMap::new(),
            weighting_sources: BTreeMap::new(),
            created: OffsetDateTime::now_utc(),
        }
    }

    /// Add a fire, replacing any earlier copy with the same id
    pub fn add_fire(&mut self, fire: Fire) {
        match self.fires.iter_mut().find(|f| f.id == fire.id) {
            Some(existing) => *existing = fire,
            None => self.fires.push(fire),
        }
    }

    pub fn add_fires(&mut self, fires: impl IntoIterator<Item = Fire>) {
        for fire in fires {
            self.add_fire(fire);
        }
    }

    pub fn set_outline(&mut self, outline: Option<MultiPolygon<f64>>) {
        self.shape = outline.map(Shape::MultiPolygon);
    }

    pub fn outline(&self) -> Option<&MultiPolygon<f64>> {
        match &self.shape {
            Some(Shape::MultiPolygon(mp)) => Some(mp),
            _ => None,
        }
    }

    /// Stored date span, if the event has been populated
    pub fn window(&self) -> Option<Window> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => Some(Window {
                start: start.min(end),
                end: end.max(start),
            }),
            _ => None,
        }
    }

    pub fn set_weighting_source(&mut self, field: WeightField, source_name: impl Into<String>) {
        self.weighting_sources.insert(field, source_name.into());
    }

    pub fn weighting_source(&self, field: WeightField) -> Option<&str> {
        self.weighting_sources.get(&field).map(String::as_str)
    }

    /// Partition the fires by source, in the stream's weighting order
    ///
    /// Sources without fires in this event produce no slice, and fires whose
    /// source has no weighting in the stream are not part of any slice.
    pub fn slices<'a>(&'a self, stream: &'a ReconciliationStream) -> Vec<EventSlice<'a>> {
        stream
            .weightings
            .iter()
            .filter_map(|weights| {
                let mut fires: Vec<&Fire> = self
                    .fires
                    .iter()
                    .filter(|f| f.source == weights.source && f.shape.is_some())
                    .collect();
                if fires.is_empty() {
                    return None;
                }
                fires.sort_by(|a, b| b.area.total_cmp(&a.area));
                Some(EventSlice {
                    source: weights.source,
                    source_name: stream.source_name(weights.source),
                    weights,
                    fires,
                })
            })
            .collect()
    }

    /// Location phrase built from the event attributes, see [`format_location`]
    pub fn format_location(&self) -> String {
        format_location(&self.attributes)
    }
}

impl HasShape for Event {
    fn shape(&self) -> Option<&Shape> {
        self.shape.as_ref()
    }

    fn shape_name(&self) -> String {
        format!("Event {}", self.id)
    }
}

/// The fires one source contributed to an event
#[derive(Debug, Clone)]
pub struct EventSlice<'a> {
    pub source: SourceId,
    pub source_name: String,
    pub weights: &'a ReconciliationWeighting,
    /// Largest fire first
    pub fires: Vec<&'a Fire>,
}

impl EventSlice<'_> {
    pub fn weight(&self, field: WeightField) -> f64 {
        self.weights.weight(field)
    }
}

/// Order slices by a weighted field, highest first; ties keep stream order
pub fn by_weight_desc<'s, 'a>(
    slices: &'s [EventSlice<'a>],
    field: WeightField,
) -> Vec<&'s EventSlice<'a>> {
    let mut ordered: Vec<_> = slices.iter().collect();
    ordered.sort_by(|a, b| b.weight(field).total_cmp(&a.weight(field)));
    ordered
}

/// Order slices by a weighted field, lowest first; ties keep stream order
pub fn by_weight_asc<'s, 'a>(
    slices: &'s [EventSlice<'a>],
    field: WeightField,
) -> Vec<&'s EventSlice<'a>> {
    let mut ordered: Vec<_> = slices.iter().collect();
    ordered.sort_by(|a, b| a.weight(field).total_cmp(&b.weight(field)));
    ordered
}

/// Location phrase built from the `CNTY`, `STATE` and `CNTRY` attributes
///
/// Falls back to the `location` attribute, then to `"Unknown"`.
pub fn format_location(attributes: &BTreeMap<String, String>) -> String {
    let attr = |key: &str| attributes.get(key).map(String::as_str);
    let Some(country) = attr("CNTRY") else {
        return attr("location").unwrap_or("Unknown").to_string();
    };
    let county = attr("CNTY").unwrap_or("Unknown");
    let state = attr("STATE").unwrap_or("Unknown");
    let location = match country {
        "USA" => format!("{} County, {}", county, state),
        "CANADA" | "MEXICO" => format!("{}, {}, {}", county, state, country),
        other => other.to_string(),
    };
    capitalize_fully(&location)
}

/// Upper-case the first letter of every whitespace-separated word, lower-case the rest
pub fn capitalize_fully(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut at_word_start = true;
    for ch in text.chars() {
        if ch.is_whitespace() {
            at_word_start = true;
            out.push(ch);
        } else if at_word_start {
            out.extend(ch.to_uppercase());
            at_word_start = false;
        } else {
            out.extend(ch.to_lowercase());
        }
    }
    out
}

/// Format a fraction as a whole percentage, e.g. `0.456` as `46%`
pub fn format_percent(fraction: f64) -> String {
    format!("{}%", (fraction * 100.0).round() as i64)
}
