//! # Geometry
//!
//! Adapter over the `geo` crate exposing the capability set reconciliation
//! relies on (union, intersection, buffer, area, envelope, part counts and
//! multipolygon coercion), plus the union helpers shared by dissolve and
//! event merging.
//!
//! Coordinates are planar and measured in metres; reprojection happens before
//! shapes reach this crate.

use crate::error::{Result, SmartfireError};
use geo::{
    Area, BooleanOps, BoundingRect, Coord, CoordsIter, Geometry, Intersects, Line, LineString,
    MultiPolygon, Polygon, Rect,
};
use rstar::primitives::Rectangle;
use std::borrow::Cow;

/// Any planar shape handled by the engine
pub type Shape = Geometry<f64>;

/// An entity that may carry a shape
pub trait HasShape {
    /// The entity's shape, or `None` when it has not been set
    fn shape(&self) -> Option<&Shape>;

    /// Label used in error messages
    fn shape_name(&self) -> String;
}

impl HasShape for Shape {
    fn shape(&self) -> Option<&Shape> {
        Some(self)
    }

    fn shape_name(&self) -> String {
        geometry_type(self).to_string()
    }
}

impl<T: HasShape + ?Sized> HasShape for &T {
    fn shape(&self) -> Option<&Shape> {
        (**self).shape()
    }

    fn shape_name(&self) -> String {
        (**self).shape_name()
    }
}

/// Name of the geometry variant
pub fn geometry_type(shape: &Shape) -> &'static str {
    match shape {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) => "Line",
        Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) => "Polygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::GeometryCollection(_) => "GeometryCollection",
        Geometry::Rect(_) => "Rect",
        Geometry::Triangle(_) => "Triangle",
    }
}

/// Number of independent parts in a shape
pub fn num_geometries(shape: &Shape) -> usize {
    match shape {
        Geometry::MultiPoint(mp) => mp.0.len(),
        Geometry::MultiLineString(ml) => ml.0.len(),
        Geometry::MultiPolygon(mp) => mp.0.len(),
        Geometry::GeometryCollection(gc) => gc.0.len(),
        _ => 1,
    }
}

/// Axis-aligned bounding rectangle, `None` for empty shapes
pub fn envelope(shape: &Shape) -> Option<Rect<f64>> {
    shape.bounding_rect()
}

/// Envelope as an R-tree rectangle
pub fn envelope_rectangle(rect: &Rect<f64>) -> Rectangle<[f64; 2]> {
    Rectangle::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y])
}

/// Check if two envelopes share any point
#[inline]
pub fn envelopes_intersect(a: &Rect<f64>, b: &Rect<f64>) -> bool {
    a.min().x <= b.max().x && a.max().x >= b.min().x && a.min().y <= b.max().y && a.max().y >= b.min().y
}

/// Planar area
pub fn area(shape: &Shape) -> f64 {
    shape.unsigned_area()
}

/// True when the shapes share any boundary or interior point
pub fn intersects(a: &Shape, b: &Shape) -> bool {
    a.intersects(b)
}

/// Segments used to approximate the rounded corners of a buffer
const BUFFER_SEGMENTS: usize = 32;

/// Grow a shape by `distance` in every direction
///
/// Built as the union of the shape's own area, a slab of width `2 * distance`
/// around every edge and a disc at every vertex. Non-positive distances return
/// the shape unchanged.
pub fn buffer(shape: &Shape, distance: f64) -> Shape {
    if distance.is_nan() || distance <= 0.0 {
        return shape.clone();
    }

    let mut parts = Vec::new();
    if let Ok(area) = polygonal(shape) {
        parts.push(area);
    }
    let mut lines = Vec::new();
    edges(shape, &mut lines);
    for line in &lines {
        if let Some(slab) = edge_slab(line, distance) {
            parts.push(MultiPolygon::new(vec![slab]));
        }
    }
    for coord in shape.coords_iter() {
        parts.push(MultiPolygon::new(vec![disc(coord, distance)]));
    }

    if parts.is_empty() {
        return shape.clone();
    }
    collapse(cascaded_union(parts))
}

fn edges(shape: &Shape, lines: &mut Vec<Line<f64>>) {
    fn ring(ring: &LineString<f64>, lines: &mut Vec<Line<f64>>) {
        lines.extend(ring.lines());
    }
    fn polygon(polygon: &Polygon<f64>, lines: &mut Vec<Line<f64>>) {
        ring(polygon.exterior(), lines);
        for interior in polygon.interiors() {
            ring(interior, lines);
        }
    }

    match shape {
        Geometry::Point(_) | Geometry::MultiPoint(_) => {}
        Geometry::Line(line) => lines.push(*line),
        Geometry::LineString(line_string) => ring(line_string, lines),
        Geometry::MultiLineString(multi) => multi.0.iter().for_each(|l| ring(l, lines)),
        Geometry::Polygon(p) => polygon(p, lines),
        Geometry::MultiPolygon(multi) => multi.0.iter().for_each(|p| polygon(p, lines)),
        Geometry::Rect(rect) => polygon(&rect.to_polygon(), lines),
        Geometry::Triangle(triangle) => polygon(&triangle.to_polygon(), lines),
        Geometry::GeometryCollection(collection) => {
            collection.0.iter().for_each(|member| edges(member, lines))
        }
    }
}

/// Rectangle covering every point within `distance` of the segment's interior
fn edge_slab(line: &Line<f64>, distance: f64) -> Option<Polygon<f64>> {
    let delta = line.delta();
    let length = delta.x.hypot(delta.y);
    if length == 0.0 {
        return None;
    }
    let normal = Coord {
        x: -delta.y / length * distance,
        y: delta.x / length * distance,
    };
    let exterior = vec![
        line.start + normal,
        line.end + normal,
        line.end - normal,
        line.start - normal,
        line.start + normal,
    ];
    Some(Polygon::new(LineString::new(exterior), Vec::new()))
}

/// Regular polygon circumscribing the circle of `radius` around `center`
fn disc(center: Coord<f64>, radius: f64) -> Polygon<f64> {
    let step = std::f64::consts::TAU / BUFFER_SEGMENTS as f64;
    // Circumscribed so the approximation never falls short of the true radius
    let reach = radius / (step / 2.0).cos();
    let mut exterior: Vec<Coord<f64>> = (0..BUFFER_SEGMENTS)
        .map(|i| {
            let angle = step * i as f64;
            Coord {
                x: center.x + reach * angle.cos(),
                y: center.y + reach * angle.sin(),
            }
        })
        .collect();
    exterior.push(exterior[0]);
    Polygon::new(LineString::new(exterior), Vec::new())
}

/// Area shared by two polygonal shapes
pub fn intersection_area(a: &Shape, b: &Shape) -> Result<f64> {
    let a = polygonal(a)?;
    let b = polygonal(b)?;
    Ok(a.intersection(&b).unsigned_area())
}

/// Union of two shapes
pub fn union(a: &Shape, b: &Shape) -> Result<Shape> {
    union_all([a, b]).map(Cow::into_owned)
}

/// Union every shape into one
///
/// A single input is returned as-is (borrowed, not copied).
///
/// # Errors
/// `InvalidArgument` for an empty input, `TypeMismatch` if a shape is not polygonal.
pub fn union_all<'a, I>(shapes: I) -> Result<Cow<'a, Shape>>
where
    I: IntoIterator<Item = &'a Shape>,
{
    let shapes: Vec<&'a Shape> = shapes.into_iter().collect();
    match shapes.as_slice() {
        [] => Err(SmartfireError::invalid("Cannot union zero geometries")),
        [only] => Ok(Cow::Borrowed(*only)),
        _ => {
            let parts = shapes
                .iter()
                .map(|shape| polygonal(shape))
                .collect::<Result<Vec<_>>>()?;
            Ok(Cow::Owned(collapse(cascaded_union(parts))))
        }
    }
}

/// Union the shapes of every entity
///
/// # Errors
/// `InvalidArgument` when the input is empty or any entity has no shape.
pub fn union_all_shapes<'a, E, I>(entities: I) -> Result<Cow<'a, Shape>>
where
    E: HasShape + 'a,
    I: IntoIterator<Item = &'a E>,
{
    let shapes = entities
        .into_iter()
        .map(|entity| {
            entity.shape().ok_or_else(|| {
                SmartfireError::invalid(format!("Geometry of {} is null", entity.shape_name()))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    union_all(shapes)
}

/// Normalize a polygonal result to a multipolygon
///
/// # Errors
/// `TypeMismatch` for any non-polygonal shape.
pub fn to_multi_polygon(shape: Option<Shape>) -> Result<Option<MultiPolygon<f64>>> {
    match shape {
        None => Ok(None),
        Some(Geometry::Polygon(polygon)) => Ok(Some(MultiPolygon::new(vec![polygon]))),
        Some(Geometry::MultiPolygon(multi)) => Ok(Some(multi)),
        Some(other) => Err(SmartfireError::TypeMismatch(format!(
            "Unable to convert from shape of type \"{}\" to MultiPolygon",
            geometry_type(&other)
        ))),
    }
}

fn polygonal(shape: &Shape) -> Result<MultiPolygon<f64>> {
    match shape {
        Geometry::Polygon(polygon) => Ok(MultiPolygon::new(vec![polygon.clone()])),
        Geometry::MultiPolygon(multi) => Ok(multi.clone()),
        Geometry::Rect(rect) => Ok(MultiPolygon::new(vec![rect.to_polygon()])),
        Geometry::Triangle(triangle) => Ok(MultiPolygon::new(vec![triangle.to_polygon()])),
        other => Err(SmartfireError::TypeMismatch(format!(
            "Unable to union shape of type \"{}\"",
            geometry_type(other)
        ))),
    }
}

/// Pairwise tree reduction keeps each boolean op on similarly sized operands
fn cascaded_union(mut parts: Vec<MultiPolygon<f64>>) -> MultiPolygon<f64> {
    while parts.len() > 1 {
        let mut next = Vec::with_capacity(parts.len().div_ceil(2));
        let mut iter = parts.into_iter();
        while let Some(left) = iter.next() {
            match iter.next() {
                Some(right) => next.push(left.union(&right)),
                None => next.push(left),
            }
        }
        parts = next;
    }
    parts.pop().unwrap_or_else(|| MultiPolygon::new(Vec::new()))
}

fn collapse(mut multi: MultiPolygon<f64>) -> Shape {
    if multi.0.len() == 1 {
        Geometry::Polygon(multi.0.remove(0))
    } else {
        Geometry::MultiPolygon(multi)
    }
}
