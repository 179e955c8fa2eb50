use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::geometry::Shape;
use crate::model::{Fire, FireId, SourceId};
use geo::{Coord, LineString, Polygon};
use std::f64::consts::PI;
use time::{Date, Duration};

const CIRCLE_SEGMENTS: usize = 32;

/// Axis-aligned square with its lower-left corner at `(x, y)`
pub fn square(x: f64, y: f64, size: f64) -> Shape {
    rectangle(x, y, size, size)
}

pub fn rectangle(x: f64, y: f64, width: f64, height: f64) -> Shape {
    let ring = LineString::from(vec![
        (x, y),
        (x + width, y),
        (x + width, y + height),
        (x, y + height),
        (x, y),
    ]);
    Shape::Polygon(Polygon::new(ring, vec![]))
}

/// Regular 32-gon approximating a circle; the four axis points are exact
pub fn circle(cx: f64, cy: f64, radius: f64) -> Shape {
    let quarter = CIRCLE_SEGMENTS / 4;
    let mut coords: Vec<Coord<f64>> = (0..CIRCLE_SEGMENTS)
        .map(|i| {
            let (dx, dy) = match (i % quarter == 0, i / quarter) {
                (true, 0) => (1.0, 0.0),
                (true, 1) => (0.0, 1.0),
                (true, 2) => (-1.0, 0.0),
                (true, _) => (0.0, -1.0),
                (false, _) => {
                    let angle = 2.0 * PI * i as f64 / CIRCLE_SEGMENTS as f64;
                    (angle.cos(), angle.sin())
                }
            };
            Coord {
                x: cx + radius * dx,
                y: cy + radius * dy,
            }
        })
        .collect();
    coords.push(coords[0]);
    Shape::Polygon(Polygon::new(LineString::new(coords), vec![]))
}

/// Lattice of non-overlapping circles plus clustered extras
#[derive(Debug, Clone)]
pub struct Lattice {
    pub shapes: Vec<Shape>,
    /// Number of circles on the grid; the dissolve result has exactly this many groups
    pub grid_count: usize,
}

/// Circles of `radius` every `step` units over `[0, size)` in both axes
///
/// Grid points on multiples of `cluster_interval` get four extra circles
/// offset by one unit, each overlapping only its grid circle.
pub fn lattice(size: usize, step: usize, radius: f64, cluster_interval: usize) -> Lattice {
    const OFFSETS: [(f64, f64); 4] = [(1.0, 1.0), (1.0, 0.0), (0.0, 1.0), (-1.0, 0.0)];
    let mut shapes = Vec::new();
    let mut grid_count = 0;
    for x in (0..size).step_by(step) {
        for y in (0..size).step_by(step) {
            let (fx, fy) = (x as f64, y as f64);
            shapes.push(circle(fx, fy, radius));
            grid_count += 1;
            if x % cluster_interval == 0 && y % cluster_interval == 0 {
                for (dx, dy) in OFFSETS {
                    shapes.push(circle(fx + dx, fy + dy, radius));
                }
            }
        }
    }
    Lattice { shapes, grid_count }
}

/// Deterministically shuffled copy of `items`
pub fn shuffled<T>(mut items: Vec<T>, seed: u64) -> Vec<T> {
    let mut rng = StdRng::seed_from_u64(seed);
    items.shuffle(&mut rng);
    items
}

/// Fire burning for the whole of `day`
pub fn fire_on(id: u64, source: u32, shape: Shape, day: Date) -> Fire {
    let start = day.midnight().assume_utc();
    let end = start + Duration::days(1) - Duration::SECOND;
    Fire::new(FireId(id), SourceId(source), shape, start, end)
}

/// Squares scattered over an `extent` x `extent` area, all burning on `day`
pub fn scattered_fires(
    count: usize,
    source: u32,
    extent: f64,
    size: f64,
    day: Date,
    seed: u64,
) -> Vec<Fire> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|i| {
            let x = rng.random_range(0.0..extent);
            let y = rng.random_range(0.0..extent);
            let probability = rng.random_range(0.5..1.0);
            fire_on(i as u64 + 1, source, square(x, y, size), day).with_probability(probability)
        })
        .collect()
}
