//! # Dissolve
//!
//! Spatial clustering of shape-bearing entities into maximal groups connected
//! by touching or overlapping shapes, each with the union of its members' shapes.
//!
//! Candidate pairs come from an R-tree self-join over envelopes, so only nearby
//! shapes are tested exactly. Components are tracked with a [`DisjointSet`];
//! pairs already known to be connected skip the exact intersection test.
//! The resulting partition depends only on geometry, never on input order.

use crate::dsu::DisjointSet;
use crate::error::{Result, SmartfireError};
use crate::geometry::{envelope, envelope_rectangle, intersects, union_all, HasShape, Shape};
use crate::queue::ProgressReporter;
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::RTree;
use std::borrow::Cow;
use std::time::Instant;
use tracing::debug;

type IndexedEnvelope = GeomWithData<Rectangle<[f64; 2]>, usize>;

/// One connected group produced by [`dissolve`]
#[derive(Debug, Clone, PartialEq)]
pub struct DissolvedEntity<E> {
    /// Union of the members' shapes
    pub shape: Shape,
    /// Members in input order
    pub entities: Vec<E>,
}

impl<E> DissolvedEntity<E> {
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl<E> HasShape for DissolvedEntity<E> {
    fn shape(&self) -> Option<&Shape> {
        Some(&self.shape)
    }

    fn shape_name(&self) -> String {
        format!("dissolved group of {} shapes", self.entities.len())
    }
}

/// Partition entities into overlap-connected groups
///
/// # Errors
/// `InvalidArgument` if an entity has no shape or an empty shape;
/// `TypeMismatch` if a group contains a non-polygonal shape.
pub fn dissolve<E: HasShape>(entities: Vec<E>) -> Result<Vec<DissolvedEntity<E>>> {
    dissolve_with_progress(entities, None)
}

/// [`dissolve`] reporting progress: 0-50 pair testing, 50-60 grouping, 60-100 unions
pub fn dissolve_with_progress<E: HasShape>(
    entities: Vec<E>,
    progress: Option<&ProgressReporter>,
) -> Result<Vec<DissolvedEntity<E>>> {
    let started = Instant::now();
    let count = entities.len();
    if count == 0 {
        return Ok(Vec::new());
    }

    let mut shapes: Vec<&Shape> = Vec::with_capacity(count);
    let mut indexed: Vec<IndexedEnvelope> = Vec::with_capacity(count);
    for (index, entity) in entities.iter().enumerate() {
        let shape = entity.shape().ok_or_else(|| {
            SmartfireError::invalid(format!("Geometry of {} is null", entity.shape_name()))
        })?;
        let rect = envelope(shape).ok_or_else(|| {
            SmartfireError::invalid(format!("Geometry of {} is empty", entity.shape_name()))
        })?;
        shapes.push(shape);
        indexed.push(GeomWithData::new(envelope_rectangle(&rect), index));
    }

    let tree = RTree::bulk_load(indexed);
    let mut candidates: Vec<(usize, usize)> = tree
        .intersection_candidates_with_other_tree(&tree)
        .filter(|(a, b)| a.data < b.data)
        .map(|(a, b)| (a.data, b.data))
        .collect();
    candidates.sort_unstable();

    let mut dsu = DisjointSet::new(count);
    let total_pairs = candidates.len().max(1);
    let mut last_percent = 0;
    for (tested, &(a, b)) in candidates.iter().enumerate() {
        if !dsu.same_component(a, b) && intersects(shapes[a], shapes[b]) {
            dsu.union(a, b);
        }
        if let Some(progress) = progress {
            let percent = (tested * 50 / total_pairs) as u8;
            if percent > last_percent {
                last_percent = percent;
                progress.set(percent, format!("Testing {} candidate overlaps", total_pairs));
            }
        }
    }

    report(progress, 50, "Grouping overlapping shapes");
    let groups = dsu.components();
    report(progress, 60, "Merging grouped shapes");

    let group_count = groups.len();
    let mut unions: Vec<Shape> = Vec::with_capacity(group_count);
    for (done, group) in groups.iter().enumerate() {
        let merged = union_all(group.iter().map(|&index| shapes[index]))?;
        unions.push(match merged {
            Cow::Borrowed(shape) => shape.clone(),
            Cow::Owned(shape) => shape,
        });
        if let Some(progress) = progress {
            let percent = 60 + ((done + 1) * 40 / group_count) as u8;
            progress.set(percent, format!("Merged {} of {} groups", done + 1, group_count));
        }
    }

    let mut slots: Vec<Option<E>> = entities.into_iter().map(Some).collect();
    let result: Vec<DissolvedEntity<E>> = groups
        .into_iter()
        .zip(unions)
        .map(|(group, shape)| DissolvedEntity {
            shape,
            entities: group
                .into_iter()
                .filter_map(|index| slots[index].take())
                .collect(),
        })
        .collect();

    debug!(
        "Dissolved {} shapes into {} shapes in {:.3} seconds",
        count,
        result.len(),
        started.elapsed().as_secs_f64()
    );
    Ok(result)
}

fn report(progress: Option<&ProgressReporter>, percent: u8, status: &str) {
    if let Some(progress) = progress {
        progress.set(percent, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{circle, square};

    #[test]
    fn test_disjoint_circles() {
        let result = dissolve(vec![circle(5.0, 5.0, 3.0), circle(10.0, 10.0, 3.0)]).unwrap();
        assert_eq!(result.len(), 2);
        assert!(result.iter().all(|group| group.len() == 1));
    }

    #[test]
    fn test_overlapping_circles() {
        let result = dissolve(vec![circle(5.0, 5.0, 3.0), circle(7.0, 7.0, 3.0)]).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].len(), 2);
    }

    #[test]
    fn test_empty_input() {
        let result = dissolve(Vec::<Shape>::new()).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_single_shape_is_kept() {
        let shape = square(0.0, 0.0, 4.0);
        let result = dissolve(vec![shape.clone()]).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].shape, shape);
    }

    #[test]
    fn test_transitive_chain_with_envelope_only_neighbours() {
        // The outer squares have overlapping envelopes with nothing but the middle one.
        let shapes = vec![
            square(0.0, 0.0, 2.0),
            square(4.0, 0.0, 2.0),
            square(1.5, 0.0, 3.0),
            square(20.0, 20.0, 1.0),
        ];
        let result = dissolve(shapes).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].len(), 3);
        assert_eq!(result[1].len(), 1);
    }

    #[test]
    fn test_progress_reaches_completion() {
        let progress = ProgressReporter::detached();
        let shapes = vec![
            circle(0.0, 0.0, 1.0),
            circle(1.0, 0.0, 1.0),
            circle(10.0, 0.0, 1.0),
        ];
        let result = dissolve_with_progress(shapes, Some(&progress)).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(progress.get().percent, 100);
    }

    #[test]
    fn test_missing_shape_is_rejected() {
        let entities: Vec<Option<Shape>> = vec![Some(square(0.0, 0.0, 1.0)), None];
        let err = dissolve(entities).unwrap_err();
        assert!(matches!(err, SmartfireError::InvalidArgument(_)));
    }

    impl HasShape for Option<Shape> {
        fn shape(&self) -> Option<&Shape> {
            self.as_ref()
        }

        fn shape_name(&self) -> String {
            "optional shape".to_string()
        }
    }
}
