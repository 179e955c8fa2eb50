//! # Summary Data Layers
//!
//! Attribute lookup against polygon layers (counties, land ownership, ...).
//! A reader reports the attributes of the feature that best represents a
//! shape, plus the fraction of the shape that feature covers.

use crate::error::{Result, SmartfireError};
use crate::geometry::{area, envelope, envelopes_intersect, intersection_area, Shape};
use crate::model::SummaryDataLayer;
use geo::Rect;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Attributes read from one layer for one shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerAttributes {
    pub layer: String,
    pub attributes: BTreeMap<String, String>,
    /// Share of the shape's area covered by the chosen feature, in `[0, 1]`
    pub representative_fraction: f64,
}

impl LayerAttributes {
    /// Result for a shape that touches no feature of the layer
    pub fn empty(layer: impl Into<String>) -> Self {
        Self {
            layer: layer.into(),
            attributes: BTreeMap::new(),
            representative_fraction: 0.0,
        }
    }
}

/// Reads summary attributes for event outlines
pub trait LayerReader: Send + Sync {
    fn read_attributes(&self, layer: &SummaryDataLayer, shape: &Shape) -> Result<LayerAttributes>;
}

/// Reader for deployments without summary layers
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLayers;

impl LayerReader for NoLayers {
    fn read_attributes(&self, layer: &SummaryDataLayer, _shape: &Shape) -> Result<LayerAttributes> {
        Ok(LayerAttributes::empty(layer.name.clone()))
    }
}

/// One polygon of a layer with its attribute row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerFeature {
    pub shape: Shape,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// A named layer of features
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureLayer {
    pub name: String,
    #[serde(default)]
    pub features: Vec<LayerFeature>,
}

#[derive(Debug, Clone)]
struct LoadedLayer {
    extent: Option<Rect<f64>>,
    features: Vec<(Rect<f64>, LayerFeature)>,
}

/// In-memory layer reader: the feature covering the largest share of the shape wins
#[derive(Debug, Clone, Default)]
pub struct FeatureLayerReader {
    layers: HashMap<String, LoadedLayer>,
}

impl FeatureLayerReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_layers(layers: impl IntoIterator<Item = FeatureLayer>) -> Self {
        let mut reader = Self::new();
        for layer in layers {
            reader.add_layer(layer);
        }
        reader
    }

    /// Register a layer, replacing any layer with the same name
    ///
    /// Features with empty shapes are dropped.
    pub fn add_layer(&mut self, layer: FeatureLayer) {
        let mut extent: Option<Rect<f64>> = None;
        let mut features = Vec::with_capacity(layer.features.len());
        for feature in layer.features {
            let Some(rect) = envelope(&feature.shape) else {
                continue;
            };
            extent = Some(match extent {
                None => rect,
                Some(current) => Rect::new(
                    (current.min().x.min(rect.min().x), current.min().y.min(rect.min().y)),
                    (current.max().x.max(rect.max().x), current.max().y.max(rect.max().y)),
                ),
            });
            features.push((rect, feature));
        }
        self.layers.insert(layer.name, LoadedLayer { extent, features });
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }
}

impl LayerReader for FeatureLayerReader {
    fn read_attributes(&self, layer: &SummaryDataLayer, shape: &Shape) -> Result<LayerAttributes> {
        let loaded = self.layers.get(&layer.name).ok_or_else(|| {
            SmartfireError::invalid(format!("No summary data layer named \"{}\"", layer.name))
        })?;

        let (Some(extent), Some(shape_rect)) = (loaded.extent, envelope(shape)) else {
            return Ok(LayerAttributes::empty(layer.name.clone()));
        };
        let shape_area = area(shape);
        if !envelopes_intersect(&extent, &shape_rect) || shape_area <= 0.0 {
            return Ok(LayerAttributes::empty(layer.name.clone()));
        }

        let mut best: Option<(f64, &LayerFeature)> = None;
        for (rect, feature) in &loaded.features {
            if !envelopes_intersect(rect, &shape_rect) {
                continue;
            }
            let fraction = (intersection_area(&feature.shape, shape)? / shape_area).min(1.0);
            if fraction > best.map_or(0.0, |(f, _)| f) {
                best = Some((fraction, feature));
            }
        }

        Ok(match best {
            Some((fraction, feature)) => LayerAttributes {
                layer: layer.name.clone(),
                attributes: feature.attributes.clone(),
                representative_fraction: fraction,
            },
            None => LayerAttributes::empty(layer.name.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::square;

    fn counties() -> FeatureLayer {
        let row = |name: &str| BTreeMap::from([("CNTY".to_string(), name.to_string())]);
        FeatureLayer {
            name: "counties".into(),
            features: vec![
                LayerFeature {
                    shape: square(0.0, 0.0, 10.0),
                    attributes: row("WEST"),
                },
                LayerFeature {
                    shape: square(10.0, 0.0, 10.0),
                    attributes: row("EAST"),
                },
            ],
        }
    }

    #[test]
    fn test_largest_overlap_wins() {
        let reader = FeatureLayerReader::from_layers([counties()]);
        let layer = SummaryDataLayer::new("counties");
        let result = reader.read_attributes(&layer, &square(7.0, 0.0, 4.0)).unwrap();
        assert_eq!(result.attributes["CNTY"], "WEST");
        assert!((result.representative_fraction - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_outside_extent_is_empty() {
        let reader = FeatureLayerReader::from_layers([counties()]);
        let layer = SummaryDataLayer::new("counties");
        let result = reader.read_attributes(&layer, &square(50.0, 50.0, 1.0)).unwrap();
        assert!(result.attributes.is_empty());
        assert_eq!(result.representative_fraction, 0.0);
    }

    #[test]
    fn test_unknown_layer_is_an_error() {
        let reader = FeatureLayerReader::new();
        let err = reader
            .read_attributes(&SummaryDataLayer::new("missing"), &square(0.0, 0.0, 1.0))
            .unwrap_err();
        assert!(matches!(err, SmartfireError::InvalidArgument(_)));
    }

    #[test]
    fn test_no_layers_reader() {
        let result = NoLayers
            .read_attributes(&SummaryDataLayer::new("any"), &square(0.0, 0.0, 1.0))
            .unwrap();
        assert_eq!(result.layer, "any");
        assert_eq!(result.representative_fraction, 0.0);
    }
}
