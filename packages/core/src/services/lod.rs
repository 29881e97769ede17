//! Level-of-detail selection
//!
//! Either a fixed [`LevelOfDetail`] or one derived from the zoom scale through
//! a piecewise-linear [`LodMapping`]. Zoom scales are compared on a log2 axis,
//! since viewer zoom levels are powers of two.

use crate::models::LevelOfDetail;
use serde::{Deserialize, Serialize};

/// One `(zoom fraction, LOD fraction)` anchor point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LodAnchor {
    pub zoom: f64,
    pub lod: f64,
}

/// Piecewise-linear map from zoom fraction to LOD fraction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<LodAnchor>", into = "Vec<LodAnchor>")]
pub struct LodMapping {
    anchors: Vec<LodAnchor>,
}

impl LodMapping {
    /// Anchors are sorted by zoom fraction; non-finite ones are dropped
    pub fn new(mut anchors: Vec<LodAnchor>) -> Self {
        anchors.retain(|a| a.zoom.is_finite() && a.lod.is_finite());
        anchors.sort_by(|a, b| a.zoom.total_cmp(&b.zoom));
        Self { anchors }
    }

    /// Identity mapping from `(0, 0)` to `(1, 1)`
    pub fn linear() -> Self {
        Self::new(vec![
            LodAnchor { zoom: 0.0, lod: 0.0 },
            LodAnchor { zoom: 1.0, lod: 1.0 },
        ])
    }

    pub fn anchors(&self) -> &[LodAnchor] {
        &self.anchors
    }

    /// LOD fraction for `zoom_fraction`, clamped outside the anchor range
    ///
    /// An empty mapping asks for full detail.
    pub fn lod_fraction(&self, zoom_fraction: f64) -> f64 {
        let (Some(first), Some(last)) = (self.anchors.first(), self.anchors.last()) else {
            return 1.0;
        };
        if zoom_fraction <= first.zoom {
            return first.lod;
        }
        if zoom_fraction >= last.zoom {
            return last.lod;
        }
        for pair in self.anchors.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if zoom_fraction >= a.zoom && zoom_fraction <= b.zoom {
                let span = b.zoom - a.zoom;
                if span <= 0.0 {
                    return b.lod;
                }
                let t = (zoom_fraction - a.zoom) / span;
                return a.lod + (b.lod - a.lod) * t;
            }
        }
        last.lod
    }
}

impl Default for LodMapping {
    fn default() -> Self {
        Self::linear()
    }
}

impl From<Vec<LodAnchor>> for LodMapping {
    fn from(anchors: Vec<LodAnchor>) -> Self {
        Self::new(anchors)
    }
}

impl From<LodMapping> for Vec<LodAnchor> {
    fn from(mapping: LodMapping) -> Self {
        mapping.anchors
    }
}

/// How the overlay picks the LOD of a window fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum LodPolicy {
    Fixed {
        lod: LevelOfDetail,
    },
    /// `min_zoom` and `max_zoom` are zoom scales mapped to fractions 0 and 1
    #[serde(rename_all = "camelCase")]
    Adaptive {
        mapping: LodMapping,
        min_zoom: f64,
        max_zoom: f64,
    },
}

impl Default for LodPolicy {
    fn default() -> Self {
        LodPolicy::Fixed {
            lod: LevelOfDetail::default(),
        }
    }
}

impl LodPolicy {
    /// LOD to request at zoom `scale`
    pub fn resolve(&self, scale: f64) -> LevelOfDetail {
        match self {
            LodPolicy::Fixed { lod } => *lod,
            LodPolicy::Adaptive {
                mapping,
                min_zoom,
                max_zoom,
            } => {
                let fraction = zoom_fraction(scale, *min_zoom, *max_zoom);
                LevelOfDetail::Percent(mapping.lod_fraction(fraction).clamp(0.0, 1.0))
            }
        }
    }
}

/// Position of `scale` between `min` and `max` on a log2 axis, in `[0, 1]`
pub fn zoom_fraction(scale: f64, min: f64, max: f64) -> f64 {
    if !(scale > 0.0 && min > 0.0 && max > min) {
        return 1.0;
    }
    let (s, lo, hi) = (scale.log2(), min.log2(), max.log2());
    ((s - lo) / (hi - lo)).clamp(0.0, 1.0)
}
