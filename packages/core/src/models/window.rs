//! Window Query Types
//!
//! A window query asks the remote source for every node inside a project-space
//! box, subject to a level-of-detail hint. The same struct doubles as the
//! result cache key, so everything that changes the answer lives in it.

use super::node::RealNodeId;
use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in project space (physical units)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

impl BoundingBox {
    pub fn new(left: f64, top: f64, right: f64, bottom: f64) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Whether `other` lies entirely inside this box (edges inclusive)
    pub fn encloses(&self, other: &BoundingBox) -> bool {
        self.left <= other.left
            && self.top <= other.top
            && self.right >= other.right
            && self.bottom >= other.bottom
    }

    pub fn contains_xy(&self, x: f64, y: f64) -> bool {
        x >= self.left && x <= self.right && y >= self.top && y <= self.bottom
    }

    /// Whether the xy extent of a segment overlaps this box
    pub fn overlaps_span(&self, x1: f64, y1: f64, x2: f64, y2: f64) -> bool {
        x1.max(x2) >= self.left
            && x1.min(x2) <= self.right
            && y1.max(y2) >= self.top
            && y1.min(y2) <= self.bottom
    }

    pub fn width(&self) -> f64 {
        self.right - self.left
    }

    pub fn height(&self) -> f64 {
        self.bottom - self.top
    }
}

/// Closed z interval `[z1, z2]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZRange {
    pub z1: f64,
    pub z2: f64,
}

impl ZRange {
    pub fn new(z1: f64, z2: f64) -> Self {
        Self { z1, z2 }
    }

    pub fn contains(&self, z: f64) -> bool {
        z >= self.z1 && z <= self.z2
    }

    /// Whether the z extent of a segment overlaps this range
    pub fn overlaps_span(&self, a: f64, b: f64) -> bool {
        a.max(b) >= self.z1 && a.min(b) <= self.z2
    }
}

/// Level-of-detail hint for a window fetch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "lodType", content = "lod", rename_all = "camelCase")]
pub enum LevelOfDetail {
    /// Absolute LOD level understood by the remote source
    Absolute(u32),
    /// Fraction in `[0, 1]` of the remote source's LOD range
    Percent(f64),
}

impl LevelOfDetail {
    /// Wire value of `lod_type`
    pub fn lod_type(&self) -> &'static str {
        match self {
            LevelOfDetail::Absolute(_) => "absolute",
            LevelOfDetail::Percent(_) => "percent",
        }
    }

    /// Wire value of `lod`
    pub fn value(&self) -> f64 {
        match self {
            LevelOfDetail::Absolute(level) => f64::from(*level),
            LevelOfDetail::Percent(fraction) => *fraction,
        }
    }
}

impl Default for LevelOfDetail {
    fn default() -> Self {
        LevelOfDetail::Absolute(1)
    }
}

/// Response encoding requested from the remote source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseFormat {
    #[default]
    Json,
    CompactBinary,
    /// Server-rendered image; carries no graph data
    Raster,
}

impl ResponseFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseFormat::Json => "json",
            ResponseFormat::CompactBinary => "compact-binary",
            ResponseFormat::Raster => "raster",
        }
    }
}

/// Parameters of one `nodes-in-window` request
///
/// Serialized with `serde_json` to form the result cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowQuery {
    pub bbox: BoundingBox,
    pub z_range: ZRange,
    pub lod: LevelOfDetail,
    /// Tree nodes to include even when outside the box
    pub treenode_ids: Vec<RealNodeId>,
    /// Connectors to include even when outside the box
    pub connector_ids: Vec<RealNodeId>,
    pub labels: bool,
}

impl WindowQuery {
    pub fn new(bbox: BoundingBox, z_range: ZRange, lod: LevelOfDetail) -> Self {
        Self {
            bbox,
            z_range,
            lod,
            treenode_ids: Vec::new(),
            connector_ids: Vec::new(),
            labels: false,
        }
    }

    pub fn with_labels(mut self, labels: bool) -> Self {
        self.labels = labels;
        self
    }

    /// Sets explicit inclusions; ids are sorted so equal sets give equal keys
    pub fn with_extra_ids(
        mut self,
        mut treenode_ids: Vec<RealNodeId>,
        mut connector_ids: Vec<RealNodeId>,
    ) -> Self {
        treenode_ids.sort_unstable();
        treenode_ids.dedup();
        connector_ids.sort_unstable();
        connector_ids.dedup();
        self.treenode_ids = treenode_ids;
        self.connector_ids = connector_ids;
        self
    }

    pub fn has_extra_ids(&self) -> bool {
        !self.treenode_ids.is_empty() || !self.connector_ids.is_empty()
    }

    /// Serialized form used as cache key
    pub fn cache_key(&self) -> String {
        // Serializing plain data with derived impls cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encloses_is_inclusive() {
        let outer = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
        assert!(outer.encloses(&outer));
        assert!(outer.encloses(&BoundingBox::new(10.0, 10.0, 90.0, 100.0)));
        assert!(!outer.encloses(&BoundingBox::new(-1.0, 10.0, 90.0, 90.0)));
        assert!(!BoundingBox::new(10.0, 10.0, 90.0, 90.0).encloses(&outer));
    }

    #[test]
    fn test_extra_ids_normalized_in_cache_key() {
        let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
        let z = ZRange::new(0.0, 1.0);
        let a = WindowQuery::new(bbox, z, LevelOfDetail::Absolute(1))
            .with_extra_ids(vec![3, 1, 3], vec![]);
        let b = WindowQuery::new(bbox, z, LevelOfDetail::Absolute(1))
            .with_extra_ids(vec![1, 3], vec![]);
        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn test_cache_key_distinguishes_lod_kind() {
        let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
        let z = ZRange::new(0.0, 1.0);
        let abs = WindowQuery::new(bbox, z, LevelOfDetail::Absolute(1));
        let pct = WindowQuery::new(bbox, z, LevelOfDetail::Percent(1.0));
        assert_ne!(abs.cache_key(), pct.cache_key());
    }

    #[test]
    fn test_lod_wire_values() {
        assert_eq!(LevelOfDetail::Absolute(3).lod_type(), "absolute");
        assert_eq!(LevelOfDetail::Absolute(3).value(), 3.0);
        assert_eq!(LevelOfDetail::Percent(0.25).lod_type(), "percent");
    }

    #[test]
    fn test_span_overlap() {
        let bbox = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        assert!(bbox.overlaps_span(-5.0, 5.0, 5.0, 5.0));
        assert!(!bbox.overlaps_span(11.0, 0.0, 20.0, 5.0));
        let z = ZRange::new(0.0, 1.0);
        assert!(z.overlaps_span(-1.0, 2.0));
        assert!(!z.overlaps_span(1.5, 2.0));
    }
}
