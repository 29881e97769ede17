//! Virtual Node Identifiers
//!
//! A virtual node marks the point where a real tree edge crosses the section
//! currently being viewed. It is never persisted; its identifier is derived
//! from the edge's two real endpoints and the intersection point, so the same
//! geometric intersection always yields the same identifier.
//!
//! # Format
//!
//! `vn:<child>:<parent>:<x>:<y>:<z>`
//!
//! Coordinates are rounded to three decimal places and stored as integer
//! thousandths. On output, trailing zeros are trimmed, so the intersection of
//! edge `5 → 9` at `(1, 2, 3)` is written `vn:5:9:1:2:3`.
//!
//! # Examples
//!
//! ```rust
//! use skeletrace_core::models::{Point3, VirtualNodeId};
//!
//! let id = VirtualNodeId::new(5, 9, Point3::new(1.0, 2.0, 3.0));
//! assert_eq!(id.to_string(), "vn:5:9:1:2:3");
//!
//! let decoded: VirtualNodeId = "vn:5:9:1:2:3".parse().unwrap();
//! assert_eq!(decoded, id);
//! assert_eq!(decoded.position(), Point3::new(1.0, 2.0, 3.0));
//! ```

use super::node::{Point3, RealNodeId, ValidationError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix tagging a virtual node identifier
pub const VIRTUAL_NODE_PREFIX: &str = "vn";

/// Number of fixed decimal places kept for virtual node coordinates
pub const VIRTUAL_NODE_PRECISION: u32 = 3;

const SCALE: f64 = 1_000.0;

/// Synthetic identifier of a virtual node
///
/// Coordinates are kept as integer thousandths so that identifiers are
/// hashable, totally ordered and compare exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VirtualNodeId {
    child: RealNodeId,
    parent: RealNodeId,
    x: i64,
    y: i64,
    z: i64,
}

impl VirtualNodeId {
    /// Encode the intersection of edge `child → parent` at `position`
    pub fn new(child: RealNodeId, parent: RealNodeId, position: Point3) -> Self {
        Self {
            child,
            parent,
            x: quantize(position.x),
            y: quantize(position.y),
            z: quantize(position.z),
        }
    }

    /// Real child endpoint of the crossed edge
    pub fn child(&self) -> RealNodeId {
        self.child
    }

    /// Real parent endpoint of the crossed edge
    pub fn parent(&self) -> RealNodeId {
        self.parent
    }

    /// Position of the virtual node, at the encoded precision
    pub fn position(&self) -> Point3 {
        Point3::new(
            self.x as f64 / SCALE,
            self.y as f64 / SCALE,
            self.z as f64 / SCALE,
        )
    }

    /// Decode the three components `(child, parent, position)`
    pub fn decode(&self) -> (RealNodeId, RealNodeId, Point3) {
        (self.child, self.parent, self.position())
    }
}

fn quantize(value: f64) -> i64 {
    (value * SCALE).round() as i64
}

fn format_fixed(thousandths: i64) -> String {
    let sign = if thousandths < 0 { "-" } else { "" };
    let abs = thousandths.unsigned_abs();
    let whole = abs / 1_000;
    let frac = abs % 1_000;
    if frac == 0 {
        return format!("{}{}", sign, whole);
    }
    let frac = format!("{:03}", frac);
    format!("{}{}.{}", sign, whole, frac.trim_end_matches('0'))
}

impl fmt::Display for VirtualNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}:{}",
            VIRTUAL_NODE_PREFIX,
            self.child,
            self.parent,
            format_fixed(self.x),
            format_fixed(self.y),
            format_fixed(self.z)
        )
    }
}

impl FromStr for VirtualNodeId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidId(s.to_string());

        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 || parts[0] != VIRTUAL_NODE_PREFIX {
            return Err(invalid());
        }

        let child = parts[1].parse::<RealNodeId>().map_err(|_| invalid())?;
        let parent = parts[2].parse::<RealNodeId>().map_err(|_| invalid())?;

        let mut coords = [0.0f64; 3];
        for (slot, raw) in coords.iter_mut().zip(&parts[3..]) {
            let value = raw.parse::<f64>().map_err(|_| invalid())?;
            if !value.is_finite() {
                return Err(invalid());
            }
            *slot = value;
        }

        Ok(Self::new(
            child,
            parent,
            Point3::new(coords[0], coords[1], coords[2]),
        ))
    }
}

impl TryFrom<String> for VirtualNodeId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VirtualNodeId> for String {
    fn from(id: VirtualNodeId) -> Self {
        id.to_string()
    }
}

/// Whether a raw identifier string follows the virtual node scheme
pub fn is_virtual_node_id(raw: &str) -> bool {
    raw.parse::<VirtualNodeId>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_trims_trailing_zeros() {
        let id = VirtualNodeId::new(5, 9, Point3::new(1.0, 2.5, 3.125));
        assert_eq!(id.to_string(), "vn:5:9:1:2.5:3.125");
    }

    #[test]
    fn test_encode_rounds_to_fixed_precision() {
        let a = VirtualNodeId::new(1, 2, Point3::new(10.00049, 0.0, -4.0));
        let b = VirtualNodeId::new(1, 2, Point3::new(10.0001, 0.0, -4.0));
        assert_eq!(a, b, "same intersection must collapse to one key");
        assert_eq!(a.to_string(), "vn:1:2:10:0:-4");
    }

    #[test]
    fn test_negative_fractional_coordinates() {
        let id = VirtualNodeId::new(7, 3, Point3::new(-0.5, -12.04, 0.001));
        assert_eq!(id.to_string(), "vn:7:3:-0.5:-12.04:0.001");
        let back: VirtualNodeId = id.to_string().parse().unwrap();
        assert_eq!(back.position(), Point3::new(-0.5, -12.04, 0.001));
    }

    #[test]
    fn test_decode_components() {
        let id: VirtualNodeId = "vn:5:9:1:2:3".parse().unwrap();
        let (child, parent, position) = id.decode();
        assert_eq!(child, 5);
        assert_eq!(parent, 9);
        assert_eq!(position, Point3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_round_trip_over_sample_positions() {
        for (child, parent, x, y, z) in [
            (1, 2, 0.0, 0.0, 0.0),
            (123456789, 42, 1024.125, -88.5, 3.75),
            (3, 4, 0.001, 99999.999, -0.002),
        ] {
            let pos = Point3::new(x, y, z);
            let id = VirtualNodeId::new(child, parent, pos);
            let decoded: VirtualNodeId = id.to_string().parse().unwrap();
            assert_eq!(decoded.decode(), (child, parent, pos));
        }
    }

    #[test]
    fn test_rejects_malformed_identifiers() {
        for raw in [
            "42",
            "vn:5:9:1:2",
            "vn:5:9:1:2:3:4",
            "xn:5:9:1:2:3",
            "vn:a:9:1:2:3",
            "vn:5:9:1:two:3",
            "vn:5:9:inf:2:3",
            "vn-5-9-3",
        ] {
            assert!(raw.parse::<VirtualNodeId>().is_err(), "{raw} should fail");
            assert!(!is_virtual_node_id(raw));
        }
    }

    #[test]
    fn test_serde_as_string() {
        let id = VirtualNodeId::new(5, 9, Point3::new(1.0, 2.0, 3.0));
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json, serde_json::json!("vn:5:9:1:2:3"));
        let back: VirtualNodeId = serde_json::from_value(json).unwrap();
        assert_eq!(back, id);
    }
}
