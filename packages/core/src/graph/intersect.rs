//! Plane Intersection
//!
//! Computes where a tree edge crosses the cutting plane of the current
//! section. The result is used to place a virtual node on that plane.

use crate::models::Point3;
use serde::{Deserialize, Serialize};

/// zdiff magnitudes below this are treated as lying on the section
pub const SECTION_EPSILON: f64 = 1e-6;

/// Plane `z = const` of the section currently displayed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CuttingPlane {
    pub z: f64,
}

impl CuttingPlane {
    pub fn new(z: f64) -> Self {
        Self { z }
    }

    /// Signed distance of `position` from the plane, snapped to zero
    pub fn zdiff(&self, position: &Point3) -> f64 {
        let d = position.z - self.z;
        if d.abs() < SECTION_EPSILON {
            0.0
        } else {
            d
        }
    }
}

/// Interpolated vertex where an edge crosses the plane
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intersection {
    pub position: Point3,
    /// `None` unless both endpoint radii are known
    pub radius: Option<f64>,
    /// Parametric fraction from child (0) to parent (1)
    pub fraction: f64,
}

/// Whether two zdiffs lie strictly on opposite sides of the plane
///
/// Zero on either side is never a crossing.
pub fn crosses(zdiff_a: f64, zdiff_b: f64) -> bool {
    (zdiff_a > 0.0 && zdiff_b < 0.0) || (zdiff_a < 0.0 && zdiff_b > 0.0)
}

/// Intersect segment `child → parent` with `plane`
///
/// Returns `None` when the segment has no z extent or does not cross the plane
/// strictly between its endpoints.
pub fn intersect(child: &Point3, parent: &Point3, plane: CuttingPlane) -> Option<Point3> {
    fraction(child, parent, plane).map(|t| {
        let mut p = child.lerp(parent, t);
        p.z = plane.z;
        p
    })
}

/// Like [`intersect`], also interpolating the radius by the same fraction
pub fn intersect_with_radius(
    child: (&Point3, Option<f64>),
    parent: (&Point3, Option<f64>),
    plane: CuttingPlane,
) -> Option<Intersection> {
    let t = fraction(child.0, parent.0, plane)?;
    let mut position = child.0.lerp(parent.0, t);
    position.z = plane.z;

    let radius = match (child.1, parent.1) {
        (Some(rc), Some(rp)) => Some(rc + (rp - rc) * t),
        _ => None,
    };

    Some(Intersection {
        position,
        radius,
        fraction: t,
    })
}

fn fraction(child: &Point3, parent: &Point3, plane: CuttingPlane) -> Option<f64> {
    let dz = parent.z - child.z;
    if dz.abs() < SECTION_EPSILON || !dz.is_finite() {
        return None;
    }
    if !crosses(plane.zdiff(child), plane.zdiff(parent)) {
        return None;
    }
    let t = (plane.z - child.z) / dz;
    if t > 0.0 && t < 1.0 {
        Some(t)
    } else {
        None
    }
}
