//! Section-scoped node graph
//!
//! - `intersect` - where a tree edge crosses the cutting plane
//! - `store` - the linked node cache, including virtual nodes
//! - `pool` - retained node objects reused across rebuilds

pub mod intersect;
mod pool;
mod store;

pub use intersect::{crosses, intersect, intersect_with_radius, CuttingPlane, Intersection};
pub use pool::NodePool;
pub use store::{GraphStore, LinkReport, RemovedNode, StoreStats};
