//! Data Models
//!
//! This module contains the core data structures of the tracing overlay:
//!
//! - `Node` - Real or virtual node held by the graph store
//! - `VirtualNodeId` - Deterministic identifier of an edge/section intersection
//! - `WindowQuery` - Parameters of a bounded-volume fetch (also the cache key)

mod node;
mod virtual_node;
mod window;

pub use node::{
    radius_from_wire, radius_to_wire, Confidence, ConnectorLink, ConnectorNode, EditionTime,
    Node, NodeId, NodeKind, NodeKindTag, Point3, RealNodeId, RelationId, SkeletonId, TreeNode,
    UserId, ValidationError,
};
pub use virtual_node::{
    is_virtual_node_id, VirtualNodeId, VIRTUAL_NODE_PRECISION, VIRTUAL_NODE_PREFIX,
};
pub use window::{BoundingBox, LevelOfDetail, ResponseFormat, WindowQuery, ZRange};
