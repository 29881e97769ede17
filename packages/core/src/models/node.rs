//! Node Data Structures
//!
//! This module defines the `Node` struct held by the graph store and the
//! identifiers, positions and per-kind payloads it is built from.
//!
//! # Architecture
//!
//! - **Tagged kinds**: `NodeKind` is a sum type over tree nodes and connector
//!   nodes; every kind-dependent behavior matches on it exhaustively
//! - **Real vs virtual**: `NodeId` distinguishes remote-issued integer ids from
//!   synthetic [`VirtualNodeId`]s
//! - **Opaque edition times**: `EditionTime` is compared for equality only and
//!   is never parsed
//!
//! # Examples
//!
//! ```rust
//! use skeletrace_core::models::{Confidence, EditionTime, Node, NodeId, Point3};
//!
//! let node = Node::tree(
//!     NodeId::Real(17),
//!     Point3::new(10.0, 20.0, 40.0),
//!     Some(NodeId::Real(16)),
//!     Some(3.5),
//!     Confidence::MAX,
//!     4,
//! )
//! .with_edition_time(EditionTime::new("2024-05-01T10:00:00.000001+00:00"));
//!
//! assert!(node.is_tree());
//! assert_eq!(node.parent_id(), Some(&NodeId::Real(16)));
//! ```

use super::virtual_node::VirtualNodeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identifier issued by the remote source for a persisted node
pub type RealNodeId = i64;

/// Identifier of a skeleton (one connected tree)
pub type SkeletonId = i64;

/// Identifier of a user known to the remote source
pub type UserId = i64;

/// Identifier of a connector relation type (pre-/post-synaptic, abutting, ...)
pub type RelationId = i64;

/// Validation errors for node records and identifiers
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid node ID format: {0}")]
    InvalidId(String),

    #[error("Invalid field value for '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Invalid parent reference: {0}")]
    InvalidParent(String),

    #[error("Malformed record: {0}")]
    MalformedRecord(String),
}

impl ValidationError {
    /// Create a missing field error
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField(field.into())
    }

    /// Create an invalid field error
    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Position in project space (physical units)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Linear interpolation `self + (other - self) * t`
    pub fn lerp(&self, other: &Point3, t: f64) -> Point3 {
        Point3::new(
            self.x + (other.x - self.x) * t,
            self.y + (other.y - self.y) * t,
            self.z + (other.z - self.z) * t,
        )
    }
}

/// Either a remote-issued id or a synthetic virtual node id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeId {
    Real(RealNodeId),
    Virtual(VirtualNodeId),
}

impl NodeId {
    pub fn is_real(&self) -> bool {
        matches!(self, NodeId::Real(_))
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, NodeId::Virtual(_))
    }

    pub fn as_real(&self) -> Option<RealNodeId> {
        match self {
            NodeId::Real(id) => Some(*id),
            NodeId::Virtual(_) => None,
        }
    }

    pub fn as_virtual(&self) -> Option<&VirtualNodeId> {
        match self {
            NodeId::Real(_) => None,
            NodeId::Virtual(vn) => Some(vn),
        }
    }
}

impl From<RealNodeId> for NodeId {
    fn from(id: RealNodeId) -> Self {
        NodeId::Real(id)
    }
}

impl From<VirtualNodeId> for NodeId {
    fn from(id: VirtualNodeId) -> Self {
        NodeId::Virtual(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Real(id) => write!(f, "{}", id),
            NodeId::Virtual(vn) => write!(f, "{}", vn),
        }
    }
}

impl FromStr for NodeId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(id) = s.parse::<RealNodeId>() {
            return Ok(NodeId::Real(id));
        }
        s.parse::<VirtualNodeId>().map(NodeId::Virtual)
    }
}

/// Opaque optimistic-concurrency token issued by the remote source
///
/// Only ever compared for equality. The content is whatever the remote sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EditionTime(String);

impl EditionTime {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EditionTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordinal edge confidence, 0 to 5
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Confidence(u8);

impl Confidence {
    pub const MAX: Confidence = Confidence(5);

    pub fn new(value: u8) -> Result<Self, ValidationError> {
        if value > Self::MAX.0 {
            return Err(ValidationError::invalid_field(
                "confidence",
                format!("{} is outside 0..=5", value),
            ));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for Confidence {
    fn default() -> Self {
        Self::MAX
    }
}

impl TryFrom<u8> for Confidence {
    type Error = ValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Confidence::new(value)
    }
}

impl From<Confidence> for u8 {
    fn from(c: Confidence) -> Self {
        c.0
    }
}

/// Typed edge from a connector to a tree node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorLink {
    pub treenode_id: RealNodeId,
    pub relation_id: RelationId,
    pub confidence: Confidence,
    pub edition_time: EditionTime,
    pub link_id: RealNodeId,
}

/// Tree-node payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    /// One step toward the root; may be virtual
    pub parent_id: Option<NodeId>,
    /// `None` when the radius is unknown
    pub radius: Option<f64>,
    /// Confidence of the edge to the parent
    pub confidence: Confidence,
    pub skeleton_id: SkeletonId,
    /// Derived adjacency, kept sorted and free of duplicates
    pub children: Vec<NodeId>,
}

/// Connector-node payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorNode {
    pub confidence: Confidence,
    pub links: Vec<ConnectorLink>,
}

/// Kind-specific payload of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeKind {
    Tree(TreeNode),
    Connector(ConnectorNode),
}

/// Discriminant of [`NodeKind`] without payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKindTag {
    Tree,
    Connector,
}

/// A live node in the graph store, real or virtual
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub position: Point3,
    /// Signed distance from the current section along z
    pub zdiff: f64,
    pub creator_id: Option<UserId>,
    /// `None` for virtual nodes and for nodes not yet acknowledged
    pub edition_time: Option<EditionTime>,
    pub kind: NodeKind,
}

impl Node {
    /// Create a tree node
    pub fn tree(
        id: NodeId,
        position: Point3,
        parent_id: Option<NodeId>,
        radius: Option<f64>,
        confidence: Confidence,
        skeleton_id: SkeletonId,
    ) -> Self {
        Self {
            id,
            position,
            zdiff: 0.0,
            creator_id: None,
            edition_time: None,
            kind: NodeKind::Tree(TreeNode {
                parent_id,
                radius,
                confidence,
                skeleton_id,
                children: Vec::new(),
            }),
        }
    }

    /// Create a connector node
    pub fn connector(id: NodeId, position: Point3, confidence: Confidence) -> Self {
        Self {
            id,
            position,
            zdiff: 0.0,
            creator_id: None,
            edition_time: None,
            kind: NodeKind::Connector(ConnectorNode {
                confidence,
                links: Vec::new(),
            }),
        }
    }

    pub fn with_edition_time(mut self, edition_time: EditionTime) -> Self {
        self.edition_time = Some(edition_time);
        self
    }

    pub fn with_creator(mut self, creator_id: UserId) -> Self {
        self.creator_id = Some(creator_id);
        self
    }

    pub fn kind_tag(&self) -> NodeKindTag {
        match self.kind {
            NodeKind::Tree(_) => NodeKindTag::Tree,
            NodeKind::Connector(_) => NodeKindTag::Connector,
        }
    }

    pub fn is_tree(&self) -> bool {
        matches!(self.kind, NodeKind::Tree(_))
    }

    pub fn is_connector(&self) -> bool {
        matches!(self.kind, NodeKind::Connector(_))
    }

    pub fn is_virtual(&self) -> bool {
        self.id.is_virtual()
    }

    pub fn as_tree(&self) -> Option<&TreeNode> {
        match &self.kind {
            NodeKind::Tree(t) => Some(t),
            NodeKind::Connector(_) => None,
        }
    }

    pub fn as_tree_mut(&mut self) -> Option<&mut TreeNode> {
        match &mut self.kind {
            NodeKind::Tree(t) => Some(t),
            NodeKind::Connector(_) => None,
        }
    }

    pub fn as_connector(&self) -> Option<&ConnectorNode> {
        match &self.kind {
            NodeKind::Tree(_) => None,
            NodeKind::Connector(c) => Some(c),
        }
    }

    pub fn as_connector_mut(&mut self) -> Option<&mut ConnectorNode> {
        match &mut self.kind {
            NodeKind::Tree(_) => None,
            NodeKind::Connector(c) => Some(c),
        }
    }

    pub fn parent_id(&self) -> Option<&NodeId> {
        self.as_tree().and_then(|t| t.parent_id.as_ref())
    }

    pub fn skeleton_id(&self) -> Option<SkeletonId> {
        self.as_tree().map(|t| t.skeleton_id)
    }

    pub fn children(&self) -> &[NodeId] {
        match &self.kind {
            NodeKind::Tree(t) => &t.children,
            NodeKind::Connector(_) => &[],
        }
    }

    /// Add a child id, keeping the list sorted and unique
    pub fn add_child(&mut self, child: NodeId) {
        if let Some(tree) = self.as_tree_mut() {
            if let Err(pos) = tree.children.binary_search(&child) {
                tree.children.insert(pos, child);
            }
        }
    }

    /// Remove a child id; returns whether it was present
    pub fn remove_child(&mut self, child: &NodeId) -> bool {
        match self.as_tree_mut() {
            Some(tree) => match tree.children.binary_search(child) {
                Ok(pos) => {
                    tree.children.remove(pos);
                    true
                }
                Err(_) => false,
            },
            None => false,
        }
    }

    /// Validate the fields every node of this kind must carry
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.position.is_finite() {
            return Err(ValidationError::invalid_field(
                "position",
                "coordinates must be finite",
            ));
        }

        match &self.kind {
            NodeKind::Tree(tree) => {
                if tree.parent_id.as_ref() == Some(&self.id) {
                    return Err(ValidationError::InvalidParent(
                        "Node cannot be its own parent".to_string(),
                    ));
                }
                if let Some(r) = tree.radius {
                    if !r.is_finite() {
                        return Err(ValidationError::invalid_field("radius", "must be finite"));
                    }
                }
            }
            NodeKind::Connector(_) => {
                if self.id.is_virtual() {
                    return Err(ValidationError::InvalidId(format!(
                        "connector {} cannot be virtual",
                        self.id
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Normalize a wire radius: negative values mean "unknown"
pub fn radius_from_wire(raw: f64) -> Option<f64> {
    if raw.is_finite() && raw >= 0.0 {
        Some(raw)
    } else {
        None
    }
}

/// Inverse of [`radius_from_wire`]
pub fn radius_to_wire(radius: Option<f64>) -> f64 {
    radius.unwrap_or(-1.0)
}
