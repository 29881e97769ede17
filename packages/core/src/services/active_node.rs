//! Active Node Controller
//!
//! Holds the node the user is currently working on, per overlay. Every
//! accepted transition is validated first and then announced exactly once on
//! a broadcast channel.
//!
//! # States
//!
//! ```text
//! Unset ──activate──► Set(node, viewer) ──activate──► Set(node', viewer')
//!   ▲                        │
//!   └──────deactivate────────┘
//! ```

use super::error::OverlayError;
use crate::models::{
    Node, NodeId, NodeKindTag, Point3, RealNodeId, SkeletonId, ValidationError, VirtualNodeId,
};
use serde::Serialize;
use std::future::Future;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Validated active node
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveNode {
    pub id: NodeId,
    pub kind: NodeKindTag,
    /// Always present for tree nodes
    pub skeleton_id: Option<SkeletonId>,
    pub position: Point3,
    pub viewer_id: Option<String>,
}

/// Candidate for activation, possibly incomplete
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeSelection {
    pub id: Option<NodeId>,
    pub kind: Option<NodeKindTag>,
    pub skeleton_id: Option<SkeletonId>,
    pub position: Option<Point3>,
}

impl From<&Node> for NodeSelection {
    fn from(node: &Node) -> Self {
        Self {
            id: Some(node.id),
            kind: Some(node.kind_tag()),
            skeleton_id: node.skeleton_id(),
            position: Some(node.position),
        }
    }
}

impl NodeSelection {
    /// Check the fields the node's kind requires
    pub fn validate(&self, viewer_id: Option<String>) -> Result<ActiveNode, ValidationError> {
        let id = self.id.ok_or_else(|| ValidationError::missing_field("id"))?;
        let kind = self
            .kind
            .ok_or_else(|| ValidationError::missing_field("kind"))?;
        let position = self
            .position
            .ok_or_else(|| ValidationError::missing_field("position"))?;
        if !position.is_finite() {
            return Err(ValidationError::invalid_field(
                "position",
                "coordinates must be finite",
            ));
        }
        match kind {
            NodeKindTag::Tree => {
                if self.skeleton_id.is_none() {
                    return Err(ValidationError::missing_field("skeletonId"));
                }
            }
            NodeKindTag::Connector => {
                if id.is_virtual() {
                    return Err(ValidationError::InvalidId(format!(
                        "connector {} cannot be virtual",
                        id
                    )));
                }
            }
        }
        Ok(ActiveNode {
            id,
            kind,
            skeleton_id: self.skeleton_id,
            position,
            viewer_id,
        })
    }
}

/// Notification raised by every accepted transition
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveNodeChange {
    pub state: Option<ActiveNode>,
    pub skeleton_changed: bool,
}

pub struct ActiveNodeController {
    state: RwLock<Option<ActiveNode>>,
    changes: broadcast::Sender<ActiveNodeChange>,
}

impl Default for ActiveNodeController {
    fn default() -> Self {
        Self::new()
    }
}

impl ActiveNodeController {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(None),
            changes,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<ActiveNode>> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<ActiveNode>> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ActiveNodeChange> {
        self.changes.subscribe()
    }

    pub fn current(&self) -> Option<ActiveNode> {
        self.read().clone()
    }

    pub fn current_id(&self) -> Option<NodeId> {
        self.read().as_ref().map(|a| a.id)
    }

    pub fn is_active(&self, id: &NodeId) -> bool {
        self.current_id().as_ref() == Some(id)
    }

    fn announce(&self, change: ActiveNodeChange) -> ActiveNodeChange {
        // No subscribers is not an error
        let _ = self.changes.send(change.clone());
        change
    }

    /// Make `selection` the active node
    ///
    /// A rejected selection leaves the previous state untouched.
    pub fn activate(
        &self,
        selection: &NodeSelection,
        viewer_id: Option<String>,
    ) -> Result<ActiveNodeChange, ValidationError> {
        let next = selection.validate(viewer_id)?;
        let change = {
            let mut state = self.write();
            let skeleton_changed =
                state.as_ref().and_then(|a| a.skeleton_id) != next.skeleton_id;
            *state = Some(next.clone());
            ActiveNodeChange {
                state: Some(next),
                skeleton_changed,
            }
        };
        tracing::debug!("Active node set to {:?}", change.state.as_ref().map(|a| a.id));
        Ok(self.announce(change))
    }

    /// Return to `Unset`; `None` when nothing was active
    pub fn deactivate(&self) -> Option<ActiveNodeChange> {
        let previous = self.write().take()?;
        Some(self.announce(ActiveNodeChange {
            state: None,
            skeleton_changed: previous.skeleton_id.is_some(),
        }))
    }

    /// Re-key the active node after it was realized elsewhere
    pub fn replace_id(&self, old: &NodeId, new: NodeId) -> Option<ActiveNodeChange> {
        let updated = {
            let mut state = self.write();
            match state.as_mut() {
                Some(active) if active.id == *old => {
                    active.id = new;
                    Some(active.clone())
                }
                _ => None,
            }
        }?;
        Some(self.announce(ActiveNodeChange {
            state: Some(updated),
            skeleton_changed: false,
        }))
    }

    /// Track a position change of the active node without notifying
    pub fn update_position(&self, id: &NodeId, position: Point3) {
        if let Some(active) = self.write().as_mut().filter(|a| a.id == *id) {
            active.position = position;
        }
    }

    /// Resolve the active node to a real id, realizing it first if virtual
    ///
    /// Re-raises the change notification when the id changed.
    pub async fn promise_real_identifier<F, Fut>(
        &self,
        realize: F,
    ) -> Result<Option<RealNodeId>, OverlayError>
    where
        F: FnOnce(VirtualNodeId) -> Fut,
        Fut: Future<Output = Result<RealNodeId, OverlayError>>,
    {
        let Some(current) = self.current_id() else {
            return Ok(None);
        };
        match current {
            NodeId::Real(id) => Ok(Some(id)),
            NodeId::Virtual(vn) => {
                let new_id = realize(vn).await?;
                self.replace_id(&current, NodeId::Real(new_id));
                Ok(Some(new_id))
            }
        }
    }
}
