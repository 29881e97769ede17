//! Service Layer Error Types
//!
//! Errors surfaced by the tracing overlay. Remote failures are folded onto
//! the same taxonomy so callers only ever match one enum.

use crate::config::ConfigError;
use crate::models::{NodeId, RealNodeId, ValidationError};
use crate::remote::RemoteError;
use thiserror::Error;

/// Overlay operation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OverlayError {
    /// A node or transition failed local validation
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The node changed remotely; reload it before retrying
    #[error("Edition time conflict for node {node_id}: expected '{expected}', current is '{actual}'")]
    Conflict {
        node_id: RealNodeId,
        expected: String,
        actual: String,
    },

    /// Node absent locally or remotely
    #[error("Node not found: {id}")]
    NotFound { id: String },

    /// Network failure after all read retries
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The session may not edit this node
    #[error("Permission denied for node {node_id} (created by user {creator_id})")]
    PermissionDenied {
        node_id: RealNodeId,
        creator_id: i64,
    },

    /// Children of the node still carry unsynced local changes
    #[error("Node {node_id} has {count} children with unsynced changes")]
    UnresolvedChildren { node_id: RealNodeId, count: usize },

    /// The operation does not apply to this node or state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Remote rejected a well-formed request or sent an undecodable response
    #[error("Remote request failed: {0}")]
    Remote(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl OverlayError {
    /// Create a not found error
    pub fn not_found(id: impl ToString) -> Self {
        Self::NotFound { id: id.to_string() }
    }

    /// Create a not found error for a node id
    pub fn node_not_found(id: &NodeId) -> Self {
        Self::not_found(id)
    }

    /// Create an invalid operation error
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Whether the same read may succeed when re-issued
    ///
    /// Mutations are never re-submitted automatically, whatever this says.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OverlayError::Transport(_))
    }

    /// Whether the caller should reload the node before retrying
    pub fn is_conflict(&self) -> bool {
        matches!(self, OverlayError::Conflict { .. })
    }
}

impl From<RemoteError> for OverlayError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Conflict {
                node_id,
                expected,
                actual,
            } => OverlayError::Conflict {
                node_id,
                expected,
                actual,
            },
            RemoteError::NotFound { node_id } => OverlayError::not_found(node_id),
            RemoteError::Transport(msg) => OverlayError::Transport(msg),
            RemoteError::InvalidRequest(msg) | RemoteError::Decode(msg) => {
                OverlayError::Remote(msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_errors_map_onto_taxonomy() {
        let conflict: OverlayError = RemoteError::conflict(3, "a", "b").into();
        assert!(conflict.is_conflict());
        assert!(!conflict.is_retryable());

        let transport: OverlayError = RemoteError::transport("reset").into();
        assert!(transport.is_retryable());

        assert_eq!(
            OverlayError::from(RemoteError::not_found(9)),
            OverlayError::NotFound { id: "9".to_string() }
        );
    }
}
