//! Remote Source Error Types
//!
//! Errors reported by a [`RemoteSource`](super::RemoteSource) implementation.
//! The service layer maps them onto the overlay error taxonomy.

use crate::models::RealNodeId;
use thiserror::Error;

/// Errors returned by the remote source
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// The node changed remotely since its edition time was read
    #[error("Edition time conflict for node {node_id}: expected '{expected}', current is '{actual}'")]
    Conflict {
        node_id: RealNodeId,
        expected: String,
        actual: String,
    },

    /// Referenced node does not exist remotely
    #[error("Node {node_id} not found")]
    NotFound { node_id: RealNodeId },

    /// Network failure or timeout
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The request was well-formed but violates a remote rule
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The response could not be decoded at all
    #[error("Malformed response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Create a conflict error
    pub fn conflict(
        node_id: RealNodeId,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            node_id,
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(node_id: RealNodeId) -> Self {
        Self::NotFound { node_id }
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Whether re-sending the same read may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transport(_))
    }
}
