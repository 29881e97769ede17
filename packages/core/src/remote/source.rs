//! Remote Source Contract
//!
//! The remote storage service is reachable only through this request/response
//! contract. Every mutation echoes the authoritative edition time of each node
//! it touched; callers apply those before considering the operation complete.

use super::error::RemoteError;
use super::wire::{
    CreateConnectorRequest, CreateLinkRequest, CreateNodeRequest, CreatedConnector,
    CreatedLink, CreatedNode, DeleteNodeRequest, DeletedNode, InsertNodeRequest, JoinRequest,
    MutationReceipt, NodeMove, Relinked, SplitRequest, SplitResult, TreenodeRecord,
    UpdateConfidenceRequest, UpdateParentRequest, UpdateRadiusRequest, WindowPayload,
    WindowRequest,
};
use crate::models::RealNodeId;
use async_trait::async_trait;

/// Abstract remote storage service
///
/// Implementations must reject any mutation whose supplied edition time does
/// not match the stored one with [`RemoteError::Conflict`].
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Every node inside the requested volume, in the requested encoding
    async fn nodes_in_window(&self, request: &WindowRequest)
        -> Result<WindowPayload, RemoteError>;

    /// Point fetch of a single tree node
    async fn get_node(&self, id: RealNodeId) -> Result<TreenodeRecord, RemoteError>;

    /// Batched position update; all-or-nothing
    async fn move_nodes(&self, moves: &[NodeMove]) -> Result<MutationReceipt, RemoteError>;

    async fn create_node(&self, request: &CreateNodeRequest) -> Result<CreatedNode, RemoteError>;

    /// Create a node between a real child and its real parent
    async fn insert_node(&self, request: &InsertNodeRequest) -> Result<CreatedNode, RemoteError>;

    async fn delete_node(&self, request: &DeleteNodeRequest) -> Result<DeletedNode, RemoteError>;

    async fn update_radius(
        &self,
        request: &UpdateRadiusRequest,
    ) -> Result<MutationReceipt, RemoteError>;

    async fn update_parent(&self, request: &UpdateParentRequest)
        -> Result<Relinked, RemoteError>;

    /// Confidence of a node's parent edge, or of its connector links
    async fn update_confidence(
        &self,
        request: &UpdateConfidenceRequest,
    ) -> Result<MutationReceipt, RemoteError>;

    async fn create_connector(
        &self,
        request: &CreateConnectorRequest,
    ) -> Result<CreatedConnector, RemoteError>;

    async fn create_link(&self, request: &CreateLinkRequest) -> Result<CreatedLink, RemoteError>;

    async fn split_skeleton(&self, request: &SplitRequest) -> Result<SplitResult, RemoteError>;

    async fn join_skeletons(&self, request: &JoinRequest) -> Result<Relinked, RemoteError>;
}
