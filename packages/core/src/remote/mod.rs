//! Remote Source Layer
//!
//! The request/response contract with the remote storage service, the wire
//! shapes it exchanges, and an in-memory implementation.

mod error;
mod memory;
mod source;
mod wire;

pub use error::RemoteError;
pub use memory::{InMemoryRemote, RequestLogEntry, RequestPhase};
pub use source::RemoteSource;
pub use wire::{
    normalize_payload, ConnectorRecord, CreateConnectorRequest, CreateLinkRequest,
    CreateNodeRequest, CreatedConnector, CreatedLink, CreatedNode, DeleteNodeRequest,
    DeletedNode, InsertNodeRequest, JoinRequest, MutationReceipt, NodeMove, Relinked,
    SplitRequest, SplitResult, TreenodeRecord, UpdateConfidenceRequest, UpdateParentRequest,
    UpdateRadiusRequest, WindowBatch, WindowPayload, WindowRequest,
};
