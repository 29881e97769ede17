//! Skeletrace Core
//!
//! Engine behind a neuron-tracing overlay: it keeps the part of a skeleton
//! graph that is near the displayed section in memory, derives the virtual
//! nodes where edges cross that section, and writes local edits back to a
//! remote annotation service.
//!
//! # Architecture
//!
//! - **Section-scoped store**: the graph is rebuilt per fetch window; edges
//!   crossing the section plane are split by a synthetic virtual node
//! - **Self-describing virtual ids**: `vn:<child>:<parent>:<x>:<y>:<z>` can be
//!   decoded without a lookup and realized into a real node on demand
//! - **Ordered remote access**: every remote call goes through one FIFO queue
//! - **Deferred write-back**: moves are batched by the sync queue
//!
//! # Modules
//!
//! - [`models`] - Nodes, identifiers, window queries
//! - [`graph`] - Plane intersection and the graph store
//! - [`remote`] - Remote source trait, wire formats, in-memory backend
//! - [`services`] - Fetcher, cache, sync queue, active node, overlay
//! - [`config`] - Overlay configuration

pub mod config;
pub mod graph;
pub mod models;
pub mod remote;
pub mod services;

// Re-export commonly used types
pub use config::{CacheConfig, ConfigError, OverlayConfig, SessionConfig};
pub use graph::{CuttingPlane, GraphStore, LinkReport};
pub use models::*;
pub use remote::{InMemoryRemote, RemoteError, RemoteSource};
pub use services::*;
