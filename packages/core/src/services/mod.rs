//! Overlay Services
//!
//! The coordinating layer between the graph store and the remote source:
//!
//! - `TracingOverlay` - Per-viewer orchestration of fetching, editing and sync
//! - `WindowFetcher` - View to query translation, cache lookup, retried fetch
//! - `ResultCache` - LRU of normalized window responses with enclosing reuse
//! - `SyncQueue` - Deferred write-back of local edits
//! - `ActiveNodeController` - The node the user is working on
//! - `RequestQueue` - Strict FIFO ordering of remote calls
//!
//! Services never touch a transport directly; everything remote goes through
//! [`crate::remote::RemoteSource`].

pub mod active_node;
pub mod error;
pub mod events;
pub mod lod;
pub mod overlay;
pub mod request_queue;
pub mod result_cache;
pub mod sync_queue;
pub mod window_fetcher;

pub use active_node::{ActiveNode, ActiveNodeChange, ActiveNodeController, NodeSelection};
pub use error::OverlayError;
pub use events::OverlayEvent;
pub use lod::{zoom_fraction, LodAnchor, LodMapping, LodPolicy};
pub use overlay::{OverlayStats, RefreshOutcome, TracingOverlay};
pub use request_queue::RequestQueue;
pub use result_cache::{can_substitute, CacheLookup, CacheStats, ResultCache};
pub use sync_queue::{FlushReport, SyncQueue, SyncTarget};
pub use window_fetcher::{FetchOutcome, FetchSource, ViewState, WindowFetcher};
