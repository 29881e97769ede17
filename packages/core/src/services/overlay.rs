//! Tracing Overlay
//!
//! One overlay instance owns everything needed to show and edit the graph in
//! one viewer: the graph store, the window fetcher with its cache, the sync
//! queue, the active node, and the ordered request queue every remote call
//! goes through.
//!
//! # Concurrency
//!
//! - All remote calls are submitted to the [`RequestQueue`]; each call's
//!   continuation (applying the result to the store) runs before the next
//!   call is dispatched.
//! - The store lock is never held across a remote await.
//! - A refresh whose generation is older than the last applied one is
//!   discarded; while suspended, fetch results are not applied at all.
//!   Refreshes enter the queue in generation order, so the discard only
//!   fires for results applied out of band.
//!
//! # Edits
//!
//! Moves are applied locally and deferred to the sync queue. Every other
//! mutation flushes first, then talks to the remote, then applies the
//! authoritative edition times it echoed. The result cache is cleared after
//! each acknowledged mutation.

use super::active_node::{ActiveNodeChange, ActiveNodeController, NodeSelection};
use super::error::OverlayError;
use super::events::{OverlayEvent, EVENT_CHANNEL_CAPACITY};
use super::request_queue::RequestQueue;
use super::result_cache::CacheStats;
use super::sync_queue::{FlushReport, SyncQueue, SyncTarget};
use super::window_fetcher::{FetchOutcome, FetchSource, ViewState, WindowFetcher};
use crate::config::OverlayConfig;
use crate::graph::{CuttingPlane, GraphStore, LinkReport, RemovedNode, StoreStats};
use crate::models::{
    Confidence, ConnectorLink, EditionTime, Node, NodeId, NodeKindTag, Point3, RealNodeId,
    RelationId, SkeletonId, ValidationError, VirtualNodeId,
};
use crate::remote::{
    ConnectorRecord, CreateConnectorRequest, CreateLinkRequest, CreateNodeRequest,
    DeleteNodeRequest, DeletedNode, InsertNodeRequest, JoinRequest, NodeMove, RemoteError,
    RemoteSource, SplitRequest, SplitResult, TreenodeRecord, UpdateConfidenceRequest,
    UpdateParentRequest, UpdateRadiusRequest, WindowBatch,
};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, RwLock, RwLockReadGuard};
use uuid::Uuid;

const PRESYNAPTIC: &str = "presynaptic_to";
const POSTSYNAPTIC: &str = "postsynaptic_to";

/// Result of one [`TracingOverlay::refresh`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshOutcome {
    pub generation: u64,
    /// Whether the fetch result replaced the store content
    pub applied: bool,
    pub source: FetchSource,
    pub truncated: bool,
    pub report: Option<LinkReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverlayStats {
    pub store: StoreStats,
    pub cache: CacheStats,
    pub dirty: usize,
    pub generation: u64,
}

pub struct TracingOverlay {
    id: Uuid,
    config: OverlayConfig,
    remote: Arc<dyn RemoteSource>,
    queue: RequestQueue,
    fetcher: WindowFetcher,
    store: RwLock<GraphStore>,
    sync: SyncQueue,
    active: ActiveNodeController,
    events: broadcast::Sender<OverlayEvent>,
    suspended: AtomicBool,
    generation: AtomicU64,
    applied_generation: AtomicU64,
    last_view: Mutex<Option<ViewState>>,
    realized: Mutex<HashMap<VirtualNodeId, RealNodeId>>,
}

impl TracingOverlay {
    pub fn new(remote: Arc<dyn RemoteSource>, config: OverlayConfig) -> Result<Self, OverlayError> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let id = Uuid::new_v4();
        tracing::debug!("Creating tracing overlay {}", id);
        Ok(Self {
            id,
            fetcher: WindowFetcher::new(remote.clone(), &config),
            store: RwLock::new(GraphStore::new(
                CuttingPlane::new(0.0),
                config.node_pool_limit,
            )),
            remote,
            config,
            queue: RequestQueue::new(),
            sync: SyncQueue::new(),
            active: ActiveNodeController::new(),
            events,
            suspended: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            applied_generation: AtomicU64::new(0),
            last_view: Mutex::new(None),
            realized: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    pub fn active(&self) -> &ActiveNodeController {
        &self.active
    }

    pub fn sync_queue(&self) -> &SyncQueue {
        &self.sync
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OverlayEvent> {
        self.events.subscribe()
    }

    /// Read access for renderers
    pub async fn store(&self) -> RwLockReadGuard<'_, GraphStore> {
        self.store.read().await
    }

    pub async fn node(&self, id: &NodeId) -> Option<Node> {
        self.store.read().await.get(id).cloned()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Stop applying fetch results; in-flight requests still complete
    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::SeqCst);
        tracing::debug!("Overlay {} suspended: {}", self.id, suspended);
    }

    pub async fn stats(&self) -> OverlayStats {
        OverlayStats {
            store: self.store.read().await.stats(),
            cache: self.fetcher.cache_stats(),
            dirty: self.sync.len(),
            generation: self.applied_generation.load(Ordering::SeqCst),
        }
    }

    fn emit(&self, event: OverlayEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    fn warn_user(&self, message: String) {
        tracing::warn!("{}", message);
        self.emit(OverlayEvent::Warning { message });
    }

    fn last_view(&self) -> MutexGuard<'_, Option<ViewState>> {
        self.last_view.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn realized(&self) -> MutexGuard<'_, HashMap<VirtualNodeId, RealNodeId>> {
        self.realized.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Real id a virtual node was persisted under, if it has been
    pub fn realized_id(&self, vn: &VirtualNodeId) -> Option<RealNodeId> {
        self.realized().get(vn).copied()
    }

    /// Realization of `vn` that still describes the store
    ///
    /// An entry only holds while the virtual node is absent and the real node
    /// present. Once the real node is deleted the edge can be split again
    /// under the same virtual id, and the stale entry is dropped.
    async fn settled_realization(&self, vn: &VirtualNodeId) -> Option<RealNodeId> {
        let id = self.realized_id(vn)?;
        let settled = {
            let store = self.store.read().await;
            !store.contains(&NodeId::Virtual(*vn)) && store.get_real(id).is_some()
        };
        if settled {
            return Some(id);
        }
        tracing::debug!("Dropping stale realization {} -> {}", vn, id);
        self.realized().remove(vn);
        None
    }

    /// Forget realizations the store no longer backs
    fn prune_realized(&self, store: &GraphStore) {
        self.realized()
            .retain(|vn, id| !store.contains(&NodeId::Virtual(*vn)) && store.get_real(*id).is_some());
    }

    /// Whether showing `view` requires a new fetch
    pub fn needs_refresh(&self, view: &ViewState) -> bool {
        let last = *self.last_view();
        self.fetcher.needs_fetch(last.as_ref(), view)
    }

    /// Flush pending edits, fetch the window around `view` and rebuild
    pub async fn refresh(&self, view: &ViewState) -> Result<RefreshOutcome, OverlayError> {
        self.flush().await?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (treenode_ids, connector_ids) = match self.active.current() {
            Some(active) => match (active.id, active.kind) {
                (NodeId::Real(id), NodeKindTag::Tree) => (vec![id], vec![]),
                (NodeId::Real(id), NodeKindTag::Connector) => (vec![], vec![id]),
                (NodeId::Virtual(_), _) => (vec![], vec![]),
            },
            None => (vec![], vec![]),
        };
        let query = self.fetcher.build_query(view, treenode_ids, connector_ids);

        self.queue
            .submit("nodes-in-window", || async {
                let outcome = self.fetcher.fetch(&query).await?;
                Ok::<_, OverlayError>(self.apply_fetch(generation, view, outcome).await)
            })
            .await
    }

    async fn apply_fetch(
        &self,
        generation: u64,
        view: &ViewState,
        outcome: FetchOutcome,
    ) -> RefreshOutcome {
        let mut result = RefreshOutcome {
            generation,
            applied: false,
            source: outcome.source,
            truncated: outcome.truncated,
            report: None,
        };

        if self.is_suspended() {
            tracing::debug!("Overlay suspended; fetch {} not applied", generation);
            return result;
        }
        if generation < self.applied_generation.load(Ordering::SeqCst) {
            tracing::debug!("Discarding stale fetch {}", generation);
            return result;
        }

        let report = {
            let mut store = self.store.write().await;
            let report = store.rebuild(view.plane(), &outcome.batch);
            self.prune_realized(&store);
            report
        };
        self.applied_generation.store(generation, Ordering::SeqCst);
        *self.last_view() = Some(*view);

        tracing::info!(
            "Overlay {} rebuilt at z={} from {:?}: {} tree nodes, {} connectors, {} virtual",
            self.id,
            view.section_z(),
            outcome.source,
            report.tree_nodes,
            report.connectors,
            report.virtual_nodes
        );
        if outcome.truncated {
            self.emit(OverlayEvent::Truncated { generation });
            self.warn_user(
                "Did not retrieve all visible nodes due to the node limit. Zoom in to see more."
                    .to_string(),
            );
        }
        self.emit(OverlayEvent::GraphRebuilt {
            generation,
            report: report.clone(),
        });

        result.applied = true;
        result.report = Some(report);
        result
    }

    /// Point-fetch `id` and splice it into the store
    async fn load_node(&self, id: RealNodeId) -> Result<(), OverlayError> {
        self.queue
            .submit("get-node", || async {
                let record = self.remote.get_node(id).await?;
                self.store.write().await.insert_records(&single(record));
                Ok::<_, OverlayError>(())
            })
            .await
    }

    /// Load the parent of `id` when it is outside the store
    async fn ensure_parent_loaded(&self, id: RealNodeId) -> Result<(), OverlayError> {
        let missing = {
            let store = self.store.read().await;
            if store.unresolved_parents().contains(&id) {
                store
                    .parent_of(&NodeId::Real(id))
                    .and_then(NodeId::as_real)
            } else {
                None
            }
        };
        if let Some(parent) = missing {
            tracing::debug!("Point-fetching parent {} of node {}", parent, id);
            self.load_node(parent).await?;
        }
        Ok(())
    }

    /// Replace a node with its authoritative remote state
    ///
    /// Any pending local change to it is dropped. Used after a conflict.
    pub async fn reload_node(&self, id: RealNodeId) -> Result<(), OverlayError> {
        self.sync.discard(&NodeId::Real(id));
        match self.load_node(id).await {
            Ok(()) => Ok(()),
            Err(OverlayError::NotFound { .. }) => {
                self.store.write().await.remove_node(id);
                Err(OverlayError::not_found(id))
            }
            Err(e) => Err(e),
        }
    }

    fn check_permission(&self, node: &Node) -> Result<(), OverlayError> {
        if self.config.session.can_edit(node.creator_id) {
            return Ok(());
        }
        Err(OverlayError::PermissionDenied {
            node_id: node.id.as_real().unwrap_or_default(),
            creator_id: node.creator_id.unwrap_or_default(),
        })
    }

    /// Permission check plus current edition time of a real node
    async fn editable(&self, id: RealNodeId) -> Result<EditionTime, OverlayError> {
        let store = self.store.read().await;
        let node = store
            .get_real(id)
            .ok_or_else(|| OverlayError::not_found(id))?;
        self.check_permission(node)?;
        edition_of(node)
    }

    async fn edition(&self, id: RealNodeId) -> Result<EditionTime, OverlayError> {
        let store = self.store.read().await;
        let node = store
            .get_real(id)
            .ok_or_else(|| OverlayError::not_found(id))?;
        edition_of(node)
    }

    /// Real id for `id`, realizing a virtual node first
    async fn ensure_real(&self, id: NodeId) -> Result<RealNodeId, OverlayError> {
        match id {
            NodeId::Real(id) => Ok(id),
            NodeId::Virtual(vn) => self.realize(vn).await,
        }
    }

    /// Apply an acknowledged mutation's edition times and drop cached windows
    ///
    /// Runs inside the queued continuation so no later fetch sees stale data.
    fn acknowledge(&self, store: &mut GraphStore, receipt: &BTreeMap<RealNodeId, EditionTime>) {
        store.apply_edition_times(receipt);
        self.fetcher.invalidate();
    }

    /// Move a node locally; the remote learns about it on the next flush
    ///
    /// Moving a real node re-links its edges. Moved virtual nodes on those
    /// edges are persisted first, and an active virtual node on them follows
    /// the new crossing point, or is unset when the edge no longer crosses.
    pub async fn move_node(&self, id: NodeId, position: Point3) -> Result<(), OverlayError> {
        if !position.is_finite() {
            return Err(ValidationError::invalid_field("position", "coordinates must be finite").into());
        }
        if let NodeId::Real(real) = id {
            let pending = self
                .store
                .read()
                .await
                .adjacent_virtuals(real)
                .into_iter()
                .any(|vn| self.sync.is_dirty(&NodeId::Virtual(vn)));
            if pending {
                self.flush().await?;
            }
        }

        let relinked: Vec<(VirtualNodeId, Option<(NodeId, Point3)>)> = {
            let mut store = self.store.write().await;
            let node = store.get(&id).ok_or_else(|| OverlayError::node_not_found(&id))?;
            self.check_permission(node)?;
            let before = match id {
                NodeId::Real(real) => store.adjacent_virtuals(real),
                NodeId::Virtual(_) => Vec::new(),
            };
            store.set_position(&id, position);
            before
                .into_iter()
                .map(|vn| {
                    let next = store
                        .parent_of(&NodeId::Real(vn.child()))
                        .filter(|p| p.is_virtual())
                        .and_then(|p| store.get(p))
                        .map(|n| (n.id, n.position));
                    (vn, next)
                })
                .collect()
        };
        self.sync.mark_dirty(id);
        self.active.update_position(&id, position);

        if let Some(NodeId::Virtual(active)) = self.active.current_id() {
            if let Some((_, next)) = relinked.iter().find(|(vn, _)| *vn == active) {
                match next {
                    Some((next_id, next_position)) => {
                        self.active.replace_id(&NodeId::Virtual(active), *next_id);
                        self.active.update_position(next_id, *next_position);
                    }
                    None => {
                        self.active.deactivate();
                    }
                }
            }
        }
        Ok(())
    }

    /// Create a tree node, as a new skeleton when `parent` is `None`
    pub async fn create_node(
        &self,
        parent: Option<NodeId>,
        position: Point3,
        radius: Option<f64>,
        confidence: Confidence,
    ) -> Result<RealNodeId, OverlayError> {
        if !position.is_finite() {
            return Err(ValidationError::invalid_field("position", "coordinates must be finite").into());
        }
        validate_radius(radius)?;
        let parent = match parent {
            Some(p) => Some(self.ensure_real(p).await?),
            None => None,
        };
        self.flush().await?;
        let parent_edition_time = match parent {
            Some(p) => Some(self.edition(p).await?),
            None => None,
        };

        let request = CreateNodeRequest {
            parent_id: parent,
            parent_edition_time,
            position,
            radius,
            confidence,
        };
        let user_id = self.config.session.user_id;
        let created = self
            .queue
            .submit("create-node", || async {
                let created = self.remote.create_node(&request).await?;
                let mut store = self.store.write().await;
                store.insert_created(
                    created.id,
                    position,
                    parent,
                    radius,
                    created.skeleton_id,
                    user_id,
                    created.edition_time.clone(),
                );
                self.acknowledge(&mut store, &created.receipt.edition_times);
                Ok::<_, OverlayError>(created)
            })
            .await?;
        tracing::info!("Created node {} in skeleton {}", created.id, created.skeleton_id);
        Ok(created.id)
    }

    /// Persist a virtual node; returns its real id
    ///
    /// Pending edits are flushed first, which may already realize it.
    pub async fn realize(&self, vn: VirtualNodeId) -> Result<RealNodeId, OverlayError> {
        if let Some(id) = self.settled_realization(&vn).await {
            return Ok(id);
        }
        self.flush().await?;
        if let Some(id) = self.settled_realization(&vn).await {
            return Ok(id);
        }
        self.realize_now(vn).await
    }

    async fn realize_now(&self, vn: VirtualNodeId) -> Result<RealNodeId, OverlayError> {
        let request = {
            let store = self.store.read().await;
            let node = store
                .get(&NodeId::Virtual(vn))
                .ok_or_else(|| OverlayError::not_found(vn))?;
            let tree = node
                .as_tree()
                .ok_or_else(|| OverlayError::invalid_operation("virtual connector"))?;
            let child = store
                .get_real(vn.child())
                .ok_or_else(|| OverlayError::not_found(vn.child()))?;
            let parent = store
                .get_real(vn.parent())
                .ok_or_else(|| OverlayError::not_found(vn.parent()))?;
            InsertNodeRequest {
                child_id: vn.child(),
                child_edition_time: edition_of(child)?,
                parent_id: vn.parent(),
                parent_edition_time: edition_of(parent)?,
                position: node.position,
                radius: tree.radius,
                confidence: tree.confidence,
            }
        };

        let user_id = self.config.session.user_id;
        let created = self
            .queue
            .submit("insert-node", || async {
                let created = self.remote.insert_node(&request).await?;
                let mut store = self.store.write().await;
                store.replace_virtual(&vn, created.id, created.edition_time.clone(), Some(user_id));
                self.acknowledge(&mut store, &created.receipt.edition_times);
                Ok::<_, OverlayError>(created)
            })
            .await?;

        self.realized().insert(vn, created.id);
        self.active
            .replace_id(&NodeId::Virtual(vn), NodeId::Real(created.id));
        self.emit(OverlayEvent::NodeRealized {
            virtual_id: vn,
            real_id: created.id,
        });
        tracing::info!("Realized virtual node {} as {}", vn, created.id);
        Ok(created.id)
    }

    /// Delete a real node
    ///
    /// Rejected before any request when the node is virtual, not editable, or
    /// has children with unsynced changes. The node disappears locally at once
    /// and is restored if the remote refuses.
    ///
    /// When it was active, the next active node is the first loaded one of:
    /// its parent; for a connector, its presynaptic then postsynaptic
    /// partners; for a tree node, connectors it is postsynaptic then
    /// presynaptic to. Without any, the active node is unset.
    pub async fn delete_node(&self, id: NodeId) -> Result<DeletedNode, OverlayError> {
        let id = match id {
            NodeId::Real(id) => id,
            NodeId::Virtual(vn) => {
                return Err(OverlayError::invalid_operation(format!(
                    "virtual node {} cannot be deleted",
                    vn
                )));
            }
        };

        {
            let store = self.store.read().await;
            let node = store
                .get_real(id)
                .ok_or_else(|| OverlayError::not_found(id))?;
            self.check_permission(node)?;
            let unsynced = store
                .children_of(&NodeId::Real(id))
                .iter()
                .filter(|child| match child {
                    NodeId::Real(_) => self.sync.is_dirty(child),
                    NodeId::Virtual(vn) => {
                        self.sync.is_dirty(child) || self.sync.is_dirty(&NodeId::Real(vn.child()))
                    }
                })
                .count();
            if unsynced > 0 {
                return Err(OverlayError::UnresolvedChildren {
                    node_id: id,
                    count: unsynced,
                });
            }
        }

        self.ensure_parent_loaded(id).await?;
        self.flush().await?;

        let (removed, edition_time, handover) = {
            let mut store = self.store.write().await;
            let edition_time = edition_of(
                store
                    .get_real(id)
                    .ok_or_else(|| OverlayError::not_found(id))?,
            )?;
            let removed = store
                .remove_node(id)
                .ok_or_else(|| OverlayError::not_found(id))?;
            store.exclude(id);
            let handover = handover_candidates(&store, &removed);
            (removed, edition_time, handover)
        };

        let request = DeleteNodeRequest { id, edition_time };
        let result = self
            .queue
            .submit("delete-node", || async {
                let outcome = self.remote.delete_node(&request).await;
                let mut store = self.store.write().await;
                store.unexclude(id);
                match outcome {
                    Ok(deleted) => {
                        self.acknowledge(&mut store, &deleted.receipt.edition_times);
                        Ok(deleted)
                    }
                    Err(e) => {
                        store.restore_node(removed);
                        Err(e)
                    }
                }
            })
            .await;

        let deleted = match result {
            Ok(deleted) => deleted,
            Err(e) => {
                self.warn_user(format!("Could not delete node {}: {}", id, e));
                return Err(e.into());
            }
        };
        self.sync.discard(&NodeId::Real(id));
        self.realized().retain(|_, real| *real != id);

        if self.active.is_active(&NodeId::Real(id)) {
            let viewer = self.active.current().and_then(|a| a.viewer_id);
            let next = {
                let store = self.store.read().await;
                deleted
                    .parent_id
                    .into_iter()
                    .chain(handover)
                    .find_map(|candidate| store.get_real(candidate).map(NodeSelection::from))
            };
            match next {
                Some(selection) => {
                    self.active.activate(&selection, viewer)?;
                }
                None => {
                    self.active.deactivate();
                }
            }
        }

        self.emit(OverlayEvent::NodeDeleted {
            id,
            parent_id: deleted.parent_id,
        });
        tracing::info!("Deleted node {}", id);
        Ok(deleted)
    }

    pub async fn set_radius(&self, id: NodeId, radius: Option<f64>) -> Result<(), OverlayError> {
        validate_radius(radius)?;
        let id = self.ensure_real(id).await?;
        self.flush().await?;
        let edition_time = self.editable(id).await?;

        let request = UpdateRadiusRequest {
            id,
            radius,
            edition_time,
        };
        self.queue
            .submit("update-radius", || async {
                let receipt = self.remote.update_radius(&request).await?;
                let mut store = self.store.write().await;
                store.set_radius(&NodeId::Real(id), radius);
                self.acknowledge(&mut store, &receipt.edition_times);
                Ok::<_, OverlayError>(())
            })
            .await
    }

    /// Set the confidence of the edge from `id` to its parent
    ///
    /// With `to_connector` the links from `id` to its connectors are set
    /// instead.
    pub async fn set_confidence(
        &self,
        id: NodeId,
        confidence: Confidence,
        to_connector: bool,
    ) -> Result<(), OverlayError> {
        {
            let store = self.store.read().await;
            let node = store.get(&id).ok_or_else(|| OverlayError::node_not_found(&id))?;
            if !node.is_tree() {
                return Err(OverlayError::invalid_operation(format!(
                    "node {} is not a tree node",
                    id
                )));
            }
            if !to_connector && node.parent_id().is_none() {
                return Err(OverlayError::invalid_operation(format!(
                    "node {} has no parent edge",
                    id
                )));
            }
        }
        let id = self.ensure_real(id).await?;
        self.flush().await?;
        let edition_time = self.editable(id).await?;

        let request = UpdateConfidenceRequest {
            id,
            edition_time,
            confidence,
            to_connector,
        };
        self.queue
            .submit("update-confidence", || async {
                let receipt = self.remote.update_confidence(&request).await?;
                let mut store = self.store.write().await;
                store.set_confidence(id, confidence, to_connector);
                self.acknowledge(&mut store, &receipt.edition_times);
                Ok::<_, OverlayError>(())
            })
            .await
    }

    /// Make `parent` the parent of `child`; returns the resulting skeleton
    pub async fn relink(&self, child: NodeId, parent: NodeId) -> Result<SkeletonId, OverlayError> {
        let child = self.ensure_real(child).await?;
        let parent = self.ensure_real(parent).await?;
        if child == parent {
            return Err(ValidationError::InvalidParent("Node cannot be its own parent".to_string()).into());
        }
        self.flush().await?;
        let edition_time = self.editable(child).await?;
        let parent_edition_time = self.edition(parent).await?;

        let request = UpdateParentRequest {
            id: child,
            edition_time,
            parent_id: parent,
            parent_edition_time,
        };
        let relinked = self
            .queue
            .submit("update-parent", || async {
                let relinked = self.remote.update_parent(&request).await?;
                let mut store = self.store.write().await;
                store.set_parent(child, Some(parent));
                store.set_skeleton(child, relinked.skeleton_id);
                self.acknowledge(&mut store, &relinked.receipt.edition_times);
                Ok::<_, OverlayError>(relinked)
            })
            .await?;
        Ok(relinked.skeleton_id)
    }

    /// Create a connector linked to nothing and make it the active node
    pub async fn create_connector(
        &self,
        position: Point3,
        confidence: Confidence,
        viewer_id: Option<String>,
    ) -> Result<RealNodeId, OverlayError> {
        if !position.is_finite() {
            return Err(ValidationError::invalid_field("position", "coordinates must be finite").into());
        }
        self.flush().await?;

        let request = CreateConnectorRequest {
            position,
            confidence,
        };
        let user_id = self.config.session.user_id;
        let created = self
            .queue
            .submit("create-connector", || async {
                let created = self.remote.create_connector(&request).await?;
                let mut store = self.store.write().await;
                store.insert_records(&WindowBatch {
                    connectors: vec![ConnectorRecord {
                        id: created.id,
                        position,
                        confidence,
                        edition_time: created.edition_time.clone(),
                        user_id,
                        links: Vec::new(),
                    }],
                    ..WindowBatch::default()
                });
                self.acknowledge(&mut store, &created.receipt.edition_times);
                Ok::<_, OverlayError>(created)
            })
            .await?;

        self.activate(&NodeId::Real(created.id), viewer_id).await?;
        tracing::info!("Created connector {}", created.id);
        Ok(created.id)
    }

    /// Link a tree node to a connector under the named relation
    pub async fn create_link(
        &self,
        treenode: NodeId,
        connector_id: RealNodeId,
        relation_name: &str,
    ) -> Result<ConnectorLink, OverlayError> {
        {
            let store = self.store.read().await;
            if !store.relation_names().is_empty() && store.relation_id(relation_name).is_none() {
                return Err(OverlayError::invalid_operation(format!(
                    "unknown relation '{}'",
                    relation_name
                )));
            }
            match store.get_real(connector_id) {
                Some(node) if node.is_connector() => {}
                Some(_) => {
                    return Err(OverlayError::invalid_operation(format!(
                        "node {} is not a connector",
                        connector_id
                    )));
                }
                None => return Err(OverlayError::not_found(connector_id)),
            }
        }
        let treenode = self.ensure_real(treenode).await?;
        self.flush().await?;
        let treenode_edition_time = self.editable(treenode).await?;
        let connector_edition_time = self.edition(connector_id).await?;

        let request = CreateLinkRequest {
            treenode_id: treenode,
            treenode_edition_time,
            connector_id,
            connector_edition_time,
            relation_name: relation_name.to_string(),
            confidence: Confidence::MAX,
        };
        let created = self
            .queue
            .submit("create-link", || async {
                let created = self.remote.create_link(&request).await?;
                let mut store = self.store.write().await;
                store.add_link(connector_id, created.link.clone());
                self.acknowledge(&mut store, &created.receipt.edition_times);
                Ok::<_, OverlayError>(created)
            })
            .await?;
        Ok(created.link)
    }

    /// Cut the edge above `id`; `id` becomes the root of a new skeleton
    pub async fn split_skeleton(&self, id: NodeId) -> Result<SplitResult, OverlayError> {
        let id = self.ensure_real(id).await?;
        self.flush().await?;
        let edition_time = self.editable(id).await?;

        let request = SplitRequest { id, edition_time };
        let split = self
            .queue
            .submit("split-skeleton", || async {
                let split = self.remote.split_skeleton(&request).await?;
                let mut store = self.store.write().await;
                store.set_parent(id, None);
                store.set_skeleton(id, split.new_skeleton_id);
                self.acknowledge(&mut store, &split.receipt.edition_times);
                Ok::<_, OverlayError>(split)
            })
            .await?;
        tracing::info!("Split skeleton {} at node {}", split.existing_skeleton_id, id);
        Ok(split)
    }

    /// Attach the skeleton rooted at `to` below `from`
    pub async fn merge_skeletons(&self, from: NodeId, to: NodeId) -> Result<SkeletonId, OverlayError> {
        let from = self.ensure_real(from).await?;
        let to = self.ensure_real(to).await?;
        self.flush().await?;
        let to_edition_time = self.editable(to).await?;
        let from_edition_time = self.edition(from).await?;

        let request = JoinRequest {
            from_id: from,
            from_edition_time,
            to_id: to,
            to_edition_time,
        };
        let joined = self
            .queue
            .submit("join-skeletons", || async {
                let joined = self.remote.join_skeletons(&request).await?;
                let mut store = self.store.write().await;
                store.set_parent(to, Some(from));
                store.set_skeleton(to, joined.skeleton_id);
                self.acknowledge(&mut store, &joined.receipt.edition_times);
                Ok::<_, OverlayError>(joined)
            })
            .await?;
        tracing::info!("Merged node {} into skeleton {}", to, joined.skeleton_id);
        Ok(joined.skeleton_id)
    }

    /// Activate a node held by the store
    pub async fn activate(
        &self,
        id: &NodeId,
        viewer_id: Option<String>,
    ) -> Result<ActiveNodeChange, OverlayError> {
        let selection = {
            let store = self.store.read().await;
            let node = store.get(id).ok_or_else(|| OverlayError::node_not_found(id))?;
            NodeSelection::from(node)
        };
        Ok(self.active.activate(&selection, viewer_id)?)
    }

    /// Real id of the active node, realizing it first when virtual
    pub async fn promise_real_active_id(&self) -> Result<Option<RealNodeId>, OverlayError> {
        self.active
            .promise_real_identifier(|vn| self.realize(vn))
            .await
    }

    /// Push every pending local change
    pub async fn flush(&self) -> Result<FlushReport, OverlayError> {
        self.sync.flush(self).await
    }
}

#[async_trait]
impl SyncTarget for TracingOverlay {
    async fn realize_virtual(&self, vn: VirtualNodeId) -> Result<RealNodeId, OverlayError> {
        if let Some(id) = self.settled_realization(&vn).await {
            return Ok(id);
        }
        self.realize_now(vn).await
    }

    async fn push_positions(&self, ids: &[RealNodeId]) -> Result<(), OverlayError> {
        let moves: Vec<NodeMove> = {
            let store = self.store.read().await;
            ids.iter()
                .filter_map(|id| {
                    let node = store.get_real(*id)?;
                    Some(NodeMove {
                        id: *id,
                        position: node.position,
                        edition_time: node.edition_time.clone()?,
                    })
                })
                .collect()
        };
        if moves.is_empty() {
            return Ok(());
        }

        let result = self
            .queue
            .submit("move-nodes", || async {
                let receipt = self.remote.move_nodes(&moves).await?;
                let mut store = self.store.write().await;
                self.acknowledge(&mut store, &receipt.edition_times);
                Ok::<_, RemoteError>(())
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                if let RemoteError::Conflict { node_id, .. } = &e {
                    self.warn_user(format!(
                        "Node {} was changed by someone else; reload it before moving it again",
                        node_id
                    ));
                }
                Err(e.into())
            }
        }
    }
}

fn edition_of(node: &Node) -> Result<EditionTime, OverlayError> {
    node.edition_time.clone().ok_or_else(|| {
        OverlayError::invalid_operation(format!("node {} has no edition time", node.id))
    })
}

/// Nodes to activate after `removed` was deleted, in order of preference
fn handover_candidates(store: &GraphStore, removed: &RemovedNode) -> Vec<RealNodeId> {
    let named = |relation: RelationId, name: &str| {
        store.relation_names().get(&relation).map(String::as_str) == Some(name)
    };
    let mut candidates = Vec::new();
    match removed.node.as_connector() {
        Some(connector) => {
            for name in [PRESYNAPTIC, POSTSYNAPTIC] {
                candidates.extend(
                    connector
                        .links
                        .iter()
                        .filter(|l| named(l.relation_id, name))
                        .map(|l| l.treenode_id),
                );
            }
        }
        None => {
            for name in [POSTSYNAPTIC, PRESYNAPTIC] {
                candidates.extend(
                    removed
                        .pruned_links
                        .iter()
                        .filter(|(_, l)| named(l.relation_id, name))
                        .map(|(connector_id, _)| *connector_id),
                );
            }
        }
    }
    candidates
}

fn validate_radius(radius: Option<f64>) -> Result<(), OverlayError> {
    match radius {
        Some(r) if !r.is_finite() || r < 0.0 => Err(ValidationError::invalid_field(
            "radius",
            "must be a non-negative number",
        )
        .into()),
        _ => Ok(()),
    }
}

fn single(record: TreenodeRecord) -> WindowBatch {
    WindowBatch {
        treenodes: vec![record],
        ..WindowBatch::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryRemote;

    fn view(z: f64) -> ViewState {
        ViewState {
            center: Point3::new(50.0, 50.0, z),
            width_px: 100.0,
            height_px: 100.0,
            scale: 1.0,
            resolution: 1.0,
            section_thickness: 1.0,
        }
    }

    fn overlay(remote: &Arc<InMemoryRemote>) -> TracingOverlay {
        TracingOverlay::new(remote.clone(), OverlayConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_suspended_overlay_does_not_rebuild() {
        let remote = Arc::new(InMemoryRemote::new());
        remote.seed_treenode(1, None, Point3::new(50.0, 50.0, 0.5), None, 1);
        let overlay = overlay(&remote);

        overlay.set_suspended(true);
        let outcome = overlay.refresh(&view(0.5)).await.unwrap();
        assert!(!outcome.applied);
        assert!(overlay.store().await.is_empty());
        assert_eq!(remote.calls("nodes_in_window"), 1);

        overlay.set_suspended(false);
        let outcome = overlay.refresh(&view(0.5)).await.unwrap();
        assert!(outcome.applied);
        assert_eq!(outcome.source, FetchSource::CacheExact);
        assert_eq!(overlay.store().await.len(), 1);
    }

    #[tokio::test]
    async fn test_move_is_deferred_until_flush() {
        let remote = Arc::new(InMemoryRemote::new());
        remote.seed_treenode(1, None, Point3::new(50.0, 50.0, 0.5), None, 1);
        let overlay = overlay(&remote);
        overlay.refresh(&view(0.5)).await.unwrap();

        overlay
            .move_node(NodeId::Real(1), Point3::new(60.0, 50.0, 0.5))
            .await
            .unwrap();
        assert_eq!(remote.calls("move_nodes"), 0);
        assert!(overlay.sync_queue().is_dirty(&NodeId::Real(1)));

        let report = overlay.flush().await.unwrap();
        assert_eq!(report.moved, vec![1]);
        assert_eq!(remote.treenode(1).unwrap().position.x, 60.0);
        assert_eq!(
            overlay.node(&NodeId::Real(1)).await.unwrap().edition_time,
            Some(remote.treenode(1).unwrap().edition_time)
        );
    }

    #[tokio::test]
    async fn test_other_users_nodes_are_protected() {
        let remote = Arc::new(InMemoryRemote::new().with_user(99));
        remote.seed_treenode(1, None, Point3::new(50.0, 50.0, 0.5), None, 1);
        let overlay = overlay(&remote);
        overlay.refresh(&view(0.5)).await.unwrap();

        let err = overlay
            .move_node(NodeId::Real(1), Point3::new(0.0, 0.0, 0.5))
            .await
            .unwrap_err();
        assert!(matches!(err, OverlayError::PermissionDenied { creator_id: 99, .. }));
        let err = overlay.delete_node(NodeId::Real(1)).await.unwrap_err();
        assert!(matches!(err, OverlayError::PermissionDenied { .. }));
        assert_eq!(remote.calls("delete_node"), 0);
    }

    #[tokio::test]
    async fn test_older_generation_is_discarded() {
        let remote = Arc::new(InMemoryRemote::new());
        let overlay = overlay(&remote);
        let outcome = |id: RealNodeId| FetchOutcome {
            batch: Arc::new(single(TreenodeRecord {
                id,
                parent_id: None,
                position: Point3::new(50.0, 50.0, 0.5),
                confidence: Confidence::MAX,
                radius: None,
                skeleton_id: 1,
                user_id: 1,
                edition_time: EditionTime::new(format!("e{}", id)),
            })),
            source: FetchSource::Network,
            truncated: false,
        };

        let newer = overlay.apply_fetch(2, &view(0.5), outcome(2)).await;
        assert!(newer.applied);
        let older = overlay.apply_fetch(1, &view(0.5), outcome(1)).await;
        assert!(!older.applied);
        assert!(older.report.is_none());

        assert_eq!(overlay.stats().await.generation, 2);
        let store = overlay.store().await;
        assert!(store.get_real(2).is_some());
        assert!(store.get_real(1).is_none());
    }

    #[tokio::test]
    async fn test_virtual_nodes_cannot_be_deleted() {
        let remote = Arc::new(InMemoryRemote::new());
        let overlay = overlay(&remote);
        let vn: VirtualNodeId = "vn:5:9:1:2:3".parse().unwrap();
        let err = overlay.delete_node(NodeId::Virtual(vn)).await.unwrap_err();
        assert!(matches!(err, OverlayError::InvalidOperation(_)));
    }
}
