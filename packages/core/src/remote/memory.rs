//! In-Memory Remote Source
//!
//! A complete [`RemoteSource`] backed by plain maps. It enforces edition-time
//! checks exactly like a real service, honors the node-count ceiling, and keeps
//! a log of every request it serves so ordering can be asserted in tests.
//!
//! Edition times are minted from the wall clock plus a monotonic counter, so
//! two mutations in the same microsecond still produce distinct tokens.

use super::error::RemoteError;
use super::source::RemoteSource;
use super::wire::{
    ConnectorRecord, CreateConnectorRequest, CreateLinkRequest, CreateNodeRequest,
    CreatedConnector, CreatedLink, CreatedNode, DeleteNodeRequest, DeletedNode,
    InsertNodeRequest, JoinRequest, MutationReceipt, NodeMove, Relinked, SplitRequest,
    SplitResult, TreenodeRecord, UpdateConfidenceRequest, UpdateParentRequest,
    UpdateRadiusRequest, WindowBatch, WindowPayload, WindowRequest,
};
use crate::models::{
    Confidence, ConnectorLink, EditionTime, LevelOfDetail, Point3, RealNodeId, RelationId,
    ResponseFormat, SkeletonId, UserId,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Relations every fresh project knows about
const DEFAULT_RELATIONS: [(RelationId, &str); 4] = [
    (1, "presynaptic_to"),
    (2, "postsynaptic_to"),
    (3, "abutting"),
    (4, "gapjunction_with"),
];

/// Whether a log entry marks the start or the end of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Started,
    Finished,
}

/// One entry of the request log
#[derive(Debug, Clone, PartialEq)]
pub struct RequestLogEntry {
    pub operation: &'static str,
    pub phase: RequestPhase,
    pub detail: String,
}

#[derive(Debug, Default)]
struct RemoteState {
    treenodes: BTreeMap<RealNodeId, TreenodeRecord>,
    connectors: BTreeMap<RealNodeId, ConnectorRecord>,
    labels: BTreeMap<RealNodeId, Vec<String>>,
    relations: BTreeMap<RelationId, String>,
    next_node_id: RealNodeId,
    next_skeleton_id: SkeletonId,
    next_link_id: RealNodeId,
    edition_counter: u64,
    node_limit: Option<usize>,
    user_id: UserId,
    injected: VecDeque<RemoteError>,
    log: Vec<RequestLogEntry>,
}

impl RemoteState {
    fn mint(&mut self) -> EditionTime {
        self.edition_counter += 1;
        EditionTime::new(format!(
            "{}#{}",
            Utc::now().to_rfc3339(),
            self.edition_counter
        ))
    }

    fn allocate_node_id(&mut self) -> RealNodeId {
        let id = self.next_node_id;
        self.next_node_id += 1;
        id
    }

    fn allocate_skeleton_id(&mut self) -> SkeletonId {
        let id = self.next_skeleton_id;
        self.next_skeleton_id += 1;
        id
    }

    fn current_edition(&self, id: RealNodeId) -> Option<&EditionTime> {
        self.treenodes
            .get(&id)
            .map(|t| &t.edition_time)
            .or_else(|| self.connectors.get(&id).map(|c| &c.edition_time))
    }

    fn check_edition(&self, id: RealNodeId, expected: &EditionTime) -> Result<(), RemoteError> {
        match self.current_edition(id) {
            None => Err(RemoteError::not_found(id)),
            Some(actual) if actual != expected => Err(RemoteError::conflict(
                id,
                expected.as_str(),
                actual.as_str(),
            )),
            Some(_) => Ok(()),
        }
    }

    fn treenode(&self, id: RealNodeId) -> Result<&TreenodeRecord, RemoteError> {
        self.treenodes
            .get(&id)
            .ok_or_else(|| RemoteError::not_found(id))
    }

    fn treenode_mut(&mut self, id: RealNodeId) -> Result<&mut TreenodeRecord, RemoteError> {
        self.treenodes
            .get_mut(&id)
            .ok_or_else(|| RemoteError::not_found(id))
    }

    /// Assign a fresh edition time to `id` and record it in `receipt`
    fn bump(&mut self, id: RealNodeId, receipt: &mut MutationReceipt) {
        let edition = self.mint();
        if let Some(t) = self.treenodes.get_mut(&id) {
            t.edition_time = edition.clone();
        } else if let Some(c) = self.connectors.get_mut(&id) {
            c.edition_time = edition.clone();
        } else {
            return;
        }
        receipt.edition_times.insert(id, edition);
    }

    /// Echo the unchanged edition time of `id` in `receipt`
    fn echo(&self, id: RealNodeId, receipt: &mut MutationReceipt) {
        if let Some(edition) = self.current_edition(id) {
            receipt.edition_times.insert(id, edition.clone());
        }
    }

    fn children_of(&self, id: RealNodeId) -> Vec<RealNodeId> {
        self.treenodes
            .values()
            .filter(|t| t.parent_id == Some(id))
            .map(|t| t.id)
            .collect()
    }

    /// `root` and every node below it
    fn subtree(&self, root: RealNodeId) -> Vec<RealNodeId> {
        let mut out = vec![root];
        let mut i = 0;
        while i < out.len() {
            let next = self.children_of(out[i]);
            out.extend(next);
            i += 1;
        }
        out
    }

    /// Move the subtree rooted at `root` to `skeleton_id`, bumping every node
    fn reassign_skeleton(
        &mut self,
        root: RealNodeId,
        skeleton_id: SkeletonId,
        receipt: &mut MutationReceipt,
    ) {
        for id in self.subtree(root) {
            if let Some(t) = self.treenodes.get_mut(&id) {
                t.skeleton_id = skeleton_id;
            }
            self.bump(id, receipt);
        }
    }

    fn select_window(&self, request: &WindowRequest) -> WindowBatch {
        let bbox = request.bbox();
        let z_range = request.z_range();
        let inside = |p: &Point3| bbox.contains_xy(p.x, p.y) && z_range.contains(p.z);

        let mut treenode_ids: BTreeSet<RealNodeId> = BTreeSet::new();
        for t in self.treenodes.values() {
            if inside(&t.position) {
                treenode_ids.insert(t.id);
            }
            // Edges passing through the volume bring both endpoints along
            if let Some(parent) = t.parent_id.and_then(|p| self.treenodes.get(&p)) {
                let (a, b) = (&t.position, &parent.position);
                if bbox.overlaps_span(a.x, a.y, b.x, b.y) && z_range.overlaps_span(a.z, b.z) {
                    treenode_ids.insert(t.id);
                    treenode_ids.insert(parent.id);
                }
            }
        }

        let mut connector_ids: BTreeSet<RealNodeId> = self
            .connectors
            .values()
            .filter(|c| {
                inside(&c.position)
                    || c.links.iter().any(|l| treenode_ids.contains(&l.treenode_id))
            })
            .map(|c| c.id)
            .collect();

        let mut truncated = false;
        if let Some(limit) = self.node_limit {
            if treenode_ids.len() + connector_ids.len() > limit {
                truncated = true;
                treenode_ids = treenode_ids.into_iter().take(limit).collect();
                let room = limit.saturating_sub(treenode_ids.len());
                connector_ids = connector_ids.into_iter().take(room).collect();
            }
        }

        // Explicit inclusions are never subject to the ceiling
        treenode_ids.extend(
            request
                .treenode_ids
                .iter()
                .filter(|id| self.treenodes.contains_key(id)),
        );
        connector_ids.extend(
            request
                .connector_ids
                .iter()
                .filter(|id| self.connectors.contains_key(id)),
        );

        let labels = if request.labels {
            self.labels
                .iter()
                .filter(|(id, _)| treenode_ids.contains(id))
                .map(|(id, ls)| (*id, ls.clone()))
                .collect()
        } else {
            BTreeMap::new()
        };

        WindowBatch {
            treenodes: treenode_ids
                .iter()
                .filter_map(|id| self.treenodes.get(id).cloned())
                .collect(),
            connectors: connector_ids
                .iter()
                .filter_map(|id| self.connectors.get(id).cloned())
                .collect(),
            labels,
            truncated,
            relation_names: self.relations.clone(),
            skipped: 0,
        }
    }
}

/// Remote source living entirely in process memory
#[derive(Debug)]
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
    latency: Option<Duration>,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        let state = RemoteState {
            relations: DEFAULT_RELATIONS
                .iter()
                .map(|(id, name)| (*id, name.to_string()))
                .collect(),
            next_node_id: 1,
            next_skeleton_id: 1,
            next_link_id: 1,
            user_id: 1,
            ..RemoteState::default()
        };
        Self {
            state: Mutex::new(state),
            latency: None,
        }
    }

    /// Delay every request by `latency` between its start and its effect
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Server-side node-count ceiling for window requests
    pub fn with_node_limit(self, limit: usize) -> Self {
        self.lock().node_limit = Some(limit);
        self
    }

    /// User recorded as creator of new nodes
    pub fn with_user(self, user_id: UserId) -> Self {
        self.lock().user_id = user_id;
        self
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Id the next created node will receive
    pub fn set_next_node_id(&self, id: RealNodeId) {
        self.lock().next_node_id = id;
    }

    /// Insert or overwrite a tree node, returning its fresh edition time
    pub fn seed_treenode(
        &self,
        id: RealNodeId,
        parent_id: Option<RealNodeId>,
        position: Point3,
        radius: Option<f64>,
        skeleton_id: SkeletonId,
    ) -> EditionTime {
        let mut state = self.lock();
        let edition_time = state.mint();
        let user_id = state.user_id;
        state.treenodes.insert(
            id,
            TreenodeRecord {
                id,
                parent_id,
                position,
                confidence: Confidence::MAX,
                radius,
                skeleton_id,
                user_id,
                edition_time: edition_time.clone(),
            },
        );
        state.next_node_id = state.next_node_id.max(id + 1);
        state.next_skeleton_id = state.next_skeleton_id.max(skeleton_id + 1);
        edition_time
    }

    pub fn seed_connector(&self, id: RealNodeId, position: Point3) -> EditionTime {
        let mut state = self.lock();
        let edition_time = state.mint();
        let user_id = state.user_id;
        state.connectors.insert(
            id,
            ConnectorRecord {
                id,
                position,
                confidence: Confidence::MAX,
                edition_time: edition_time.clone(),
                user_id,
                links: Vec::new(),
            },
        );
        state.next_node_id = state.next_node_id.max(id + 1);
        edition_time
    }

    /// Link an existing connector to an existing tree node
    pub fn seed_link(
        &self,
        connector_id: RealNodeId,
        treenode_id: RealNodeId,
        relation_id: RelationId,
    ) -> Result<(), RemoteError> {
        let mut state = self.lock();
        let link_id = state.next_link_id;
        state.next_link_id += 1;
        let edition_time = state.mint();
        let connector = state
            .connectors
            .get_mut(&connector_id)
            .ok_or_else(|| RemoteError::not_found(connector_id))?;
        connector.links.push(ConnectorLink {
            treenode_id,
            relation_id,
            confidence: Confidence::MAX,
            edition_time,
            link_id,
        });
        Ok(())
    }

    pub fn seed_label(&self, id: RealNodeId, label: impl Into<String>) {
        self.lock().labels.entry(id).or_default().push(label.into());
    }

    /// Simulate a concurrent edit by another client
    pub fn touch(&self, id: RealNodeId) -> Option<EditionTime> {
        let mut state = self.lock();
        let mut receipt = MutationReceipt::default();
        state.bump(id, &mut receipt);
        receipt.edition_times.remove(&id)
    }

    /// Make the next request fail with `error`
    pub fn fail_next(&self, error: RemoteError) {
        self.lock().injected.push_back(error);
    }

    pub fn treenode(&self, id: RealNodeId) -> Option<TreenodeRecord> {
        self.lock().treenodes.get(&id).cloned()
    }

    pub fn connector(&self, id: RealNodeId) -> Option<ConnectorRecord> {
        self.lock().connectors.get(&id).cloned()
    }

    pub fn node_count(&self) -> usize {
        let state = self.lock();
        state.treenodes.len() + state.connectors.len()
    }

    pub fn request_log(&self) -> Vec<RequestLogEntry> {
        self.lock().log.clone()
    }

    pub fn clear_request_log(&self) {
        self.lock().log.clear();
    }

    /// Number of finished requests of the given operation
    pub fn calls(&self, operation: &str) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|e| e.operation == operation && e.phase == RequestPhase::Finished)
            .count()
    }

    fn record(&self, operation: &'static str, phase: RequestPhase, detail: &str) {
        self.lock().log.push(RequestLogEntry {
            operation,
            phase,
            detail: detail.to_string(),
        });
    }

    async fn serve<T, F>(
        &self,
        operation: &'static str,
        detail: String,
        handler: F,
    ) -> Result<T, RemoteError>
    where
        F: FnOnce(&mut RemoteState) -> Result<T, RemoteError> + Send,
        T: Send,
    {
        self.record(operation, RequestPhase::Started, &detail);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let result = {
            let mut state = self.lock();
            match state.injected.pop_front() {
                Some(error) => Err(error),
                None => handler(&mut state),
            }
        };
        if let Err(e) = &result {
            tracing::debug!("In-memory remote rejected {} ({}): {}", operation, detail, e);
        }
        self.record(operation, RequestPhase::Finished, &detail);
        result
    }
}

#[async_trait]
impl RemoteSource for InMemoryRemote {
    async fn nodes_in_window(
        &self,
        request: &WindowRequest,
    ) -> Result<WindowPayload, RemoteError> {
        let detail = format!(
            "[{}, {}, {}]-[{}, {}, {}]",
            request.left, request.top, request.z1, request.right, request.bottom, request.z2
        );
        self.serve("nodes_in_window", detail, |state| {
            if request.format == ResponseFormat::Raster {
                return Err(RemoteError::invalid_request(
                    "raster responses are not served by this source",
                ));
            }
            // LOD is accepted but advisory; only its shape is checked
            match request.level_of_detail() {
                Some(LevelOfDetail::Percent(p)) if !(0.0..=1.0).contains(&p) => {
                    return Err(RemoteError::invalid_request(format!(
                        "percent LOD {} outside [0, 1]",
                        p
                    )));
                }
                None => {
                    return Err(RemoteError::invalid_request(format!(
                        "unknown lod_type '{}'",
                        request.lod_type
                    )));
                }
                Some(_) => {}
            }
            state.select_window(request).encode(request.format)
        })
        .await
    }

    async fn get_node(&self, id: RealNodeId) -> Result<TreenodeRecord, RemoteError> {
        self.serve("get_node", id.to_string(), |state| {
            state.treenode(id).cloned()
        })
        .await
    }

    async fn move_nodes(&self, moves: &[NodeMove]) -> Result<MutationReceipt, RemoteError> {
        let detail = moves
            .iter()
            .map(|m| m.id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.serve("move_nodes", detail, |state| {
            for m in moves {
                state.check_edition(m.id, &m.edition_time)?;
            }
            let mut receipt = MutationReceipt::default();
            for m in moves {
                if let Some(t) = state.treenodes.get_mut(&m.id) {
                    t.position = m.position;
                } else if let Some(c) = state.connectors.get_mut(&m.id) {
                    c.position = m.position;
                }
                state.bump(m.id, &mut receipt);
            }
            Ok(receipt)
        })
        .await
    }

    async fn create_node(&self, request: &CreateNodeRequest) -> Result<CreatedNode, RemoteError> {
        let detail = format!("parent={:?}", request.parent_id);
        self.serve("create_node", detail, |state| {
            let mut receipt = MutationReceipt::default();
            let skeleton_id = match request.parent_id {
                Some(parent_id) => {
                    if let Some(expected) = &request.parent_edition_time {
                        state.check_edition(parent_id, expected)?;
                    }
                    let skeleton_id = state.treenode(parent_id)?.skeleton_id;
                    state.echo(parent_id, &mut receipt);
                    skeleton_id
                }
                None => state.allocate_skeleton_id(),
            };

            let id = state.allocate_node_id();
            let edition_time = state.mint();
            let user_id = state.user_id;
            state.treenodes.insert(
                id,
                TreenodeRecord {
                    id,
                    parent_id: request.parent_id,
                    position: request.position,
                    confidence: request.confidence,
                    radius: request.radius,
                    skeleton_id,
                    user_id,
                    edition_time: edition_time.clone(),
                },
            );
            receipt.edition_times.insert(id, edition_time.clone());
            Ok(CreatedNode {
                id,
                edition_time,
                skeleton_id,
                receipt,
            })
        })
        .await
    }

    async fn insert_node(&self, request: &InsertNodeRequest) -> Result<CreatedNode, RemoteError> {
        let detail = format!("{}->{}", request.child_id, request.parent_id);
        self.serve("insert_node", detail, |state| {
            state.check_edition(request.child_id, &request.child_edition_time)?;
            state.check_edition(request.parent_id, &request.parent_edition_time)?;
            let child = state.treenode(request.child_id)?;
            if child.parent_id != Some(request.parent_id) {
                return Err(RemoteError::invalid_request(format!(
                    "node {} is not a child of {}",
                    request.child_id, request.parent_id
                )));
            }
            let skeleton_id = child.skeleton_id;

            let id = state.allocate_node_id();
            let edition_time = state.mint();
            let user_id = state.user_id;
            state.treenodes.insert(
                id,
                TreenodeRecord {
                    id,
                    parent_id: Some(request.parent_id),
                    position: request.position,
                    confidence: request.confidence,
                    radius: request.radius,
                    skeleton_id,
                    user_id,
                    edition_time: edition_time.clone(),
                },
            );
            state.treenode_mut(request.child_id)?.parent_id = Some(id);

            let mut receipt = MutationReceipt::default().with(id, edition_time.clone());
            state.bump(request.child_id, &mut receipt);
            state.echo(request.parent_id, &mut receipt);
            Ok(CreatedNode {
                id,
                edition_time,
                skeleton_id,
                receipt,
            })
        })
        .await
    }

    async fn delete_node(&self, request: &DeleteNodeRequest) -> Result<DeletedNode, RemoteError> {
        self.serve("delete_node", request.id.to_string(), |state| {
            state.check_edition(request.id, &request.edition_time)?;

            if state.connectors.remove(&request.id).is_some() {
                return Ok(DeletedNode {
                    id: request.id,
                    parent_id: None,
                    deleted_skeleton: false,
                    receipt: MutationReceipt::default(),
                });
            }

            let node = state.treenode(request.id)?.clone();
            let children = state.children_of(request.id);
            if node.parent_id.is_none() && children.len() > 1 {
                return Err(RemoteError::invalid_request(format!(
                    "root {} has {} children; split before deleting",
                    request.id,
                    children.len()
                )));
            }

            state.treenodes.remove(&request.id);
            state.labels.remove(&request.id);
            let mut receipt = MutationReceipt::default();
            for child in children {
                state.treenode_mut(child)?.parent_id = node.parent_id;
                state.bump(child, &mut receipt);
            }
            let pruned: Vec<RealNodeId> = state
                .connectors
                .values_mut()
                .filter_map(|c| {
                    let before = c.links.len();
                    c.links.retain(|l| l.treenode_id != request.id);
                    (c.links.len() != before).then_some(c.id)
                })
                .collect();
            for connector_id in pruned {
                state.bump(connector_id, &mut receipt);
            }

            let deleted_skeleton = !state
                .treenodes
                .values()
                .any(|t| t.skeleton_id == node.skeleton_id);
            Ok(DeletedNode {
                id: request.id,
                parent_id: node.parent_id,
                deleted_skeleton,
                receipt,
            })
        })
        .await
    }

    async fn update_radius(
        &self,
        request: &UpdateRadiusRequest,
    ) -> Result<MutationReceipt, RemoteError> {
        self.serve("update_radius", request.id.to_string(), |state| {
            state.check_edition(request.id, &request.edition_time)?;
            state.treenode_mut(request.id)?.radius = request.radius;
            let mut receipt = MutationReceipt::default();
            state.bump(request.id, &mut receipt);
            Ok(receipt)
        })
        .await
    }

    async fn update_parent(
        &self,
        request: &UpdateParentRequest,
    ) -> Result<Relinked, RemoteError> {
        let detail = format!("{}->{}", request.id, request.parent_id);
        self.serve("update_parent", detail, |state| {
            state.check_edition(request.id, &request.edition_time)?;
            state.check_edition(request.parent_id, &request.parent_edition_time)?;
            if state.subtree(request.id).contains(&request.parent_id) {
                return Err(RemoteError::invalid_request(format!(
                    "node {} is below {}; relinking would create a cycle",
                    request.parent_id, request.id
                )));
            }
            let skeleton_id = state.treenode(request.parent_id)?.skeleton_id;
            state.treenode_mut(request.id)?.parent_id = Some(request.parent_id);

            let mut receipt = MutationReceipt::default();
            state.reassign_skeleton(request.id, skeleton_id, &mut receipt);
            state.echo(request.parent_id, &mut receipt);
            Ok(Relinked {
                skeleton_id,
                receipt,
            })
        })
        .await
    }

    async fn update_confidence(
        &self,
        request: &UpdateConfidenceRequest,
    ) -> Result<MutationReceipt, RemoteError> {
        let detail = format!(
            "{}={}{}",
            request.id,
            request.confidence.value(),
            if request.to_connector { " (connectors)" } else { "" }
        );
        self.serve("update_confidence", detail, |state| {
            state.check_edition(request.id, &request.edition_time)?;
            let mut receipt = MutationReceipt::default();
            if request.to_connector {
                let linked: Vec<RealNodeId> = state
                    .connectors
                    .values_mut()
                    .filter_map(|c| {
                        let mut hit = false;
                        for link in c.links.iter_mut().filter(|l| l.treenode_id == request.id) {
                            link.confidence = request.confidence;
                            hit = true;
                        }
                        hit.then_some(c.id)
                    })
                    .collect();
                if linked.is_empty() {
                    return Err(RemoteError::invalid_request(format!(
                        "node {} is not linked to any connector",
                        request.id
                    )));
                }
                for connector_id in linked {
                    state.bump(connector_id, &mut receipt);
                }
                state.echo(request.id, &mut receipt);
            } else {
                let node = state.treenode_mut(request.id)?;
                if node.parent_id.is_none() {
                    return Err(RemoteError::invalid_request(format!(
                        "root {} has no parent edge",
                        request.id
                    )));
                }
                node.confidence = request.confidence;
                state.bump(request.id, &mut receipt);
            }
            Ok(receipt)
        })
        .await
    }

    async fn create_connector(
        &self,
        request: &CreateConnectorRequest,
    ) -> Result<CreatedConnector, RemoteError> {
        let detail = format!(
            "[{}, {}, {}]",
            request.position.x, request.position.y, request.position.z
        );
        self.serve("create_connector", detail, |state| {
            let id = state.allocate_node_id();
            let edition_time = state.mint();
            let user_id = state.user_id;
            state.connectors.insert(
                id,
                ConnectorRecord {
                    id,
                    position: request.position,
                    confidence: request.confidence,
                    edition_time: edition_time.clone(),
                    user_id,
                    links: Vec::new(),
                },
            );
            Ok(CreatedConnector {
                id,
                receipt: MutationReceipt::default().with(id, edition_time.clone()),
                edition_time,
            })
        })
        .await
    }

    async fn create_link(&self, request: &CreateLinkRequest) -> Result<CreatedLink, RemoteError> {
        let detail = format!(
            "{} {} {}",
            request.connector_id, request.relation_name, request.treenode_id
        );
        self.serve("create_link", detail, |state| {
            state.check_edition(request.treenode_id, &request.treenode_edition_time)?;
            state.check_edition(request.connector_id, &request.connector_edition_time)?;
            state.treenode(request.treenode_id)?;
            let relation_id = state
                .relations
                .iter()
                .find(|(_, name)| **name == request.relation_name)
                .map(|(id, _)| *id)
                .ok_or_else(|| {
                    RemoteError::invalid_request(format!(
                        "unknown relation '{}'",
                        request.relation_name
                    ))
                })?;

            let link_id = state.next_link_id;
            state.next_link_id += 1;
            let link = ConnectorLink {
                treenode_id: request.treenode_id,
                relation_id,
                confidence: request.confidence,
                edition_time: state.mint(),
                link_id,
            };
            state
                .connectors
                .get_mut(&request.connector_id)
                .ok_or_else(|| RemoteError::not_found(request.connector_id))?
                .links
                .push(link.clone());

            let mut receipt = MutationReceipt::default();
            state.bump(request.connector_id, &mut receipt);
            state.echo(request.treenode_id, &mut receipt);
            Ok(CreatedLink { link, receipt })
        })
        .await
    }

    async fn split_skeleton(&self, request: &SplitRequest) -> Result<SplitResult, RemoteError> {
        self.serve("split_skeleton", request.id.to_string(), |state| {
            state.check_edition(request.id, &request.edition_time)?;
            let node = state.treenode(request.id)?;
            if node.parent_id.is_none() {
                return Err(RemoteError::invalid_request(format!(
                    "node {} is already a root",
                    request.id
                )));
            }
            let existing_skeleton_id = node.skeleton_id;
            let new_skeleton_id = state.allocate_skeleton_id();
            state.treenode_mut(request.id)?.parent_id = None;

            let mut receipt = MutationReceipt::default();
            state.reassign_skeleton(request.id, new_skeleton_id, &mut receipt);
            Ok(SplitResult {
                existing_skeleton_id,
                new_skeleton_id,
                receipt,
            })
        })
        .await
    }

    async fn join_skeletons(&self, request: &JoinRequest) -> Result<Relinked, RemoteError> {
        let detail = format!("{}<-{}", request.from_id, request.to_id);
        self.serve("join_skeletons", detail, |state| {
            state.check_edition(request.from_id, &request.from_edition_time)?;
            state.check_edition(request.to_id, &request.to_edition_time)?;
            let from = state.treenode(request.from_id)?;
            let to = state.treenode(request.to_id)?;
            if to.parent_id.is_some() {
                return Err(RemoteError::invalid_request(format!(
                    "join target {} is not a root",
                    request.to_id
                )));
            }
            if from.skeleton_id == to.skeleton_id {
                return Err(RemoteError::invalid_request(
                    "both nodes belong to the same skeleton",
                ));
            }
            let skeleton_id = from.skeleton_id;
            state.treenode_mut(request.to_id)?.parent_id = Some(request.from_id);

            let mut receipt = MutationReceipt::default();
            state.reassign_skeleton(request.to_id, skeleton_id, &mut receipt);
            state.echo(request.from_id, &mut receipt);
            Ok(Relinked {
                skeleton_id,
                receipt,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BoundingBox, WindowQuery, ZRange};
    use crate::remote::normalize_payload;

    fn window(left: f64, right: f64, z1: f64, z2: f64) -> WindowRequest {
        let query = WindowQuery::new(
            BoundingBox::new(left, 0.0, right, 100.0),
            ZRange::new(z1, z2),
            LevelOfDetail::Absolute(1),
        )
        .with_labels(true);
        WindowRequest::from_query(&query, ResponseFormat::Json)
    }

    #[tokio::test]
    async fn test_window_includes_edges_crossing_the_volume() {
        let remote = InMemoryRemote::new();
        remote.seed_treenode(1, None, Point3::new(10.0, 10.0, 0.0), None, 1);
        remote.seed_treenode(2, Some(1), Point3::new(10.0, 10.0, 4.0), None, 1);
        remote.seed_treenode(3, None, Point3::new(500.0, 10.0, 2.0), None, 2);

        let payload = remote.nodes_in_window(&window(0.0, 100.0, 1.5, 2.5)).await.unwrap();
        let batch = normalize_payload(&payload).unwrap();
        let ids: Vec<_> = batch.treenodes.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(batch.relation_names.get(&1).map(String::as_str), Some("presynaptic_to"));
    }

    #[tokio::test]
    async fn test_node_limit_truncates_but_keeps_extras() {
        let remote = InMemoryRemote::new().with_node_limit(2);
        for id in 1..=4 {
            remote.seed_treenode(id, None, Point3::new(1.0, 1.0, 0.0), None, id);
        }
        remote.seed_treenode(9, None, Point3::new(900.0, 1.0, 0.0), None, 9);

        let mut request = window(0.0, 100.0, 0.0, 1.0);
        request.treenode_ids = vec![9];
        let batch = normalize_payload(&remote.nodes_in_window(&request).await.unwrap()).unwrap();
        assert!(batch.truncated);
        let ids: Vec<_> = batch.treenodes.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 2, 9]);
    }

    #[tokio::test]
    async fn test_stale_edition_conflicts() {
        let remote = InMemoryRemote::new();
        let stale = remote.seed_treenode(1, None, Point3::default(), None, 1);
        remote.touch(1);

        let err = remote
            .update_radius(&UpdateRadiusRequest {
                id: 1,
                radius: Some(2.0),
                edition_time: stale,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Conflict { node_id: 1, .. }));
        assert_eq!(remote.treenode(1).unwrap().radius, None);
    }

    #[tokio::test]
    async fn test_insert_node_rewrites_child_and_echoes_neighbors() {
        let remote = InMemoryRemote::new();
        let parent_edition = remote.seed_treenode(9, None, Point3::new(0.0, 0.0, 4.0), None, 1);
        let child_edition = remote.seed_treenode(5, Some(9), Point3::new(2.0, 4.0, 2.0), None, 1);
        remote.set_next_node_id(42);

        let created = remote
            .insert_node(&InsertNodeRequest {
                child_id: 5,
                child_edition_time: child_edition.clone(),
                parent_id: 9,
                parent_edition_time: parent_edition.clone(),
                position: Point3::new(1.0, 2.0, 3.0),
                radius: None,
                confidence: Confidence::MAX,
            })
            .await
            .unwrap();

        assert_eq!(created.id, 42);
        assert_eq!(remote.treenode(5).unwrap().parent_id, Some(42));
        assert_eq!(remote.treenode(42).unwrap().parent_id, Some(9));
        assert_ne!(created.receipt.get(5), Some(&child_edition));
        assert_eq!(created.receipt.get(9), Some(&parent_edition));
    }

    #[tokio::test]
    async fn test_delete_root_promotes_single_child() {
        let remote = InMemoryRemote::new();
        let root = remote.seed_treenode(1, None, Point3::default(), None, 1);
        remote.seed_treenode(2, Some(1), Point3::default(), None, 1);

        let deleted = remote
            .delete_node(&DeleteNodeRequest {
                id: 1,
                edition_time: root,
            })
            .await
            .unwrap();
        assert_eq!(deleted.parent_id, None);
        assert!(!deleted.deleted_skeleton);
        assert!(deleted.receipt.get(2).is_some());
        assert_eq!(remote.treenode(2).unwrap().parent_id, None);
    }

    #[tokio::test]
    async fn test_join_requires_root_target() {
        let remote = InMemoryRemote::new();
        let a = remote.seed_treenode(1, None, Point3::default(), None, 1);
        remote.seed_treenode(2, None, Point3::default(), None, 2);
        let c = remote.seed_treenode(3, Some(2), Point3::default(), None, 2);

        let err = remote
            .join_skeletons(&JoinRequest {
                from_id: 1,
                from_edition_time: a,
                to_id: 3,
                to_edition_time: c,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_connector_confidence_updates_every_link() {
        let remote = InMemoryRemote::new();
        remote.seed_treenode(1, None, Point3::default(), None, 1);
        let node = remote.seed_treenode(2, Some(1), Point3::default(), None, 1);
        let created = remote
            .create_connector(&CreateConnectorRequest {
                position: Point3::new(1.0, 1.0, 0.0),
                confidence: Confidence::MAX,
            })
            .await
            .unwrap();
        remote.seed_link(created.id, 2, 1).unwrap();

        let receipt = remote
            .update_confidence(&UpdateConfidenceRequest {
                id: 2,
                edition_time: node.clone(),
                confidence: Confidence::new(1).unwrap(),
                to_connector: true,
            })
            .await
            .unwrap();
        let connector = remote.connector(created.id).unwrap();
        assert_eq!(connector.links[0].confidence.value(), 1);
        assert_ne!(receipt.get(created.id), Some(&created.edition_time));
        assert_eq!(receipt.get(2), Some(&node));
        assert_eq!(remote.treenode(2).unwrap().confidence, Confidence::MAX);
    }

    #[tokio::test]
    async fn test_root_has_no_edge_confidence() {
        let remote = InMemoryRemote::new();
        let root = remote.seed_treenode(1, None, Point3::default(), None, 1);
        let err = remote
            .update_confidence(&UpdateConfidenceRequest {
                id: 1,
                edition_time: root,
                confidence: Confidence::new(2).unwrap(),
                to_connector: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_injected_failure_is_logged() {
        let remote = InMemoryRemote::new();
        remote.seed_treenode(1, None, Point3::default(), None, 1);
        remote.fail_next(RemoteError::transport("connection reset"));

        assert!(remote.get_node(1).await.is_err());
        assert!(remote.get_node(1).await.is_ok());
        assert_eq!(remote.calls("get_node"), 2);
    }
}
