//! Graph Store
//!
//! Section-scoped cache of the nodes inside the current window. Every tree
//! edge whose endpoints lie strictly on opposite sides of the cutting plane is
//! split by a virtual node placed where the edge crosses the plane:
//!
//! ```text
//!   child (z=2) ── parent (z=0)        section z=1
//!
//!   child ──► vn:child:parent:x:y:1 ──► parent
//! ```
//!
//! The child's `parent_id` then names the virtual node, the virtual node's
//! `parent_id` names the real parent, and the parent lists the virtual node
//! among its children. All edge bookkeeping goes through [`GraphStore::link_edge`],
//! which keeps the three views consistent.
//!
//! A child whose parent is neither in the batch nor already in the store keeps
//! its real parent reference and is recorded as *unresolved*; it renders as a
//! root until the ancestor is point-fetched and spliced in.

use super::intersect::{crosses, intersect_with_radius, CuttingPlane};
use super::pool::NodePool;
use crate::models::{
    Confidence, ConnectorLink, EditionTime, Node, NodeId, NodeKind, Point3, RealNodeId,
    RelationId, SkeletonId, UserId, VirtualNodeId,
};
use crate::remote::{ConnectorRecord, TreenodeRecord, WindowBatch};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

/// Counters describing one link pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkReport {
    pub tree_nodes: usize,
    pub connectors: usize,
    pub virtual_nodes: usize,
    /// Tree nodes whose parent is outside the store after the pass
    pub unresolved: usize,
    /// Records ignored because their node is pending deletion
    pub skipped_excluded: usize,
    pub skipped_invalid: usize,
    pub reused_from_pool: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub tree_nodes: usize,
    pub virtual_nodes: usize,
    pub connectors: usize,
    pub unresolved: usize,
    pub pending_deletions: usize,
    pub pooled: usize,
}

/// Snapshot of a node taken out of the store, enough to put it back
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedNode {
    pub node: Node,
    /// Real parent at removal time (tree nodes only)
    pub parent: Option<RealNodeId>,
    /// Real children re-parented by the removal
    pub children: Vec<RealNodeId>,
    pub labels: Vec<String>,
    /// Links pruned from connectors, as `(connector_id, link)`
    pub pruned_links: Vec<(RealNodeId, ConnectorLink)>,
}

#[derive(Debug)]
pub struct GraphStore {
    plane: CuttingPlane,
    nodes: HashMap<NodeId, Node>,
    labels: HashMap<NodeId, Vec<String>>,
    relation_names: BTreeMap<RelationId, String>,
    unresolved: BTreeSet<RealNodeId>,
    excluded: BTreeSet<RealNodeId>,
    pool: NodePool,
}

impl GraphStore {
    pub fn new(plane: CuttingPlane, pool_limit: usize) -> Self {
        Self {
            plane,
            nodes: HashMap::new(),
            labels: HashMap::new(),
            relation_names: BTreeMap::new(),
            unresolved: BTreeSet::new(),
            excluded: BTreeSet::new(),
            pool: NodePool::new(pool_limit),
        }
    }

    pub fn plane(&self) -> CuttingPlane {
        self.plane
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn get_real(&self, id: RealNodeId) -> Option<&Node> {
        self.nodes.get(&NodeId::Real(id))
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn children_of(&self, id: &NodeId) -> &[NodeId] {
        self.nodes.get(id).map(Node::children).unwrap_or(&[])
    }

    pub fn parent_of(&self, id: &NodeId) -> Option<&NodeId> {
        self.nodes.get(id).and_then(Node::parent_id)
    }

    /// Real parent of a real node, looking through a virtual intermediate
    pub fn real_parent(&self, id: RealNodeId) -> Option<RealNodeId> {
        match self.get_real(id)?.parent_id()? {
            NodeId::Real(p) => Some(*p),
            NodeId::Virtual(vn) => Some(vn.parent()),
        }
    }

    /// Real children of a node, looking through virtual intermediates
    pub fn real_children(&self, id: RealNodeId) -> Vec<RealNodeId> {
        self.children_of(&NodeId::Real(id))
            .iter()
            .map(|c| match c {
                NodeId::Real(c) => *c,
                NodeId::Virtual(vn) => vn.child(),
            })
            .collect()
    }

    /// Virtual nodes on the parent edge and child edges of `id`
    pub fn adjacent_virtuals(&self, id: RealNodeId) -> Vec<VirtualNodeId> {
        let key = NodeId::Real(id);
        self.parent_of(&key)
            .into_iter()
            .chain(self.children_of(&key))
            .filter_map(|n| n.as_virtual().copied())
            .collect()
    }

    pub fn virtual_nodes(&self) -> Vec<&Node> {
        let mut out: Vec<&Node> = self.nodes.values().filter(|n| n.is_virtual()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Nodes whose parent is not loaded
    pub fn unresolved_parents(&self) -> &BTreeSet<RealNodeId> {
        &self.unresolved
    }

    pub fn labels_of(&self, id: &NodeId) -> &[String] {
        self.labels.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn relation_names(&self) -> &BTreeMap<RelationId, String> {
        &self.relation_names
    }

    pub fn relation_id(&self, name: &str) -> Option<RelationId> {
        self.relation_names
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(id, _)| *id)
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats {
            unresolved: self.unresolved.len(),
            pending_deletions: self.excluded.len(),
            pooled: self.pool.len(),
            ..StoreStats::default()
        };
        for node in self.nodes.values() {
            match (&node.kind, node.is_virtual()) {
                (NodeKind::Connector(_), _) => stats.connectors += 1,
                (NodeKind::Tree(_), true) => stats.virtual_nodes += 1,
                (NodeKind::Tree(_), false) => stats.tree_nodes += 1,
            }
        }
        stats
    }

    /// Keep `id` out of every later link pass until [`unexclude`](Self::unexclude)
    pub fn exclude(&mut self, id: RealNodeId) {
        self.excluded.insert(id);
    }

    pub fn unexclude(&mut self, id: RealNodeId) {
        self.excluded.remove(&id);
    }

    pub fn is_excluded(&self, id: RealNodeId) -> bool {
        self.excluded.contains(&id)
    }

    /// Replace the whole content with `batch` seen from `plane`
    ///
    /// Evicted nodes are released into the pool. Pending deletions survive.
    pub fn rebuild(&mut self, plane: CuttingPlane, batch: &WindowBatch) -> LinkReport {
        for (_, node) in self.nodes.drain() {
            self.pool.release(node);
        }
        self.labels.clear();
        self.unresolved.clear();
        self.plane = plane;
        self.insert_records(batch)
    }

    /// Splice `batch` into the current content
    ///
    /// Records for nodes already present replace them in place; existing edges
    /// touching those nodes are re-linked against the new positions.
    pub fn insert_records(&mut self, batch: &WindowBatch) -> LinkReport {
        let mut report = LinkReport::default();
        for (id, name) in &batch.relation_names {
            self.relation_names.insert(*id, name.clone());
        }

        let mut touched: Vec<&TreenodeRecord> = Vec::with_capacity(batch.treenodes.len());
        let mut existing_children: Vec<(RealNodeId, RealNodeId)> = Vec::new();
        for record in &batch.treenodes {
            if self.excluded.contains(&record.id) {
                report.skipped_excluded += 1;
                continue;
            }
            if !record.position.is_finite() || record.parent_id == Some(record.id) {
                tracing::warn!("Skipping invalid treenode record {}", record.id);
                report.skipped_invalid += 1;
                continue;
            }
            if self.upsert_treenode(record) {
                existing_children
                    .extend(self.real_children(record.id).into_iter().map(|c| (c, record.id)));
            }
            touched.push(record);
        }

        for record in &batch.connectors {
            if self.excluded.contains(&record.id) {
                report.skipped_excluded += 1;
                continue;
            }
            if !record.position.is_finite() {
                tracing::warn!("Skipping invalid connector record {}", record.id);
                report.skipped_invalid += 1;
                continue;
            }
            self.upsert_connector(record);
            report.connectors += 1;
        }

        let touched_ids: HashSet<RealNodeId> = touched.iter().map(|r| r.id).collect();
        for record in &touched {
            if self.link_edge(record.id, record.parent_id) {
                report.virtual_nodes += 1;
            }
        }
        for (child, parent) in existing_children {
            if !touched_ids.contains(&child) && self.link_edge(child, Some(parent)) {
                report.virtual_nodes += 1;
            }
        }

        // Children loaded earlier whose parent just arrived
        let waiting: Vec<(RealNodeId, RealNodeId)> = self
            .unresolved
            .iter()
            .filter_map(|child| match self.parent_of(&NodeId::Real(*child)) {
                Some(NodeId::Real(p)) if touched_ids.contains(p) => Some((*child, *p)),
                _ => None,
            })
            .collect();
        for (child, parent) in waiting {
            if self.link_edge(child, Some(parent)) {
                report.virtual_nodes += 1;
            }
        }

        for (id, names) in &batch.labels {
            let key = NodeId::Real(*id);
            if self.nodes.contains_key(&key) {
                self.labels.insert(key, names.clone());
            }
        }

        report.tree_nodes = touched.len();
        report.unresolved = self.unresolved.len();
        report.reused_from_pool = self.pool.take_reused();
        tracing::debug!(
            "Linked {} tree nodes, {} connectors, {} virtual nodes ({} unresolved, {} reused)",
            report.tree_nodes,
            report.connectors,
            report.virtual_nodes,
            report.unresolved,
            report.reused_from_pool
        );
        report
    }

    /// Returns whether the node already existed
    fn upsert_treenode(&mut self, record: &TreenodeRecord) -> bool {
        let zdiff = self.plane.zdiff(&record.position);
        let key = NodeId::Real(record.id);
        if let Some(node) = self.nodes.get_mut(&key) {
            if let NodeKind::Tree(tree) = &mut node.kind {
                node.position = record.position;
                node.zdiff = zdiff;
                node.creator_id = Some(record.user_id);
                node.edition_time = Some(record.edition_time.clone());
                tree.radius = record.radius;
                tree.confidence = record.confidence;
                tree.skeleton_id = record.skeleton_id;
                return true;
            }
            // A connector under the same id is replaced outright
            self.nodes.remove(&key);
        }

        let mut node = self.pool.acquire_tree(
            key,
            record.position,
            None,
            record.radius,
            record.confidence,
            record.skeleton_id,
        );
        node.zdiff = zdiff;
        node.creator_id = Some(record.user_id);
        node.edition_time = Some(record.edition_time.clone());
        self.nodes.insert(key, node);
        false
    }

    fn upsert_connector(&mut self, record: &ConnectorRecord) {
        let key = NodeId::Real(record.id);
        if let Some(old) = self.nodes.get(&key) {
            if old.is_tree() {
                tracing::warn!("Connector {} replaces a tree node with the same id", record.id);
                self.remove_node(record.id);
            }
        }
        let mut node =
            self.pool
                .acquire_connector(key, record.position, record.confidence, &record.links);
        node.zdiff = self.plane.zdiff(&record.position);
        node.creator_id = Some(record.user_id);
        node.edition_time = Some(record.edition_time.clone());
        if let Some(old) = self.nodes.insert(key, node) {
            self.pool.release(old);
        }
    }

    /// Remove `child`'s edge to its parent, including a virtual intermediate
    fn detach_parent(&mut self, child: RealNodeId) {
        let child_key = NodeId::Real(child);
        let Some(parent) = self
            .nodes
            .get_mut(&child_key)
            .and_then(Node::as_tree_mut)
            .and_then(|t| t.parent_id.take())
        else {
            self.unresolved.remove(&child);
            return;
        };
        self.unresolved.remove(&child);

        match parent {
            NodeId::Real(p) => {
                if let Some(parent) = self.nodes.get_mut(&NodeId::Real(p)) {
                    parent.remove_child(&child_key);
                }
            }
            NodeId::Virtual(vn) => {
                let vn_key = NodeId::Virtual(vn);
                if let Some(node) = self.nodes.remove(&vn_key) {
                    self.pool.release(node);
                }
                self.labels.remove(&vn_key);
                if let Some(parent) = self.nodes.get_mut(&NodeId::Real(vn.parent())) {
                    parent.remove_child(&vn_key);
                }
            }
        }
    }

    /// Point `child` at `parent`, splicing a virtual node when the edge
    /// crosses the plane. Returns whether a virtual node was created.
    fn link_edge(&mut self, child: RealNodeId, parent: Option<RealNodeId>) -> bool {
        self.detach_parent(child);
        let child_key = NodeId::Real(child);
        let Some(parent) = parent else {
            return false;
        };

        let (child_pos, child_radius, child_zdiff, confidence, skeleton_id) =
            match self.nodes.get(&child_key) {
                Some(node) => match &node.kind {
                    NodeKind::Tree(t) => (
                        node.position,
                        t.radius,
                        node.zdiff,
                        t.confidence,
                        t.skeleton_id,
                    ),
                    NodeKind::Connector(_) => return false,
                },
                None => return false,
            };

        let parent_key = NodeId::Real(parent);
        let parent_geometry = self
            .nodes
            .get(&parent_key)
            .and_then(|n| n.as_tree().map(|t| (n.position, t.radius, n.zdiff)));
        let Some((parent_pos, parent_radius, parent_zdiff)) = parent_geometry else {
            self.set_parent_field(child, Some(parent_key));
            self.unresolved.insert(child);
            return false;
        };

        let crossing = if crosses(child_zdiff, parent_zdiff) {
            intersect_with_radius(
                (&child_pos, child_radius),
                (&parent_pos, parent_radius),
                self.plane,
            )
        } else {
            None
        };

        match crossing {
            Some(hit) => {
                let vn = VirtualNodeId::new(child, parent, hit.position);
                let vn_key = NodeId::Virtual(vn);
                let mut position = vn.position();
                position.z = self.plane.z;
                let mut node = self.pool.acquire_tree(
                    vn_key,
                    position,
                    Some(parent_key),
                    hit.radius,
                    confidence,
                    skeleton_id,
                );
                node.add_child(child_key);
                self.nodes.insert(vn_key, node);
                if let Some(p) = self.nodes.get_mut(&parent_key) {
                    p.add_child(vn_key);
                }
                self.set_parent_field(child, Some(vn_key));
                true
            }
            None => {
                if let Some(p) = self.nodes.get_mut(&parent_key) {
                    p.add_child(child_key);
                }
                self.set_parent_field(child, Some(parent_key));
                false
            }
        }
    }

    fn set_parent_field(&mut self, child: RealNodeId, parent: Option<NodeId>) {
        if let Some(tree) = self
            .nodes
            .get_mut(&NodeId::Real(child))
            .and_then(Node::as_tree_mut)
        {
            tree.parent_id = parent;
        }
    }

    /// Move a node
    ///
    /// The edges of a real tree node are re-linked at once, so virtual nodes
    /// on them move to the new crossing point or disappear. A virtual node
    /// keeps its identifier wherever it is moved.
    pub fn set_position(&mut self, id: &NodeId, position: Point3) -> bool {
        let zdiff = self.plane.zdiff(&position);
        let is_tree = match self.nodes.get_mut(id) {
            Some(node) => {
                node.position = position;
                node.zdiff = zdiff;
                node.is_tree()
            }
            None => return false,
        };
        if let (NodeId::Real(real), true) = (id, is_tree) {
            let parent = self.real_parent(*real);
            let children = self.real_children(*real);
            self.link_edge(*real, parent);
            for child in children {
                self.link_edge(child, Some(*real));
            }
        }
        true
    }

    pub fn set_radius(&mut self, id: &NodeId, radius: Option<f64>) -> bool {
        match self.nodes.get_mut(id).and_then(Node::as_tree_mut) {
            Some(tree) => {
                tree.radius = radius;
                true
            }
            None => false,
        }
    }

    /// Re-parent a real tree node, re-splicing virtual nodes as needed
    pub fn set_parent(&mut self, child: RealNodeId, parent: Option<RealNodeId>) -> bool {
        if !self
            .get_real(child)
            .map(Node::is_tree)
            .unwrap_or(false)
        {
            return false;
        }
        self.link_edge(child, parent);
        true
    }

    /// Assign `skeleton_id` to `root` and everything below it in the store
    pub fn set_skeleton(&mut self, root: RealNodeId, skeleton_id: SkeletonId) -> usize {
        let mut queue = VecDeque::from([NodeId::Real(root)]);
        let mut changed = 0;
        while let Some(id) = queue.pop_front() {
            if let Some(tree) = self.nodes.get_mut(&id).and_then(Node::as_tree_mut) {
                tree.skeleton_id = skeleton_id;
                queue.extend(tree.children.iter().copied());
                changed += 1;
            }
        }
        changed
    }

    /// Apply authoritative edition times; returns how many nodes were present
    pub fn apply_edition_times(&mut self, times: &BTreeMap<RealNodeId, EditionTime>) -> usize {
        let mut applied = 0;
        for (id, edition_time) in times {
            if let Some(node) = self.nodes.get_mut(&NodeId::Real(*id)) {
                node.edition_time = Some(edition_time.clone());
                applied += 1;
            }
        }
        applied
    }

    /// Set the confidence of the edge leaving `id`
    ///
    /// With `to_connector` every loaded link from `id` to a connector is
    /// updated instead of the parent edge. Returns how many edges changed.
    pub fn set_confidence(
        &mut self,
        id: RealNodeId,
        confidence: Confidence,
        to_connector: bool,
    ) -> usize {
        if to_connector {
            let mut changed = 0;
            for connector in self.nodes.values_mut().filter_map(Node::as_connector_mut) {
                for link in connector.links.iter_mut().filter(|l| l.treenode_id == id) {
                    link.confidence = confidence;
                    changed += 1;
                }
            }
            return changed;
        }

        let key = NodeId::Real(id);
        let via = match self.parent_of(&key) {
            Some(NodeId::Virtual(vn)) => Some(NodeId::Virtual(*vn)),
            Some(NodeId::Real(_)) => None,
            None => return 0,
        };
        // A virtual node on the edge carries the edge's confidence too
        for node_id in std::iter::once(key).chain(via) {
            if let Some(tree) = self.nodes.get_mut(&node_id).and_then(Node::as_tree_mut) {
                tree.confidence = confidence;
            }
        }
        1
    }

    /// Attach a link to a loaded connector; duplicates by link id are ignored
    pub fn add_link(&mut self, connector_id: RealNodeId, link: ConnectorLink) -> bool {
        match self
            .nodes
            .get_mut(&NodeId::Real(connector_id))
            .and_then(Node::as_connector_mut)
        {
            Some(connector) => {
                if !connector.links.iter().any(|l| l.link_id == link.link_id) {
                    connector.links.push(link);
                }
                true
            }
            None => false,
        }
    }

    /// Insert a freshly created real tree node and link it to `parent`
    #[allow(clippy::too_many_arguments)]
    pub fn insert_created(
        &mut self,
        id: RealNodeId,
        position: Point3,
        parent: Option<RealNodeId>,
        radius: Option<f64>,
        skeleton_id: SkeletonId,
        creator_id: UserId,
        edition_time: EditionTime,
    ) {
        let record = TreenodeRecord {
            id,
            parent_id: parent,
            position,
            confidence: Default::default(),
            radius,
            skeleton_id,
            user_id: creator_id,
            edition_time,
        };
        self.insert_records(&WindowBatch {
            treenodes: vec![record],
            ..WindowBatch::default()
        });
    }

    /// Replace virtual node `vn` by real node `new_id` at the same place
    ///
    /// The virtual node's child is re-pointed at `new_id` and `new_id` at the
    /// virtual node's parent. Labels move along. Returns `false` when `vn` is
    /// not in the store.
    pub fn replace_virtual(
        &mut self,
        vn: &VirtualNodeId,
        new_id: RealNodeId,
        edition_time: EditionTime,
        creator_id: Option<UserId>,
    ) -> bool {
        let vn_key = NodeId::Virtual(*vn);
        let Some(virtual_node) = self.nodes.get(&vn_key) else {
            return false;
        };
        let Some(tree) = virtual_node.as_tree() else {
            return false;
        };
        let position = virtual_node.position;
        let mut real = self.pool.acquire_tree(
            NodeId::Real(new_id),
            position,
            None,
            tree.radius,
            tree.confidence,
            tree.skeleton_id,
        );
        real.zdiff = self.plane.zdiff(&position);
        real.creator_id = creator_id;
        real.edition_time = Some(edition_time);
        let labels = self.labels.remove(&vn_key);
        self.nodes.insert(NodeId::Real(new_id), real);

        // Detaching the child drops the virtual node
        self.link_edge(vn.child(), Some(new_id));
        self.link_edge(new_id, Some(vn.parent()));
        if let Some(labels) = labels {
            self.labels.insert(NodeId::Real(new_id), labels);
        }
        true
    }

    /// Take a real node out of the store
    ///
    /// Children of a tree node are re-parented to its parent (or become roots),
    /// links pointing at it are pruned from loaded connectors, labels dropped.
    pub fn remove_node(&mut self, id: RealNodeId) -> Option<RemovedNode> {
        let key = NodeId::Real(id);
        let snapshot = self.nodes.get(&key)?.clone();
        let labels = self.labels.remove(&key).unwrap_or_default();

        if snapshot.is_connector() {
            self.nodes.remove(&key);
            return Some(RemovedNode {
                node: snapshot,
                parent: None,
                children: Vec::new(),
                labels,
                pruned_links: Vec::new(),
            });
        }

        let parent = self.real_parent(id);
        let children = self.real_children(id);
        for child in &children {
            self.link_edge(*child, parent);
        }
        self.detach_parent(id);
        self.nodes.remove(&key);

        let mut pruned_links = Vec::new();
        for node in self.nodes.values_mut() {
            let node_id = node.id;
            if let Some(connector) = node.as_connector_mut() {
                connector.links.retain(|l| {
                    if l.treenode_id == id {
                        if let NodeId::Real(cid) = node_id {
                            pruned_links.push((cid, l.clone()));
                        }
                        false
                    } else {
                        true
                    }
                });
            }
        }

        Some(RemovedNode {
            node: snapshot,
            parent,
            children,
            labels,
            pruned_links,
        })
    }

    /// Undo a [`remove_node`](Self::remove_node)
    pub fn restore_node(&mut self, removed: RemovedNode) {
        let RemovedNode {
            mut node,
            parent,
            children,
            labels,
            pruned_links,
        } = removed;
        let key = node.id;
        let Some(id) = key.as_real() else {
            return;
        };

        node.zdiff = self.plane.zdiff(&node.position);
        if let Some(tree) = node.as_tree_mut() {
            tree.parent_id = None;
            tree.children.clear();
        }
        self.nodes.insert(key, node);
        if !labels.is_empty() {
            self.labels.insert(key, labels);
        }

        if parent.is_some() {
            self.link_edge(id, parent);
        }
        for child in children {
            if self.nodes.contains_key(&NodeId::Real(child)) {
                self.link_edge(child, Some(id));
            }
        }
        for (connector_id, link) in pruned_links {
            self.add_link(connector_id, link);
        }
    }
}
