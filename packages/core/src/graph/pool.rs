//! Retained node objects released by a rebuild
//!
//! A rebuild evicts every node of the previous window. Instead of dropping
//! them, the store hands them to this pool and reuses their heap buffers
//! (children and link vectors) for the next fetch.

use crate::models::{
    Confidence, ConnectorLink, Node, NodeId, NodeKind, Point3, SkeletonId,
};

#[derive(Debug, Default)]
pub struct NodePool {
    tree: Vec<Node>,
    connectors: Vec<Node>,
    limit: usize,
    reused: usize,
}

impl NodePool {
    /// Pool retaining at most `limit` nodes of each kind
    pub fn new(limit: usize) -> Self {
        Self {
            tree: Vec::new(),
            connectors: Vec::new(),
            limit,
            reused: 0,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.tree.len() + self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retain `node` for reuse; dropped when the pool is full
    pub fn release(&mut self, node: Node) {
        let bucket = match node.kind {
            NodeKind::Tree(_) => &mut self.tree,
            NodeKind::Connector(_) => &mut self.connectors,
        };
        if bucket.len() < self.limit {
            bucket.push(node);
        }
    }

    pub fn acquire_tree(
        &mut self,
        id: NodeId,
        position: Point3,
        parent_id: Option<NodeId>,
        radius: Option<f64>,
        confidence: Confidence,
        skeleton_id: SkeletonId,
    ) -> Node {
        let Some(mut node) = self.tree.pop() else {
            return Node::tree(id, position, parent_id, radius, confidence, skeleton_id);
        };
        self.reused += 1;
        reset(&mut node, id, position);
        if let NodeKind::Tree(tree) = &mut node.kind {
            tree.parent_id = parent_id;
            tree.radius = radius;
            tree.confidence = confidence;
            tree.skeleton_id = skeleton_id;
            tree.children.clear();
        }
        node
    }

    pub fn acquire_connector(
        &mut self,
        id: NodeId,
        position: Point3,
        confidence: Confidence,
        links: &[ConnectorLink],
    ) -> Node {
        let mut node = match self.connectors.pop() {
            Some(mut node) => {
                self.reused += 1;
                reset(&mut node, id, position);
                node
            }
            None => Node::connector(id, position, confidence),
        };
        if let NodeKind::Connector(connector) = &mut node.kind {
            connector.confidence = confidence;
            connector.links.clear();
            connector.links.extend_from_slice(links);
        }
        node
    }

    /// Number of reuses since the last call
    pub fn take_reused(&mut self) -> usize {
        std::mem::take(&mut self.reused)
    }
}

fn reset(node: &mut Node, id: NodeId, position: Point3) {
    node.id = id;
    node.position = position;
    node.zdiff = 0.0;
    node.creator_id = None;
    node.edition_time = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EditionTime;

    #[test]
    fn test_reuse_resets_every_field() {
        let mut pool = NodePool::new(4);
        let mut old = Node::tree(
            NodeId::Real(1),
            Point3::new(1.0, 1.0, 1.0),
            Some(NodeId::Real(0)),
            Some(3.0),
            Confidence::new(1).unwrap(),
            7,
        )
        .with_edition_time(EditionTime::new("e"))
        .with_creator(3);
        old.add_child(NodeId::Real(2));
        pool.release(old);

        let node = pool.acquire_tree(
            NodeId::Real(10),
            Point3::new(5.0, 5.0, 5.0),
            None,
            None,
            Confidence::MAX,
            8,
        );
        assert_eq!(
            node,
            Node::tree(NodeId::Real(10), Point3::new(5.0, 5.0, 5.0), None, None, Confidence::MAX, 8)
        );
        assert_eq!(pool.take_reused(), 1);
        assert_eq!(pool.take_reused(), 0);
    }

    #[test]
    fn test_limit_bounds_each_kind() {
        let mut pool = NodePool::new(1);
        for id in 0..3 {
            pool.release(Node::tree(NodeId::Real(id), Point3::default(), None, None, Confidence::MAX, 1));
            pool.release(Node::connector(NodeId::Real(100 + id), Point3::default(), Confidence::MAX));
        }
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_kinds_do_not_mix() {
        let mut pool = NodePool::new(2);
        pool.release(Node::connector(NodeId::Real(5), Point3::default(), Confidence::MAX));
        let node = pool.acquire_tree(NodeId::Real(6), Point3::default(), None, None, Confidence::MAX, 1);
        assert!(node.is_tree());
        assert_eq!(pool.take_reused(), 0);
        assert_eq!(pool.len(), 1);
    }
}
