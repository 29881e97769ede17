//! Write-back synchronization queue
//!
//! Local edits mark nodes dirty; [`SyncQueue::flush`] pushes them to the
//! remote source. Virtual nodes are realized first (one remote insert each),
//! then all dirty real nodes go out as a single batched move.
//!
//! Each mark carries a stamp. A node re-marked while its write is in flight
//! gets a newer stamp and therefore stays dirty once that write completes.
//! Flushes serialize on an async lock, so at most one batched write is in
//! flight per queue.

use super::error::OverlayError;
use crate::models::{NodeId, RealNodeId, VirtualNodeId};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Remote side of a flush
#[async_trait]
pub trait SyncTarget: Send + Sync {
    /// Persist a virtual node between its two real endpoints
    async fn realize_virtual(&self, vn: VirtualNodeId) -> Result<RealNodeId, OverlayError>;

    /// Send the current positions of `ids` as one batched move
    async fn push_positions(&self, ids: &[RealNodeId]) -> Result<(), OverlayError>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    pub realized: Vec<(VirtualNodeId, RealNodeId)>,
    pub moved: Vec<RealNodeId>,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.realized.is_empty() && self.moved.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct SyncQueue {
    dirty: Mutex<BTreeMap<NodeId, u64>>,
    next_stamp: AtomicU64,
    flush_lock: tokio::sync::Mutex<()>,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn dirty(&self) -> MutexGuard<'_, BTreeMap<NodeId, u64>> {
        self.dirty.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn mark_dirty(&self, id: NodeId) {
        let stamp = self.next_stamp.fetch_add(1, Ordering::SeqCst) + 1;
        self.dirty().insert(id, stamp);
    }

    pub fn is_dirty(&self, id: &NodeId) -> bool {
        self.dirty().contains_key(id)
    }

    pub fn dirty_ids(&self) -> Vec<NodeId> {
        self.dirty().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.dirty().len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirty().is_empty()
    }

    /// Forget a pending change; returns whether one existed
    pub fn discard(&self, id: &NodeId) -> bool {
        self.dirty().remove(id).is_some()
    }

    /// Carry a pending mark over to a node's new identifier
    pub fn rename(&self, from: &NodeId, to: NodeId) {
        let mut dirty = self.dirty();
        if let Some(stamp) = dirty.remove(from) {
            dirty.insert(to, stamp);
        }
    }

    /// Clear `id` unless it was re-marked after `stamp`
    fn clear_if_unchanged(&self, id: &NodeId, stamp: u64) {
        let mut dirty = self.dirty();
        if dirty.get(id) == Some(&stamp) {
            dirty.remove(id);
        }
    }

    /// After realization, drop the virtual mark; a newer mark moves to the new id
    fn settle_realized(&self, vn: VirtualNodeId, new_id: RealNodeId, stamp: u64) {
        let mut dirty = self.dirty();
        if let Some(current) = dirty.remove(&NodeId::Virtual(vn)) {
            if current != stamp {
                dirty.insert(NodeId::Real(new_id), current);
            }
        }
    }

    /// Push every pending change
    ///
    /// Resolves immediately when nothing is dirty. On error the remaining
    /// items stay dirty for the next attempt.
    pub async fn flush<T>(&self, target: &T) -> Result<FlushReport, OverlayError>
    where
        T: SyncTarget + ?Sized,
    {
        let _flushing = self.flush_lock.lock().await;
        let snapshot: Vec<(NodeId, u64)> =
            self.dirty().iter().map(|(id, stamp)| (*id, *stamp)).collect();
        let mut report = FlushReport::default();
        if snapshot.is_empty() {
            return Ok(report);
        }

        for (id, stamp) in &snapshot {
            if let NodeId::Virtual(vn) = id {
                let new_id = target.realize_virtual(*vn).await?;
                self.settle_realized(*vn, new_id, *stamp);
                report.realized.push((*vn, new_id));
            }
        }

        let reals: Vec<(RealNodeId, u64)> = snapshot
            .iter()
            .filter_map(|(id, stamp)| id.as_real().map(|r| (r, *stamp)))
            .collect();
        if !reals.is_empty() {
            let ids: Vec<RealNodeId> = reals.iter().map(|(id, _)| *id).collect();
            target.push_positions(&ids).await?;
            for (id, stamp) in reals {
                self.clear_if_unchanged(&NodeId::Real(id), stamp);
            }
            report.moved = ids;
        }

        tracing::debug!(
            "Flushed {} realization(s) and {} move(s)",
            report.realized.len(),
            report.moved.len()
        );
        Ok(report)
    }
}
