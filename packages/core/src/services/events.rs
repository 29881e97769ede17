//! Overlay events
//!
//! Emitted on a tokio broadcast channel so renderers and widgets can follow
//! the overlay without being called by it.

use crate::graph::LinkReport;
use crate::models::{RealNodeId, VirtualNodeId};
use serde::Serialize;

pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OverlayEvent {
    /// The store was rebuilt from a window fetch
    #[serde(rename_all = "camelCase")]
    GraphRebuilt {
        generation: u64,
        report: LinkReport,
    },

    /// The remote hit its node limit; not everything visible was loaded
    #[serde(rename_all = "camelCase")]
    Truncated { generation: u64 },

    /// Non-fatal problem the user should see
    Warning { message: String },

    #[serde(rename_all = "camelCase")]
    NodeRealized {
        virtual_id: VirtualNodeId,
        real_id: RealNodeId,
    },

    #[serde(rename_all = "camelCase")]
    NodeDeleted {
        id: RealNodeId,
        parent_id: Option<RealNodeId>,
    },
}

impl OverlayEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            OverlayEvent::GraphRebuilt { .. } => "graph:rebuilt",
            OverlayEvent::Truncated { .. } => "graph:truncated",
            OverlayEvent::Warning { .. } => "warning",
            OverlayEvent::NodeRealized { .. } => "node:realized",
            OverlayEvent::NodeDeleted { .. } => "node:deleted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_is_internally_tagged() {
        let event = OverlayEvent::NodeRealized {
            virtual_id: "vn:5:9:1:2:3".parse().unwrap(),
            real_id: 42,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "nodeRealized");
        assert_eq!(json["virtualId"], "vn:5:9:1:2:3");
        assert_eq!(json["realId"], 42);
        assert_eq!(event.event_type(), "node:realized");
    }
}
