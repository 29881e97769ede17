//! Wire Types and Response Normalization
//!
//! Request and response shapes exchanged with the remote source, and the
//! normalization of `nodes-in-window` responses into a [`WindowBatch`].
//!
//! # Accepted response encodings
//!
//! - keyed JSON object: `{treenodes, connectors, labels, truncated, relationNameMap}`
//! - positional JSON array: `[treenodes, connectors, labels, truncated, relationNameMap]`
//! - `compact-binary`: CBOR carrying either of the two shapes above
//!
//! Records inside a response are positional arrays:
//!
//! ```text
//! treenode:  [id, parentId, x, y, z, confidence, radius, skeletonId, userId, editionTime]
//! connector: [id, x, y, z, confidence, editionTime, userId, links]
//! link:      [treenodeId, relationId, confidence, linkEditionTime, linkId]
//! ```
//!
//! A malformed record is skipped with a warning and counted in
//! [`WindowBatch::skipped`]; it never fails the whole batch.

use super::error::RemoteError;
use crate::models::{
    radius_from_wire, radius_to_wire, BoundingBox, Confidence, ConnectorLink, EditionTime,
    LevelOfDetail, Node, NodeId, NodeKind, Point3, RealNodeId, RelationId, ResponseFormat,
    SkeletonId, UserId, ValidationError, WindowQuery, ZRange,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Wire form of a `nodes-in-window` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowRequest {
    pub left: f64,
    pub top: f64,
    pub z1: f64,
    pub right: f64,
    pub bottom: f64,
    pub z2: f64,
    pub lod: f64,
    pub lod_type: String,
    pub treenode_ids: Vec<RealNodeId>,
    pub connector_ids: Vec<RealNodeId>,
    pub labels: bool,
    pub format: ResponseFormat,
}

impl WindowRequest {
    pub fn from_query(query: &WindowQuery, format: ResponseFormat) -> Self {
        Self {
            left: query.bbox.left,
            top: query.bbox.top,
            z1: query.z_range.z1,
            right: query.bbox.right,
            bottom: query.bbox.bottom,
            z2: query.z_range.z2,
            lod: query.lod.value(),
            lod_type: query.lod.lod_type().to_string(),
            treenode_ids: query.treenode_ids.clone(),
            connector_ids: query.connector_ids.clone(),
            labels: query.labels,
            format,
        }
    }

    pub fn bbox(&self) -> BoundingBox {
        BoundingBox::new(self.left, self.top, self.right, self.bottom)
    }

    pub fn z_range(&self) -> ZRange {
        ZRange::new(self.z1, self.z2)
    }

    /// Level of detail, `None` when `lod_type` is unknown
    pub fn level_of_detail(&self) -> Option<LevelOfDetail> {
        match self.lod_type.as_str() {
            "absolute" => Some(LevelOfDetail::Absolute(self.lod.max(0.0) as u32)),
            "percent" => Some(LevelOfDetail::Percent(self.lod)),
            _ => None,
        }
    }
}

/// Raw `nodes-in-window` response body
#[derive(Debug, Clone, PartialEq)]
pub enum WindowPayload {
    Json(Value),
    CompactBinary(Vec<u8>),
}

impl WindowPayload {
    /// Size of the payload as transferred
    pub fn byte_len(&self) -> usize {
        match self {
            WindowPayload::Json(v) => v.to_string().len(),
            WindowPayload::CompactBinary(bytes) => bytes.len(),
        }
    }
}

/// One tree node as sent by the remote source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreenodeRecord {
    pub id: RealNodeId,
    pub parent_id: Option<RealNodeId>,
    pub position: Point3,
    pub confidence: Confidence,
    pub radius: Option<f64>,
    pub skeleton_id: SkeletonId,
    pub user_id: UserId,
    pub edition_time: EditionTime,
}

impl TreenodeRecord {
    /// Parse a positional treenode row
    pub fn from_row(row: &Value) -> Result<Self, ValidationError> {
        let row = as_row(row, "treenode")?;
        Ok(Self {
            id: req_i64(row, 0, "id")?,
            parent_id: opt_i64(row, 1, "parentId")?,
            position: Point3::new(
                req_f64(row, 2, "x")?,
                req_f64(row, 3, "y")?,
                req_f64(row, 4, "z")?,
            ),
            confidence: confidence(row, 5)?,
            radius: radius_from_wire(req_f64(row, 6, "radius")?),
            skeleton_id: req_i64(row, 7, "skeletonId")?,
            user_id: req_i64(row, 8, "userId")?,
            edition_time: edition_time(row, 9, "editionTime")?,
        })
    }

    pub fn to_row(&self) -> Value {
        json!([
            self.id,
            self.parent_id,
            self.position.x,
            self.position.y,
            self.position.z,
            self.confidence.value(),
            radius_to_wire(self.radius),
            self.skeleton_id,
            self.user_id,
            self.edition_time.as_str(),
        ])
    }

    /// Rebuild a record from a real tree node held locally
    ///
    /// Returns `None` for virtual nodes, connectors and nodes without an
    /// acknowledged edition time.
    pub fn from_node(node: &Node) -> Option<Self> {
        let id = node.id.as_real()?;
        let tree = match &node.kind {
            NodeKind::Tree(tree) => tree,
            NodeKind::Connector(_) => return None,
        };
        let parent_id = match tree.parent_id {
            None => None,
            Some(NodeId::Real(p)) => Some(p),
            Some(NodeId::Virtual(vn)) => Some(vn.parent()),
        };
        Some(Self {
            id,
            parent_id,
            position: node.position,
            confidence: tree.confidence,
            radius: tree.radius,
            skeleton_id: tree.skeleton_id,
            user_id: node.creator_id.unwrap_or_default(),
            edition_time: node.edition_time.clone()?,
        })
    }
}

/// One connector as sent by the remote source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorRecord {
    pub id: RealNodeId,
    pub position: Point3,
    pub confidence: Confidence,
    pub edition_time: EditionTime,
    pub user_id: UserId,
    pub links: Vec<ConnectorLink>,
}

impl ConnectorRecord {
    /// Parse a positional connector row with its nested link rows
    pub fn from_row(row: &Value) -> Result<Self, ValidationError> {
        let row = as_row(row, "connector")?;
        let links = match row.get(7) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(link_from_row)
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => {
                return Err(ValidationError::invalid_field("links", "expected an array"));
            }
        };
        Ok(Self {
            id: req_i64(row, 0, "id")?,
            position: Point3::new(
                req_f64(row, 1, "x")?,
                req_f64(row, 2, "y")?,
                req_f64(row, 3, "z")?,
            ),
            confidence: confidence(row, 4)?,
            edition_time: edition_time(row, 5, "editionTime")?,
            user_id: req_i64(row, 6, "userId")?,
            links,
        })
    }

    pub fn to_row(&self) -> Value {
        let links: Vec<Value> = self
            .links
            .iter()
            .map(|l| {
                json!([
                    l.treenode_id,
                    l.relation_id,
                    l.confidence.value(),
                    l.edition_time.as_str(),
                    l.link_id,
                ])
            })
            .collect();
        json!([
            self.id,
            self.position.x,
            self.position.y,
            self.position.z,
            self.confidence.value(),
            self.edition_time.as_str(),
            self.user_id,
            links,
        ])
    }
}

fn link_from_row(row: &Value) -> Result<ConnectorLink, ValidationError> {
    let row = as_row(row, "link")?;
    Ok(ConnectorLink {
        treenode_id: req_i64(row, 0, "treenodeId")?,
        relation_id: req_i64(row, 1, "relationId")?,
        confidence: confidence(row, 2)?,
        edition_time: edition_time(row, 3, "linkEditionTime")?,
        link_id: req_i64(row, 4, "linkId")?,
    })
}

/// Normalized content of one window response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowBatch {
    pub treenodes: Vec<TreenodeRecord>,
    pub connectors: Vec<ConnectorRecord>,
    pub labels: BTreeMap<RealNodeId, Vec<String>>,
    /// The remote hit its node-count ceiling
    pub truncated: bool,
    pub relation_names: BTreeMap<RelationId, String>,
    /// Records dropped as malformed during normalization
    pub skipped: usize,
}

impl WindowBatch {
    /// Rough in-memory footprint, used for the cache memory bound
    pub fn approximate_bytes(&self) -> usize {
        const TREENODE_BYTES: usize = 96;
        const CONNECTOR_BYTES: usize = 80;
        const LINK_BYTES: usize = 56;

        let links: usize = self.connectors.iter().map(|c| c.links.len()).sum();
        let labels: usize = self
            .labels
            .values()
            .flat_map(|ls| ls.iter())
            .map(|l| l.len() + 24)
            .sum();
        self.treenodes.len() * TREENODE_BYTES
            + self.connectors.len() * CONNECTOR_BYTES
            + links * LINK_BYTES
            + labels
    }

    /// Keyed JSON encoding
    pub fn to_json(&self) -> Value {
        let labels: Map<String, Value> = self
            .labels
            .iter()
            .map(|(id, ls)| (id.to_string(), json!(ls)))
            .collect();
        let relations: Map<String, Value> = self
            .relation_names
            .iter()
            .map(|(id, name)| (id.to_string(), json!(name)))
            .collect();
        json!({
            "treenodes": self.treenodes.iter().map(TreenodeRecord::to_row).collect::<Vec<_>>(),
            "connectors": self.connectors.iter().map(ConnectorRecord::to_row).collect::<Vec<_>>(),
            "labels": labels,
            "truncated": self.truncated,
            "relationNameMap": relations,
        })
    }

    /// Encode for transfer in the requested format
    pub fn encode(&self, format: ResponseFormat) -> Result<WindowPayload, RemoteError> {
        let value = self.to_json();
        match format {
            ResponseFormat::Json => Ok(WindowPayload::Json(value)),
            ResponseFormat::CompactBinary => {
                let mut buf = Vec::new();
                ciborium::ser::into_writer(&value, &mut buf)
                    .map_err(|e| RemoteError::decode(format!("compact-binary encode: {}", e)))?;
                Ok(WindowPayload::CompactBinary(buf))
            }
            ResponseFormat::Raster => Err(RemoteError::invalid_request(
                "raster responses carry no graph data",
            )),
        }
    }
}

/// Normalize any accepted response encoding into a [`WindowBatch`]
pub fn normalize_payload(payload: &WindowPayload) -> Result<WindowBatch, RemoteError> {
    match payload {
        WindowPayload::Json(value) => normalize_value(value),
        WindowPayload::CompactBinary(bytes) => {
            let value: Value = ciborium::de::from_reader(bytes.as_slice())
                .map_err(|e| RemoteError::decode(format!("compact-binary: {}", e)))?;
            normalize_value(&value)
        }
    }
}

fn normalize_value(value: &Value) -> Result<WindowBatch, RemoteError> {
    let (treenodes, connectors, labels, truncated, relations) = match value {
        Value::Object(map) => (
            map.get("treenodes"),
            map.get("connectors"),
            map.get("labels"),
            map.get("truncated"),
            map.get("relationNameMap").or_else(|| map.get("relation_map")),
        ),
        Value::Array(items) => (
            items.first(),
            items.get(1),
            items.get(2),
            items.get(3),
            items.get(4),
        ),
        other => {
            return Err(RemoteError::decode(format!(
                "expected an object or array, got {}",
                type_name(other)
            )));
        }
    };

    let mut batch = WindowBatch {
        truncated: truncated.and_then(Value::as_bool).unwrap_or(false),
        ..WindowBatch::default()
    };

    for row in rows(treenodes, "treenodes")? {
        match TreenodeRecord::from_row(row) {
            Ok(record) => batch.treenodes.push(record),
            Err(e) => {
                tracing::warn!("Skipping malformed treenode record {}: {}", row, e);
                batch.skipped += 1;
            }
        }
    }

    for row in rows(connectors, "connectors")? {
        match ConnectorRecord::from_row(row) {
            Ok(record) => batch.connectors.push(record),
            Err(e) => {
                tracing::warn!("Skipping malformed connector record {}: {}", row, e);
                batch.skipped += 1;
            }
        }
    }

    if let Some(Value::Object(map)) = labels {
        for (key, names) in map {
            let Ok(id) = key.parse::<RealNodeId>() else {
                tracing::warn!("Skipping labels for non-numeric node id '{}'", key);
                continue;
            };
            let names: Vec<String> = names
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            if !names.is_empty() {
                batch.labels.insert(id, names);
            }
        }
    }

    if let Some(Value::Object(map)) = relations {
        for (key, name) in map {
            if let (Ok(id), Some(name)) = (key.parse::<RelationId>(), name.as_str()) {
                batch.relation_names.insert(id, name.to_string());
            }
        }
    }

    Ok(batch)
}

fn rows<'a>(value: Option<&'a Value>, what: &str) -> Result<&'a [Value], RemoteError> {
    match value {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(items)) => Ok(items.as_slice()),
        Some(other) => Err(RemoteError::decode(format!(
            "'{}' must be an array, got {}",
            what,
            type_name(other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn as_row<'a>(value: &'a Value, what: &str) -> Result<&'a [Value], ValidationError> {
    value
        .as_array()
        .map(|v| v.as_slice())
        .ok_or_else(|| ValidationError::MalformedRecord(format!("{} is not an array", what)))
}

fn req_i64(row: &[Value], idx: usize, field: &str) -> Result<i64, ValidationError> {
    match row.get(idx) {
        None | Some(Value::Null) => Err(ValidationError::missing_field(field)),
        Some(v) => v
            .as_i64()
            .ok_or_else(|| ValidationError::invalid_field(field, "expected an integer")),
    }
}

fn opt_i64(row: &[Value], idx: usize, field: &str) -> Result<Option<i64>, ValidationError> {
    match row.get(idx) {
        None => Err(ValidationError::missing_field(field)),
        Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| ValidationError::invalid_field(field, "expected an integer or null")),
    }
}

fn req_f64(row: &[Value], idx: usize, field: &str) -> Result<f64, ValidationError> {
    match row.get(idx) {
        None | Some(Value::Null) => Err(ValidationError::missing_field(field)),
        Some(v) => match v.as_f64() {
            Some(f) if f.is_finite() => Ok(f),
            _ => Err(ValidationError::invalid_field(field, "expected a finite number")),
        },
    }
}

fn confidence(row: &[Value], idx: usize) -> Result<Confidence, ValidationError> {
    let raw = req_i64(row, idx, "confidence")?;
    let raw = u8::try_from(raw)
        .map_err(|_| ValidationError::invalid_field("confidence", format!("{} out of range", raw)))?;
    Confidence::new(raw)
}

fn edition_time(row: &[Value], idx: usize, field: &str) -> Result<EditionTime, ValidationError> {
    match row.get(idx) {
        Some(Value::String(s)) if !s.is_empty() => Ok(EditionTime::new(s.clone())),
        Some(Value::Number(n)) => Ok(EditionTime::new(n.to_string())),
        _ => Err(ValidationError::missing_field(field)),
    }
}

/// Authoritative edition times of every node a mutation touched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MutationReceipt {
    pub edition_times: BTreeMap<RealNodeId, EditionTime>,
}

impl MutationReceipt {
    pub fn with(mut self, id: RealNodeId, edition_time: EditionTime) -> Self {
        self.edition_times.insert(id, edition_time);
        self
    }

    pub fn get(&self, id: RealNodeId) -> Option<&EditionTime> {
        self.edition_times.get(&id)
    }
}

/// One entry of a batched move
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMove {
    pub id: RealNodeId,
    pub position: Point3,
    pub edition_time: EditionTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateNodeRequest {
    pub parent_id: Option<RealNodeId>,
    pub parent_edition_time: Option<EditionTime>,
    pub position: Point3,
    pub radius: Option<f64>,
    pub confidence: Confidence,
}

/// Realization of a virtual node: create a node between two real ones
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertNodeRequest {
    pub child_id: RealNodeId,
    pub child_edition_time: EditionTime,
    pub parent_id: RealNodeId,
    pub parent_edition_time: EditionTime,
    pub position: Point3,
    pub radius: Option<f64>,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedNode {
    pub id: RealNodeId,
    pub edition_time: EditionTime,
    pub skeleton_id: SkeletonId,
    /// Includes the new node and every neighbor whose state changed
    pub receipt: MutationReceipt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteNodeRequest {
    pub id: RealNodeId,
    pub edition_time: EditionTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletedNode {
    pub id: RealNodeId,
    pub parent_id: Option<RealNodeId>,
    /// The deleted node was the last one of its skeleton
    pub deleted_skeleton: bool,
    /// Children whose parent pointer was rewritten
    pub receipt: MutationReceipt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRadiusRequest {
    pub id: RealNodeId,
    pub radius: Option<f64>,
    pub edition_time: EditionTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateParentRequest {
    pub id: RealNodeId,
    pub edition_time: EditionTime,
    pub parent_id: RealNodeId,
    pub parent_edition_time: EditionTime,
}

/// Result of a re-parenting mutation (update-parent or join)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relinked {
    /// Skeleton the re-parented subtree now belongs to
    pub skeleton_id: SkeletonId,
    pub receipt: MutationReceipt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateLinkRequest {
    pub treenode_id: RealNodeId,
    pub treenode_edition_time: EditionTime,
    pub connector_id: RealNodeId,
    pub connector_edition_time: EditionTime,
    pub relation_name: String,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedLink {
    pub link: ConnectorLink,
    pub receipt: MutationReceipt,
}

/// A connector not linked to any tree node yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateConnectorRequest {
    pub position: Point3,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedConnector {
    pub id: RealNodeId,
    pub edition_time: EditionTime,
    pub receipt: MutationReceipt,
}

/// Confidence of the edge leaving a tree node
///
/// With `to_connector` the links from the node to its connectors are updated
/// instead of the edge to its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateConfidenceRequest {
    pub id: RealNodeId,
    pub edition_time: EditionTime,
    pub confidence: Confidence,
    pub to_connector: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitRequest {
    pub id: RealNodeId,
    pub edition_time: EditionTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitResult {
    /// Skeleton of the part that kept the original root
    pub existing_skeleton_id: SkeletonId,
    /// Skeleton of the part rooted at the split node
    pub new_skeleton_id: SkeletonId,
    pub receipt: MutationReceipt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub from_id: RealNodeId,
    pub from_edition_time: EditionTime,
    /// Must be the root of its skeleton
    pub to_id: RealNodeId,
    pub to_edition_time: EditionTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch() -> WindowBatch {
        WindowBatch {
            treenodes: vec![
                TreenodeRecord {
                    id: 1,
                    parent_id: None,
                    position: Point3::new(0.0, 0.0, 0.0),
                    confidence: Confidence::MAX,
                    radius: None,
                    skeleton_id: 10,
                    user_id: 3,
                    edition_time: EditionTime::new("e1"),
                },
                TreenodeRecord {
                    id: 2,
                    parent_id: Some(1),
                    position: Point3::new(5.0, 5.0, 2.0),
                    confidence: Confidence::new(2).unwrap(),
                    radius: Some(1.5),
                    skeleton_id: 10,
                    user_id: 3,
                    edition_time: EditionTime::new("e2"),
                },
            ],
            connectors: vec![ConnectorRecord {
                id: 50,
                position: Point3::new(1.0, 1.0, 0.0),
                confidence: Confidence::MAX,
                edition_time: EditionTime::new("c50"),
                user_id: 3,
                links: vec![ConnectorLink {
                    treenode_id: 1,
                    relation_id: 7,
                    confidence: Confidence::MAX,
                    edition_time: EditionTime::new("l1"),
                    link_id: 900,
                }],
            }],
            labels: BTreeMap::from([(2, vec!["ends".to_string()])]),
            truncated: true,
            relation_names: BTreeMap::from([(7, "presynaptic_to".to_string())]),
            skipped: 0,
        }
    }

    #[test]
    fn test_keyed_json_and_cbor_normalize_identically() {
        let batch = sample_batch();
        let json = normalize_payload(&batch.encode(ResponseFormat::Json).unwrap()).unwrap();
        let cbor =
            normalize_payload(&batch.encode(ResponseFormat::CompactBinary).unwrap()).unwrap();
        assert_eq!(json, batch);
        assert_eq!(cbor, batch);
    }

    #[test]
    fn test_positional_legacy_shape() {
        let payload = WindowPayload::Json(json!([
            [[1, null, 0.0, 0.0, 0.0, 5, -1, 10, 3, "e1"]],
            [],
            {},
            false
        ]));
        let batch = normalize_payload(&payload).unwrap();
        assert_eq!(batch.treenodes.len(), 1);
        assert_eq!(batch.treenodes[0].radius, None);
        assert!(!batch.truncated);
    }

    #[test]
    fn test_malformed_records_are_skipped() {
        let payload = WindowPayload::Json(json!({
            "treenodes": [
                [1, null, 0.0, 0.0, 0.0, 5, -1, 10, 3, "e1"],
                [2, 1, 0.0, 0.0],
                [3, 1, 0.0, 0.0, 1.0, 9, -1, 10, 3, "e3"],
                "not-a-row",
                [4, 1, 0.0, 0.0, 1.0, 5, -1, 10, 3, 1715000000]
            ],
            "connectors": [[60, 0.0, 0.0, 0.0, 5, "c", 3, [[1, 7]]]],
        }));
        let batch = normalize_payload(&payload).unwrap();
        let ids: Vec<_> = batch.treenodes.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 4]);
        assert_eq!(batch.treenodes[1].edition_time.as_str(), "1715000000");
        assert!(batch.connectors.is_empty());
        assert_eq!(batch.skipped, 4);
    }

    #[test]
    fn test_structurally_invalid_payload_is_an_error() {
        assert!(matches!(
            normalize_payload(&WindowPayload::Json(json!("nope"))),
            Err(RemoteError::Decode(_))
        ));
        assert!(matches!(
            normalize_payload(&WindowPayload::Json(json!({"treenodes": 5}))),
            Err(RemoteError::Decode(_))
        ));
        assert!(matches!(
            normalize_payload(&WindowPayload::CompactBinary(vec![0xff, 0x00])),
            Err(RemoteError::Decode(_))
        ));
    }

    #[test]
    fn test_raster_cannot_be_encoded() {
        assert!(sample_batch().encode(ResponseFormat::Raster).is_err());
    }

    #[test]
    fn test_request_from_query() {
        let query = WindowQuery::new(
            BoundingBox::new(0.0, 0.0, 100.0, 100.0),
            ZRange::new(0.0, 1.0),
            LevelOfDetail::Percent(0.5),
        )
        .with_labels(true);
        let request = WindowRequest::from_query(&query, ResponseFormat::CompactBinary);
        assert_eq!(request.lod_type, "percent");
        assert_eq!(request.level_of_detail(), Some(LevelOfDetail::Percent(0.5)));
        assert_eq!(request.bbox(), query.bbox);

        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(wire["format"], "compact-binary");
        assert_eq!(wire["z2"], 1.0);
    }
}
