//! Wire contract between the authoring side and the render engine.
//!
//! Every message travels in a small JSON envelope; commands that expect a
//! reply carry a `requestId` the response echoes back. The transport only
//! has to be ordered and lossless; the engine applies messages one at a
//! time to completion.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::blueprint::Blueprint;
use crate::graph::{Edge, FilterMode, GraphSnapshot, Node, NodeId, SocketRef};
use crate::value::ParamValue;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessage<T> {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub timestamp: u64,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Graph wire shapes ────────────────────────────────────────────────────

/// Full graph snapshot as carried by `initialize`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireGraph {
    #[serde(default)]
    pub nodes: HashMap<NodeId, WireNodeEntry>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireNodeEntry {
    pub node: Node,
    pub blueprint: Blueprint,
    /// Resolved socket maps as the authoring side computed them. The mirror
    /// treats the raw edge list as truth and re-derives these.
    #[serde(default)]
    pub inputs: HashMap<String, SocketRef>,
    #[serde(default)]
    pub outputs: HashMap<String, SocketRef>,
}

impl WireGraph {
    pub fn into_snapshot(self) -> GraphSnapshot {
        let mut snap = GraphSnapshot::new();
        for (_, entry) in self.nodes {
            snap.insert_node(entry.node, Arc::new(entry.blueprint));
        }
        snap.replace_edges(self.edges);
        snap
    }
}

/// Everything needed to mirror a node the render side has never seen.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullNodeSnapshot {
    pub node: Node,
    pub blueprint: Blueprint,
    #[serde(default)]
    pub inputs: HashMap<String, SocketRef>,
    #[serde(default)]
    pub outputs: HashMap<String, SocketRef>,
}

/// Delta for a node the render side already mirrors. Absent fields are
/// unchanged; which fields are present decides the invalidation path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinimalNodeSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<[f32; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub texture_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<BTreeMap<String, ParamValue>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeSyncSnapshot {
    Full(FullNodeSnapshot),
    Minimal(MinimalNodeSnapshot),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynchronizeNodePayload {
    pub node_id: NodeId,
    /// `null` means the node was removed.
    pub node_snapshot: Option<NodeSyncSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynchronizeEdgesPayload {
    pub node_id: NodeId,
    pub edges: Vec<Edge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializePayload {
    pub material: WireGraph,
    #[serde(default)]
    pub start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderNodePayload {
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_filter: Option<FilterMode>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ViewportSizePayload {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UiTransformPayload {
    pub x: f32,
    pub y: f32,
    pub scale: f32,
}

/// RGBA8 pixel data, base64-encoded for the JSON envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PixelBufferPayload {
    pub width: u32,
    pub height: u32,
    pub rgba8: String,
}

impl PixelBufferPayload {
    pub fn encode(width: u32, height: u32, rgba8: &[u8]) -> Self {
        Self {
            width,
            height,
            rgba8: BASE64.encode(rgba8),
        }
    }

    pub fn decode_pixels(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.rgba8)
            .map_err(|e| anyhow!("invalid base64 pixel payload: {e}"))
    }
}

// ── Command / response vocabulary ────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum EngineCommand {
    Initialize(InitializePayload),
    SynchronizeNode(SynchronizeNodePayload),
    SynchronizeEdges(SynchronizeEdgesPayload),
    RenderNode(RenderNodePayload),
    SetViewportSize(ViewportSizePayload),
    SetUiTransform(UiTransformPayload),
}

impl EngineCommand {
    /// Parse an envelope's type + payload into a command.
    pub fn parse(msg_type: &str, payload: Option<serde_json::Value>) -> Result<Self> {
        fn payload_as<T: serde::de::DeserializeOwned>(
            msg_type: &str,
            payload: Option<serde_json::Value>,
        ) -> Result<T> {
            let payload = payload.ok_or_else(|| anyhow!("missing payload for {msg_type}"))?;
            serde_json::from_value(payload)
                .map_err(|e| anyhow!("invalid {msg_type} payload: {e}"))
        }

        Ok(match msg_type {
            "initialize" => EngineCommand::Initialize(payload_as(msg_type, payload)?),
            "synchronize_node" => EngineCommand::SynchronizeNode(payload_as(msg_type, payload)?),
            "synchronize_edges" => EngineCommand::SynchronizeEdges(payload_as(msg_type, payload)?),
            "render_node" => EngineCommand::RenderNode(payload_as(msg_type, payload)?),
            "set_viewport_size" => EngineCommand::SetViewportSize(payload_as(msg_type, payload)?),
            "set_ui_transform" => EngineCommand::SetUiTransform(payload_as(msg_type, payload)?),
            other => bail!("unknown message type: {other}"),
        })
    }

    /// Whether the sender waits for a reply (used by the command queue).
    pub fn expects_response(&self) -> bool {
        matches!(
            self,
            EngineCommand::Initialize(_) | EngineCommand::RenderNode(_)
        )
    }

    pub fn wire_type(&self) -> &'static str {
        match self {
            EngineCommand::Initialize(_) => "initialize",
            EngineCommand::SynchronizeNode(_) => "synchronize_node",
            EngineCommand::SynchronizeEdges(_) => "synchronize_edges",
            EngineCommand::RenderNode(_) => "render_node",
            EngineCommand::SetViewportSize(_) => "set_viewport_size",
            EngineCommand::SetUiTransform(_) => "set_ui_transform",
        }
    }

    pub fn payload_value(&self) -> Result<serde_json::Value> {
        let value = match self {
            EngineCommand::Initialize(p) => serde_json::to_value(p),
            EngineCommand::SynchronizeNode(p) => serde_json::to_value(p),
            EngineCommand::SynchronizeEdges(p) => serde_json::to_value(p),
            EngineCommand::RenderNode(p) => serde_json::to_value(p),
            EngineCommand::SetViewportSize(p) => serde_json::to_value(p),
            EngineCommand::SetUiTransform(p) => serde_json::to_value(p),
        };
        value.map_err(|e| anyhow!("failed to serialize command payload: {e}"))
    }
}

#[derive(Debug, Clone)]
pub enum EngineResponse {
    Initialized,
    PixelBuffer(PixelBufferPayload),
    Error(ErrorPayload),
}

impl EngineResponse {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        EngineResponse::Error(ErrorPayload {
            code: code.to_string(),
            message: message.into(),
        })
    }

    /// Wrap into an envelope, echoing the originating request id.
    pub fn into_message(self, request_id: Option<String>) -> WsMessage<serde_json::Value> {
        let (msg_type, payload) = match self {
            EngineResponse::Initialized => ("initialized".to_string(), None),
            EngineResponse::PixelBuffer(p) => (
                "pixel_buffer".to_string(),
                Some(serde_json::to_value(p).unwrap_or(serde_json::Value::Null)),
            ),
            EngineResponse::Error(e) => (
                "error".to_string(),
                Some(serde_json::to_value(e).unwrap_or(serde_json::Value::Null)),
            ),
        };
        WsMessage {
            msg_type,
            timestamp: now_millis(),
            request_id,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_sync_snapshot_distinguishes_full_minimal_and_removal() {
        let full: SynchronizeNodePayload = serde_json::from_str(
            r#"{
                "nodeId": 3,
                "nodeSnapshot": {
                    "node": {"id": 3, "blueprint": "solid-color"},
                    "blueprint": {"name": "solid-color", "painter": "single-pass",
                                  "outputs": ["color"]}
                }
            }"#,
        )
        .unwrap();
        assert!(matches!(
            full.node_snapshot,
            Some(NodeSyncSnapshot::Full(_))
        ));

        let minimal: SynchronizeNodePayload = serde_json::from_str(
            r#"{"nodeId": 3, "nodeSnapshot": {"textureSize": 256}}"#,
        )
        .unwrap();
        match minimal.node_snapshot {
            Some(NodeSyncSnapshot::Minimal(m)) => assert_eq!(m.texture_size, Some(256)),
            other => panic!("expected minimal snapshot, got {other:?}"),
        }

        let removal: SynchronizeNodePayload =
            serde_json::from_str(r#"{"nodeId": 3, "nodeSnapshot": null}"#).unwrap();
        assert!(removal.node_snapshot.is_none());
    }

    #[test]
    fn edges_use_two_element_array_endpoints() {
        let edge: Edge =
            serde_json::from_str(r#"{"from": [0, "color"], "to": [1, "in"]}"#).unwrap();
        assert_eq!(edge.from, SocketRef::new(0, "color"));
        assert_eq!(
            serde_json::to_string(&edge).unwrap(),
            r#"{"from":[0,"color"],"to":[1,"in"]}"#
        );
    }

    #[test]
    fn pixel_buffer_round_trips_base64() {
        let pixels = vec![0u8, 127, 255, 64];
        let payload = PixelBufferPayload::encode(1, 1, &pixels);
        assert_eq!(payload.decode_pixels().unwrap(), pixels);
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        assert!(EngineCommand::parse("reticulate_splines", None).is_err());
    }
}
