//! JSON frame codec for the broker WebSocket link.
//!
//! The broker is an opaque publish/subscribe peer; every frame on the wire is
//! a single JSON object tagged by its `op` field:
//!
//! | `op` | Direction | Carries |
//! |---|---|---|
//! | `publish` | both | `topic`, `payload`, `qos`, `retain`, optional `id` |
//! | `subscribe` | outbound | `topics` (subscription patterns, `+`/`#` allowed) |
//! | `puback` | inbound | `id` of the acknowledged QoS ≥ 1 publish |
//! | `ping` / `pong` | both | keepalive |
//!
//! Publish payloads are arbitrary JSON: the scale node sends bare numbers,
//! the robot sends objects. Interpretation is left to the domain validators.

use pourlink_types::BridgeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One frame on the broker link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Frame {
    Publish {
        /// Present on QoS ≥ 1 publishes; echoed back in the matching `puback`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Uuid>,
        topic: String,
        payload: Value,
        #[serde(default)]
        qos: u8,
        #[serde(default)]
        retain: bool,
    },
    Subscribe {
        topics: Vec<String>,
    },
    Puback {
        id: Uuid,
    },
    Ping,
    Pong,
}

impl Frame {
    /// Serialize the frame to its wire text.
    pub fn encode(&self) -> Result<String, BridgeError> {
        serde_json::to_string(self).map_err(|e| BridgeError::Transport(e.to_string()))
    }

    /// Parse a wire text frame.
    pub fn decode(text: &str) -> Result<Frame, BridgeError> {
        serde_json::from_str(text)
            .map_err(|e| BridgeError::Transport(format!("malformed frame: {e}")))
    }
}
