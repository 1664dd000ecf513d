//! Wire format: mesh control messages vs. opaque application payloads.
//!
//! Every payload on a peer connection is a JSON value. A payload is a control
//! message when it is an object whose `meshAction` field names a known action;
//! anything else belongs to the application and is delivered untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MeshError;
use crate::identity::PeerId;

/// Reserved discriminator field marking control-plane payloads.
pub const MESH_ACTION_FIELD: &str = "meshAction";

/// Discriminator value for [`ControlMessage::AnnouncePeer`].
pub const ANNOUNCE_PEER_ACTION: &str = "announce-peer";

const PEER_ID_FIELD: &str = "peerId";

/// Control-plane messages exchanged between mesh nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "meshAction")]
pub enum ControlMessage {
    /// "I just connected to `peer_id`, you should too."
    #[serde(rename = "announce-peer")]
    AnnouncePeer {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
}

impl ControlMessage {
    pub fn announce(peer_id: PeerId) -> Self {
        Self::AnnouncePeer { peer_id }
    }

    /// Encode for transmission.
    pub fn to_value(&self) -> Result<Value, MeshError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// A decoded inbound payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Control(ControlMessage),
    Application(Value),
}

/// Split an inbound payload into control or application traffic.
///
/// Announce-shaped payloads without a usable peer id yield
/// [`MeshError::MalformedAnnounce`].
pub fn decode(payload: Value) -> Result<Inbound, MeshError> {
    let is_announce = payload
        .get(MESH_ACTION_FIELD)
        .and_then(Value::as_str)
        .is_some_and(|action| action == ANNOUNCE_PEER_ACTION);

    if !is_announce {
        return Ok(Inbound::Application(payload));
    }

    match payload.get(PEER_ID_FIELD).and_then(Value::as_str) {
        Some(id) if !id.is_empty() => Ok(Inbound::Control(ControlMessage::announce(
            PeerId::from_string(id),
        ))),
        _ => Err(MeshError::MalformedAnnounce(payload.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
