//! Transport capability: what the mesh needs from the layer below it.
//!
//! The mesh never establishes connections itself. A [`Transport`] registers
//! the local identity with a discovery/signaling service, opens outbound
//! connections, and reports everything that happens afterwards as
//! [`TransportEvent`]s on a channel the node drains one event at a time.
//! Events for a single connection arrive in order (open, data, close);
//! nothing is guaranteed across connections.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::MeshError;
use crate::identity::PeerId;

/// Transport-unique id of one connection. A peer link uses it to tell its
/// current connection's events from a superseded one's.
///
/// Both ends of a connection see the same id, and ids increase in the order
/// connections are opened, so peers agree on which of two is the newer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Which side initiated a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outbound,
    Inbound,
}

/// One point-to-point connection to a remote peer.
pub trait Connection: fmt::Debug + Send + 'static {
    fn id(&self) -> ConnectionId;

    /// The peer on the other end. Fixed for the connection's lifetime.
    fn remote_peer(&self) -> &PeerId;

    /// Whether payloads can currently be sent.
    fn is_open(&self) -> bool;

    /// Hand a payload to the transport. Only valid while open.
    fn send(&mut self, payload: &Value) -> Result<(), MeshError>;

    /// Close the connection. Idempotent.
    fn close(&mut self);
}

/// Connection establishment and identity registration.
pub trait Transport: Send + 'static {
    type Conn: Connection;

    /// Register with the discovery service, optionally asking for a
    /// specific id. The outcome arrives as an [`IdentityEvent`].
    fn register(&mut self, requested: Option<&PeerId>);

    /// Start an outbound connection. Its lifecycle arrives as
    /// [`ConnectionEvent`]s tagged with the returned connection's id.
    fn connect(&mut self, remote: &PeerId) -> Result<Self::Conn, MeshError>;

    /// Re-establish the signaling connection after a disconnect.
    fn reconnect(&mut self);

    /// Release the local identity. Completion is reported as
    /// [`IdentityEvent::Closed`].
    fn teardown(&mut self);
}

/// Failure classes reported by the discovery service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityErrorKind {
    /// The requested id is already claimed.
    UnavailableId,
    Network,
    ServerError,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityError {
    pub kind: IdentityErrorKind,
    pub message: String,
}

impl IdentityError {
    pub fn new(kind: IdentityErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<IdentityError> for MeshError {
    fn from(err: IdentityError) -> Self {
        match err.kind {
            IdentityErrorKind::UnavailableId => MeshError::IdentityUnavailable(err.message),
            _ => MeshError::Signaling(err.message),
        }
    }
}

/// Lifecycle of the local identity's registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityEvent {
    Assigned(PeerId),
    Disconnected,
    Closed,
    Error(IdentityError),
}

/// Lifecycle of one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Open,
    Data(Value),
    Close,
    Error(String),
}

/// Everything the transport reports to the mesh.
#[derive(Debug)]
pub enum TransportEvent<C> {
    Identity(IdentityEvent),
    /// A remote peer opened a connection to us.
    ConnectionRequest(C),
    Connection {
        id: ConnectionId,
        peer: PeerId,
        event: ConnectionEvent,
    },
}

/// Channel a transport pushes its events into.
pub type EventSender<C> = mpsc::UnboundedSender<TransportEvent<C>>;

/// Receiving half drained by the node.
pub type EventReceiver<C> = mpsc::UnboundedReceiver<TransportEvent<C>>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
