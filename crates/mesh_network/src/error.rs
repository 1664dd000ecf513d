//! Mesh error types.

use crate::identity::PeerId;

/// Errors that can occur in the mesh_network crate.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// `send_to` targeted a peer that is not in the connected set.
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    /// A transport-level failure on one peer link. Non-fatal to membership.
    #[error("Connection error with {peer}: {message}")]
    Connection { peer: PeerId, message: String },

    /// An announce-shaped payload was missing its required fields.
    #[error("Malformed announce: {0}")]
    MalformedAnnounce(String),

    /// The requested local identity is already claimed on the discovery service.
    #[error("Identity unavailable: {0}")]
    IdentityUnavailable(String),

    /// Any other discovery/signaling service failure.
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// The transport refused an operation outright.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A connect attempt did not reach the open state.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The mesh has been destroyed; the handle is no longer usable.
    #[error("Mesh destroyed")]
    Destroyed,
}

impl MeshError {
    /// Whether the caller may recover by retrying with a different identity.
    pub fn is_identity_unavailable(&self) -> bool {
        matches!(self, Self::IdentityUnavailable(_))
    }
}

/// Outcome of a failed connect attempt.
///
/// Cloneable so every waiter sharing one attempt observes the same value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("Connection to {0} closed before opening")]
    Closed(PeerId),

    #[error("Connection to {peer} failed: {message}")]
    Failed { peer: PeerId, message: String },

    #[error("Connect attempt for {0} was removed")]
    Removed(PeerId),

    #[error("Mesh destroyed before connection to {0} opened")]
    Destroyed(PeerId),

    #[error("Refusing to connect to own identity {0}")]
    SelfConnect(PeerId),
}
