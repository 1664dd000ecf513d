//! Peer link: one remote peer's connection and its lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::error::MeshError;
use crate::identity::PeerId;
use crate::transport::{Connection, ConnectionId, Direction};

/// Lifecycle state of a peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// Created, no connection bound yet.
    Uninitialized,
    /// A connection is bound and has not reported `open`.
    Connecting,
    /// The bound connection is open.
    Open,
    /// Destroyed or closed by the remote end.
    Closed,
}

/// Snapshot of a peer link, handed to the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub state: LinkState,
    /// Who initiated the currently bound connection.
    pub direction: Option<Direction>,
    /// When the link first reached `open`.
    pub connected_at: Option<DateTime<Utc>>,
}

/// Wraps at most one live connection to a single remote peer.
///
/// The coordinator owns every link and feeds it the events of its current
/// connection; events from a superseded connection never reach it.
#[derive(Debug)]
pub struct PeerLink<C> {
    peer_id: PeerId,
    state: LinkState,
    connection: Option<C>,
    direction: Option<Direction>,
    connected_at: Option<DateTime<Utc>>,
}

impl<C: Connection> PeerLink<C> {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            state: LinkState::Uninitialized,
            connection: None,
            direction: None,
            connected_at: None,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn direction(&self) -> Option<Direction> {
        self.direction
    }

    /// Id of the currently bound connection.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection.as_ref().map(Connection::id)
    }

    pub fn is_current(&self, id: ConnectionId) -> bool {
        self.connection_id() == Some(id)
    }

    /// Bind `connection`, closing whatever was bound before. Moves the link
    /// to `Connecting` until the new connection reports `open`.
    ///
    /// A connection for a different remote peer is closed and rejected.
    pub fn bind(&mut self, mut connection: C, direction: Direction) -> Result<(), MeshError> {
        if connection.remote_peer() != &self.peer_id {
            error!(
                "Refusing to bind {} from {} to link for {}",
                connection.id(),
                connection.remote_peer(),
                self.peer_id
            );
            let message = format!("connection reports remote {}", connection.remote_peer());
            connection.close();
            return Err(MeshError::Connection {
                peer: self.peer_id.clone(),
                message,
            });
        }

        if let Some(mut previous) = self.connection.take() {
            debug!(
                "Rebinding {} from {} to {}",
                self.peer_id,
                previous.id(),
                connection.id()
            );
            previous.close();
        }

        self.connection = Some(connection);
        self.direction = Some(direction);
        self.state = LinkState::Connecting;
        Ok(())
    }

    /// Handle the bound connection's `open`. Returns whether the link moved
    /// from `Connecting` to `Open`.
    pub fn mark_open(&mut self) -> bool {
        if self.state != LinkState::Connecting {
            return false;
        }
        self.state = LinkState::Open;
        if self.connected_at.is_none() {
            self.connected_at = Some(Utc::now());
        }
        true
    }

    /// Send a payload over the bound connection.
    ///
    /// Never buffers or retries: without an open connection this logs and
    /// returns `false`.
    pub fn send(&mut self, payload: &Value) -> bool {
        let Some(connection) = self.connection.as_mut() else {
            warn!("No connection bound for peer {}", self.peer_id);
            return false;
        };

        if self.state != LinkState::Open || !connection.is_open() {
            warn!("Cannot send to {}: connection is not open", self.peer_id);
            return false;
        }

        match connection.send(payload) {
            Ok(()) => true,
            Err(e) => {
                warn!("Send to {} failed: {e}", self.peer_id);
                false
            }
        }
    }

    /// Close and release the bound connection.
    pub fn destroy(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
        self.state = LinkState::Closed;
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.peer_id.clone(),
            state: self.state,
            direction: self.direction,
            connected_at: self.connected_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
