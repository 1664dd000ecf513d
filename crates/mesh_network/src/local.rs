//! Local node: the local identity's registration with the discovery service.

use tracing::{debug, info};

use crate::error::MeshError;
use crate::identity::PeerId;
use crate::transport::Transport;

/// Owns the transport and tracks the local identity's lifecycle.
///
/// The coordinator forwards identity events here and decides how to react;
/// this type only records state and relays requests to the transport.
#[derive(Debug)]
pub struct LocalNode<T> {
    transport: T,
    requested: Option<PeerId>,
    id: Option<PeerId>,
    disconnected: bool,
    closed: bool,
    teardown_requested: bool,
}

impl<T: Transport> LocalNode<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            requested: None,
            id: None,
            disconnected: false,
            closed: false,
            teardown_requested: false,
        }
    }

    /// Register with the discovery service.
    pub fn open(&mut self, requested: Option<&PeerId>) {
        match requested {
            Some(id) => debug!("Registering with discovery service as {id}"),
            None => debug!("Registering with discovery service"),
        }
        self.requested = requested.cloned();
        self.transport.register(requested);
    }

    /// The assigned identity, once known.
    pub fn id(&self) -> Option<&PeerId> {
        self.id.as_ref()
    }

    /// Whether `peer_id` names this node: the assigned identity, or the
    /// requested one while registration is still in flight.
    pub fn is_own(&self, peer_id: &PeerId) -> bool {
        match &self.id {
            Some(id) => id == peer_id,
            None => self.requested.as_ref() == Some(peer_id),
        }
    }

    /// The identity, if it is assigned and currently reachable.
    pub fn open_id(&self) -> Option<&PeerId> {
        if self.disconnected || self.closed {
            return None;
        }
        self.id.as_ref()
    }

    /// Whether an assigned identity has lost its signaling connection.
    pub fn is_disconnected(&self) -> bool {
        self.id.is_some() && self.disconnected && !self.closed
    }

    /// Whether the identity has been torn down.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn on_assigned(&mut self, id: PeerId) {
        info!("Registered with discovery service as {id}");
        self.id = Some(id);
        self.disconnected = false;
    }

    pub fn on_disconnected(&mut self) {
        info!("Lost connection to discovery service");
        self.disconnected = true;
    }

    pub fn on_closed(&mut self) {
        info!("Local identity closed");
        self.closed = true;
    }

    pub fn request_reconnect(&mut self) {
        if self.closed || self.teardown_requested {
            return;
        }
        debug!("Requesting reconnect to discovery service");
        self.transport.reconnect();
    }

    /// Ask the transport to release the identity. Returns `false` when a
    /// teardown is already underway or complete.
    pub fn request_teardown(&mut self) -> bool {
        if self.closed || self.teardown_requested {
            return false;
        }
        self.teardown_requested = true;
        self.transport.teardown();
        true
    }

    pub fn connect(&mut self, remote: &PeerId) -> Result<T::Conn, MeshError> {
        self.transport.connect(remote)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
