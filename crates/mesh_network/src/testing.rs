//! Recording transport doubles shared by unit tests.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::MeshError;
use crate::identity::PeerId;
use crate::transport::{Connection, ConnectionId, Transport};

#[derive(Debug, Default)]
pub struct MockWire {
    pub open: bool,
    pub closed: bool,
    pub sent: Vec<Value>,
}

/// A connection whose wire state stays inspectable after it is moved into a
/// peer link.
#[derive(Debug, Clone)]
pub struct MockConnection {
    id: ConnectionId,
    remote: PeerId,
    pub wire: Arc<Mutex<MockWire>>,
}

impl MockConnection {
    pub fn new(id: u64, remote: impl Into<PeerId>) -> Self {
        Self {
            id: ConnectionId(id),
            remote: remote.into(),
            wire: Arc::new(Mutex::new(MockWire::default())),
        }
    }

    /// Mark the wire open, as the transport would before emitting `open`.
    pub fn set_open(&self) {
        self.wire.lock().open = true;
    }

    pub fn sent(&self) -> Vec<Value> {
        self.wire.lock().sent.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.wire.lock().closed
    }
}

impl Connection for MockConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote_peer(&self) -> &PeerId {
        &self.remote
    }

    fn is_open(&self) -> bool {
        let wire = self.wire.lock();
        wire.open && !wire.closed
    }

    fn send(&mut self, payload: &Value) -> Result<(), MeshError> {
        let mut wire = self.wire.lock();
        if wire.closed {
            return Err(MeshError::Transport("closed".into()));
        }
        wire.sent.push(payload.clone());
        Ok(())
    }

    fn close(&mut self) {
        let mut wire = self.wire.lock();
        wire.open = false;
        wire.closed = true;
    }
}

#[derive(Debug, Default)]
pub struct MockTransportState {
    pub registrations: Vec<Option<PeerId>>,
    pub connects: Vec<MockConnection>,
    pub reconnects: usize,
    pub teardowns: usize,
    pub refuse_connects: bool,
    next_id: u64,
}

impl MockTransportState {
    pub fn connects_to(&self, remote: &PeerId) -> Vec<MockConnection> {
        self.connects
            .iter()
            .filter(|c| c.remote_peer() == remote)
            .cloned()
            .collect()
    }

    pub fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Transport double that records every request and never emits events on
/// its own; tests feed events to the coordinator by hand.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    pub state: Arc<Mutex<MockTransportState>>,
}

impl MockTransport {
    /// Create an inbound connection with an id that never collides with
    /// outbound ones.
    pub fn inbound(&self, remote: impl Into<PeerId>) -> MockConnection {
        let id = self.state.lock().allocate_id();
        MockConnection::new(id, remote)
    }
}

impl Transport for MockTransport {
    type Conn = MockConnection;

    fn register(&mut self, requested: Option<&PeerId>) {
        self.state.lock().registrations.push(requested.cloned());
    }

    fn connect(&mut self, remote: &PeerId) -> Result<MockConnection, MeshError> {
        let mut state = self.state.lock();
        if state.refuse_connects {
            return Err(MeshError::Transport("refused".into()));
        }
        let id = state.allocate_id();
        let connection = MockConnection::new(id, remote.clone());
        state.connects.push(connection.clone());
        Ok(connection)
    }

    fn reconnect(&mut self) {
        self.state.lock().reconnects += 1;
    }

    fn teardown(&mut self) {
        self.state.lock().teardowns += 1;
    }
}
