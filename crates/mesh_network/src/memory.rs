//! In-process transport: a broker that connects nodes living in one process.
//!
//! [`MemoryNetwork`] plays the discovery service: it hands out identities and
//! routes connection requests between registered nodes. Every node gets its
//! own event channel, so the nodes behave like independent peers even though
//! they share an address space.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::MeshError;
use crate::identity::PeerId;
use crate::transport::{
    Connection, ConnectionEvent, ConnectionId, EventReceiver, EventSender, IdentityError,
    IdentityErrorKind, IdentityEvent, Transport, TransportEvent,
};

type MemoryEvent = TransportEvent<MemoryConnection>;

#[derive(Debug, Default)]
struct NetworkState {
    /// Registered identities and the channel each one listens on.
    nodes: HashMap<PeerId, EventSender<MemoryConnection>>,
    /// Every connection end owned by a registered identity.
    connections: HashMap<PeerId, Vec<MemoryConnection>>,
    next_connection: u64,
}

impl NetworkState {
    fn allocate_connection_id(&mut self) -> ConnectionId {
        self.next_connection += 1;
        ConnectionId(self.next_connection)
    }

    fn track(&mut self, owner: &PeerId, connection: MemoryConnection) {
        let ends = self.connections.entry(owner.clone()).or_default();
        ends.retain(|end| !end.pipe.closed.load(Ordering::Acquire));
        ends.push(connection);
    }
}

/// Shared broker. Clone it to hand the same network to many nodes.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport attached to this network, and the event channel
    /// it reports into.
    pub fn transport(&self) -> (MemoryTransport, EventReceiver<MemoryConnection>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = MemoryTransport {
            network: self.clone(),
            events,
            id: None,
            torn_down: false,
        };
        (transport, rx)
    }

    /// Identities currently registered, sorted.
    pub fn registered_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.state.lock().nodes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Simulate `id` losing its signaling connection. Existing peer
    /// connections stay up. Returns whether `id` was registered.
    pub fn disconnect(&self, id: &PeerId) -> bool {
        let state = self.state.lock();
        match state.nodes.get(id) {
            Some(inbox) => {
                debug!("Dropping signaling connection of {id}");
                let _ = inbox.send(TransportEvent::Identity(IdentityEvent::Disconnected));
                true
            }
            None => false,
        }
    }

    /// Number of open connection ends owned by `id`.
    pub fn open_connections(&self, id: &PeerId) -> usize {
        self.state
            .lock()
            .connections
            .get(id)
            .map(|ends| ends.iter().filter(|end| end.is_open()).count())
            .unwrap_or(0)
    }
}

/// Open/closed flags shared by both ends of one connection.
#[derive(Debug, Default)]
struct Pipe {
    open: AtomicBool,
    closed: AtomicBool,
}

/// One end of an in-process connection.
#[derive(Debug, Clone)]
pub struct MemoryConnection {
    id: ConnectionId,
    /// Identity owning this end.
    local: PeerId,
    remote: PeerId,
    pipe: Arc<Pipe>,
    /// Channel of this end's owner.
    local_events: EventSender<MemoryConnection>,
    /// Channel of the other end's owner.
    remote_events: EventSender<MemoryConnection>,
}

impl MemoryConnection {
    fn event(&self, peer: &PeerId, event: ConnectionEvent) -> MemoryEvent {
        TransportEvent::Connection {
            id: self.id,
            peer: peer.clone(),
            event,
        }
    }

    /// The end the remote peer holds.
    fn mirror(&self) -> Self {
        Self {
            id: self.id,
            local: self.remote.clone(),
            remote: self.local.clone(),
            pipe: Arc::clone(&self.pipe),
            local_events: self.remote_events.clone(),
            remote_events: self.local_events.clone(),
        }
    }
}

impl Connection for MemoryConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote_peer(&self) -> &PeerId {
        &self.remote
    }

    fn is_open(&self) -> bool {
        self.pipe.open.load(Ordering::Acquire) && !self.pipe.closed.load(Ordering::Acquire)
    }

    fn send(&mut self, payload: &Value) -> Result<(), MeshError> {
        if !self.is_open() {
            return Err(MeshError::Transport(format!("{} is not open", self.id)));
        }
        self.remote_events
            .send(self.event(&self.local, ConnectionEvent::Data(payload.clone())))
            .map_err(|_| MeshError::Transport(format!("{} has gone away", self.remote)))
    }

    fn close(&mut self) {
        if self.pipe.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pipe.open.store(false, Ordering::Release);
        trace!("Closing {} between {} and {}", self.id, self.local, self.remote);
        let _ = self
            .local_events
            .send(self.event(&self.remote, ConnectionEvent::Close));
        let _ = self
            .remote_events
            .send(self.event(&self.local, ConnectionEvent::Close));
    }
}

/// A node's attachment to a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    events: EventSender<MemoryConnection>,
    id: Option<PeerId>,
    torn_down: bool,
}

impl MemoryTransport {
    fn emit(&self, event: MemoryEvent) {
        if self.events.send(event).is_err() {
            trace!("Event receiver dropped");
        }
    }

    fn identity_error(&self, kind: IdentityErrorKind, message: String) {
        self.emit(TransportEvent::Identity(IdentityEvent::Error(
            IdentityError::new(kind, message),
        )));
    }
}

impl Transport for MemoryTransport {
    type Conn = MemoryConnection;

    fn register(&mut self, requested: Option<&PeerId>) {
        if self.torn_down {
            self.identity_error(IdentityErrorKind::Other, "transport was torn down".into());
            return;
        }

        let id = requested.cloned().unwrap_or_else(PeerId::generate);
        {
            let mut state = self.network.state.lock();
            if state.nodes.contains_key(&id) {
                drop(state);
                warn!("Identity {id} is already registered");
                self.identity_error(IdentityErrorKind::UnavailableId, format!("ID \"{id}\" is taken"));
                return;
            }
            state.nodes.insert(id.clone(), self.events.clone());
        }

        self.id = Some(id.clone());
        self.emit(TransportEvent::Identity(IdentityEvent::Assigned(id)));
    }

    fn connect(&mut self, remote: &PeerId) -> Result<MemoryConnection, MeshError> {
        let Some(local) = self.id.clone() else {
            return Err(MeshError::Transport("not registered with the network".into()));
        };
        if self.torn_down {
            return Err(MeshError::Transport("transport was torn down".into()));
        }

        let mut state = self.network.state.lock();
        let id = state.allocate_connection_id();
        let remote_inbox = state.nodes.get(remote).cloned();

        let Some(remote_inbox) = remote_inbox else {
            drop(state);
            debug!("{local} cannot reach unknown peer {remote}");
            let connection = MemoryConnection {
                id,
                local,
                remote: remote.clone(),
                pipe: Arc::new(Pipe::default()),
                local_events: self.events.clone(),
                remote_events: self.events.clone(),
            };
            connection.pipe.closed.store(true, Ordering::Release);
            self.emit(connection.event(
                remote,
                ConnectionEvent::Error(format!("Could not connect to peer {remote}")),
            ));
            self.emit(connection.event(remote, ConnectionEvent::Close));
            return Ok(connection);
        };

        let connection = MemoryConnection {
            id,
            local: local.clone(),
            remote: remote.clone(),
            pipe: Arc::new(Pipe::default()),
            local_events: self.events.clone(),
            remote_events: remote_inbox.clone(),
        };
        let remote_end = connection.mirror();
        state.track(&local, connection.clone());
        state.track(remote, remote_end.clone());
        drop(state);

        debug!("{local} opening {id} to {remote}");
        connection.pipe.open.store(true, Ordering::Release);
        let _ = remote_inbox.send(TransportEvent::ConnectionRequest(remote_end));
        let _ = remote_inbox.send(connection.event(&local, ConnectionEvent::Open));
        self.emit(connection.event(remote, ConnectionEvent::Open));
        Ok(connection)
    }

    fn reconnect(&mut self) {
        if self.torn_down {
            return;
        }
        let Some(id) = self.id.clone() else {
            return;
        };
        let registered = self.network.state.lock().nodes.contains_key(&id);
        if registered {
            debug!("{id} reconnected to signaling");
            self.emit(TransportEvent::Identity(IdentityEvent::Assigned(id)));
        } else {
            self.identity_error(IdentityErrorKind::Network, format!("{id} is no longer registered"));
        }
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        let ends = match &self.id {
            Some(id) => {
                let mut state = self.network.state.lock();
                state.nodes.remove(id);
                state.connections.remove(id).unwrap_or_default()
            }
            None => Vec::new(),
        };
        for mut end in ends {
            end.close();
        }

        debug!("Transport torn down");
        self.emit(TransportEvent::Identity(IdentityEvent::Closed));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pid(s: &str) -> PeerId {
        PeerId::from(s)
    }

    fn drain(rx: &mut EventReceiver<MemoryConnection>) -> Vec<MemoryEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn registered(network: &MemoryNetwork, id: &str) -> (MemoryTransport, EventReceiver<MemoryConnection>) {
        let (mut transport, mut rx) = network.transport();
        transport.register(Some(&pid(id)));
        let events = drain(&mut rx);
        assert!(matches!(
            events.as_slice(),
            [TransportEvent::Identity(IdentityEvent::Assigned(assigned))] if *assigned == pid(id)
        ));
        (transport, rx)
    }

    fn connection_events(events: &[MemoryEvent]) -> Vec<(PeerId, ConnectionEvent)> {
        events
            .iter()
            .filter_map(|event| match event {
                TransportEvent::Connection { peer, event, .. } => Some((peer.clone(), event.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_register_generates_identity() {
        let network = MemoryNetwork::new();
        let (mut transport, mut rx) = network.transport();
        transport.register(None);

        match drain(&mut rx).as_slice() {
            [TransportEvent::Identity(IdentityEvent::Assigned(id))] => {
                assert!(!id.is_empty());
                assert_eq!(network.registered_ids(), vec![id.clone()]);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_identity_is_unavailable() {
        let network = MemoryNetwork::new();
        let (_alpha, _rx) = registered(&network, "alpha");

        let (mut second, mut rx) = network.transport();
        second.register(Some(&pid("alpha")));
        match drain(&mut rx).as_slice() {
            [TransportEvent::Identity(IdentityEvent::Error(err))] => {
                assert_eq!(err.kind, IdentityErrorKind::UnavailableId);
            }
            other => panic!("unexpected events: {other:?}"),
        }
        assert_eq!(network.registered_ids(), vec![pid("alpha")]);
    }

    #[test]
    fn test_connect_notifies_both_ends() {
        let network = MemoryNetwork::new();
        let (mut alpha, mut alpha_rx) = registered(&network, "alpha");
        let (_beta, mut beta_rx) = registered(&network, "beta");

        let conn = alpha.connect(&pid("beta")).unwrap();
        assert!(conn.is_open());
        assert_eq!(conn.remote_peer(), &pid("beta"));

        let beta_events = drain(&mut beta_rx);
        match &beta_events[0] {
            TransportEvent::ConnectionRequest(inbound) => {
                assert_eq!(inbound.remote_peer(), &pid("alpha"));
                assert_eq!(inbound.id(), conn.id());
            }
            other => panic!("expected connection request, got {other:?}"),
        }
        assert_eq!(
            connection_events(&beta_events),
            vec![(pid("alpha"), ConnectionEvent::Open)]
        );
        assert_eq!(
            connection_events(&drain(&mut alpha_rx)),
            vec![(pid("beta"), ConnectionEvent::Open)]
        );
    }

    #[test]
    fn test_data_arrives_in_order() {
        let network = MemoryNetwork::new();
        let (mut alpha, _alpha_rx) = registered(&network, "alpha");
        let (_beta, mut beta_rx) = registered(&network, "beta");

        let mut conn = alpha.connect(&pid("beta")).unwrap();
        drain(&mut beta_rx);
        for n in 0..3 {
            conn.send(&json!({"n": n})).unwrap();
        }

        let received: Vec<_> = connection_events(&drain(&mut beta_rx))
            .into_iter()
            .map(|(from, event)| {
                assert_eq!(from, pid("alpha"));
                event
            })
            .collect();
        assert_eq!(
            received,
            (0..3)
                .map(|n| ConnectionEvent::Data(json!({"n": n})))
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_close_notifies_both_ends_once() {
        let network = MemoryNetwork::new();
        let (mut alpha, mut alpha_rx) = registered(&network, "alpha");
        let (_beta, mut beta_rx) = registered(&network, "beta");

        let mut conn = alpha.connect(&pid("beta")).unwrap();
        drain(&mut alpha_rx);
        drain(&mut beta_rx);

        conn.close();
        conn.close();
        assert!(!conn.is_open());
        assert!(conn.send(&json!("late")).is_err());

        assert_eq!(
            connection_events(&drain(&mut alpha_rx)),
            vec![(pid("beta"), ConnectionEvent::Close)]
        );
        assert_eq!(
            connection_events(&drain(&mut beta_rx)),
            vec![(pid("alpha"), ConnectionEvent::Close)]
        );
    }

    #[test]
    fn test_connect_to_unknown_peer_errors_then_closes() {
        let network = MemoryNetwork::new();
        let (mut alpha, mut alpha_rx) = registered(&network, "alpha");

        let conn = alpha.connect(&pid("nobody")).unwrap();
        assert!(!conn.is_open());
        let events = connection_events(&drain(&mut alpha_rx));
        assert!(matches!(
            events.as_slice(),
            [(_, ConnectionEvent::Error(_)), (_, ConnectionEvent::Close)]
        ));
    }

    #[test]
    fn test_connect_before_register_fails() {
        let network = MemoryNetwork::new();
        let (mut transport, _rx) = network.transport();
        assert!(matches!(
            transport.connect(&pid("beta")),
            Err(MeshError::Transport(_))
        ));
    }

    #[test]
    fn test_teardown_closes_connections_and_frees_identity() {
        let network = MemoryNetwork::new();
        let (mut alpha, mut alpha_rx) = registered(&network, "alpha");
        let (_beta, mut beta_rx) = registered(&network, "beta");
        let conn = alpha.connect(&pid("beta")).unwrap();
        drain(&mut alpha_rx);
        drain(&mut beta_rx);
        assert_eq!(network.open_connections(&pid("beta")), 1);

        alpha.teardown();
        alpha.teardown();
        assert!(matches!(
            alpha.connect(&pid("beta")),
            Err(MeshError::Transport(_))
        ));
        assert!(!conn.is_open());
        assert_eq!(network.registered_ids(), vec![pid("beta")]);
        assert_eq!(network.open_connections(&pid("beta")), 0);

        let alpha_events = drain(&mut alpha_rx);
        assert!(matches!(
            alpha_events.last(),
            Some(TransportEvent::Identity(IdentityEvent::Closed))
        ));
        assert_eq!(
            connection_events(&drain(&mut beta_rx)),
            vec![(pid("alpha"), ConnectionEvent::Close)]
        );

        let (_again, _rx) = registered(&network, "alpha");
    }

    #[test]
    fn test_disconnect_and_reconnect() {
        let network = MemoryNetwork::new();
        let (mut alpha, mut alpha_rx) = registered(&network, "alpha");

        assert!(network.disconnect(&pid("alpha")));
        assert!(!network.disconnect(&pid("ghost")));
        assert!(matches!(
            drain(&mut alpha_rx).as_slice(),
            [TransportEvent::Identity(IdentityEvent::Disconnected)]
        ));

        alpha.reconnect();
        assert!(matches!(
            drain(&mut alpha_rx).as_slice(),
            [TransportEvent::Identity(IdentityEvent::Assigned(id))] if *id == pid("alpha")
        ));
    }
}
