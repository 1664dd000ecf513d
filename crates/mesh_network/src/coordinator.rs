//! Mesh coordinator: pending/connected membership and the announce protocol.
//!
//! Whenever a link opens, every *other* connected peer is told about the new
//! peer and connects to it in turn, so the overlay converges on a complete
//! graph. The coordinator is a plain state machine: the caller feeds it one
//! transport event or application request at a time through `&mut self`.
//!
//! Membership invariants:
//! - a peer id is in at most one of `pending` / `connected`;
//! - one link per remote peer;
//! - a connect attempt exists only while its peer is pending.

use std::collections::HashMap;

use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

use crate::config::{MeshConfig, RebindPolicy};
use crate::error::{ConnectError, MeshError};
use crate::event::{EventBus, EventCallback, EventTag, MeshEvent};
use crate::identity::PeerId;
use crate::link::{PeerInfo, PeerLink};
use crate::local::LocalNode;
use crate::message::{self, ControlMessage, Inbound};
use crate::transport::{
    Connection, ConnectionEvent, ConnectionId, Direction, IdentityEvent, Transport, TransportEvent,
};

/// Completion of a connect request. Every caller waiting on the same peer
/// holds a clone of one shared future, so all of them settle together.
pub type ConnectFuture = Shared<BoxFuture<'static, Result<(), ConnectError>>>;

fn settled(outcome: Result<(), ConnectError>) -> ConnectFuture {
    futures::future::ready(outcome).boxed().shared()
}

/// One in-flight connect attempt and the future its waiters share.
struct PendingAttempt {
    tx: oneshot::Sender<Result<(), ConnectError>>,
    future: ConnectFuture,
}

impl PendingAttempt {
    fn new(peer_id: PeerId) -> Self {
        let (tx, rx) = oneshot::channel();
        let future = async move {
            rx.await
                .unwrap_or_else(|_| Err(ConnectError::Removed(peer_id)))
        }
        .boxed()
        .shared();
        Self { tx, future }
    }

    fn settle(self, outcome: Result<(), ConnectError>) {
        let _ = self.tx.send(outcome);
    }
}

/// Drives mesh formation for one local node.
pub struct MeshCoordinator<T: Transport> {
    local: LocalNode<T>,
    config: MeshConfig,
    pending: HashMap<PeerId, PeerLink<T::Conn>>,
    connected: HashMap<PeerId, PeerLink<T::Conn>>,
    attempts: HashMap<PeerId, PendingAttempt>,
    events: EventBus,
    destroyed: bool,
}

impl<T: Transport> MeshCoordinator<T> {
    pub fn new(transport: T, config: MeshConfig) -> Self {
        Self {
            local: LocalNode::new(transport),
            config,
            pending: HashMap::new(),
            connected: HashMap::new(),
            attempts: HashMap::new(),
            events: EventBus::new(),
            destroyed: false,
        }
    }

    /// Register the local identity and start accepting connection requests.
    pub fn initialize(&mut self, local_id: Option<PeerId>) {
        self.local.open(local_id.as_ref());
    }

    pub fn local_id(&self) -> Option<&PeerId> {
        self.local.id()
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.connected.contains_key(peer_id)
    }

    pub fn is_pending(&self, peer_id: &PeerId) -> bool {
        self.pending.contains_key(peer_id)
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    // -----------------------------------------------------------------------
    // Application surface
    // -----------------------------------------------------------------------

    /// Register the single callback for `tag`, replacing any previous one.
    ///
    /// `Open` replays immediately if the identity is already open, and
    /// `Disconnected` replays if it is currently disconnected. No other tag
    /// replays.
    pub fn on(&mut self, tag: EventTag, callback: EventCallback) {
        self.events.register(tag, callback);
        match tag {
            EventTag::Open => {
                if let Some(id) = self.local.open_id().cloned() {
                    self.events.emit(&MeshEvent::Open(id));
                }
            }
            EventTag::Disconnected if self.local.is_disconnected() => {
                self.events.emit(&MeshEvent::Disconnected);
            }
            _ => {}
        }
    }

    /// Send `payload` to every connected peer. Returns how many links
    /// accepted it; a failure on one peer does not affect the others.
    pub fn broadcast(&mut self, payload: &Value) -> usize {
        self.connected
            .values_mut()
            .map(|link| link.send(payload))
            .filter(|sent| *sent)
            .count()
    }

    pub fn send_to(&mut self, peer_id: &PeerId, payload: &Value) -> Result<(), MeshError> {
        let link = self
            .connected
            .get_mut(peer_id)
            .ok_or_else(|| MeshError::PeerNotFound(peer_id.clone()))?;
        link.send(payload);
        Ok(())
    }

    /// Snapshot of the connected peers.
    pub fn all_peers(&self) -> Vec<PeerInfo> {
        self.connected.values().map(PeerLink::info).collect()
    }

    /// Connect to `peer_id`, or join the attempt already in flight.
    pub fn connect_to_peer(&mut self, peer_id: PeerId) -> ConnectFuture {
        if self.destroyed {
            return settled(Err(ConnectError::Destroyed(peer_id)));
        }
        if self.is_local(&peer_id) {
            warn!("Refusing to connect to own identity {peer_id}");
            return settled(Err(ConnectError::SelfConnect(peer_id)));
        }
        if self.connected.contains_key(&peer_id) {
            return settled(Ok(()));
        }
        if let Err(e) = self.start_attempt(&peer_id) {
            return settled(Err(e));
        }

        self.attempts
            .entry(peer_id.clone())
            .or_insert_with(|| PendingAttempt::new(peer_id))
            .future
            .clone()
    }

    /// Drop a peer from whichever set holds it. Only a connected peer
    /// produces `peer-disconnected`.
    pub fn remove_peer(&mut self, peer_id: &PeerId) {
        self.remove_peer_with(peer_id, ConnectError::Removed(peer_id.clone()));
    }

    /// Close every link without per-peer events.
    pub fn remove_all(&mut self) {
        let dropped = self.pending.len() + self.connected.len();
        self.close_all_links();
        for (peer_id, attempt) in self.attempts.drain() {
            attempt.settle(Err(ConnectError::Removed(peer_id)));
        }
        debug!("Removed all {dropped} peer link(s)");
    }

    /// Tear the mesh down. Idempotent.
    ///
    /// While the local identity is alive this only requests its teardown;
    /// the transport's `closed` confirmation finishes the job.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        if !self.local.is_closed() {
            if self.local.request_teardown() {
                info!("Tearing down local identity");
            }
            return;
        }

        self.destroyed = true;
        self.events.emit(&MeshEvent::Destroyed);
        self.close_all_links();
        for (peer_id, attempt) in self.attempts.drain() {
            attempt.settle(Err(ConnectError::Destroyed(peer_id)));
        }
        self.events.clear();
        info!("Mesh destroyed");
    }

    // -----------------------------------------------------------------------
    // Transport events
    // -----------------------------------------------------------------------

    pub fn handle_event(&mut self, event: TransportEvent<T::Conn>) {
        if self.destroyed {
            if let TransportEvent::ConnectionRequest(mut connection) = event {
                connection.close();
            }
            trace!("Ignoring transport event after destroy");
            return;
        }

        match event {
            TransportEvent::Identity(event) => self.on_identity_event(event),
            TransportEvent::ConnectionRequest(connection) => self.on_connection_request(connection),
            TransportEvent::Connection { id, peer, event } => {
                self.on_connection_event(id, peer, event)
            }
        }
    }

    fn on_identity_event(&mut self, event: IdentityEvent) {
        match event {
            IdentityEvent::Assigned(id) => {
                self.local.on_assigned(id.clone());
                self.events.emit(&MeshEvent::Open(id));
            }
            IdentityEvent::Disconnected => {
                self.local.on_disconnected();
                self.events.emit(&MeshEvent::Disconnected);
                if self.config.auto_reconnect {
                    self.local.request_reconnect();
                }
            }
            IdentityEvent::Closed => {
                self.local.on_closed();
                self.events.emit(&MeshEvent::Close);
                self.destroy();
            }
            IdentityEvent::Error(err) => {
                warn!("Discovery service error ({:?}): {}", err.kind, err.message);
                self.events.emit(&MeshEvent::Error(err.into()));
            }
        }
    }

    fn on_connection_request(&mut self, mut connection: T::Conn) {
        let remote = connection.remote_peer().clone();
        if self.is_local(&remote) {
            warn!("Closing inbound {} from own identity", connection.id());
            connection.close();
            return;
        }

        if !self.connected.contains_key(&remote) && !self.pending.contains_key(&remote) {
            debug!("Inbound {} from {remote}", connection.id());
            let mut link = PeerLink::new(remote.clone());
            match link.bind(connection, Direction::Inbound) {
                Ok(()) => {
                    self.pending.insert(remote, link);
                }
                Err(e) => warn!("Inbound connection from {remote} rejected: {e}"),
            }
            return;
        }

        let policy = self.config.rebind_policy;
        let local_id = self.local.id().cloned();
        let existing = match self.connected.get_mut(&remote) {
            Some(link) => Some(link),
            None => self.pending.get_mut(&remote),
        };
        let Some(link) = existing else {
            return;
        };

        if keeps_existing(policy, link, connection.id(), local_id.as_ref()) {
            debug!(
                "Keeping current link to {remote}, closing inbound {}",
                connection.id()
            );
            connection.close();
            return;
        }
        info!("Rebinding {remote} to inbound {}", connection.id());
        if let Err(e) = link.bind(connection, Direction::Inbound) {
            warn!("Rebind for {remote} rejected: {e}");
        }
    }

    fn on_connection_event(&mut self, id: ConnectionId, peer: PeerId, event: ConnectionEvent) {
        let Some(link) = self.link(&peer) else {
            debug!("Ignoring {id} event for unknown peer {peer}");
            return;
        };

        // Data from a known peer is delivered even on a superseded
        // connection; lifecycle events are not.
        let is_current = link.is_current(id);
        match event {
            ConnectionEvent::Data(payload) => {
                if !is_current {
                    trace!("Accepting data from {peer} on superseded {id}");
                }
                self.on_data(peer, payload);
            }
            event if !is_current => {
                debug!("Ignoring {event:?} from stale {id} for {peer}");
            }
            ConnectionEvent::Open => self.on_peer_open(&peer),
            ConnectionEvent::Close => {
                debug!("{id} to {peer} closed");
                let reason = ConnectError::Closed(peer.clone());
                self.remove_peer_with(&peer, reason);
            }
            ConnectionEvent::Error(message) => {
                if self.pending.contains_key(&peer) {
                    warn!("Connection attempt to {peer} failed: {message}");
                    let reason = ConnectError::Failed {
                        peer: peer.clone(),
                        message: message.clone(),
                    };
                    self.remove_peer_with(&peer, reason);
                } else {
                    warn!("Connection error with {peer}: {message}");
                }
                self.events
                    .emit(&MeshEvent::Error(MeshError::Connection { peer, message }));
            }
        }
    }

    /// Promote a pending peer, resolve its waiters, and announce it.
    fn on_peer_open(&mut self, peer_id: &PeerId) {
        if let Some(mut link) = self.pending.remove(peer_id) {
            link.mark_open();
            self.connected.insert(peer_id.clone(), link);
            info!("Peer {peer_id} connected");

            if let Some(attempt) = self.attempts.remove(peer_id) {
                attempt.settle(Ok(()));
            }
            self.announce(peer_id);
            self.events
                .emit(&MeshEvent::PeerConnected(peer_id.clone()));
        } else if let Some(link) = self.connected.get_mut(peer_id) {
            if link.mark_open() {
                debug!("Rebound connection to {peer_id} is open");
            }
        }
    }

    /// Tell every other connected peer about `peer_id`.
    fn announce(&mut self, peer_id: &PeerId) {
        let payload = match ControlMessage::announce(peer_id.clone()).to_value() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode announce for {peer_id}: {e}");
                return;
            }
        };

        let notified = self
            .connected
            .iter_mut()
            .filter(|(id, _)| *id != peer_id)
            .map(|(_, link)| link.send(&payload))
            .filter(|sent| *sent)
            .count();
        debug!("Announced {peer_id} to {notified} peer(s)");
    }

    fn on_data(&mut self, from: PeerId, payload: Value) {
        match message::decode(payload) {
            Ok(Inbound::Control(ControlMessage::AnnouncePeer { peer_id })) => {
                self.on_announce(&from, peer_id);
            }
            Ok(Inbound::Application(payload)) => {
                self.events.emit(&MeshEvent::ReceivedData {
                    peer_id: from,
                    payload,
                });
            }
            Err(e) => warn!("Dropping payload from {from}: {e}"),
        }
    }

    fn on_announce(&mut self, from: &PeerId, peer_id: PeerId) {
        if self.is_local(&peer_id) {
            trace!("{from} announced our own identity");
            return;
        }
        if self.connected.contains_key(&peer_id) || self.pending.contains_key(&peer_id) {
            trace!("{from} announced {peer_id}, already known");
            return;
        }
        debug!("{from} announced {peer_id}, connecting");
        if let Err(e) = self.start_attempt(&peer_id) {
            warn!("Could not follow announce of {peer_id}: {e}");
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn is_local(&self, peer_id: &PeerId) -> bool {
        self.local.is_own(peer_id)
    }

    fn link(&self, peer_id: &PeerId) -> Option<&PeerLink<T::Conn>> {
        self.connected
            .get(peer_id)
            .or_else(|| self.pending.get(peer_id))
    }

    /// Ensure a link exists for `peer_id`, issuing a transport connect if
    /// neither set holds one.
    fn start_attempt(&mut self, peer_id: &PeerId) -> Result<(), ConnectError> {
        if self.pending.contains_key(peer_id) || self.connected.contains_key(peer_id) {
            return Ok(());
        }

        let failed = |e: MeshError| ConnectError::Failed {
            peer: peer_id.clone(),
            message: e.to_string(),
        };

        let connection = self.local.connect(peer_id).map_err(failed)?;
        let mut link = PeerLink::new(peer_id.clone());
        let connection_id = connection.id();
        link.bind(connection, Direction::Outbound).map_err(failed)?;

        debug!("Connecting to {peer_id} over {connection_id}");
        self.pending.insert(peer_id.clone(), link);
        Ok(())
    }

    fn remove_peer_with(&mut self, peer_id: &PeerId, reason: ConnectError) {
        if let Some(mut link) = self.connected.remove(peer_id) {
            info!("Removing peer {peer_id}");
            link.destroy();
            self.events
                .emit(&MeshEvent::PeerDisconnected(peer_id.clone()));
        } else if let Some(mut link) = self.pending.remove(peer_id) {
            debug!("Removing pending peer {peer_id}");
            link.destroy();
            if let Some(attempt) = self.attempts.remove(peer_id) {
                attempt.settle(Err(reason));
            }
        }
    }

    fn close_all_links(&mut self) {
        for (_, mut link) in self.pending.drain() {
            link.destroy();
        }
        for (_, mut link) in self.connected.drain() {
            link.destroy();
        }
    }
}

/// Whether an inbound connection should be refused in favour of the link's
/// current connection.
///
/// Both ends of a simultaneous connect see the same two connections, so each
/// rule has to pick the same survivor on both sides.
fn keeps_existing<C: Connection>(
    policy: RebindPolicy,
    link: &PeerLink<C>,
    incoming: ConnectionId,
    local_id: Option<&PeerId>,
) -> bool {
    match policy {
        RebindPolicy::LastConnectionWins => link
            .connection_id()
            .is_some_and(|current| current > incoming),
        RebindPolicy::LowerInitiatorWins => {
            link.direction() == Some(Direction::Outbound)
                && local_id.is_some_and(|local| local < link.peer_id())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
