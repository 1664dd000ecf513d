//! MeshNode: async driver that owns a coordinator on its own task.
//!
//! [`MeshNode::spawn`] moves a [`MeshCoordinator`] onto a tokio task that
//! processes application commands and transport events one at a time. The
//! returned [`MeshHandle`] is the application's API: cheap to clone, usable
//! from any task.
//!
//! Callbacks registered with [`MeshHandle::on`] run on the node task, inline
//! with the event that caused them. They must not block.

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::coordinator::{ConnectFuture, MeshCoordinator};
use crate::error::MeshError;
use crate::event::{EventTag, MeshEvent};
use crate::identity::PeerId;
use crate::link::PeerInfo;
use crate::transport::{EventReceiver, Transport};

/// Requests from a [`MeshHandle`] to the node task.
enum Command {
    Connect {
        peer_id: PeerId,
        reply: oneshot::Sender<ConnectFuture>,
    },
    Broadcast {
        payload: Value,
        reply: oneshot::Sender<usize>,
    },
    SendTo {
        peer_id: PeerId,
        payload: Value,
        reply: oneshot::Sender<Result<(), MeshError>>,
    },
    AllPeers {
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    LocalId {
        reply: oneshot::Sender<Option<PeerId>>,
    },
    On {
        tag: EventTag,
        callback: crate::event::EventCallback,
        reply: oneshot::Sender<()>,
    },
    RemovePeer {
        peer_id: PeerId,
    },
    RemoveAll,
    Destroy,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connect { .. } => "Connect",
            Self::Broadcast { .. } => "Broadcast",
            Self::SendTo { .. } => "SendTo",
            Self::AllPeers { .. } => "AllPeers",
            Self::LocalId { .. } => "LocalId",
            Self::On { .. } => "On",
            Self::RemovePeer { .. } => "RemovePeer",
            Self::RemoveAll => "RemoveAll",
            Self::Destroy => "Destroy",
        };
        f.write_str(name)
    }
}

/// A mesh node that has not started yet.
///
/// Callbacks registered here are in place before the local identity is
/// registered, so no early event is missed.
pub struct MeshNode<T: Transport> {
    task: NodeTask<T>,
    handle: MeshHandle,
}

impl<T: Transport> MeshNode<T> {
    /// `events` must be the receiving half of the channel `transport`
    /// reports into.
    pub fn new(transport: T, events: EventReceiver<T::Conn>, config: MeshConfig) -> Self {
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let (closed_tx, closed_rx) = watch::channel(false);

        Self {
            task: NodeTask {
                mesh: MeshCoordinator::new(transport, config),
                commands: command_rx,
                events,
                closed_tx,
            },
            handle: MeshHandle {
                commands: command_tx,
                closed: closed_rx,
            },
        }
    }

    /// Register the callback for `tag` before the node starts.
    pub fn on<F>(mut self, tag: EventTag, callback: F) -> Self
    where
        F: FnMut(&MeshEvent) + Send + 'static,
    {
        self.task.mesh.on(tag, Box::new(callback));
        self
    }

    /// Register the local identity and start driving the mesh on a tokio
    /// task.
    pub fn spawn(self) -> MeshHandle {
        let Self { mut task, handle } = self;
        let requested = task.mesh.config().requested_id.clone();
        task.mesh.initialize(requested);
        tokio::spawn(task.run());
        handle
    }

    /// Shorthand for `MeshNode::new(..).spawn()`.
    pub fn start(transport: T, events: EventReceiver<T::Conn>, config: MeshConfig) -> MeshHandle {
        Self::new(transport, events, config).spawn()
    }
}

/// State owned by the running node task.
struct NodeTask<T: Transport> {
    mesh: MeshCoordinator<T>,
    commands: mpsc::Receiver<Command>,
    events: EventReceiver<T::Conn>,
    closed_tx: watch::Sender<bool>,
}

impl<T: Transport> NodeTask<T> {
    async fn run(mut self) {
        let mut handles_dropped = false;

        loop {
            tokio::select! {
                command = self.commands.recv(), if !handles_dropped => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All mesh handles dropped, destroying");
                        handles_dropped = true;
                        self.mesh.destroy();
                    }
                },

                event = self.events.recv() => match event {
                    Some(event) => self.mesh.handle_event(event),
                    None => {
                        warn!("Transport event channel closed");
                        break;
                    }
                },
            }

            if self.mesh.is_destroyed() {
                break;
            }
        }

        let _ = self.closed_tx.send(true);
        info!(
            "Mesh node {} stopped",
            self.mesh
                .local_id()
                .map(PeerId::as_str)
                .unwrap_or("(unassigned)")
        );
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { peer_id, reply } => {
                let _ = reply.send(self.mesh.connect_to_peer(peer_id));
            }
            Command::Broadcast { payload, reply } => {
                let _ = reply.send(self.mesh.broadcast(&payload));
            }
            Command::SendTo {
                peer_id,
                payload,
                reply,
            } => {
                let _ = reply.send(self.mesh.send_to(&peer_id, &payload));
            }
            Command::AllPeers { reply } => {
                let _ = reply.send(self.mesh.all_peers());
            }
            Command::LocalId { reply } => {
                let _ = reply.send(self.mesh.local_id().cloned());
            }
            Command::On {
                tag,
                callback,
                reply,
            } => {
                self.mesh.on(tag, callback);
                let _ = reply.send(());
            }
            Command::RemovePeer { peer_id } => self.mesh.remove_peer(&peer_id),
            Command::RemoveAll => self.mesh.remove_all(),
            Command::Destroy => self.mesh.destroy(),
        }
    }
}

/// Application handle to a running [`MeshNode`].
///
/// Every method fails with [`MeshError::Destroyed`] once the node task has
/// stopped.
#[derive(Debug, Clone)]
pub struct MeshHandle {
    commands: mpsc::Sender<Command>,
    closed: watch::Receiver<bool>,
}

impl MeshHandle {
    async fn submit(&self, command: Command) -> Result<(), MeshError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| MeshError::Destroyed)
    }

    async fn request<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, MeshError> {
        let (reply, rx) = oneshot::channel();
        self.submit(build(reply)).await?;
        rx.await.map_err(|_| MeshError::Destroyed)
    }

    /// Connect to `peer_id`. Resolves once the peer is connected; concurrent
    /// calls for the same peer share one attempt and one outcome.
    pub async fn connect_to_peer(&self, peer_id: impl Into<PeerId>) -> Result<(), MeshError> {
        let peer_id = peer_id.into();
        let attempt = self
            .request(|reply| Command::Connect { peer_id, reply })
            .await?;
        attempt.await.map_err(MeshError::from)
    }

    /// Send `payload` to every connected peer. Returns how many accepted it.
    pub async fn broadcast(&self, payload: Value) -> Result<usize, MeshError> {
        self.request(|reply| Command::Broadcast { payload, reply })
            .await
    }

    pub async fn send_to(&self, peer_id: &PeerId, payload: Value) -> Result<(), MeshError> {
        let peer_id = peer_id.clone();
        self.request(|reply| Command::SendTo {
            peer_id,
            payload,
            reply,
        })
        .await?
    }

    /// Snapshot of the connected peers.
    pub async fn all_peers(&self) -> Result<Vec<PeerInfo>, MeshError> {
        self.request(|reply| Command::AllPeers { reply }).await
    }

    /// The local identity, once the discovery service has assigned it.
    pub async fn local_id(&self) -> Result<Option<PeerId>, MeshError> {
        self.request(|reply| Command::LocalId { reply }).await
    }

    /// Register the callback for `tag`, replacing any previous one.
    pub async fn on<F>(&self, tag: EventTag, callback: F) -> Result<(), MeshError>
    where
        F: FnMut(&MeshEvent) + Send + 'static,
    {
        let callback = Box::new(callback);
        self.request(|reply| Command::On {
            tag,
            callback,
            reply,
        })
        .await
    }

    pub async fn remove_peer(&self, peer_id: &PeerId) -> Result<(), MeshError> {
        self.submit(Command::RemovePeer {
            peer_id: peer_id.clone(),
        })
        .await
    }

    /// Close every link without per-peer events.
    pub async fn remove_all(&self) -> Result<(), MeshError> {
        self.submit(Command::RemoveAll).await
    }

    /// Tear the node down. Returns once the request is queued; use
    /// [`closed`](Self::closed) to wait for the task to stop. Calling this on
    /// a stopped node is a no-op.
    pub async fn destroy(&self) {
        if self.submit(Command::Destroy).await.is_err() {
            debug!("Destroy requested on a stopped mesh node");
        }
    }

    /// Wait until the node task has stopped.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|stopped| *stopped).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.commands.is_closed()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
