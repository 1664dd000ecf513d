//! Mesh Network: self-assembling full-mesh peer overlay.
//!
//! Every node keeps a direct connection to every other node it has learned
//! about. Connecting two nodes is enough to pull in the rest: whenever a link
//! opens, the node gossips the new peer's identity to all of its other peers,
//! and they connect to it in turn.
//!
//! # Architecture
//!
//! - **Transport**: pluggable ([`Transport`] / [`Connection`]). Connection
//!   establishment and identity registration live below the mesh. An
//!   in-process implementation ([`MemoryNetwork`]) ships for tests and
//!   simulation.
//! - **Coordinator**: [`MeshCoordinator`], a single-owner state machine that
//!   tracks pending/connected peers, deduplicates connect attempts, and runs
//!   the announce protocol.
//! - **Driver**: [`MeshNode`] owns a coordinator on a tokio task;
//!   [`MeshHandle`] is the application API.
//! - **Events**: one callback per [`EventTag`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use mesh_network::{EventTag, MemoryNetwork, MeshConfig, MeshEvent, MeshNode};
//!
//! # async fn example() -> Result<(), mesh_network::MeshError> {
//! let network = MemoryNetwork::new();
//! let (transport, events) = network.transport();
//! let mesh = MeshNode::start(transport, events, MeshConfig::default());
//!
//! mesh.on(EventTag::ReceivedData, |event| {
//!     if let MeshEvent::ReceivedData { peer_id, payload } = event {
//!         println!("{peer_id}: {payload}");
//!     }
//! })
//! .await?;
//! mesh.connect_to_peer("some-peer").await?;
//! mesh.broadcast(serde_json::json!({"hello": "mesh"})).await?;
//! mesh.destroy().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod identity;
pub mod link;
pub mod local;
pub mod memory;
pub mod message;
pub mod node;
pub mod transport;

#[cfg(test)]
mod testing;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::{MeshConfig, RebindPolicy};
pub use coordinator::{ConnectFuture, MeshCoordinator};
pub use error::{ConnectError, MeshError};
pub use event::{EventBus, EventCallback, EventTag, MeshEvent};
pub use identity::PeerId;
pub use link::{LinkState, PeerInfo, PeerLink};
pub use local::LocalNode;
pub use memory::{MemoryConnection, MemoryNetwork, MemoryTransport};
pub use node::{MeshHandle, MeshNode};
pub use transport::{Connection, Direction, Transport, TransportEvent};
