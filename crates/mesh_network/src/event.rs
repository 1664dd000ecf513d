//! Event bus: lifecycle notifications handed to the application.
//!
//! One callback per [`EventTag`]. Registering a tag again replaces the
//! previous callback; it never appends. Dispatch runs inline with the
//! transport event that caused it.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;
use tracing::trace;

use crate::error::MeshError;
use crate::identity::PeerId;

/// Tags an application can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTag {
    ReceivedData,
    PeerConnected,
    PeerDisconnected,
    Open,
    Disconnected,
    Error,
    Close,
    Destroyed,
}

impl EventTag {
    pub const ALL: [EventTag; 8] = [
        Self::ReceivedData,
        Self::PeerConnected,
        Self::PeerDisconnected,
        Self::Open,
        Self::Disconnected,
        Self::Error,
        Self::Close,
        Self::Destroyed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReceivedData => "received-data",
            Self::PeerConnected => "peer-connected",
            Self::PeerDisconnected => "peer-disconnected",
            Self::Open => "open",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
            Self::Close => "close",
            Self::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for EventTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle notification.
#[derive(Debug)]
pub enum MeshEvent {
    /// Application payload from a connected peer.
    ReceivedData { peer_id: PeerId, payload: Value },
    /// A peer moved from pending to connected.
    PeerConnected(PeerId),
    /// A connected peer was removed.
    PeerDisconnected(PeerId),
    /// The local identity was assigned (or re-assigned after reconnect).
    Open(PeerId),
    /// The local identity lost its signaling connection.
    Disconnected,
    Error(MeshError),
    /// The local identity was torn down.
    Close,
    Destroyed,
}

impl MeshEvent {
    pub fn tag(&self) -> EventTag {
        match self {
            Self::ReceivedData { .. } => EventTag::ReceivedData,
            Self::PeerConnected(_) => EventTag::PeerConnected,
            Self::PeerDisconnected(_) => EventTag::PeerDisconnected,
            Self::Open(_) => EventTag::Open,
            Self::Disconnected => EventTag::Disconnected,
            Self::Error(_) => EventTag::Error,
            Self::Close => EventTag::Close,
            Self::Destroyed => EventTag::Destroyed,
        }
    }
}

/// Application callback for one event tag.
pub type EventCallback = Box<dyn FnMut(&MeshEvent) + Send>;

/// Single-slot registry of event callbacks.
#[derive(Default)]
pub struct EventBus {
    callbacks: HashMap<EventTag, EventCallback>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `tag`. Returns `true` if a previous callback
    /// was replaced.
    pub fn register(&mut self, tag: EventTag, callback: EventCallback) -> bool {
        trace!("Registering callback for {tag}");
        self.callbacks.insert(tag, callback).is_some()
    }

    pub fn has_callback(&self, tag: EventTag) -> bool {
        self.callbacks.contains_key(&tag)
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }

    /// Invoke the callback registered for the event's tag, if any.
    pub fn emit(&mut self, event: &MeshEvent) {
        if let Some(callback) = self.callbacks.get_mut(&event.tag()) {
            callback(event);
        }
    }

    pub fn clear(&mut self) {
        self.callbacks.clear();
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("tags", &self.callbacks.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
