//! Mesh configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::MeshError;
use crate::identity::PeerId;

/// How an inbound connection for an already-known peer is reconciled with the
/// connection that peer's link already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebindPolicy {
    /// Always switch the link to the newest connection.
    LastConnectionWins,
    /// Keep the current connection if we initiated it and our id sorts lower
    /// than the remote's; otherwise switch. Both ends pick the same connection.
    #[default]
    LowerInitiatorWins,
}

/// Configuration for a mesh node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Identity to request from the discovery service. `None` lets the
    /// service assign one.
    pub requested_id: Option<PeerId>,

    /// Ask the discovery service to reconnect after a signaling disconnect.
    pub auto_reconnect: bool,

    /// Resolution for simultaneous mutual connects.
    pub rebind_policy: RebindPolicy,

    /// Capacity of the application command queue feeding the node task.
    pub command_buffer: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            requested_id: None,
            auto_reconnect: true,
            rebind_policy: RebindPolicy::default(),
            command_buffer: 256,
        }
    }
}

impl MeshConfig {
    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), MeshError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<MeshConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt mesh config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read mesh config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
