//! Mesh simulation: N nodes on one in-process network, seeded as a chain.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use mesh_network::{
    EventTag, MemoryNetwork, MeshConfig, MeshEvent, MeshHandle, MeshNode, PeerId,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Simulator settings, loaded from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Number of nodes to start. At least two.
    pub node_count: usize,

    /// How long to wait for the mesh to converge, in seconds.
    #[serde(with = "duration_secs")]
    pub settle_timeout: Duration,

    /// Write a daily-rolling log file here in addition to the console.
    pub log_dir: Option<PathBuf>,

    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_filter: String,

    /// Settings shared by every node. `requested_id` is ignored; nodes are
    /// named `node-0`, `node-1`, ...
    pub mesh: MeshConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            node_count: 5,
            settle_timeout: Duration::from_secs(10),
            log_dir: None,
            log_filter: "info,mesh_network=debug".into(),
            mesh: MeshConfig::default(),
        }
    }
}

impl SimConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read sim config {}", path.display()))?;
        let config: SimConfig = serde_json::from_str(&data)
            .with_context(|| format!("Invalid sim config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_count < 2 {
            bail!("node_count must be at least 2, got {}", self.node_count);
        }
        if self.settle_timeout.is_zero() {
            bail!("settle_timeout must be positive");
        }
        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Outcome of one simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    /// Each node's connected peers once the mesh settled.
    pub topology: BTreeMap<PeerId, Vec<PeerId>>,
    pub converged_in_ms: u128,
    /// Application payloads delivered by the closing broadcast.
    pub deliveries: usize,
}

struct SimNode {
    id: PeerId,
    handle: MeshHandle,
}

fn node_id(index: usize) -> PeerId {
    PeerId::from_string(format!("node-{index}"))
}

/// Run a full simulation: start, chain-connect, converge, broadcast, tear
/// down.
pub async fn run(config: &SimConfig) -> Result<SimReport> {
    config.validate()?;

    let network = MemoryNetwork::new();
    let deliveries = Arc::new(AtomicUsize::new(0));
    let nodes: Vec<SimNode> = (0..config.node_count)
        .map(|index| start_node(&network, index, &config.mesh, &deliveries))
        .collect();
    info!("Started {} node(s)", nodes.len());

    let started = Instant::now();
    for pair in nodes.windows(2) {
        pair[0]
            .handle
            .connect_to_peer(pair[1].id.clone())
            .await
            .with_context(|| format!("{} could not connect to {}", pair[0].id, pair[1].id))?;
        debug!("Seeded link {} -> {}", pair[0].id, pair[1].id);
    }

    let topology = wait_for_full_mesh(&nodes, config.settle_timeout).await?;
    let converged_in_ms = started.elapsed().as_millis();
    info!("Mesh of {} node(s) converged in {converged_in_ms} ms", nodes.len());

    let expected = nodes.len() - 1;
    let sent = nodes[0]
        .handle
        .broadcast(serde_json::json!({ "hello": nodes[0].id }))
        .await?;
    if sent != expected {
        warn!("Broadcast reached {sent} of {expected} peer(s)");
    }
    wait_until(config.settle_timeout, || {
        deliveries.load(Ordering::Acquire) >= expected
    })
    .await
    .context("Broadcast was not delivered to every peer")?;

    for node in &nodes {
        node.handle.destroy().await;
    }
    for node in &nodes {
        tokio::time::timeout(config.settle_timeout, node.handle.closed())
            .await
            .with_context(|| format!("{} did not shut down", node.id))?;
    }
    info!("All nodes destroyed");

    Ok(SimReport {
        topology,
        converged_in_ms,
        deliveries: deliveries.load(Ordering::Acquire),
    })
}

fn start_node(
    network: &MemoryNetwork,
    index: usize,
    mesh: &MeshConfig,
    deliveries: &Arc<AtomicUsize>,
) -> SimNode {
    let id = node_id(index);
    let config = MeshConfig {
        requested_id: Some(id.clone()),
        ..mesh.clone()
    };
    let (transport, events) = network.transport();

    let counter = Arc::clone(deliveries);
    let label = id.clone();
    let handle = MeshNode::new(transport, events, config)
        .on(EventTag::ReceivedData, move |event| {
            if let MeshEvent::ReceivedData { peer_id, payload } = event {
                debug!("{label} received {payload} from {peer_id}");
                counter.fetch_add(1, Ordering::AcqRel);
            }
        })
        .on(EventTag::Error, {
            let label = id.clone();
            move |event| {
                if let MeshEvent::Error(e) = event {
                    warn!("{label}: {e}");
                }
            }
        })
        .spawn();

    SimNode { id, handle }
}

async fn wait_for_full_mesh(
    nodes: &[SimNode],
    timeout: Duration,
) -> Result<BTreeMap<PeerId, Vec<PeerId>>> {
    let deadline = Instant::now() + timeout;
    loop {
        let topology = snapshot(nodes).await?;
        let complete = topology.values().all(|peers| peers.len() == nodes.len() - 1);
        if complete {
            return Ok(topology);
        }
        if Instant::now() >= deadline {
            bail!(
                "Mesh did not converge within {}s: {}",
                timeout.as_secs(),
                serde_json::to_string(&topology)?
            );
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn snapshot(nodes: &[SimNode]) -> Result<BTreeMap<PeerId, Vec<PeerId>>> {
    let mut topology = BTreeMap::new();
    for node in nodes {
        let mut peers: Vec<PeerId> = node
            .handle
            .all_peers()
            .await?
            .into_iter()
            .map(|info| info.id)
            .collect();
        peers.sort();
        topology.insert(node.id.clone(), peers);
    }
    Ok(topology)
}

async fn wait_until(timeout: Duration, done: impl Fn() -> bool) -> Result<()> {
    tokio::time::timeout(timeout, async {
        while !done() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("Timed out after {}s", timeout.as_secs()))
}
