//! End-to-end mesh formation over the in-process transport.

use std::sync::Arc;
use std::time::Duration;

use mesh_network::{
    EventTag, MemoryNetwork, MeshConfig, MeshError, MeshEvent, MeshHandle, MeshNode, PeerId,
    RebindPolicy,
};
use parking_lot::Mutex;
use serde_json::json;

const SETTLE: Duration = Duration::from_secs(5);

fn pid(s: &str) -> PeerId {
    PeerId::from(s)
}

fn config(id: &str) -> MeshConfig {
    MeshConfig {
        requested_id: Some(pid(id)),
        ..MeshConfig::default()
    }
}

fn start(network: &MemoryNetwork, id: &str) -> MeshHandle {
    let (transport, events) = network.transport();
    MeshNode::start(transport, events, config(id))
}

async fn peer_ids(handle: &MeshHandle) -> Vec<PeerId> {
    let mut ids: Vec<PeerId> = handle
        .all_peers()
        .await
        .unwrap()
        .into_iter()
        .map(|info| info.id)
        .collect();
    ids.sort();
    ids
}

/// Poll until `handle` is connected to exactly `expected`.
async fn wait_for_peers(handle: &MeshHandle, expected: &[&str]) {
    let expected: Vec<PeerId> = expected.iter().map(|id| pid(id)).collect();
    let outcome = tokio::time::timeout(SETTLE, async {
        loop {
            if peer_ids(handle).await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    if outcome.is_err() {
        panic!(
            "peers never settled: expected {expected:?}, have {:?}",
            peer_ids(handle).await
        );
    }
}

#[tokio::test]
async fn test_triangle_forms_through_announce() {
    let network = MemoryNetwork::new();
    let a = start(&network, "a");
    let b = start(&network, "b");
    let c = start(&network, "c");

    a.connect_to_peer("b").await.unwrap();
    wait_for_peers(&b, &["a"]).await;

    b.connect_to_peer("c").await.unwrap();

    wait_for_peers(&a, &["b", "c"]).await;
    wait_for_peers(&b, &["a", "c"]).await;
    wait_for_peers(&c, &["a", "b"]).await;
}

#[tokio::test]
async fn test_chain_converges_to_full_mesh() {
    let network = MemoryNetwork::new();
    let ids = ["n0", "n1", "n2", "n3", "n4"];
    let nodes: Vec<MeshHandle> = ids.iter().map(|id| start(&network, id)).collect();

    for (node, next) in nodes.iter().zip(ids.iter().skip(1)) {
        node.connect_to_peer(*next).await.unwrap();
    }

    for (node, id) in nodes.iter().zip(ids) {
        let others: Vec<&str> = ids.iter().copied().filter(|other| *other != id).collect();
        wait_for_peers(node, &others).await;
    }
}

#[tokio::test]
async fn test_application_data_reaches_every_peer() {
    let network = MemoryNetwork::new();
    let a = start(&network, "a");
    let b = start(&network, "b");
    let c = start(&network, "c");

    let received = Arc::new(Mutex::new(Vec::new()));
    for (name, node) in [("b", &b), ("c", &c)] {
        let sink = Arc::clone(&received);
        node.on(EventTag::ReceivedData, move |event| {
            if let MeshEvent::ReceivedData { peer_id, payload } = event {
                sink.lock().push(format!("{name}<-{peer_id}:{payload}"));
            }
        })
        .await
        .unwrap();
    }

    a.connect_to_peer("b").await.unwrap();
    b.connect_to_peer("c").await.unwrap();
    wait_for_peers(&a, &["b", "c"]).await;

    assert_eq!(a.broadcast(json!({"chat": "hi"})).await.unwrap(), 2);

    tokio::time::timeout(SETTLE, async {
        while received.lock().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let mut seen = received.lock().clone();
    seen.sort();
    assert_eq!(
        seen,
        vec![r#"b<-a:{"chat":"hi"}"#, r#"c<-a:{"chat":"hi"}"#]
    );
}

#[tokio::test]
async fn test_destroy_emits_once_and_drops_peer_everywhere() {
    let network = MemoryNetwork::new();
    let a = start(&network, "a");
    let b = start(&network, "b");

    let destroyed = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&destroyed);
    a.on(EventTag::Destroyed, move |_| *counter.lock() += 1)
        .await
        .unwrap();

    let gone = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&gone);
    b.on(EventTag::PeerDisconnected, move |event| {
        if let MeshEvent::PeerDisconnected(id) = event {
            sink.lock().push(id.clone());
        }
    })
    .await
    .unwrap();

    a.connect_to_peer("b").await.unwrap();
    wait_for_peers(&b, &["a"]).await;

    a.destroy().await;
    a.destroy().await;
    tokio::time::timeout(SETTLE, a.closed()).await.unwrap();
    a.destroy().await;

    assert_eq!(*destroyed.lock(), 1);
    assert!(matches!(a.all_peers().await, Err(MeshError::Destroyed)));

    wait_for_peers(&b, &[]).await;
    assert_eq!(*gone.lock(), vec![pid("a")]);
    assert_eq!(network.registered_ids(), vec![pid("b")]);
}

#[tokio::test]
async fn test_taken_identity_is_reported_not_fatal() {
    let network = MemoryNetwork::new();
    let _first = start(&network, "a");

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    let (transport, events) = network.transport();
    let second = MeshNode::new(transport, events, config("a"))
        .on(EventTag::Error, move |event| {
            if let MeshEvent::Error(err) = event {
                sink.lock().push(err.is_identity_unavailable());
            }
        })
        .spawn();

    tokio::time::timeout(SETTLE, async {
        while errors.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(*errors.lock(), vec![true]);
    assert!(!second.is_closed());
    assert_eq!(second.local_id().await.unwrap(), None);
}

#[tokio::test]
async fn test_send_to_unknown_peer_fails() {
    let network = MemoryNetwork::new();
    let a = start(&network, "a");

    let err = a.send_to(&pid("nobody"), json!("hello")).await.unwrap_err();
    assert!(matches!(err, MeshError::PeerNotFound(id) if id == pid("nobody")));
}

#[tokio::test]
async fn test_connect_to_unregistered_peer_rejects() {
    let network = MemoryNetwork::new();
    let a = start(&network, "a");

    let err = a.connect_to_peer("ghost").await.unwrap_err();
    assert!(matches!(err, MeshError::Connect(_)));
    assert!(peer_ids(&a).await.is_empty());
}

#[tokio::test]
async fn test_reconnect_after_signaling_loss() {
    let network = MemoryNetwork::new();
    let opens = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&opens);
    let (transport, events) = network.transport();
    let a = MeshNode::new(transport, events, config("a"))
        .on(EventTag::Open, move |_| *counter.lock() += 1)
        .spawn();
    let b = start(&network, "b");
    a.connect_to_peer("b").await.unwrap();

    assert!(network.disconnect(&pid("a")));

    tokio::time::timeout(SETTLE, async {
        while *opens.lock() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(peer_ids(&a).await, vec![pid("b")]);
    wait_for_peers(&b, &["a"]).await;
}

async fn mutual_connect_settles_on_one_connection(policy: RebindPolicy) {
    let network = MemoryNetwork::new();
    let start_with = |id: &str| {
        let (transport, events) = network.transport();
        let config = MeshConfig {
            rebind_policy: policy,
            ..config(id)
        };
        MeshNode::start(transport, events, config)
    };
    let a = start_with("a");
    let b = start_with("b");

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    b.on(EventTag::ReceivedData, move |event| {
        if let MeshEvent::ReceivedData { payload, .. } = event {
            sink.lock().push(payload.clone());
        }
    })
    .await
    .unwrap();

    let (a_to_b, b_to_a) = tokio::join!(a.connect_to_peer("b"), b.connect_to_peer("a"));
    a_to_b.unwrap();
    b_to_a.unwrap();

    wait_for_peers(&a, &["b"]).await;
    wait_for_peers(&b, &["a"]).await;
    tokio::time::timeout(SETTLE, async {
        while network.open_connections(&pid("a")) != 1 || network.open_connections(&pid("b")) != 1
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(a.broadcast(json!("over the survivor")).await.unwrap(), 1);
    tokio::time::timeout(SETTLE, async {
        while received.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(*received.lock(), vec![json!("over the survivor")]);
    assert_eq!(peer_ids(&a).await, vec![pid("b")]);
    assert_eq!(peer_ids(&b).await, vec![pid("a")]);
}

#[tokio::test]
async fn test_mutual_connect_lower_initiator_wins() {
    mutual_connect_settles_on_one_connection(RebindPolicy::LowerInitiatorWins).await;
}

#[tokio::test]
async fn test_mutual_connect_last_connection_wins() {
    mutual_connect_settles_on_one_connection(RebindPolicy::LastConnectionWins).await;
}
