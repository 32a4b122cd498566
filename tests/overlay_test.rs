use serde_json::json;
use std::sync::Arc;
use tanglegram::config::{NodeConfig, OverlayConfig};
use tanglegram::crypto::PacketHash;
use tanglegram::identity::Address;
use tanglegram::node::Node;
use tanglegram::overlay::Overlay;
use tanglegram::store::GraphStore;
use tanglegram::testing::{
    CollectingHandler, GraphHandle, VirtualGraph, drive, test_identity, test_rng,
};
use tanglegram::time::ManualTimeProvider;

fn sim_node(
    graph: &VirtualGraph,
    tag: u8,
    seed: u64,
    time: &Arc<ManualTimeProvider>,
    encrypted: bool,
) -> (Node<GraphHandle>, GraphHandle, Arc<CollectingHandler>) {
    let handle = graph.handle();
    let mut node = Node::new(
        "room",
        test_identity(tag, seed),
        NodeConfig {
            encrypted,
            ..NodeConfig::default()
        },
        handle.clone(),
        time.clone(),
        test_rng(seed),
    );
    let events = Arc::new(CollectingHandler::new());
    node.set_event_handler(events.clone());
    (node, handle, events)
}

#[test]
fn encrypted_round_trip_with_plain_observer() {
    let _ = tracing_subscriber::fmt::try_init();
    let graph = VirtualGraph::new();
    let time = Arc::new(ManualTimeProvider::new(0));
    let (mut a, a_handle, _) = sim_node(&graph, 0, 1, &time, true);
    let (mut b, b_handle, b_events) = sim_node(&graph, 1, 2, &time, true);
    let (mut c, c_handle, c_events) = sim_node(&graph, 2, 3, &time, false);

    a.start().unwrap();
    b.start().unwrap();
    c.start().unwrap();
    // Presence, then the `peer` handshakes in both directions.
    drive(
        &mut [(&mut a, &a_handle), (&mut b, &b_handle), (&mut c, &c_handle)],
        &time,
        50,
        5,
    );

    a.send(&json!({"text": "hi"})).unwrap();
    drive(
        &mut [(&mut a, &a_handle), (&mut b, &b_handle), (&mut c, &c_handle)],
        &time,
        50,
        3,
    );

    let decrypted = b_events.decrypted();
    assert_eq!(decrypted.len(), 1);
    assert_eq!(&decrypted[0].0, a.address());
    assert_eq!(decrypted[0].1, json!({"text": "hi"}));

    // The plain subscriber saw no cleartext: the directed box was not even
    // addressed to it, and it never emitted the payload.
    assert!(c_events.messages().is_empty());
    assert!(c_events.decrypted().is_empty());
}

#[test]
fn broadcast_sends_one_ciphertext_per_overlay_peer() {
    let graph = VirtualGraph::new();
    let time = Arc::new(ManualTimeProvider::new(0));
    let (mut a, a_handle, _) = sim_node(&graph, 0, 1, &time, true);
    let (mut b, b_handle, b_events) = sim_node(&graph, 1, 2, &time, true);
    let (mut c, c_handle, c_events) = sim_node(&graph, 2, 3, &time, true);

    a.start().unwrap();
    b.start().unwrap();
    c.start().unwrap();
    drive(
        &mut [(&mut a, &a_handle), (&mut b, &b_handle), (&mut c, &c_handle)],
        &time,
        50,
        5,
    );

    let before = a_handle.scan("messages/").len();
    a.send(&json!({"n": 1})).unwrap();
    drive(
        &mut [(&mut a, &a_handle), (&mut b, &b_handle), (&mut c, &c_handle)],
        &time,
        50,
        3,
    );

    // Exactly k = 2 directed sends for a peer table of size 2.
    assert_eq!(a_handle.scan("messages/").len(), before + 2);
    assert_eq!(b_events.decrypted().len(), 1);
    assert_eq!(c_events.decrypted().len(), 1);
}

#[test]
fn broadcast_before_first_handshake_is_queued() {
    let graph = VirtualGraph::new();
    let time = Arc::new(ManualTimeProvider::new(0));
    let (mut a, a_handle, _) = sim_node(&graph, 0, 1, &time, true);

    a.start().unwrap();
    // No peers yet: the send is accepted and queued.
    a.send(&json!({"early": true})).unwrap();

    let (mut b, b_handle, b_events) = sim_node(&graph, 1, 2, &time, true);
    b.start().unwrap();
    drive(
        &mut [(&mut a, &a_handle), (&mut b, &b_handle)],
        &time,
        50,
        6,
    );

    let decrypted = b_events.decrypted();
    assert_eq!(decrypted.len(), 1);
    assert_eq!(decrypted[0].1, json!({"early": true}));
}

#[test]
fn direct_to_unhandshaken_peer_fails() {
    let graph = VirtualGraph::new();
    let time = Arc::new(ManualTimeProvider::new(0));
    let (mut a, a_handle, _) = sim_node(&graph, 0, 1, &time, true);
    let (mut b, b_handle, _) = sim_node(&graph, 1, 2, &time, false);

    a.start().unwrap();
    b.start().unwrap();
    // B is a channel peer but never performs the overlay handshake.
    drive(
        &mut [(&mut a, &a_handle), (&mut b, &b_handle)],
        &time,
        50,
        4,
    );
    assert_eq!(a.connections(), 1);
    let b_address = b.address().clone();
    assert!(a.send_to(&b_address, &json!(1)).is_err());
}

#[test]
fn seen_id_set_is_trimmed() {
    let config = OverlayConfig::default();
    let trim_keep = config.trim_keep;
    let mut overlay = Overlay::new(config, test_rng(1));
    let from = Address::from("somewhere");

    for index in 0..1_001u32 {
        let id = PacketHash::of(&index.to_be_bytes());
        overlay.handle_message(&from, &json!("ct"), id);
    }
    assert_eq!(overlay.seen_len(), 1_001);

    overlay.trim(0);
    assert_eq!(overlay.seen_len(), trim_keep);
}

#[test]
fn overlay_exposes_session_keys() {
    let graph = VirtualGraph::new();
    let time = Arc::new(ManualTimeProvider::new(0));
    let (a, _, _) = sim_node(&graph, 0, 1, &time, true);
    let (b, _, _) = sim_node(&graph, 1, 2, &time, false);
    let keys = a.overlay_public().expect("encrypted node has sea keys");
    assert!(!keys.signing.is_empty());
    assert!(!keys.epub.is_empty());
    assert!(b.overlay_public().is_none());
}
