use serde_json::json;
use std::sync::Arc;
use tanglegram::config::NodeConfig;
use tanglegram::node::Node;
use tanglegram::store::GraphStore;
use tanglegram::testing::{
    CollectingHandler, GraphHandle, VirtualGraph, drive, test_identity, test_rng,
};
use tanglegram::time::ManualTimeProvider;
use tanglegram::{Error, Event};

fn sim_node(
    graph: &VirtualGraph,
    identifier: &str,
    tag: u8,
    seed: u64,
    time: &Arc<ManualTimeProvider>,
    encrypted: bool,
) -> (Node<GraphHandle>, GraphHandle, Arc<CollectingHandler>) {
    let handle = graph.handle();
    let mut node = Node::new(
        identifier,
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
fn two_node_plain_broadcast() {
    let _ = tracing_subscriber::fmt::try_init();
    let graph = VirtualGraph::new();
    let time = Arc::new(ManualTimeProvider::new(0));
    let (mut a, a_handle, a_events) = sim_node(&graph, "room", 0, 1, &time, false);
    let (mut b, b_handle, b_events) = sim_node(&graph, "room", 1, 2, &time, false);

    a.start().unwrap();
    b.start().unwrap();
    drive(
        &mut [(&mut a, &a_handle), (&mut b, &b_handle)],
        &time,
        50,
        2,
    );
    assert_eq!(a.connections(), 1);
    assert_eq!(b.connections(), 1);

    a.send(&json!({"hello": "world"})).unwrap();
    drive(
        &mut [(&mut a, &a_handle), (&mut b, &b_handle)],
        &time,
        50,
        3,
    );

    let messages = b_events.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(&messages[0].0, a.address());
    assert_eq!(messages[0].1, json!({"hello": "world"}));
    assert!(a_events.messages().is_empty());
}

#[test]
fn duplicate_gossip_delivery_reaches_the_app_once() {
    let graph = VirtualGraph::new();
    graph.set_deliveries_per_write(3);
    let time = Arc::new(ManualTimeProvider::new(0));
    let (mut a, a_handle, _) = sim_node(&graph, "room", 0, 1, &time, false);
    let (mut b, b_handle, b_events) = sim_node(&graph, "room", 1, 2, &time, false);

    a.start().unwrap();
    b.start().unwrap();
    drive(
        &mut [(&mut a, &a_handle), (&mut b, &b_handle)],
        &time,
        50,
        2,
    );
    a.send(&json!(42)).unwrap();
    drive(
        &mut [(&mut a, &a_handle), (&mut b, &b_handle)],
        &time,
        50,
        3,
    );
    assert_eq!(b_events.messages().len(), 1);
}

#[test]
fn directed_send_is_invisible_to_a_third_node() {
    let graph = VirtualGraph::new();
    let time = Arc::new(ManualTimeProvider::new(0));
    let (mut a, a_handle, _) = sim_node(&graph, "room", 0, 1, &time, false);
    let (mut b, b_handle, b_events) = sim_node(&graph, "room", 1, 2, &time, false);
    let (mut c, c_handle, c_events) = sim_node(&graph, "room", 2, 3, &time, false);

    a.start().unwrap();
    b.start().unwrap();
    c.start().unwrap();
    drive(
        &mut [(&mut a, &a_handle), (&mut b, &b_handle), (&mut c, &c_handle)],
        &time,
        50,
        2,
    );

    let messages_before = c_handle.scan("messages/").len();
    let b_address = b.address().clone();
    a.send_to(&b_address, &json!({"to": "B"})).unwrap();
    drive(
        &mut [(&mut a, &a_handle), (&mut b, &b_handle), (&mut c, &c_handle)],
        &time,
        50,
        3,
    );

    assert_eq!(b_events.messages().len(), 1);
    assert_eq!(b_events.messages()[0].1, json!({"to": "B"}));
    // C observed the packet on the graph store but decoded nothing.
    assert!(c_handle.scan("messages/").len() > messages_before);
    assert!(c_events.messages().is_empty());
}

#[test]
fn send_to_unknown_peer_fails_synchronously() {
    let graph = VirtualGraph::new();
    let time = Arc::new(ManualTimeProvider::new(0));
    let (mut a, _, _) = sim_node(&graph, "room", 0, 1, &time, false);
    let stranger = test_identity(9, 9).address().clone();
    assert!(matches!(
        a.send_to(&stranger, &json!(1)),
        Err(Error::UnknownPeer(_))
    ));
    assert!(matches!(
        a.call(&stranger, "anything", &json!({})),
        Err(Error::UnknownPeer(_))
    ));
}

#[test]
fn rpc_round_trip_and_missing_handler() {
    let graph = VirtualGraph::new();
    let time = Arc::new(ManualTimeProvider::new(0));
    let (mut a, a_handle, a_events) = sim_node(&graph, "room", 0, 1, &time, false);
    let (mut b, b_handle, _) = sim_node(&graph, "room", 1, 2, &time, false);

    b.register(
        "sum",
        Some("Adds x and y.".to_string()),
        Box::new(|_, args| {
            let x = args.get("x").and_then(|v| v.as_i64()).unwrap_or(0);
            let y = args.get("y").and_then(|v| v.as_i64()).unwrap_or(0);
            json!(x + y)
        }),
    );

    a.start().unwrap();
    b.start().unwrap();
    drive(
        &mut [(&mut a, &a_handle), (&mut b, &b_handle)],
        &time,
        50,
        2,
    );

    let b_address = b.address().clone();
    let nonce = a.call(&b_address, "sum", &json!({"x": 2, "y": 3})).unwrap();
    let bad_nonce = a.call(&b_address, "missing", &json!({})).unwrap();
    drive(
        &mut [(&mut a, &a_handle), (&mut b, &b_handle)],
        &time,
        50,
        4,
    );

    let responses: Vec<(String, serde_json::Value)> = a_events
        .snapshot()
        .into_iter()
        .filter_map(|event| match event {
            Event::Response { nonce, result, .. } => Some((nonce, result)),
            _ => None,
        })
        .collect();
    assert!(responses.contains(&(nonce, json!(5))));
    assert!(responses.contains(&(bad_nonce, json!({"error": "No such API call."}))));
}

#[test]
fn ping_is_dispatched() {
    let graph = VirtualGraph::new();
    let time = Arc::new(ManualTimeProvider::new(0));
    let (mut a, a_handle, _) = sim_node(&graph, "room", 0, 1, &time, false);
    let (mut b, b_handle, b_events) = sim_node(&graph, "room", 1, 2, &time, false);

    a.start().unwrap();
    b.start().unwrap();
    drive(
        &mut [(&mut a, &a_handle), (&mut b, &b_handle)],
        &time,
        50,
        2,
    );
    a.ping().unwrap();
    drive(
        &mut [(&mut a, &a_handle), (&mut b, &b_handle)],
        &time,
        50,
        2,
    );
    assert!(
        b_events
            .snapshot()
            .iter()
            .any(|event| matches!(event, Event::Ping { from } if from == a.address()))
    );
}

#[test]
fn destroy_broadcasts_leave_and_stops_the_node() {
    let graph = VirtualGraph::new();
    let time = Arc::new(ManualTimeProvider::new(0));
    let (mut a, a_handle, _) = sim_node(&graph, "room", 0, 1, &time, false);
    let (mut b, b_handle, b_events) = sim_node(&graph, "room", 1, 2, &time, false);

    a.start().unwrap();
    b.start().unwrap();
    drive(
        &mut [(&mut a, &a_handle), (&mut b, &b_handle)],
        &time,
        50,
        2,
    );
    assert_eq!(b.connections(), 1);

    a.destroy();
    a.destroy(); // idempotent
    drive(&mut [(&mut b, &b_handle)], &time, 50, 2);

    assert!(
        b_events
            .snapshot()
            .iter()
            .any(|event| matches!(event, Event::PeerLeft { .. }))
    );
    assert_eq!(b.connections(), 0);
    assert!(a.poll().is_none());
    assert!(matches!(a.send(&json!(1)), Err(Error::Destroyed)));
}

#[test]
fn reordered_delivery_still_converges() {
    let graph = VirtualGraph::new();
    graph.set_reorder(true);
    let time = Arc::new(ManualTimeProvider::new(0));
    let (mut a, a_handle, _) = sim_node(&graph, "room", 0, 1, &time, false);
    let (mut b, b_handle, b_events) = sim_node(&graph, "room", 1, 2, &time, false);

    a.start().unwrap();
    b.start().unwrap();
    drive(
        &mut [(&mut a, &a_handle), (&mut b, &b_handle)],
        &time,
        50,
        2,
    );
    a.send(&json!(1)).unwrap();
    a.send(&json!(2)).unwrap();
    drive(
        &mut [(&mut a, &a_handle), (&mut b, &b_handle)],
        &time,
        50,
        3,
    );
    let values: Vec<serde_json::Value> =
        b_events.messages().into_iter().map(|(_, v)| v).collect();
    assert_eq!(values.len(), 2);
    assert!(values.contains(&json!(1)));
    assert!(values.contains(&json!(2)));
}

#[test]
fn ready_and_connections_events_fire() {
    let graph = VirtualGraph::new();
    let time = Arc::new(ManualTimeProvider::new(0));
    let (mut a, a_handle, a_events) = sim_node(&graph, "room", 0, 1, &time, false);
    let (mut b, b_handle, _) = sim_node(&graph, "room", 1, 2, &time, false);

    a.start().unwrap();
    b.start().unwrap();
    drive(
        &mut [(&mut a, &a_handle), (&mut b, &b_handle)],
        &time,
        50,
        2,
    );

    let events = a_events.snapshot();
    assert!(
        events
            .iter()
            .any(|event| matches!(event, Event::Ready { address } if address == a.address()))
    );
    assert!(
        events
            .iter()
            .any(|event| matches!(event, Event::Connections(1)))
    );
}
