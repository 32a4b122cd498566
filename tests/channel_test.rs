use serde_json::{Value, json};
use tanglegram::channel::Channel;
use tanglegram::config::ChannelConfig;
use tanglegram::identity::encode_key;
use tanglegram::testing::{test_identity, test_rng};
use tanglegram::wire::PresenceRecord;
use tanglegram::{CallOrigin, Effect, Error, Event};

const NOW: i64 = 1_000;

fn make_channel(identifier: &str, tag: u8, seed: u64) -> Channel {
    Channel::new(
        identifier,
        test_identity(tag, seed),
        ChannelConfig::default(),
        test_rng(seed + 1_000),
    )
}

fn first_put(effects: &[Effect]) -> (String, Value) {
    effects
        .iter()
        .find_map(|effect| match effect {
            Effect::Put { key, value } => Some((key.clone(), value.clone())),
            _ => None,
        })
        .expect("no put effect")
}

fn events(effects: &[Effect]) -> Vec<&Event> {
    effects
        .iter()
        .filter_map(|effect| match effect {
            Effect::Emit(event) => Some(event),
            _ => None,
        })
        .collect()
}

/// Makes `receiver` aware of `sender` by delivering one broadcast.
fn introduce(sender: &mut Channel, receiver: &mut Channel, now: i64) {
    let effects = sender.broadcast(&json!("hello"), now).unwrap();
    let (_, value) = first_put(&effects);
    receiver.handle_record(&value, now);
}

#[test]
fn broadcast_is_verified_and_dispatched() {
    let mut a = make_channel("room", 0, 1);
    let mut b = make_channel("room", 1, 2);

    let effects = a.broadcast(&json!({"hello": "world"}), NOW).unwrap();
    let (key, value) = first_put(&effects);
    assert!(key.starts_with("messages/"));

    let received = b.handle_record(&value, NOW);
    let received = events(&received);
    assert!(matches!(
        received[0],
        Event::PeerSeen { address } if address == a.address()
    ));
    assert!(matches!(received[1], Event::Connections(1)));
    assert!(matches!(
        received[2],
        Event::Message { from, value, .. }
            if from == a.address() && *value == json!({"hello": "world"})
    ));
    assert_eq!(b.connections(), 1);
}

#[test]
fn duplicate_packet_is_dropped() {
    let mut a = make_channel("room", 0, 1);
    let mut b = make_channel("room", 1, 2);

    let effects = a.broadcast(&json!(1), NOW).unwrap();
    let (_, value) = first_put(&effects);
    assert!(!b.handle_record(&value, NOW).is_empty());
    assert!(b.handle_record(&value, NOW).is_empty());
}

#[test]
fn own_packet_echo_is_dropped() {
    let mut a = make_channel("room", 0, 1);
    let effects = a.broadcast(&json!(1), NOW).unwrap();
    let (_, value) = first_put(&effects);
    assert!(a.handle_record(&value, NOW).is_empty());
}

#[test]
fn foreign_channel_identifier_is_dropped() {
    let mut a = make_channel("room", 0, 1);
    let mut b = make_channel("lobby", 1, 2);

    let effects = a.broadcast(&json!(1), NOW).unwrap();
    let (_, value) = first_put(&effects);
    assert!(b.handle_record(&value, NOW).is_empty());
    assert_eq!(b.connections(), 0);
}

#[test]
fn packet_one_ms_past_timeout_is_dropped() {
    let mut a = make_channel("room", 0, 1);
    let mut b = make_channel("room", 1, 2);
    let timeout = b.config().peer_timeout_ms;

    let effects = a.broadcast(&json!(1), NOW).unwrap();
    let (_, value) = first_put(&effects);
    assert!(b.handle_record(&value, NOW + timeout + 1).is_empty());

    // Exactly at the boundary the packet is still fresh.
    let effects = a.broadcast(&json!(2), NOW).unwrap();
    let (_, value) = first_put(&effects);
    assert!(!b.handle_record(&value, NOW + timeout).is_empty());
}

#[test]
fn directed_send_requires_known_peer() {
    let mut a = make_channel("room", 0, 1);
    let b = make_channel("room", 1, 2);
    let result = a.send_to(b.address(), &json!(1), NOW);
    assert!(matches!(result, Err(Error::UnknownPeer(_))));
}

#[test]
fn directed_send_is_opaque_to_third_parties() {
    let mut a = make_channel("room", 0, 1);
    let mut b = make_channel("room", 1, 2);
    let mut c = make_channel("room", 2, 3);

    introduce(&mut b, &mut a, NOW);
    let b_address = b.address().clone();
    let effects = a.send_to(&b_address, &json!({"to": "B"}), NOW).unwrap();
    let (_, value) = first_put(&effects);

    let received = b.handle_record(&value, NOW);
    assert!(
        events(&received)
            .iter()
            .any(|event| matches!(event, Event::Message { value, .. } if *value == json!({"to": "B"})))
    );

    // C observes the record but cannot open the box.
    assert!(c.handle_record(&value, NOW).is_empty());
}

#[test]
fn request_and_response_flow() {
    let mut a = make_channel("room", 0, 1);
    let mut b = make_channel("room", 1, 2);
    introduce(&mut a, &mut b, NOW);
    introduce(&mut b, &mut a, NOW);

    let b_address = b.address().clone();
    let (nonce, effects) = a
        .call(
            &b_address,
            "sum",
            &json!({"x": 2, "y": 3}),
            CallOrigin::Application,
            NOW,
        )
        .unwrap();
    let (_, value) = first_put(&effects);

    let received = b.handle_record(&value, NOW);
    let request = events(&received)
        .into_iter()
        .find_map(|event| match event {
            Event::Request {
                from, name, args, nonce,
            } => Some((from.clone(), name.clone(), args.clone(), nonce.clone())),
            _ => None,
        })
        .expect("no request event");
    assert_eq!(request.0, *a.address());
    assert_eq!(request.1, "sum");
    assert_eq!(request.2, json!({"x": 2, "y": 3}));
    assert_eq!(request.3, nonce);

    let a_address = a.address().clone();
    let effects = b.respond(&a_address, &nonce, &json!(5), NOW).unwrap();
    let (_, value) = first_put(&effects);
    let received = a.handle_record(&value, NOW);
    assert!(events(&received).iter().any(|event| matches!(
        event,
        Event::Response { nonce: got, result, .. } if *got == nonce && *result == json!(5)
    )));
}

#[test]
fn response_with_unknown_nonce_is_dropped() {
    let mut a = make_channel("room", 0, 1);
    let mut b = make_channel("room", 1, 2);
    introduce(&mut a, &mut b, NOW);

    let a_address = a.address().clone();
    let effects = b.respond(&a_address, "deadbeefdeadbeef", &json!(5), NOW).unwrap();
    let (_, value) = first_put(&effects);
    let received = a.handle_record(&value, NOW);
    assert!(
        !events(&received)
            .iter()
            .any(|event| matches!(event, Event::Response { .. }))
    );
}

fn presence_record_for(tag: u8, rng_seed: u64) -> (tanglegram::Address, Value) {
    let identity = test_identity(tag, rng_seed);
    let record = json!(PresenceRecord {
        pk: encode_key(identity.verifying_key().as_bytes()),
        ek: encode_key(identity.box_public().as_bytes()),
        t: NOW,
    });
    (identity.address().clone(), record)
}

#[test]
fn presence_upserts_peer_and_emits_seen() {
    let mut b = make_channel("room", 1, 2);
    let (a_address, record) = presence_record_for(0, 1);

    let effects = b.handle_presence(a_address.as_str(), &record, NOW);
    assert!(
        events(&effects)
            .iter()
            .any(|event| matches!(event, Event::PeerSeen { address } if *address == a_address))
    );
    assert_eq!(b.connections(), 1);
}

#[test]
fn presence_with_mismatched_address_is_dropped() {
    let mut b = make_channel("room", 1, 2);
    let (_, record) = presence_record_for(0, 1);

    // Presence published under an address that does not match the key.
    let effects = b.handle_presence("3FakeAddress", &record, NOW);
    assert!(effects.is_empty());
    assert_eq!(b.connections(), 0);
}

#[test]
fn heartbeat_evicts_silent_peers() {
    let mut a = make_channel("room", 0, 1);
    let mut b = make_channel("room", 1, 2);
    introduce(&mut a, &mut b, NOW);
    assert_eq!(b.connections(), 1);

    let timeout = b.config().peer_timeout_ms;
    let effects = b.heartbeat(NOW + timeout + 1);
    let effects = events(&effects);
    assert!(
        effects
            .iter()
            .any(|event| matches!(event, Event::PeerTimeout { address } if address == a.address()))
    );
    assert!(
        effects
            .iter()
            .any(|event| matches!(event, Event::PeerLeft { address } if address == a.address()))
    );
    assert_eq!(b.connections(), 0);
}

#[test]
fn leave_packet_removes_peer() {
    let mut a = make_channel("room", 0, 1);
    let mut b = make_channel("room", 1, 2);
    introduce(&mut a, &mut b, NOW);

    let effects = a.leave(NOW).unwrap();
    let (_, value) = first_put(&effects);
    let received = b.handle_record(&value, NOW);
    assert!(
        events(&received)
            .iter()
            .any(|event| matches!(event, Event::PeerLeft { address } if address == a.address()))
    );
    assert_eq!(b.connections(), 0);
}

#[test]
fn seen_set_is_trimmed_on_heartbeat() {
    let mut a = make_channel("room", 0, 1);
    let mut b = make_channel("room", 1, 2);

    for index in 0..1_001 {
        let effects = a.broadcast(&json!(index), NOW).unwrap();
        let (_, value) = first_put(&effects);
        b.handle_record(&value, NOW);
    }
    assert_eq!(b.seen_len(), 1_001);

    b.heartbeat(NOW + 1);
    assert_eq!(b.seen_len(), b.config().seen_trim_keep);
}

#[test]
fn api_docs_lists_registered_handlers() {
    let mut a = make_channel("room", 0, 1);
    a.register(
        "sum",
        Some("Adds two numbers.".to_string()),
        Box::new(|_, _| json!(null)),
    );
    a.register("noop", None, Box::new(|_, _| json!(null)));
    assert_eq!(
        a.api_docs(),
        vec![
            ("noop".to_string(), None),
            ("sum".to_string(), Some("Adds two numbers.".to_string())),
        ]
    );
}
