use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::VerifyingKey;
use rand::rngs::StdRng;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;
use x25519_dalek::PublicKey as BoxPublicKey;

use crate::config::ChannelConfig;
use crate::crypto::{self, PacketHash};
use crate::error::{Error, Result};
use crate::identity::{self, Address, Identity, encode_key};
use crate::store::{MESSAGES_PREFIX, PRESENCE_PREFIX};
use crate::wire::{
    BoxEnvelope, MessageRecord, PacketKind, Payload, PresenceRecord, SignedEnvelope,
    is_box_envelope,
};
use crate::{CallOrigin, Effect, Event};

/// An RPC handler. The returned value becomes the signed, box-encrypted
/// reply to the caller.
pub type Handler = Box<dyn FnMut(&Address, &Value) -> Value + Send>;

struct ApiHandler {
    doc: Option<String>,
    func: Handler,
}

/// Dedup set over packet hashes with insertion-order recency trimming.
pub(crate) struct SeenSet {
    order: VecDeque<PacketHash>,
    set: HashSet<PacketHash>,
}

impl SeenSet {
    pub(crate) fn new() -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
        }
    }

    /// Returns false when the hash was already present.
    pub(crate) fn insert(&mut self, hash: PacketHash) -> bool {
        if !self.set.insert(hash) {
            return false;
        }
        self.order.push_back(hash);
        true
    }

    /// Once the set exceeds `threshold`, retain only the `keep` most recent
    /// entries.
    pub(crate) fn trim(&mut self, threshold: usize, keep: usize) {
        if self.set.len() <= threshold {
            return;
        }
        while self.order.len() > keep {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.set.len()
    }
}

/// A peer of the signed transport. Keys come from verified envelopes or from
/// presence records whose address matches the embedded signing key.
pub struct PeerEntry {
    pub signing_pub: VerifyingKey,
    pub box_pub: BoxPublicKey,
    /// Wire (base58) forms, kept so replies and presence don't re-encode.
    pub pk: String,
    pub ek: String,
    pub last_seen: i64,
}

/// The signed transport: identity, presence, outgoing signing, incoming
/// verification, deduplication by packet hash, and request/response.
///
/// The channel never performs IO; every operation returns effects for the
/// node to apply, and incoming graph records are fed in by the node.
pub struct Channel {
    identifier: String,
    identity: Identity,
    config: ChannelConfig,
    pk_b58: String,
    ek_b58: String,
    peers: HashMap<Address, PeerEntry>,
    seen: SeenSet,
    pending_calls: HashMap<String, CallOrigin>,
    handlers: HashMap<String, ApiHandler>,
    rng: StdRng,
}

impl Channel {
    pub fn new(
        identifier: impl Into<String>,
        identity: Identity,
        config: ChannelConfig,
        rng: StdRng,
    ) -> Self {
        let pk_b58 = encode_key(identity.verifying_key().as_bytes());
        let ek_b58 = encode_key(identity.box_public().as_bytes());
        Self {
            identifier: identifier.into(),
            identity,
            config,
            pk_b58,
            ek_b58,
            peers: HashMap::new(),
            seen: SeenSet::new(),
            pending_calls: HashMap::new(),
            handlers: HashMap::new(),
            rng,
        }
    }

    pub fn address(&self) -> &Address {
        self.identity.address()
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Number of currently known peers.
    pub fn connections(&self) -> usize {
        self.peers.len()
    }

    pub fn peer(&self, address: &Address) -> Option<&PeerEntry> {
        self.peers.get(address)
    }

    pub fn is_peer(&self, address: &Address) -> bool {
        self.peers.contains_key(address)
    }

    /// Size of the packet dedup set.
    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    /// Announces presence and emits `Ready`. Called once by the node.
    pub fn startup(&mut self, now: i64) -> Vec<Effect> {
        vec![
            self.presence_effect(now),
            Effect::Emit(Event::Ready {
                address: self.address().clone(),
            }),
        ]
    }

    fn presence_effect(&self, now: i64) -> Effect {
        let record = PresenceRecord {
            pk: self.pk_b58.clone(),
            ek: self.ek_b58.clone(),
            t: now,
        };
        Effect::Put {
            key: format!("{PRESENCE_PREFIX}{}", self.address()),
            value: serde_json::json!(record),
        }
    }

    fn base_payload(&mut self, kind: PacketKind, now: i64) -> Payload {
        Payload {
            t: now,
            i: self.identifier.clone(),
            pk: self.pk_b58.clone(),
            ek: self.ek_b58.clone(),
            n: crypto::call_nonce(&mut self.rng),
            y: kind,
            v: None,
            c: None,
            a: None,
            rn: None,
            rr: None,
        }
    }

    /// Signs `payload`, optionally box-encrypts it for `recipient`, and
    /// produces the `messages/` write. The packet hash goes straight into
    /// the seen set so the gossiped echo of our own write is dropped.
    fn publish(&mut self, payload: Payload, recipient: Option<&Address>, now: i64) -> Result<Vec<Effect>> {
        let envelope = SignedEnvelope::seal(&payload, self.identity.signing_key())?;
        let inner = serde_json::to_vec(&envelope)?;
        let outer = match recipient {
            Some(address) => {
                let peer_box = self
                    .peers
                    .get(address)
                    .ok_or_else(|| Error::UnknownPeer(address.clone()))?
                    .box_pub;
                let (nonce, ciphertext) = crypto::box_seal(
                    &inner,
                    &peer_box,
                    self.identity.box_secret(),
                    &mut self.rng,
                )
                .ok_or_else(|| Error::Crypto("box seal failed".into()))?;
                serde_json::to_vec(&BoxEnvelope {
                    n: hex::encode(nonce),
                    ek: self.ek_b58.clone(),
                    e: hex::encode(ciphertext),
                })?
            }
            None => inner,
        };
        let hash = PacketHash::of(&outer);
        self.seen.insert(hash);
        let record = MessageRecord {
            m: BASE64.encode(&outer),
            t: now,
            k: hash.to_hex(),
        };
        Ok(vec![Effect::Put {
            key: format!("{MESSAGES_PREFIX}{}", hash.to_hex()),
            value: serde_json::json!(record),
        }])
    }

    /// Broadcasts a message to the room.
    pub fn broadcast(&mut self, value: &Value, now: i64) -> Result<Vec<Effect>> {
        let mut payload = self.base_payload(PacketKind::Message, now);
        payload.v = Some(value.to_string());
        self.publish(payload, None, now)
    }

    /// Directed, box-encrypted send. Fails with `UnknownPeer` when the
    /// recipient's box key is not known.
    pub fn send_to(&mut self, to: &Address, value: &Value, now: i64) -> Result<Vec<Effect>> {
        if !self.peers.contains_key(to) {
            return Err(Error::UnknownPeer(to.clone()));
        }
        let mut payload = self.base_payload(PacketKind::Message, now);
        payload.v = Some(value.to_string());
        self.publish(payload, Some(to), now)
    }

    /// Sends a request and records the call nonce for response correlation.
    pub fn call(
        &mut self,
        to: &Address,
        name: &str,
        args: &Value,
        origin: CallOrigin,
        now: i64,
    ) -> Result<(String, Vec<Effect>)> {
        if !self.peers.contains_key(to) {
            return Err(Error::UnknownPeer(to.clone()));
        }
        let nonce = crypto::call_nonce(&mut self.rng);
        let mut payload = self.base_payload(PacketKind::Request, now);
        payload.c = Some(name.to_string());
        payload.a = Some(args.to_string());
        payload.rn = Some(nonce.clone());
        let effects = self.publish(payload, Some(to), now)?;
        self.pending_calls.insert(nonce.clone(), origin);
        Ok((nonce, effects))
    }

    /// Sends the reply to a received request.
    pub fn respond(&mut self, to: &Address, nonce: &str, result: &Value, now: i64) -> Result<Vec<Effect>> {
        if !self.peers.contains_key(to) {
            return Err(Error::UnknownPeer(to.clone()));
        }
        let mut payload = self.base_payload(PacketKind::Response, now);
        payload.rn = Some(nonce.to_string());
        payload.rr = Some(result.to_string());
        self.publish(payload, Some(to), now)
    }

    pub fn ping(&mut self, now: i64) -> Result<Vec<Effect>> {
        let payload = self.base_payload(PacketKind::Ping, now);
        self.publish(payload, None, now)
    }

    /// Broadcasts the leave packet. The node clears the rest.
    pub fn leave(&mut self, now: i64) -> Result<Vec<Effect>> {
        let payload = self.base_payload(PacketKind::Leave, now);
        self.publish(payload, None, now)
    }

    /// Installs an RPC handler; overwrites any previous handler of that name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        doc: Option<String>,
        func: Handler,
    ) {
        self.handlers.insert(name.into(), ApiHandler { doc, func });
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered handler names and docstrings.
    pub fn api_docs(&self) -> Vec<(String, Option<String>)> {
        let mut docs: Vec<(String, Option<String>)> = self
            .handlers
            .iter()
            .map(|(name, h)| (name.clone(), h.doc.clone()))
            .collect();
        docs.sort();
        docs
    }

    pub(crate) fn invoke_handler(
        &mut self,
        name: &str,
        from: &Address,
        args: &Value,
    ) -> Option<Value> {
        self.handlers
            .get_mut(name)
            .map(|handler| (handler.func)(from, args))
    }

    /// Removes and returns the origin of an outstanding call.
    pub(crate) fn take_pending(&mut self, nonce: &str) -> Option<CallOrigin> {
        self.pending_calls.remove(nonce)
    }

    /// Incoming path for one `messages/` record: decode, dedup, optionally
    /// unbox, verify, check channel and freshness, upsert the peer and
    /// dispatch. Malformed packets drop silently.
    pub fn handle_record(&mut self, value: &Value, now: i64) -> Vec<Effect> {
        let record: MessageRecord = match serde_json::from_value(value.clone()) {
            Ok(record) => record,
            Err(err) => {
                debug!("dropping malformed message record: {err}");
                return Vec::new();
            }
        };
        let outer = match BASE64.decode(record.m.as_bytes()) {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!("dropping undecodable packet: {err}");
                return Vec::new();
            }
        };
        let hash = PacketHash::of(&outer);
        if !self.seen.insert(hash) {
            return Vec::new();
        }

        let Ok(outer_value) = serde_json::from_slice::<Value>(&outer) else {
            debug!("dropping non-JSON packet");
            return Vec::new();
        };
        let inner = if is_box_envelope(&outer_value) {
            let Some(bytes) = self.open_box(outer_value) else {
                return Vec::new();
            };
            bytes
        } else {
            outer
        };

        let Ok(envelope) = serde_json::from_slice::<SignedEnvelope>(&inner) else {
            debug!("dropping packet without signed envelope");
            return Vec::new();
        };
        let Some(claimed) = envelope.peek_payload() else {
            debug!("dropping packet with unparsable payload");
            return Vec::new();
        };
        let Ok(signing_pub) = identity::decode_signing_pub(&claimed.pk) else {
            debug!("dropping packet with invalid signing key");
            return Vec::new();
        };
        let Some(payload) = envelope.verify(&signing_pub) else {
            debug!("dropping packet with invalid signature");
            return Vec::new();
        };

        if payload.i != self.identifier {
            debug!(identifier = %payload.i, "dropping packet for another channel");
            return Vec::new();
        }
        if payload.t + self.config.peer_timeout_ms < now {
            debug!(sent = payload.t, "dropping stale packet");
            return Vec::new();
        }

        let from = Address::from_verifying_key(&signing_pub);
        if from == *self.identity.address() {
            return Vec::new();
        }
        let Ok(box_pub) = identity::decode_box_pub(&payload.ek) else {
            debug!("dropping packet with invalid box key");
            return Vec::new();
        };

        let mut effects = self.upsert_peer(
            from.clone(),
            signing_pub,
            box_pub,
            payload.pk.clone(),
            payload.ek.clone(),
            now,
        );
        self.dispatch(payload, from, hash, &mut effects);
        effects
    }

    fn open_box(&mut self, outer_value: Value) -> Option<Vec<u8>> {
        let envelope: BoxEnvelope = match serde_json::from_value(outer_value) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!("dropping malformed box envelope: {err}");
                return None;
            }
        };
        let nonce = envelope.nonce_bytes()?;
        let sender_ek = identity::decode_box_pub(&envelope.ek).ok()?;
        let ciphertext = hex::decode(&envelope.e).ok()?;
        let opened = crypto::box_open(
            &ciphertext,
            &nonce,
            &sender_ek,
            self.identity.box_secret(),
        );
        if opened.is_none() {
            debug!("dropping box envelope that failed to open");
        }
        opened
    }

    fn dispatch(
        &mut self,
        payload: Payload,
        from: Address,
        hash: PacketHash,
        effects: &mut Vec<Effect>,
    ) {
        match payload.y {
            PacketKind::Message => {
                let Some(value) = payload.v.as_deref().and_then(|v| serde_json::from_str(v).ok())
                else {
                    debug!("dropping message with unparsable value");
                    return;
                };
                effects.push(Effect::Emit(Event::Message {
                    from,
                    value,
                    id: hash,
                }));
            }
            PacketKind::Request => {
                let (Some(name), Some(nonce)) = (payload.c, payload.rn) else {
                    debug!("dropping request without name or nonce");
                    return;
                };
                let Some(args) = payload.a.as_deref().and_then(|a| serde_json::from_str(a).ok())
                else {
                    debug!("dropping request with unparsable args");
                    return;
                };
                effects.push(Effect::Emit(Event::Request {
                    from,
                    name,
                    args,
                    nonce,
                }));
            }
            PacketKind::Response => {
                let Some(nonce) = payload.rn else {
                    debug!("dropping response without nonce");
                    return;
                };
                if !self.pending_calls.contains_key(&nonce) {
                    debug!(%nonce, "dropping response for unknown call");
                    return;
                }
                let Some(result) = payload.rr.as_deref().and_then(|r| serde_json::from_str(r).ok())
                else {
                    debug!("dropping response with unparsable result");
                    return;
                };
                effects.push(Effect::Emit(Event::Response {
                    from,
                    nonce,
                    result,
                }));
            }
            PacketKind::Ping => {
                effects.push(Effect::Emit(Event::Ping { from }));
            }
            PacketKind::Leave => {
                if self.peers.remove(&from).is_some() {
                    effects.push(Effect::Emit(Event::PeerLeft { address: from }));
                    effects.push(Effect::Emit(Event::Connections(self.peers.len())));
                }
            }
        }
    }

    /// Incoming path for one `presence/` record. The address must match the
    /// embedded signing key, so presence cannot graft foreign keys onto an
    /// address.
    pub fn handle_presence(&mut self, address: &str, value: &Value, now: i64) -> Vec<Effect> {
        if address == self.identity.address().as_str() {
            return Vec::new();
        }
        let record: PresenceRecord = match serde_json::from_value(value.clone()) {
            Ok(record) => record,
            Err(err) => {
                debug!("dropping malformed presence record: {err}");
                return Vec::new();
            }
        };
        let Ok(signing_pub) = identity::decode_signing_pub(&record.pk) else {
            debug!("dropping presence with invalid signing key");
            return Vec::new();
        };
        let derived = Address::from_verifying_key(&signing_pub);
        if derived.as_str() != address {
            debug!(%address, "dropping presence whose address does not match its key");
            return Vec::new();
        }
        let Ok(box_pub) = identity::decode_box_pub(&record.ek) else {
            debug!("dropping presence with invalid box key");
            return Vec::new();
        };
        self.upsert_peer(derived, signing_pub, box_pub, record.pk, record.ek, now)
    }

    fn upsert_peer(
        &mut self,
        address: Address,
        signing_pub: VerifyingKey,
        box_pub: BoxPublicKey,
        pk: String,
        ek: String,
        now: i64,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        let first_sighting = !self.peers.contains_key(&address);
        self.peers.insert(
            address.clone(),
            PeerEntry {
                signing_pub,
                box_pub,
                pk,
                ek,
                last_seen: now,
            },
        );
        if first_sighting {
            effects.push(Effect::Emit(Event::PeerSeen { address }));
            effects.push(Effect::Emit(Event::Connections(self.peers.len())));
        }
        effects
    }

    /// Heartbeat tick: republish presence, evict stale peers, trim the seen
    /// set. The node reschedules the tick.
    pub fn heartbeat(&mut self, now: i64) -> Vec<Effect> {
        let mut effects = vec![self.presence_effect(now)];
        let stale: Vec<Address> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.last_seen + self.config.peer_timeout_ms < now)
            .map(|(address, _)| address.clone())
            .collect();
        for address in stale {
            self.peers.remove(&address);
            effects.push(Effect::Emit(Event::PeerTimeout {
                address: address.clone(),
            }));
            effects.push(Effect::Emit(Event::PeerLeft { address }));
            effects.push(Effect::Emit(Event::Connections(self.peers.len())));
        }
        self.seen
            .trim(self.config.seen_trim_threshold, self.config.seen_trim_keep);
        effects
    }

    /// Drops all transient state. Used by `destroy`; idempotent.
    pub(crate) fn clear(&mut self) {
        self.peers.clear();
        self.pending_calls.clear();
        self.handlers.clear();
    }
}
