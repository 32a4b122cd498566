use rand::rngs::StdRng;
use serde_json::{Value, json};
use std::collections::HashMap;
use tracing::{debug, warn};
use x25519_dalek::PublicKey as BoxPublicKey;

use crate::channel::SeenSet;
use crate::config::OverlayConfig;
use crate::crypto::{self, PacketHash, SeaKeyPair, SharedKey};
use crate::error::{Error, Result};
use crate::identity::{Address, decode_box_pub};
use crate::{CallOrigin, Effect, Event, Task};

pub use crate::crypto::SeaPublicKeys;

/// Name of the key-exchange request handler.
pub const PEER_HANDSHAKE: &str = "peer";

struct OverlayPeer {
    keys: SeaPublicKeys,
    epub: BoxPublicKey,
}

/// End-to-end encrypted overlay over the signed channel.
///
/// Maintains its own peer table, filled exclusively by the `peer` request
/// handshake, and encrypts application payloads with per-pair shared
/// secrets. Deduplicates across the dual (plain + decrypted) delivery paths
/// by the channel packet hash.
pub struct Overlay {
    sea: SeaKeyPair,
    config: OverlayConfig,
    peers: HashMap<Address, OverlayPeer>,
    secrets: HashMap<Address, SharedKey>,
    seen_ids: SeenSet,
    /// Broadcasts issued before the first handshake completed.
    queued: Vec<Value>,
    rng: StdRng,
}

impl Overlay {
    pub fn new(config: OverlayConfig, mut rng: StdRng) -> Self {
        let sea = SeaKeyPair::generate(&mut rng);
        Self {
            sea,
            config,
            peers: HashMap::new(),
            secrets: HashMap::new(),
            seen_ids: SeenSet::new(),
            queued: Vec::new(),
            rng,
        }
    }

    pub fn public(&self) -> &SeaPublicKeys {
        self.sea.public()
    }

    pub fn peer_keys(&self, address: &Address) -> Option<&SeaPublicKeys> {
        self.peers.get(address).map(|peer| &peer.keys)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Arms the periodic seen-id trim.
    pub fn startup(&mut self, now: i64) -> Vec<Effect> {
        vec![Effect::Schedule {
            task: Task::SeenTrim,
            at: now + self.config.trim_interval_ms,
        }]
    }

    /// A channel peer appeared; offer it our keys.
    pub fn handle_seen(&self, address: &Address) -> Vec<Effect> {
        vec![Effect::CallPeer {
            to: address.clone(),
            name: PEER_HANDSHAKE.to_string(),
            args: json!(self.sea.public()),
            origin: CallOrigin::OverlayHandshake,
        }]
    }

    /// The `peer` handshake: records the caller's keys. Returns the reply
    /// plus any queued broadcasts released by the first insertion.
    pub fn handle_peer_request(&mut self, from: &Address, args: &Value) -> (Value, Vec<Effect>) {
        let keys: SeaPublicKeys = match serde_json::from_value(args.clone()) {
            Ok(keys) => keys,
            Err(err) => {
                debug!(%from, "rejecting peer handshake with malformed keys: {err}");
                return (json!({"success": false}), Vec::new());
            }
        };
        let Ok(epub) = decode_box_pub(&keys.epub) else {
            debug!(%from, "rejecting peer handshake with invalid epub");
            return (json!({"success": false}), Vec::new());
        };
        let was_empty = self.peers.is_empty();
        self.secrets.remove(from);
        self.peers.insert(from.clone(), OverlayPeer { keys, epub });

        let mut effects = Vec::new();
        if was_empty && !self.queued.is_empty() {
            let queued = std::mem::take(&mut self.queued);
            for value in queued {
                effects.extend(self.broadcast(&value));
            }
        }
        (json!({"success": true}), effects)
    }

    fn secret_for(&mut self, address: &Address) -> Option<SharedKey> {
        if let Some(secret) = self.secrets.get(address) {
            return Some(secret.clone());
        }
        let epub = self.peers.get(address)?.epub;
        let secret = self.sea.secret(&epub);
        self.secrets.insert(address.clone(), secret.clone());
        Some(secret)
    }

    fn encrypted_send(&mut self, to: &Address, value: &Value) -> Option<Effect> {
        let secret = self.secret_for(to)?;
        let plain = value.to_string();
        let ciphertext = crypto::sea_encrypt(plain.as_bytes(), &secret, &mut self.rng)?;
        Some(Effect::SendTo {
            to: to.clone(),
            value: Value::String(ciphertext),
        })
    }

    /// Encrypts `value` once per known peer. With an empty table the value
    /// is queued until the first handshake completes. Per-peer failures are
    /// logged and do not abort the broadcast.
    pub fn broadcast(&mut self, value: &Value) -> Vec<Effect> {
        if self.peers.is_empty() {
            debug!("no overlay peers yet; queueing broadcast");
            self.queued.push(value.clone());
            return Vec::new();
        }
        let addresses: Vec<Address> = self.peers.keys().cloned().collect();
        let mut effects = Vec::new();
        for address in addresses {
            match self.encrypted_send(&address, value) {
                Some(effect) => effects.push(effect),
                None => warn!(%address, "failed to encrypt broadcast for peer"),
            }
        }
        effects
    }

    /// Encrypts `value` for a single peer.
    pub fn direct(&mut self, to: &Address, value: &Value) -> Result<Vec<Effect>> {
        if !self.peers.contains_key(to) {
            return Err(Error::UnknownPeer(to.clone()));
        }
        match self.encrypted_send(to, value) {
            Some(effect) => Ok(vec![effect]),
            None => Err(Error::Crypto("overlay encryption failed".into())),
        }
    }

    /// Consumes a channel `Message` event. The packet hash deduplicates
    /// across the raw and decrypted delivery paths.
    pub fn handle_message(&mut self, from: &Address, value: &Value, id: PacketHash) -> Vec<Effect> {
        if !self.seen_ids.insert(id) {
            return Vec::new();
        }
        let Some(keys) = self.peers.get(from).map(|peer| peer.keys.clone()) else {
            debug!(%from, "message from peer without completed handshake");
            return Vec::new();
        };
        let Some(secret) = self.secret_for(from) else {
            return Vec::new();
        };
        let Some(wire) = value.as_str() else {
            debug!(%from, "overlay message is not a ciphertext string");
            return Vec::new();
        };
        let Some(plain) = crypto::sea_decrypt(wire, &secret) else {
            debug!(%from, "failed to decrypt overlay message");
            return Vec::new();
        };
        let Ok(decrypted) = serde_json::from_slice::<Value>(&plain) else {
            debug!(%from, "decrypted overlay payload is not JSON");
            return Vec::new();
        };
        vec![Effect::Emit(Event::Decrypted {
            from: from.clone(),
            keys,
            value: decrypted,
            id,
        })]
    }

    /// Periodic trim of the seen-id set; reschedules itself.
    pub fn trim(&mut self, now: i64) -> Vec<Effect> {
        self.seen_ids
            .trim(self.config.trim_threshold, self.config.trim_keep);
        vec![Effect::Schedule {
            task: Task::SeenTrim,
            at: now + self.config.trim_interval_ms,
        }]
    }

    /// Size of the seen-id dedup set.
    pub fn seen_len(&self) -> usize {
        self.seen_ids.len()
    }

    /// Drops all transient state; idempotent.
    pub(crate) fn clear(&mut self) {
        self.peers.clear();
        self.secrets.clear();
        self.queued.clear();
        self.seen_ids = SeenSet::new();
    }
}
