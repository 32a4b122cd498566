use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, XChaCha20Poly1305, XNonce};
use ed25519_dalek::SigningKey;
use hkdf::Hkdf;
use rand::{CryptoRng, Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use x25519_dalek::{PublicKey as BoxPublicKey, StaticSecret};

use crate::identity::encode_key;

/// Length of a truncated packet hash.
pub const PACKET_HASH_LEN: usize = 16;
/// Nonce length of the directed box envelope.
pub const BOX_NONCE_LEN: usize = 24;

const BOX_INFO: &[u8] = b"tanglegram v1 box";
const SEA_INFO: &[u8] = b"tanglegram v1 sea";

/// First 16 bytes of `SHA512(packet_bytes)`. Used as the dedup key, the
/// `messages/` key suffix, and the overlay message id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketHash([u8; PACKET_HASH_LEN]);

impl PacketHash {
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha512::digest(bytes);
        let mut hash = [0u8; PACKET_HASH_LEN];
        hash.copy_from_slice(&digest[..PACKET_HASH_LEN]);
        Self(hash)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; PACKET_HASH_LEN] {
        &self.0
    }
}

impl fmt::Debug for PacketHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketHash({})", hex::encode(self.0))
    }
}

fn derive_key(shared: &[u8], info: &[u8]) -> Key {
    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .expect("32 bytes is a valid length for HKDF");
    Key::from(okm)
}

/// Seals `plain` for `recipient` with a NaCl-style public-key box:
/// X25519 ECDH, HKDF-SHA256, XChaCha20-Poly1305 under a fresh 24-byte nonce.
pub fn box_seal<R: RngCore + CryptoRng>(
    plain: &[u8],
    recipient: &BoxPublicKey,
    sender: &StaticSecret,
    rng: &mut R,
) -> Option<([u8; BOX_NONCE_LEN], Vec<u8>)> {
    let shared = sender.diffie_hellman(recipient);
    let cipher = XChaCha20Poly1305::new(&derive_key(shared.as_bytes(), BOX_INFO));
    let mut nonce = [0u8; BOX_NONCE_LEN];
    rng.fill(&mut nonce);
    let ciphertext = cipher.encrypt(XNonce::from_slice(&nonce), plain).ok()?;
    Some((nonce, ciphertext))
}

/// Opens a box envelope. `None` on any failure; the packet is dropped.
pub fn box_open(
    ciphertext: &[u8],
    nonce: &[u8],
    sender: &BoxPublicKey,
    recipient: &StaticSecret,
) -> Option<Vec<u8>> {
    if nonce.len() != BOX_NONCE_LEN {
        return None;
    }
    let shared = recipient.diffie_hellman(sender);
    let cipher = XChaCha20Poly1305::new(&derive_key(shared.as_bytes(), BOX_INFO));
    cipher.decrypt(XNonce::from_slice(nonce), ciphertext).ok()
}

/// The overlay's public key pair as exchanged in the `peer` handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeaPublicKeys {
    /// Base58 signing public key.
    #[serde(rename = "pub")]
    pub signing: String,
    /// Base58 key-agreement public key.
    pub epub: String,
}

/// The overlay's session keypair, distinct from the channel's identity keys.
pub struct SeaKeyPair {
    signing: SigningKey,
    exchange: StaticSecret,
    public: SeaPublicKeys,
}

impl SeaKeyPair {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut seed = [0u8; 32];
        rng.fill(&mut seed);
        let signing = SigningKey::from_bytes(&seed);
        let exchange = StaticSecret::random_from_rng(rng);
        let public = SeaPublicKeys {
            signing: encode_key(signing.verifying_key().as_bytes()),
            epub: encode_key(BoxPublicKey::from(&exchange).as_bytes()),
        };
        Self {
            signing,
            exchange,
            public,
        }
    }

    pub fn public(&self) -> &SeaPublicKeys {
        &self.public
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    /// Per-pair symmetric key: X25519 ECDH over the `epub` keys, HKDF-SHA256.
    pub fn secret(&self, their_epub: &BoxPublicKey) -> SharedKey {
        let shared = self.exchange.diffie_hellman(their_epub);
        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(SEA_INFO, &mut okm)
            .expect("32 bytes is a valid length for HKDF");
        SharedKey(okm)
    }
}

impl fmt::Debug for SeaKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeaKeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// A derived per-pair symmetric key.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey([u8; 32]);

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

/// Encrypts an application payload with a shared key. The wire form is
/// `hex(nonce12 || ciphertext)`.
pub fn sea_encrypt<R: RngCore + CryptoRng>(
    plain: &[u8],
    key: &SharedKey,
    rng: &mut R,
) -> Option<String> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key.0));
    let mut nonce = [0u8; 12];
    rng.fill(&mut nonce);
    let ciphertext = cipher.encrypt(Nonce::from_slice(&nonce), plain).ok()?;
    let mut out = Vec::with_capacity(12 + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Some(hex::encode(out))
}

/// Decrypts an overlay payload. `None` on any failure; the message is dropped.
pub fn sea_decrypt(wire: &str, key: &SharedKey) -> Option<Vec<u8>> {
    let bytes = hex::decode(wire).ok()?;
    if bytes.len() < 12 {
        return None;
    }
    let (nonce, ciphertext) = bytes.split_at(12);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key.0));
    cipher.decrypt(Nonce::from_slice(nonce), ciphertext).ok()
}

/// Generates the 8-byte hex nonce used for packets and request correlation.
pub fn call_nonce<R: Rng>(rng: &mut R) -> String {
    let mut bytes = [0u8; 8];
    rng.fill(&mut bytes);
    hex::encode(bytes)
}
