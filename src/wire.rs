use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::BOX_NONCE_LEN;

/// Packet type discriminator, field `y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketKind {
    #[serde(rename = "m")]
    Message,
    #[serde(rename = "r")]
    Request,
    #[serde(rename = "rr")]
    Response,
    #[serde(rename = "p")]
    Ping,
    #[serde(rename = "x")]
    Leave,
}

/// The signed payload. `v`, `a` and `rr` are JSON-encoded strings; they are
/// parsed at dispatch, and a parse failure drops the packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    /// Send time (ms).
    pub t: i64,
    /// Channel identifier.
    pub i: String,
    /// Sender signing public key, base58.
    pub pk: String,
    /// Sender box public key, base58.
    pub ek: String,
    /// Per-packet 8-byte hex nonce.
    pub n: String,
    /// Packet type.
    pub y: PacketKind,
    /// Message value (JSON string), `y = m`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
    /// Call name, `y = r`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c: Option<String>,
    /// Call args (JSON string), `y = r`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub a: Option<String>,
    /// Request nonce, `y = r` and `y = rr`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rn: Option<String>,
    /// Call result (JSON string), `y = rr`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rr: Option<String>,
}

/// `{sig, payload}` wrapper. The signature covers the byte-identical payload
/// string; no whitespace normalization happens on either side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedEnvelope {
    /// Hex Ed25519 signature over the bytes of `p`.
    pub s: String,
    /// Payload JSON, exactly as signed.
    pub p: String,
}

impl SignedEnvelope {
    /// Serializes and signs a payload. The payload string is produced once
    /// and carried verbatim so signer and verifier agree on the bytes.
    pub fn seal(payload: &Payload, key: &SigningKey) -> Result<Self, serde_json::Error> {
        let p = serde_json::to_string(payload)?;
        let signature = key.sign(p.as_bytes());
        Ok(Self {
            s: hex::encode(signature.to_bytes()),
            p,
        })
    }

    /// Verifies the signature over the exact payload bytes and parses the
    /// payload. `None` on any failure.
    pub fn verify(&self, key: &VerifyingKey) -> Option<Payload> {
        let sig_bytes = hex::decode(&self.s).ok()?;
        let signature = Signature::from_slice(&sig_bytes).ok()?;
        key.verify(self.p.as_bytes(), &signature).ok()?;
        serde_json::from_str(&self.p).ok()
    }

    /// Reads the embedded payload without verifying. Used only to learn the
    /// claimed `pk` before verification.
    pub fn peek_payload(&self) -> Option<Payload> {
        serde_json::from_str(&self.p).ok()
    }
}

/// Outer wrapper of a directed send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoxEnvelope {
    /// Hex 24-byte nonce.
    pub n: String,
    /// Sender box public key, base58.
    pub ek: String,
    /// Hex ciphertext of the signed-envelope bytes.
    pub e: String,
}

impl BoxEnvelope {
    pub fn nonce_bytes(&self) -> Option<[u8; BOX_NONCE_LEN]> {
        let bytes = hex::decode(&self.n).ok()?;
        bytes.as_slice().try_into().ok()
    }
}

/// Entry at `messages/<hash16>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Base64 of the outer envelope bytes.
    pub m: String,
    /// Write time (ms).
    pub t: i64,
    /// Hex 16-byte packet hash.
    pub k: String,
}

/// Entry at `presence/<address>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRecord {
    /// Signing public key, base58.
    pub pk: String,
    /// Box public key, base58.
    pub ek: String,
    /// Announce time (ms).
    pub t: i64,
}

/// Entry at `files/<transfer_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferMetadata {
    pub name: String,
    #[serde(
        rename = "type",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub mime: Option<String>,
    pub size: u64,
    #[serde(rename = "totalChunks")]
    pub total_chunks: usize,
    pub timestamp: i64,
    /// Base58 address of the recognized sender.
    pub sender: String,
}

/// Entry under `chunks/<transfer_id>/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub index: usize,
    /// Base64 fragment of the file body.
    pub data: String,
    pub timestamp: i64,
    #[serde(rename = "fileId")]
    pub file_id: String,
}

/// Classifies an incoming outer packet by its fields: a box envelope carries
/// `n`, `ek` and `e`; everything else is treated as a signed envelope.
pub fn is_box_envelope(value: &Value) -> bool {
    value.get("n").is_some() && value.get("ek").is_some() && value.get("e").is_some()
}
