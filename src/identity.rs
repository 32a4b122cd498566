use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::{CryptoRng, Rng, RngCore};
use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::fmt;
use thiserror::Error;
use x25519_dalek::{PublicKey as BoxPublicKey, StaticSecret};

/// Two-byte version prefix of an encoded seed.
pub const SEED_PREFIX: [u8; 2] = [0x49, 0x0a];
/// Version byte of an encoded address.
pub const ADDRESS_VERSION: u8 = 0x55;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("base58 decode failed: {0}")]
    Base58(#[from] bs58::decode::Error),
    #[error("unexpected version prefix")]
    BadPrefix,
    #[error("unexpected payload length {0}")]
    BadLength(usize),
    #[error("invalid public key")]
    BadKey,
}

/// The 32 random bytes an identity is derived from. Stable across sessions
/// when persisted; the signing keypair is deterministic in the seed.
#[derive(Clone, PartialEq, Eq)]
pub struct Seed([u8; 32]);

impl Seed {
    pub fn generate<R: Rng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// `base58check( 0x490a || seed )`.
    pub fn encode(&self) -> String {
        let mut payload = Vec::with_capacity(34);
        payload.extend_from_slice(&SEED_PREFIX);
        payload.extend_from_slice(&self.0);
        bs58::encode(payload).with_check().into_string()
    }

    pub fn decode(encoded: &str) -> Result<Self, IdentityError> {
        let payload = bs58::decode(encoded).with_check(None).into_vec()?;
        if payload.len() != 2 + 32 {
            return Err(IdentityError::BadLength(payload.len()));
        }
        if payload[..2] != SEED_PREFIX {
            return Err(IdentityError::BadPrefix);
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&payload[2..]);
        Ok(Self(bytes))
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The seed is the root secret; never log it.
        f.write_str("Seed(..)")
    }
}

/// Compact identifier derived from a signing public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// `base58check( 0x55 || RIPEMD160( SHA512( pubkey ) ) )`.
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let sha = Sha512::digest(key.as_bytes());
        let ripe = Ripemd160::digest(sha);
        let mut payload = Vec::with_capacity(21);
        payload.push(ADDRESS_VERSION);
        payload.extend_from_slice(&ripe);
        Self(bs58::encode(payload).with_check().into_string())
    }

    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Local identity: persistent signing keypair derived from the seed, plus a
/// box keypair generated per process lifetime and never persisted.
pub struct Identity {
    seed: Seed,
    signing: SigningKey,
    box_secret: StaticSecret,
    box_public: BoxPublicKey,
    address: Address,
}

impl Identity {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let seed = Seed::generate(rng);
        Self::from_seed(seed, rng)
    }

    pub fn from_seed<R: RngCore + CryptoRng>(seed: Seed, rng: &mut R) -> Self {
        let signing = SigningKey::from_bytes(seed.as_bytes());
        let box_secret = StaticSecret::random_from_rng(rng);
        let box_public = BoxPublicKey::from(&box_secret);
        let address = Address::from_verifying_key(&signing.verifying_key());
        Self {
            seed,
            signing,
            box_secret,
            box_public,
            address,
        }
    }

    pub fn from_encoded_seed<R: RngCore + CryptoRng>(
        encoded: &str,
        rng: &mut R,
    ) -> Result<Self, IdentityError> {
        Ok(Self::from_seed(Seed::decode(encoded)?, rng))
    }

    pub fn seed(&self) -> &Seed {
        &self.seed
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn box_secret(&self) -> &StaticSecret {
        &self.box_secret
    }

    pub fn box_public(&self) -> &BoxPublicKey {
        &self.box_public
    }

    pub fn address(&self) -> &Address {
        &self.address
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Plain base58 (no checksum) used for public keys on the wire.
pub fn encode_key(bytes: &[u8]) -> String {
    bs58::encode(bytes).into_string()
}

pub fn decode_signing_pub(encoded: &str) -> Result<VerifyingKey, IdentityError> {
    let bytes = bs58::decode(encoded).into_vec()?;
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| IdentityError::BadLength(bytes.len()))?;
    VerifyingKey::from_bytes(&arr).map_err(|_| IdentityError::BadKey)
}

pub fn decode_box_pub(encoded: &str) -> Result<BoxPublicKey, IdentityError> {
    let bytes = bs58::decode(encoded).into_vec()?;
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| IdentityError::BadLength(bytes.len()))?;
    Ok(BoxPublicKey::from(arr))
}
