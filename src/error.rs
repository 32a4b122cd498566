use crate::identity::{Address, IdentityError};
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown peer: {0}")]
    UnknownPeer(Address),
    #[error("file offer publish failed for {code}: {source}")]
    OfferTimeout { code: String, source: StoreError },
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error("graph store error: {0}")]
    Store(#[from] StoreError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("node destroyed")]
    Destroyed,
}

pub type Result<T> = std::result::Result<T, Error>;
