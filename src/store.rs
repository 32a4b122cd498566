use serde_json::Value;
use thiserror::Error;

/// Key prefix for signed packets.
pub const MESSAGES_PREFIX: &str = "messages/";
/// Key prefix for presence records.
pub const PRESENCE_PREFIX: &str = "presence/";
/// Key prefix for transfer metadata.
pub const FILES_PREFIX: &str = "files/";
/// Key prefix for transfer chunk entries.
pub const CHUNKS_PREFIX: &str = "chunks/";

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct StoreError(pub String);

/// The external gossip-replicated keyed map.
///
/// Replication is best-effort with at-least-once delivery and arbitrary
/// reordering. Writes are fire-and-forget; a `Value::Null` write is the
/// tombstone. The persistent `map()`-style subscription is owned by the
/// embedding driver, which feeds every observed `(key, value)` pair into
/// [`crate::Node::handle_update`].
pub trait GraphStore {
    /// Write a value under `key` and gossip it to the swarm.
    fn put(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// One-shot scan of all currently visible entries under `prefix`.
    /// This is the `once()`-style read used by sweep passes; it may miss
    /// entries still in flight.
    fn scan(&self, prefix: &str) -> Vec<(String, Value)>;
}

/// Builds the graph key for a chunk entry of a transfer.
pub fn chunk_key(transfer_id: &str, index: usize) -> String {
    format!("{CHUNKS_PREFIX}{transfer_id}/{index}")
}

/// Builds the scan prefix for a transfer's chunk set.
pub fn chunk_prefix(transfer_id: &str) -> String {
    format!("{CHUNKS_PREFIX}{transfer_id}/")
}
