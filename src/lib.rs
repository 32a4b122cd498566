pub mod channel;
pub mod config;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod node;
pub mod overlay;
pub mod store;
pub mod testing;
pub mod time;
pub mod transfer;
pub mod wire;
pub mod words;

pub use channel::Channel;
pub use config::{ChannelConfig, NodeConfig, OverlayConfig, TransferConfig};
pub use crypto::PacketHash;
pub use error::{Error, Result};
pub use identity::{Address, Identity, Seed};
pub use node::{Node, NodeStatus};
pub use overlay::{Overlay, SeaPublicKeys};
pub use store::{GraphStore, StoreError};
pub use transfer::ReceivedFile;

use serde_json::Value;

/// Events emitted by the node stack for orchestration by the embedder.
#[derive(Debug, Clone)]
pub enum Event {
    /// The node has announced itself on the channel and is accepting traffic.
    Ready { address: Address },
    /// A peer was observed for the first time (or re-observed after eviction).
    PeerSeen { address: Address },
    /// A peer left the channel or was evicted.
    PeerLeft { address: Address },
    /// A peer was evicted because its presence went stale.
    PeerTimeout { address: Address },
    /// The number of known peers changed.
    Connections(usize),
    /// A verified broadcast or directed message arrived.
    Message {
        from: Address,
        value: Value,
        id: PacketHash,
    },
    /// A verified request arrived. The reply is produced by the registered
    /// handler; this event is informational.
    Request {
        from: Address,
        name: String,
        args: Value,
        nonce: String,
    },
    /// A response to an outstanding call arrived.
    Response {
        from: Address,
        nonce: String,
        result: Value,
    },
    /// A ping broadcast arrived.
    Ping { from: Address },
    /// The encrypted overlay decrypted an inbound payload.
    Decrypted {
        from: Address,
        keys: SeaPublicKeys,
        value: Value,
        id: PacketHash,
    },
    /// All chunks of an outbound transfer have been published.
    TransferComplete { transfer_id: String },
    /// Periodic progress of an inbound transfer.
    ReceiveProgress {
        transfer_id: String,
        received: usize,
        total: usize,
    },
    /// An inbound transfer was fully reassembled.
    FileReceived { file: ReceivedFile },
    /// Sweeps and retransmission were exhausted without full reassembly.
    TransferFailed {
        transfer_id: String,
        missing: Vec<usize>,
    },
}

/// A trait for receiving node events.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: Event);
}

/// Timer-driven activities of the node. Every long-running activity of the
/// stack is one of these, scheduled at an absolute millisecond deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Presence republish, stale-peer eviction and seen-set trim.
    Heartbeat,
    /// Recency trim of the overlay's seen-id set.
    SeenTrim,
    /// Publish the next chunk of an outbound transfer.
    EmitChunk { transfer_id: String, index: usize },
    /// Inbound transfer gave up waiting on the chunk subscription.
    TransferTimeout { transfer_id: String },
    /// One pass of the sweep procedure for an inbound transfer.
    Sweep {
        transfer_id: String,
        pass: u32,
        after_timeout: bool,
    },
    /// TTL eviction pass over the sender chunk cache.
    CacheSweep,
}

/// Marks who issued an outstanding call, so the response can be routed back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOrigin {
    /// Issued through the public `call` API; the response surfaces as an event.
    Application,
    /// The overlay `peer` handshake; the acknowledgement is informational.
    OverlayHandshake,
    /// A `request-chunks` retransmission request for an inbound transfer.
    TransferRetransmit { transfer_id: String },
    /// A `transfer-confirmed` notification; the acknowledgement is ignored.
    TransferConfirm,
}

/// Side effects produced by the component engines. Components never perform
/// IO themselves; the node applies these against the graph store and the
/// channel.
#[derive(Debug)]
pub enum Effect {
    /// Write a value into the graph store.
    Put { key: String, value: Value },
    /// Deliver an event to the embedder (and to the inner routing layers).
    Emit(Event),
    /// Request a wakeup for `task` at absolute time `at` (ms).
    Schedule { task: Task, at: i64 },
    /// Issue a signed, box-encrypted request through the channel.
    CallPeer {
        to: Address,
        name: String,
        args: Value,
        origin: CallOrigin,
    },
    /// Issue a directed channel send (used by the overlay for ciphertexts).
    SendTo { to: Address, value: Value },
    /// Issue a signed, box-encrypted response to a received request.
    RespondTo {
        to: Address,
        nonce: String,
        result: Value,
    },
}
