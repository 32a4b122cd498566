use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::rngs::StdRng;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, warn};

use crate::config::TransferConfig;
use crate::error::Result;
use crate::identity::Address;
use crate::store::{FILES_PREFIX, GraphStore, chunk_key, chunk_prefix};
use crate::wire::{ChunkRecord, TransferMetadata};
use crate::words;
use crate::{CallOrigin, Effect, Event, Task};

/// Name of the retransmission request handler.
pub const REQUEST_CHUNKS: &str = "request-chunks";
/// Name of the completion confirmation handler.
pub const TRANSFER_CONFIRMED: &str = "transfer-confirmed";

/// A fully reassembled inbound transfer.
#[derive(Clone)]
pub struct ReceivedFile {
    pub name: String,
    pub mime: Option<String>,
    pub size: u64,
    pub data: Vec<u8>,
    pub transfer_id: String,
}

impl fmt::Debug for ReceivedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedFile")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("transfer_id", &self.transfer_id)
            .finish_non_exhaustive()
    }
}

/// An upload whose chunks are still being paced out.
struct Outgoing {
    body_b64: String,
    total_chunks: usize,
}

/// Cached chunks of a completed (or completing) upload, retained for
/// retransmission until the TTL expires or the receiver confirms.
struct CacheEntry {
    chunks: HashMap<usize, String>,
    created_at: Option<i64>,
}

struct Receiver {
    metadata: TransferMetadata,
    sender: Address,
    chunks: HashMap<usize, String>,
    /// Graph entry keys already consumed; the subscription may repeat.
    processed_entries: HashSet<String>,
    /// The sweep phase has been entered.
    sweeping: bool,
    /// The chunk subscription has been detached.
    detached: bool,
    /// A retransmission request is outstanding.
    rpc_inflight: bool,
    last_progress_decile: usize,
}

impl Receiver {
    fn new(metadata: TransferMetadata) -> Self {
        let sender = Address::from_string(metadata.sender.clone());
        Self {
            metadata,
            sender,
            chunks: HashMap::new(),
            processed_entries: HashSet::new(),
            sweeping: false,
            detached: false,
            rpc_inflight: false,
            last_progress_decile: 0,
        }
    }

    fn received(&self) -> usize {
        self.chunks.len()
    }

    fn is_complete(&self) -> bool {
        self.received() >= self.metadata.total_chunks
    }

    fn missing_indices(&self) -> Vec<usize> {
        (0..self.metadata.total_chunks)
            .filter(|index| !self.chunks.contains_key(index))
            .collect()
    }
}

/// The chunked file-transfer engine.
///
/// Chunk bytes ride the graph store under `chunks/`; the signed channel is
/// used only for coordination (offers are `files/` records, retransmission
/// and confirmation are RPCs). Like the other engines this one is sans-IO:
/// the node feeds in graph updates, RPC traffic and timer ticks, and applies
/// the returned effects.
pub struct Transfer {
    config: TransferConfig,
    local_address: Address,
    outgoing: HashMap<String, Outgoing>,
    cache: HashMap<String, CacheEntry>,
    receivers: HashMap<String, Receiver>,
    /// Transfers that have begun processing; suppresses repeat activation
    /// when the offer record is delivered again.
    activated: HashSet<String>,
    sweeper_armed: bool,
    rng: StdRng,
}

impl Transfer {
    pub fn new(local_address: Address, config: TransferConfig, rng: StdRng) -> Self {
        Self {
            config,
            local_address,
            outgoing: HashMap::new(),
            cache: HashMap::new(),
            receivers: HashMap::new(),
            activated: HashSet::new(),
            sweeper_armed: false,
            rng,
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub(crate) fn cached_transfers(&self) -> usize {
        self.cache.len()
    }

    pub(crate) fn inbound_transfers(&self) -> usize {
        self.receivers.len()
    }

    // --- send path ---

    /// Publishes the transfer offer and schedules the paced chunk emission.
    /// Returns the generated transfer code alongside the effects.
    pub fn send_file(
        &mut self,
        name: &str,
        mime: Option<&str>,
        data: &[u8],
        now: i64,
    ) -> Result<(String, Vec<Effect>)> {
        let transfer_id = words::transfer_code(&mut self.rng);
        let body_b64 = BASE64.encode(data);
        let total_chunks = body_b64.len().div_ceil(self.config.chunk_size);
        let metadata = TransferMetadata {
            name: name.to_string(),
            mime: mime.map(str::to_string),
            size: data.len() as u64,
            total_chunks,
            timestamp: now,
            sender: self.local_address.to_string(),
        };

        let mut effects = vec![Effect::Put {
            key: format!("{FILES_PREFIX}{transfer_id}"),
            value: serde_json::to_value(&metadata)?,
        }];

        self.cache.insert(
            transfer_id.clone(),
            CacheEntry {
                chunks: HashMap::new(),
                created_at: None,
            },
        );

        if total_chunks == 0 {
            effects.extend(self.finish_upload(&transfer_id, now));
        } else {
            self.outgoing.insert(
                transfer_id.clone(),
                Outgoing {
                    body_b64,
                    total_chunks,
                },
            );
            effects.push(Effect::Schedule {
                task: Task::EmitChunk {
                    transfer_id: transfer_id.clone(),
                    index: 0,
                },
                at: now + self.config.chunk_delay_ms,
            });
        }
        Ok((transfer_id, effects))
    }

    /// One paced chunk write. Reschedules itself until the last index.
    pub fn emit_chunk(&mut self, transfer_id: &str, index: usize, now: i64) -> Vec<Effect> {
        let Some(outgoing) = self.outgoing.get(transfer_id) else {
            return Vec::new();
        };
        let start = index * self.config.chunk_size;
        let end = (start + self.config.chunk_size).min(outgoing.body_b64.len());
        let data = outgoing.body_b64[start..end].to_string();
        let total_chunks = outgoing.total_chunks;

        let record = ChunkRecord {
            index,
            data: data.clone(),
            timestamp: now,
            file_id: transfer_id.to_string(),
        };
        let mut effects = vec![Effect::Put {
            key: chunk_key(transfer_id, index),
            value: json!(record),
        }];
        if let Some(entry) = self.cache.get_mut(transfer_id) {
            entry.chunks.insert(index, data);
        }

        if index + 1 < total_chunks {
            effects.push(Effect::Schedule {
                task: Task::EmitChunk {
                    transfer_id: transfer_id.to_string(),
                    index: index + 1,
                },
                at: now + self.config.chunk_delay_ms,
            });
        } else {
            self.outgoing.remove(transfer_id);
            effects.extend(self.finish_upload(transfer_id, now));
        }
        effects
    }

    fn finish_upload(&mut self, transfer_id: &str, now: i64) -> Vec<Effect> {
        if let Some(entry) = self.cache.get_mut(transfer_id) {
            entry.created_at = Some(now);
        }
        let mut effects = vec![Effect::Emit(Event::TransferComplete {
            transfer_id: transfer_id.to_string(),
        })];
        if !self.sweeper_armed {
            self.sweeper_armed = true;
            effects.push(Effect::Schedule {
                task: Task::CacheSweep,
                at: now + self.config.cache_sweep_interval_ms,
            });
        }
        effects
    }

    /// TTL eviction pass over the sender cache; reschedules itself.
    pub fn cache_sweep(&mut self, now: i64) -> Vec<Effect> {
        let ttl = self.config.cache_ttl_ms;
        self.cache.retain(|transfer_id, entry| {
            let keep = entry.created_at.is_none_or(|created| created + ttl >= now);
            if !keep {
                debug!(%transfer_id, "evicting expired sender cache entry");
            }
            keep
        });
        vec![Effect::Schedule {
            task: Task::CacheSweep,
            at: now + self.config.cache_sweep_interval_ms,
        }]
    }

    /// The `request-chunks` handler: serves cached chunks to a receiver
    /// whose subscription lost some.
    pub fn handle_chunk_request(&mut self, args: &Value) -> Value {
        #[derive(Deserialize)]
        struct ChunkRequest {
            #[serde(rename = "fileId")]
            file_id: String,
            #[serde(rename = "missingChunks")]
            missing: Vec<usize>,
        }
        let request: ChunkRequest = match serde_json::from_value(args.clone()) {
            Ok(request) => request,
            Err(err) => {
                debug!("malformed request-chunks args: {err}");
                return json!({"success": false, "error": "File not in cache"});
            }
        };
        let Some(entry) = self.cache.get(&request.file_id) else {
            return json!({"success": false, "error": "File not in cache"});
        };
        let chunks: Vec<Value> = request
            .missing
            .iter()
            .filter_map(|index| {
                entry
                    .chunks
                    .get(index)
                    .map(|data| json!({"index": index, "data": data}))
            })
            .collect();
        json!({"success": true, "fileId": request.file_id, "chunks": chunks})
    }

    /// The `transfer-confirmed` handler: the receiver has the file, the
    /// cache entry can go early.
    pub fn handle_confirm(&mut self, args: &Value) -> Value {
        if let Some(file_id) = args.get("fileId").and_then(Value::as_str) {
            self.cache.remove(file_id);
        }
        json!({"success": true})
    }

    // --- receive path ---

    /// A `files/` record arrived. Starts a receiver unless the transfer is
    /// our own or already processing.
    pub fn handle_offer(&mut self, transfer_id: &str, value: &Value, now: i64) -> Vec<Effect> {
        if value.is_null() {
            return Vec::new();
        }
        let metadata: TransferMetadata = match serde_json::from_value(value.clone()) {
            Ok(metadata) => metadata,
            Err(err) => {
                debug!(%transfer_id, "dropping malformed transfer offer: {err}");
                return Vec::new();
            }
        };
        if metadata.sender == self.local_address.as_str() {
            return Vec::new();
        }
        if !self.activated.insert(transfer_id.to_string()) {
            return Vec::new();
        }

        let total_chunks = metadata.total_chunks;
        let mut receiver = Receiver::new(metadata);
        let mut effects = vec![Effect::Schedule {
            task: Task::TransferTimeout {
                transfer_id: transfer_id.to_string(),
            },
            at: now + self.config.receive_timeout_ms(total_chunks),
        }];
        if total_chunks == 0 {
            receiver.sweeping = true;
            receiver.detached = true;
            effects.push(Effect::Schedule {
                task: Task::Sweep {
                    transfer_id: transfer_id.to_string(),
                    pass: 0,
                    after_timeout: false,
                },
                at: now + self.config.recheck_delay_ms,
            });
        }
        self.receivers.insert(transfer_id.to_string(), receiver);
        effects
    }

    /// A `chunks/` entry arrived over the persistent subscription.
    pub fn handle_chunk(
        &mut self,
        transfer_id: &str,
        entry_key: &str,
        value: &Value,
        now: i64,
    ) -> Vec<Effect> {
        let Some(receiver) = self.receivers.get_mut(transfer_id) else {
            return Vec::new();
        };
        if receiver.detached {
            return Vec::new();
        }
        if !receiver.processed_entries.insert(entry_key.to_string()) {
            return Vec::new();
        }
        if value.is_null() {
            return Vec::new();
        }
        let record: ChunkRecord = match serde_json::from_value(value.clone()) {
            Ok(record) => record,
            Err(err) => {
                debug!(%transfer_id, "dropping malformed chunk entry: {err}");
                return Vec::new();
            }
        };
        let mut effects = Vec::new();
        if Self::accept_chunk(receiver, transfer_id, record) {
            Self::push_progress(receiver, transfer_id, &mut effects);
        }
        if receiver.is_complete() && !receiver.sweeping {
            receiver.sweeping = true;
            receiver.detached = true;
            effects.push(Effect::Schedule {
                task: Task::Sweep {
                    transfer_id: transfer_id.to_string(),
                    pass: 0,
                    after_timeout: false,
                },
                at: now + self.config.recheck_delay_ms,
            });
        }
        effects
    }

    /// Validates and stores one chunk; true when it was new.
    fn accept_chunk(receiver: &mut Receiver, transfer_id: &str, record: ChunkRecord) -> bool {
        if record.file_id != transfer_id {
            debug!(%transfer_id, "chunk entry names a different transfer");
            return false;
        }
        if record.index >= receiver.metadata.total_chunks {
            debug!(
                %transfer_id,
                index = record.index,
                "chunk index out of range"
            );
            return false;
        }
        if receiver.chunks.contains_key(&record.index) {
            return false;
        }
        receiver.chunks.insert(record.index, record.data);
        true
    }

    /// Progress every 10% or every 100 chunks, and at completion.
    fn push_progress(receiver: &mut Receiver, transfer_id: &str, effects: &mut Vec<Effect>) {
        let total = receiver.metadata.total_chunks;
        if total == 0 {
            return;
        }
        let received = receiver.received();
        let decile = received * 10 / total;
        if received == total || received % 100 == 0 || decile > receiver.last_progress_decile {
            receiver.last_progress_decile = decile;
            effects.push(Effect::Emit(Event::ReceiveProgress {
                transfer_id: transfer_id.to_string(),
                received,
                total,
            }));
        }
    }

    /// The receive timeout fired before the chunk count was reached: detach
    /// and start the timeout sweep chain.
    pub fn handle_timeout(&mut self, transfer_id: &str, now: i64) -> Vec<Effect> {
        let Some(receiver) = self.receivers.get_mut(transfer_id) else {
            return Vec::new();
        };
        if receiver.sweeping {
            return Vec::new();
        }
        warn!(
            %transfer_id,
            received = receiver.received(),
            total = receiver.metadata.total_chunks,
            "transfer timed out waiting for chunks"
        );
        receiver.sweeping = true;
        receiver.detached = true;
        vec![Effect::Schedule {
            task: Task::Sweep {
                transfer_id: transfer_id.to_string(),
                pass: 0,
                after_timeout: true,
            },
            at: now,
        }]
    }

    /// One sweep pass: a one-shot scan of the chunk set to pull in entries
    /// the subscription missed, then completion check, retry, or (on the
    /// timeout chain) the retransmission RPC.
    pub fn handle_sweep<S: GraphStore>(
        &mut self,
        transfer_id: &str,
        pass: u32,
        after_timeout: bool,
        store: &S,
        now: i64,
    ) -> Vec<Effect> {
        let Some(receiver) = self.receivers.get_mut(transfer_id) else {
            return Vec::new();
        };
        for (_, value) in store.scan(&chunk_prefix(transfer_id)) {
            if value.is_null() {
                continue;
            }
            let Ok(record) = serde_json::from_value::<ChunkRecord>(value) else {
                continue;
            };
            Self::accept_chunk(receiver, transfer_id, record);
        }

        if receiver.is_complete() {
            return self.deliver(transfer_id);
        }

        if pass + 1 < self.config.max_sweeps {
            debug!(
                %transfer_id,
                pass,
                missing = receiver.missing_indices().len(),
                "sweep pass incomplete; retrying"
            );
            return vec![Effect::Schedule {
                task: Task::Sweep {
                    transfer_id: transfer_id.to_string(),
                    pass: pass + 1,
                    after_timeout,
                },
                at: now + self.config.sweep_delay_ms,
            }];
        }

        let missing = receiver.missing_indices();
        if after_timeout {
            receiver.rpc_inflight = true;
            warn!(
                %transfer_id,
                missing = missing.len(),
                "sweeps exhausted; requesting retransmission from sender"
            );
            vec![Effect::CallPeer {
                to: receiver.sender.clone(),
                name: REQUEST_CHUNKS.to_string(),
                args: json!({"fileId": transfer_id, "missingChunks": missing}),
                origin: CallOrigin::TransferRetransmit {
                    transfer_id: transfer_id.to_string(),
                },
            }]
        } else {
            // Leave the state; a later chunk event may re-enter the sweep.
            receiver.sweeping = false;
            debug!(%transfer_id, missing = missing.len(), "sweeps exhausted");
            Vec::new()
        }
    }

    /// The retransmission request could not be issued (the sender is not a
    /// current peer).
    pub fn retransmit_unavailable(&mut self, transfer_id: &str) -> Vec<Effect> {
        let Some(receiver) = self.receivers.get_mut(transfer_id) else {
            return Vec::new();
        };
        receiver.rpc_inflight = false;
        receiver.sweeping = false;
        let missing = receiver.missing_indices();
        warn!(
            %transfer_id,
            missing = missing.len(),
            "sender unavailable for retransmission"
        );
        vec![Effect::Emit(Event::TransferFailed {
            transfer_id: transfer_id.to_string(),
            missing,
        })]
    }

    /// Response to a `request-chunks` call.
    pub fn handle_retransmit_reply(&mut self, transfer_id: &str, result: &Value) -> Vec<Effect> {
        let Some(receiver) = self.receivers.get_mut(transfer_id) else {
            return Vec::new();
        };
        if !receiver.rpc_inflight {
            return Vec::new();
        }
        receiver.rpc_inflight = false;

        if result.get("success").and_then(Value::as_bool) != Some(true) {
            receiver.sweeping = false;
            let missing = receiver.missing_indices();
            warn!(%transfer_id, "sender no longer holds the chunk cache");
            return vec![Effect::Emit(Event::TransferFailed {
                transfer_id: transfer_id.to_string(),
                missing,
            })];
        }

        if let Some(chunks) = result.get("chunks").and_then(Value::as_array) {
            for chunk in chunks {
                let (Some(index), Some(data)) = (
                    chunk.get("index").and_then(Value::as_u64),
                    chunk.get("data").and_then(Value::as_str),
                ) else {
                    continue;
                };
                let record = ChunkRecord {
                    index: index as usize,
                    data: data.to_string(),
                    timestamp: 0,
                    file_id: transfer_id.to_string(),
                };
                Self::accept_chunk(receiver, transfer_id, record);
            }
        }

        let sender = receiver.sender.clone();
        if receiver.is_complete() {
            let mut effects = self.deliver(transfer_id);
            // Retransmission made us whole; let the sender drop its cache.
            effects.push(Effect::CallPeer {
                to: sender,
                name: TRANSFER_CONFIRMED.to_string(),
                args: json!({"fileId": transfer_id}),
                origin: CallOrigin::TransferConfirm,
            });
            return effects;
        }
        receiver.sweeping = false;
        let missing = receiver.missing_indices();
        warn!(
            %transfer_id,
            missing = missing.len(),
            "retransmission reply left chunks missing"
        );
        vec![Effect::Emit(Event::TransferFailed {
            transfer_id: transfer_id.to_string(),
            missing,
        })]
    }

    /// Reassembles and emits the file, then tears the receiver down. The
    /// `activated` marker stays so a re-delivered offer does not restart.
    fn deliver(&mut self, transfer_id: &str) -> Vec<Effect> {
        let Some(receiver) = self.receivers.remove(transfer_id) else {
            return Vec::new();
        };
        let total = receiver.metadata.total_chunks;
        let mut body = String::new();
        for index in 0..total {
            if let Some(fragment) = receiver.chunks.get(&index) {
                body.push_str(fragment);
            }
        }
        let data = match BASE64.decode(body.as_bytes()) {
            Ok(data) => data,
            Err(err) => {
                warn!(%transfer_id, "reassembled body failed to decode: {err}");
                return vec![Effect::Emit(Event::TransferFailed {
                    transfer_id: transfer_id.to_string(),
                    missing: receiver.missing_indices(),
                })];
            }
        };
        if data.len() as u64 != receiver.metadata.size {
            warn!(
                %transfer_id,
                expected = receiver.metadata.size,
                actual = data.len(),
                "reassembled size does not match the offer"
            );
            return vec![Effect::Emit(Event::TransferFailed {
                transfer_id: transfer_id.to_string(),
                missing: Vec::new(),
            })];
        }

        vec![Effect::Emit(Event::FileReceived {
            file: ReceivedFile {
                name: receiver.metadata.name,
                mime: receiver.metadata.mime,
                size: receiver.metadata.size,
                data,
                transfer_id: transfer_id.to_string(),
            },
        })]
    }

    /// Drops all transient state; idempotent.
    pub(crate) fn clear(&mut self) {
        self.outgoing.clear();
        self.cache.clear();
        self.receivers.clear();
        self.activated.clear();
        self.sweeper_armed = false;
    }

    /// Whether the sender cache still holds a transfer.
    pub fn cache_contains(&self, transfer_id: &str) -> bool {
        self.cache.contains_key(transfer_id)
    }
}
