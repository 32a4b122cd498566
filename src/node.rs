use rand::RngCore;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::{Value, json};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::channel::{Channel, Handler};
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::identity::{Address, Identity};
use crate::overlay::{Overlay, PEER_HANDSHAKE, SeaPublicKeys};
use crate::store::{
    CHUNKS_PREFIX, FILES_PREFIX, GraphStore, MESSAGES_PREFIX, PRESENCE_PREFIX,
};
use crate::time::TimeProvider;
use crate::transfer::{REQUEST_CHUNKS, TRANSFER_CONFIRMED, Transfer};
use crate::{CallOrigin, Effect, Event, EventHandler, Task};

/// Status snapshot of a node for observability.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub address: Address,
    pub connections: usize,
    pub seen_packets: usize,
    pub overlay_peers: usize,
    pub inbound_transfers: usize,
    pub cached_transfers: usize,
    pub scheduled_tasks: usize,
}

#[derive(Debug, PartialEq, Eq)]
struct Scheduled {
    at: i64,
    seq: u64,
    task: Task,
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Orchestrates the channel, the optional encrypted overlay and the transfer
/// engine over one graph store.
///
/// The embedding driver owns the store's `map()` subscription and the clock:
/// it feeds every observed `(key, value)` pair into [`handle_update`] and
/// calls [`poll`] whenever the returned deadline passes. Everything else —
/// signing, verification, presence, key exchange, chunk pacing, sweeps,
/// retransmission — happens in here.
///
/// [`handle_update`]: Node::handle_update
/// [`poll`]: Node::poll
pub struct Node<S: GraphStore> {
    store: S,
    time: Arc<dyn TimeProvider>,
    config: NodeConfig,
    channel: Channel,
    overlay: Option<Overlay>,
    transfer: Transfer,
    tasks: BinaryHeap<Reverse<Scheduled>>,
    next_seq: u64,
    handler: Option<Arc<dyn EventHandler>>,
    destroyed: bool,
}

impl<S: GraphStore> Node<S> {
    pub fn new(
        identifier: impl Into<String>,
        identity: Identity,
        config: NodeConfig,
        store: S,
        time: Arc<dyn TimeProvider>,
        mut rng: StdRng,
    ) -> Self {
        let channel_rng = StdRng::seed_from_u64(rng.next_u64());
        let overlay_rng = StdRng::seed_from_u64(rng.next_u64());
        let transfer_rng = StdRng::seed_from_u64(rng.next_u64());
        let address = identity.address().clone();
        let overlay = config
            .encrypted
            .then(|| Overlay::new(config.overlay.clone(), overlay_rng));
        Self {
            store,
            time,
            channel: Channel::new(identifier, identity, config.channel.clone(), channel_rng),
            overlay,
            transfer: Transfer::new(address, config.transfer.clone(), transfer_rng),
            config,
            tasks: BinaryHeap::new(),
            next_seq: 0,
            handler: None,
            destroyed: false,
        }
    }

    pub fn set_event_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handler = Some(handler);
    }

    pub fn address(&self) -> &Address {
        self.channel.address()
    }

    /// Number of currently known channel peers.
    pub fn connections(&self) -> usize {
        self.channel.connections()
    }

    /// The overlay's public keys, when encryption is enabled.
    pub fn overlay_public(&self) -> Option<&SeaPublicKeys> {
        self.overlay.as_ref().map(Overlay::public)
    }

    /// Whether the sender cache still holds a transfer.
    pub fn cache_contains(&self, transfer_id: &str) -> bool {
        self.transfer.cache_contains(transfer_id)
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            address: self.channel.address().clone(),
            connections: self.channel.connections(),
            seen_packets: self.channel.seen_len(),
            overlay_peers: self.overlay.as_ref().map_or(0, Overlay::peer_count),
            inbound_transfers: self.transfer.inbound_transfers(),
            cached_transfers: self.transfer.cached_transfers(),
            scheduled_tasks: self.tasks.len(),
        }
    }

    /// Announces presence, arms the periodic ticks and emits `Ready`.
    pub fn start(&mut self) -> Result<()> {
        if self.destroyed {
            return Err(Error::Destroyed);
        }
        let now = self.time.now_ms();
        let mut effects = self.channel.startup(now);
        effects.push(Effect::Schedule {
            task: Task::Heartbeat,
            at: now + self.config.channel.heartbeat_interval_ms,
        });
        if let Some(overlay) = &mut self.overlay {
            effects.extend(overlay.startup(now));
        }
        self.process_effects(effects);
        Ok(())
    }

    /// Feeds one `(key, value)` pair observed on the graph-store
    /// subscription. Repeat delivery and reordering are tolerated.
    pub fn handle_update(&mut self, key: &str, value: &Value) {
        if self.destroyed {
            return;
        }
        let now = self.time.now_ms();
        let effects = if key.strip_prefix(MESSAGES_PREFIX).is_some() {
            self.channel.handle_record(value, now)
        } else if let Some(address) = key.strip_prefix(PRESENCE_PREFIX) {
            self.channel.handle_presence(address, value, now)
        } else if let Some(transfer_id) = key.strip_prefix(FILES_PREFIX) {
            self.transfer.handle_offer(transfer_id, value, now)
        } else if let Some(suffix) = key.strip_prefix(CHUNKS_PREFIX) {
            match suffix.split_once('/') {
                Some((transfer_id, _)) => self.transfer.handle_chunk(transfer_id, key, value, now),
                None => Vec::new(),
            }
        } else {
            debug!(%key, "ignoring update outside the known prefixes");
            Vec::new()
        };
        self.process_effects(effects);
    }

    /// Runs every due task. Returns the deadline of the next scheduled task,
    /// if any; the driver should call again no later than that.
    pub fn poll(&mut self) -> Option<i64> {
        if self.destroyed {
            return None;
        }
        let now = self.time.now_ms();
        while let Some(Reverse(scheduled)) = self.tasks.peek() {
            if scheduled.at > now {
                break;
            }
            let Some(Reverse(scheduled)) = self.tasks.pop() else {
                break;
            };
            let effects = self.run_task(scheduled.task, now);
            self.process_effects(effects);
        }
        self.tasks.peek().map(|Reverse(scheduled)| scheduled.at)
    }

    fn run_task(&mut self, task: Task, now: i64) -> Vec<Effect> {
        match task {
            Task::Heartbeat => {
                let mut effects = self.channel.heartbeat(now);
                effects.push(Effect::Schedule {
                    task: Task::Heartbeat,
                    at: now + self.config.channel.heartbeat_interval_ms,
                });
                effects
            }
            Task::SeenTrim => match &mut self.overlay {
                Some(overlay) => overlay.trim(now),
                None => Vec::new(),
            },
            Task::EmitChunk { transfer_id, index } => {
                self.transfer.emit_chunk(&transfer_id, index, now)
            }
            Task::TransferTimeout { transfer_id } => {
                self.transfer.handle_timeout(&transfer_id, now)
            }
            Task::Sweep {
                transfer_id,
                pass,
                after_timeout,
            } => self
                .transfer
                .handle_sweep(&transfer_id, pass, after_timeout, &self.store, now),
            Task::CacheSweep => self.transfer.cache_sweep(now),
        }
    }

    fn process_effects(&mut self, effects: Vec<Effect>) {
        let now = self.time.now_ms();
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Put { key, value } => {
                    if let Err(err) = self.store.put(&key, value) {
                        error!(%key, "graph store write failed: {err}");
                    }
                }
                Effect::Schedule { task, at } => {
                    self.next_seq += 1;
                    self.tasks.push(Reverse(Scheduled {
                        at,
                        seq: self.next_seq,
                        task,
                    }));
                }
                Effect::CallPeer {
                    to,
                    name,
                    args,
                    origin,
                } => match self.channel.call(&to, &name, &args, origin.clone(), now) {
                    Ok((_, effects)) => queue.extend(effects),
                    Err(Error::UnknownPeer(_)) => {
                        if let CallOrigin::TransferRetransmit { transfer_id } = origin {
                            queue.extend(self.transfer.retransmit_unavailable(&transfer_id));
                        } else {
                            debug!(%to, %name, "call to unknown peer dropped");
                        }
                    }
                    Err(err) => warn!(%to, %name, "call failed: {err}"),
                },
                Effect::SendTo { to, value } => match self.channel.send_to(&to, &value, now) {
                    Ok(effects) => queue.extend(effects),
                    Err(err) => warn!(%to, "directed send failed: {err}"),
                },
                Effect::RespondTo { to, nonce, result } => {
                    match self.channel.respond(&to, &nonce, &result, now) {
                        Ok(effects) => queue.extend(effects),
                        Err(err) => warn!(%to, "response send failed: {err}"),
                    }
                }
                Effect::Emit(event) => {
                    for extra in self.route_event(&event) {
                        queue.push_back(extra);
                    }
                    if let Some(handler) = &self.handler {
                        handler.handle_event(event);
                    }
                }
            }
        }
    }

    /// Inner routing of channel events to the overlay and transfer layers.
    fn route_event(&mut self, event: &Event) -> Vec<Effect> {
        match event {
            Event::PeerSeen { address } => match &self.overlay {
                Some(overlay) => overlay.handle_seen(address),
                None => Vec::new(),
            },
            Event::Message { from, value, id } => match &mut self.overlay {
                Some(overlay) => overlay.handle_message(from, value, *id),
                None => Vec::new(),
            },
            Event::Request {
                from,
                name,
                args,
                nonce,
            } => {
                let mut effects = Vec::new();
                let reply = if name == PEER_HANDSHAKE
                    && let Some(overlay) = &mut self.overlay
                {
                    let (reply, released) = overlay.handle_peer_request(from, args);
                    effects.extend(released);
                    reply
                } else if name == REQUEST_CHUNKS {
                    self.transfer.handle_chunk_request(args)
                } else if name == TRANSFER_CONFIRMED {
                    self.transfer.handle_confirm(args)
                } else {
                    match self.channel.invoke_handler(name, from, args) {
                        Some(result) => result,
                        None => json!({"error": "No such API call."}),
                    }
                };
                effects.push(Effect::RespondTo {
                    to: from.clone(),
                    nonce: nonce.clone(),
                    result: reply,
                });
                effects
            }
            Event::Response { nonce, result, .. } => {
                match self.channel.take_pending(nonce) {
                    Some(CallOrigin::TransferRetransmit { transfer_id }) => {
                        self.transfer.handle_retransmit_reply(&transfer_id, result)
                    }
                    Some(CallOrigin::OverlayHandshake) => {
                        debug!("peer handshake acknowledged");
                        Vec::new()
                    }
                    Some(CallOrigin::TransferConfirm) | Some(CallOrigin::Application) | None => {
                        Vec::new()
                    }
                }
            }
            _ => Vec::new(),
        }
    }

    /// Broadcasts a message, through the overlay when encryption is enabled.
    pub fn send(&mut self, value: &Value) -> Result<()> {
        if self.destroyed {
            return Err(Error::Destroyed);
        }
        let now = self.time.now_ms();
        let effects = match &mut self.overlay {
            Some(overlay) => overlay.broadcast(value),
            None => self.channel.broadcast(value, now)?,
        };
        self.process_effects(effects);
        Ok(())
    }

    /// Directed send, through the overlay when encryption is enabled. Fails
    /// with `UnknownPeer` when the recipient's keys are not known.
    pub fn send_to(&mut self, to: &Address, value: &Value) -> Result<()> {
        if self.destroyed {
            return Err(Error::Destroyed);
        }
        let now = self.time.now_ms();
        let effects = match &mut self.overlay {
            Some(overlay) => overlay.direct(to, value)?,
            None => self.channel.send_to(to, value, now)?,
        };
        self.process_effects(effects);
        Ok(())
    }

    /// Installs an RPC handler; overwrites any previous handler of the name.
    pub fn register(&mut self, name: impl Into<String>, doc: Option<String>, func: Handler) {
        self.channel.register(name, doc, func);
    }

    /// Registered handler names and docstrings.
    pub fn api_docs(&self) -> Vec<(String, Option<String>)> {
        self.channel.api_docs()
    }

    /// Sends a request to a peer. The returned nonce correlates the
    /// eventual `Response` event.
    pub fn call(&mut self, to: &Address, name: &str, args: &Value) -> Result<String> {
        if self.destroyed {
            return Err(Error::Destroyed);
        }
        let now = self.time.now_ms();
        let (nonce, effects) =
            self.channel
                .call(to, name, args, CallOrigin::Application, now)?;
        self.process_effects(effects);
        Ok(nonce)
    }

    /// Broadcasts a ping packet.
    pub fn ping(&mut self) -> Result<()> {
        if self.destroyed {
            return Err(Error::Destroyed);
        }
        let now = self.time.now_ms();
        let effects = self.channel.ping(now)?;
        self.process_effects(effects);
        Ok(())
    }

    /// Publishes a file to the room and returns its transfer code. A failed
    /// offer publish surfaces as `OfferTimeout`, with the code carried in
    /// the error so the caller can still hand it out.
    pub fn send_file(&mut self, name: &str, mime: Option<&str>, data: &[u8]) -> Result<String> {
        if self.destroyed {
            return Err(Error::Destroyed);
        }
        let now = self.time.now_ms();
        let (code, effects) = self.transfer.send_file(name, mime, data, now)?;
        let offer_key = format!("{FILES_PREFIX}{code}");
        let mut offer_error = None;
        let mut rest = Vec::new();
        for effect in effects {
            match effect {
                Effect::Put { key, value } if key == offer_key => {
                    if let Err(err) = self.store.put(&key, value) {
                        warn!(%code, "file offer publish failed: {err}");
                        offer_error = Some(err);
                    }
                }
                other => rest.push(other),
            }
        }
        self.process_effects(rest);
        match offer_error {
            Some(source) => Err(Error::OfferTimeout { code, source }),
            None => Ok(code),
        }
    }

    /// Broadcasts a leave packet, cancels every timer, drops pending calls
    /// and releases all component state. Idempotent.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        let now = self.time.now_ms();
        match self.channel.leave(now) {
            Ok(effects) => self.process_effects(effects),
            Err(err) => warn!("leave broadcast failed: {err}"),
        }
        self.channel.clear();
        if let Some(overlay) = &mut self.overlay {
            overlay.clear();
        }
        self.transfer.clear();
        self.tasks.clear();
        self.destroyed = true;
    }
}
