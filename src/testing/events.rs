use parking_lot::Mutex;
use serde_json::Value;

use crate::identity::Address;
use crate::transfer::ReceivedFile;
use crate::{Event, EventHandler};

/// Collects every emitted event for later assertions.
#[derive(Default)]
pub struct CollectingHandler {
    events: Mutex<Vec<Event>>,
}

impl CollectingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn messages(&self) -> Vec<(Address, Value)> {
        self.snapshot()
            .into_iter()
            .filter_map(|event| match event {
                Event::Message { from, value, .. } => Some((from, value)),
                _ => None,
            })
            .collect()
    }

    pub fn decrypted(&self) -> Vec<(Address, Value)> {
        self.snapshot()
            .into_iter()
            .filter_map(|event| match event {
                Event::Decrypted { from, value, .. } => Some((from, value)),
                _ => None,
            })
            .collect()
    }

    pub fn received_files(&self) -> Vec<ReceivedFile> {
        self.snapshot()
            .into_iter()
            .filter_map(|event| match event {
                Event::FileReceived { file } => Some(file),
                _ => None,
            })
            .collect()
    }

    pub fn transfer_failures(&self) -> Vec<(String, Vec<usize>)> {
        self.snapshot()
            .into_iter()
            .filter_map(|event| match event {
                Event::TransferFailed {
                    transfer_id,
                    missing,
                } => Some((transfer_id, missing)),
                _ => None,
            })
            .collect()
    }

    pub fn seen_peers(&self) -> Vec<Address> {
        self.snapshot()
            .into_iter()
            .filter_map(|event| match event {
                Event::PeerSeen { address } => Some(address),
                _ => None,
            })
            .collect()
    }
}

impl EventHandler for CollectingHandler {
    fn handle_event(&self, event: Event) {
        self.events.lock().push(event);
    }
}
