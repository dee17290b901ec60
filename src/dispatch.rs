//! The cross-node/cross-connection dispatcher: turns durable inserts (and
//! ephemeral pass-throughs) into a local real-time stream, and fans each
//! incoming event out to every registered client channel (spec.md §4.5).
//!
//! Per design note §9 "Dispatch fan-out": the per-client channel pattern
//! avoids holding the subscription map lock during I/O, and each client's
//! channel is bounded so a slow consumer drops rather than blocks the
//! publisher.
use crate::event::Event;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Per-client channel capacity. A full channel means the consumer isn't
/// keeping up; the publish loop drops for that client rather than stall.
pub const CLIENT_CHANNEL_CAPACITY: usize = 512;

pub struct Dispatcher {
    clients: Mutex<HashMap<Uuid, mpsc::Sender<Event>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Dispatcher {
        Dispatcher {
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new client, returning its id and the receive half of its
    /// channel.
    pub fn add_client(&self) -> (Uuid, mpsc::Receiver<Event>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);
        self.clients.lock().unwrap().insert(id, tx);
        (id, rx)
    }

    pub fn remove_client(&self, id: &Uuid) {
        self.clients.lock().unwrap().remove(id);
    }

    /// Enqueue one copy of `event` onto every registered client channel.
    /// A full channel is a dropped delivery for that client, not a
    /// publisher-side error — consistent with "never let a slow consumer
    /// degrade the server globally."
    pub fn publish(&self, event: &Event) {
        let clients = self.clients.lock().unwrap();
        for tx in clients.values() {
            let _ = tx.try_send(event.clone());
        }
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }
}
