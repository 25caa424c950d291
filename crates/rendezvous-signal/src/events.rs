//! Observer channel for per-datagram failures
//!
//! Nothing the server drops is ever reported back to the sender. Operators
//! and tests see those drops here instead.

use std::net::SocketAddr;

use tokio::sync::broadcast;

use rendezvous_core::{PeerAddress, RoomId};

/// Capacity of the event channel; slow subscribers lag rather than block
const EVENT_CAPACITY: usize = 256;

/// Something the server handled without replying
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerEvent {
    /// A datagram could not be parsed
    DecodeFailed { from: SocketAddr, error: String },

    /// A reply could not be serialized
    EncodeFailed { to: PeerAddress, error: String },

    /// Registration could not be stored
    RegisterFailed { from: PeerAddress, error: String },

    /// The store failed while reading or refreshing a room
    StoreFailed { room_id: RoomId, error: String },

    /// A relay envelope was dropped
    RelayRejected { room_id: RoomId, from: PeerAddress, to: PeerAddress },

    /// Sending a datagram failed
    SendFailed { to: PeerAddress, error: String },

    /// Expired rooms were reclaimed
    RoomsPurged { count: usize },
}

/// Sending half of the observer channel
#[derive(Clone)]
pub struct Events {
    tx: broadcast::Sender<ServerEvent>,
}

impl Events {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event; dropped if nobody is listening
    pub fn emit(&self, event: ServerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }
}

impl Default for Events {
    fn default() -> Self {
        Self::new()
    }
}
