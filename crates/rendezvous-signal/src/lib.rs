//! Rendezvous Signal Server
//!
//! UDP rendezvous and relay service for NAT traversal. Peers register the
//! address the server observes for them under a shared room id, learn the
//! addresses of the other members, and can relay short messages to those
//! members until a direct path is open.
//!
//! # Protocol
//!
//! 1. A peer sends `create` and receives a fresh room id
//! 2. Other peers send `connect` with that id and receive the member list
//! 3. Any member can send `info` to refresh the member list
//! 4. Members may `relay` envelopes to each other through the server
//! 5. Rooms expire after an idle timeout with no registration or query

pub mod events;
pub mod messages;
pub mod redis_store;
pub mod relay;
pub mod room;
pub mod server;
pub mod sqlite;
pub mod storage;
pub mod transport;

pub use events::ServerEvent;
pub use messages::{Envelope, Protocol};
pub use redis_store::RedisStore;
pub use relay::{Forward, RelayForwarder, RelayRejected};
pub use room::{RegisterError, RoomManager};
pub use server::SignalServer;
pub use sqlite::SqliteStore;
pub use storage::{MemoryStore, RoomStore, StorageError};
pub use transport::Transport;

pub use rendezvous_core::{DEFAULT_PORT, ROOM_IDLE_TIMEOUT_SECS};
