//! Rendezvous Core - Shared types, configuration, and identifier generation
//!
//! This crate contains the foundational types used by the rendezvous server.
//! It has no dependencies on networking or storage code.

pub mod config;
pub mod crypto;
pub mod error;
pub mod types;

pub use config::{Config, ConfigError, RoomConfig, ServerConfig, StoreBackend, StoreConfig};
pub use error::*;
pub use types::*;

/// Default UDP port
pub const DEFAULT_PORT: u16 = 4300;

/// Room idle time before the store reclaims it (5 minutes)
pub const ROOM_IDLE_TIMEOUT_SECS: u64 = 300;

/// Largest UDP payload the server will receive or send
pub const MAX_DATAGRAM_SIZE: usize = 65_507;
