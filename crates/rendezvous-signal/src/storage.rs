//! Room store contract and the in-memory backend
//!
//! A room store keeps, per room id, an append-ordered list of opaque member
//! entries with a refreshable expiry. Once the expiry passes, the room reads
//! as empty and is eventually reclaimed. The contract mirrors a key-value
//! list store: append, length, indexed read, and expire.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::try_join_all;
use tokio::time::Instant;
use tracing::{debug, error};

/// Storage backend for room member lists
///
/// Implementations must be safe to call concurrently. Calls against the
/// same room are not serialized by callers.
#[async_trait]
pub trait RoomStore: Send + Sync {
    /// Append an entry to the end of a room's list, creating the room if needed
    async fn append(&self, room_id: &str, entry: &str) -> Result<(), StorageError>;

    /// Number of live entries in a room (0 if absent or expired)
    async fn length(&self, room_id: &str) -> Result<usize, StorageError>;

    /// Entry at `index`, or `None` if the list is shorter
    async fn read_at(&self, room_id: &str, index: usize) -> Result<Option<String>, StorageError>;

    /// Reset a live room's expiry to `ttl` from now. No-op for absent rooms.
    /// A `ttl` too large to represent leaves the room without an expiry.
    async fn set_expiry(&self, room_id: &str, ttl: Duration) -> Result<(), StorageError>;

    /// Reclaim expired rooms, returning how many were removed
    async fn purge_expired(&self) -> Result<usize, StorageError>;

    /// Number of live rooms
    async fn room_count(&self) -> Result<usize, StorageError>;

    /// Read a room's whole list.
    ///
    /// The default reads the length and then fans out one indexed read per
    /// entry. Entries that vanish between the two steps are skipped, so a
    /// concurrent writer or expiry can yield a partial list.
    async fn read_all(&self, room_id: &str) -> Result<Vec<String>, StorageError> {
        let len = self.length(room_id).await?;
        let reads = (0..len).map(|index| self.read_at(room_id, index));
        let entries = try_join_all(reads).await?;
        Ok(entries.into_iter().flatten().collect())
    }

    /// Backend name for logging
    fn name(&self) -> &'static str;
}

/// A room's entries in memory
struct StoredRoom {
    entries: Vec<String>,
    expires_at: Option<Instant>,
}

impl StoredRoom {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory room store
///
/// Expired rooms read as empty immediately; `purge_expired` frees them.
#[derive(Default)]
pub struct MemoryStore {
    rooms: DashMap<String, StoredRoom>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against a live room, if there is one
    fn with_live<T>(&self, room_id: &str, f: impl FnOnce(&StoredRoom) -> T) -> Option<T> {
        let room = self.rooms.get(room_id)?;
        if room.is_expired(Instant::now()) {
            return None;
        }
        Some(f(room.value()))
    }
}

#[async_trait]
impl RoomStore for MemoryStore {
    async fn append(&self, room_id: &str, entry: &str) -> Result<(), StorageError> {
        let now = Instant::now();
        let mut room = self.rooms.entry(room_id.to_owned()).or_insert_with(|| StoredRoom {
            entries: Vec::new(),
            expires_at: None,
        });

        // An expired room that has not been purged yet starts over
        if room.is_expired(now) {
            room.entries.clear();
            room.expires_at = None;
        }

        room.entries.push(entry.to_owned());
        Ok(())
    }

    async fn length(&self, room_id: &str) -> Result<usize, StorageError> {
        Ok(self.with_live(room_id, |room| room.entries.len()).unwrap_or(0))
    }

    async fn read_at(&self, room_id: &str, index: usize) -> Result<Option<String>, StorageError> {
        Ok(self
            .with_live(room_id, |room| room.entries.get(index).cloned())
            .flatten())
    }

    async fn set_expiry(&self, room_id: &str, ttl: Duration) -> Result<(), StorageError> {
        let now = Instant::now();
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            if !room.is_expired(now) {
                room.expires_at = now.checked_add(ttl);
            }
        }
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, StorageError> {
        let now = Instant::now();
        let before = self.rooms.len();
        self.rooms.retain(|room_id, room| {
            let expired = room.is_expired(now);
            if expired {
                debug!("Room {} removed (idle timeout)", room_id);
            }
            !expired
        });
        Ok(before.saturating_sub(self.rooms.len()))
    }

    async fn room_count(&self) -> Result<usize, StorageError> {
        let now = Instant::now();
        Ok(self.rooms.iter().filter(|room| !room.is_expired(now)).count())
    }

    async fn read_all(&self, room_id: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .with_live(room_id, |room| room.entries.clone())
            .unwrap_or_default())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Storage errors
#[derive(Debug)]
pub enum StorageError {
    Database(rusqlite::Error),
    /// Redis command or connection failure
    Redis(redis::RedisError),
    /// Mutex lock was poisoned (indicates a panic occurred while holding the lock)
    LockPoisoned,
    /// The backend is unreachable or refused the operation
    Unavailable(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        error!("Database error: {:?}", e);
        StorageError::Database(e)
    }
}

impl From<redis::RedisError> for StorageError {
    fn from(e: redis::RedisError) -> Self {
        error!("Redis error: {:?}", e);
        StorageError::Redis(e)
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Database(e) => write!(f, "Database error: {}", e),
            StorageError::Redis(e) => write!(f, "Redis error: {}", e),
            StorageError::LockPoisoned => {
                write!(f, "Lock poisoned: a thread panicked while holding the lock")
            }
            StorageError::Unavailable(e) => write!(f, "Store unavailable: {}", e),
        }
    }
}

impl std::error::Error for StorageError {}
