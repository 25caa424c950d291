//! SQLite room store
//!
//! Keeps room member lists in an embedded database so the server can run
//! against a file-backed store. Expiry timestamps are wall-clock
//! milliseconds; expired rooms read as empty until purged.
//!
//! rusqlite is synchronous, so every call runs on tokio's blocking pool and
//! the datagram task awaits it there.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::storage::{RoomStore, StorageError};

/// Predicate selecting rooms that have not expired as of `:now`
const LIVE: &str = "(expires_at IS NULL OR expires_at > :now)";

/// SQLite storage backend
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a new SQLite database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| StorageError::LockPoisoned)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StorageError::Unavailable(e.to_string()))?
    }
}

/// Initialize the database schema
fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS rooms (
            room_id TEXT PRIMARY KEY,
            expires_at INTEGER
        );

        CREATE TABLE IF NOT EXISTS members (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            room_id TEXT NOT NULL,
            entry TEXT NOT NULL,
            FOREIGN KEY (room_id) REFERENCES rooms(room_id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_members_room_id ON members(room_id, seq);
        CREATE INDEX IF NOT EXISTS idx_rooms_expires_at ON rooms(expires_at);
        "#,
    )?;

    info!("Storage schema initialized");
    Ok(())
}

#[async_trait]
impl RoomStore for SqliteStore {
    async fn append(&self, room_id: &str, entry: &str) -> Result<(), StorageError> {
        let (room_id, entry) = (room_id.to_owned(), entry.to_owned());
        self.blocking(move |conn| {
            let now = current_timestamp_ms();
            let tx = conn.transaction()?;

            // An expired room that has not been purged yet starts over
            let expired: bool = tx
                .query_row(
                    "SELECT expires_at IS NOT NULL AND expires_at <= ?2 FROM rooms WHERE room_id = ?1",
                    params![room_id, now],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(false);
            if expired {
                tx.execute("DELETE FROM members WHERE room_id = ?1", params![room_id])?;
                tx.execute("DELETE FROM rooms WHERE room_id = ?1", params![room_id])?;
            }

            tx.execute(
                "INSERT OR IGNORE INTO rooms (room_id, expires_at) VALUES (?1, NULL)",
                params![room_id],
            )?;
            tx.execute(
                "INSERT INTO members (room_id, entry) VALUES (?1, ?2)",
                params![room_id, entry],
            )?;
            tx.commit()?;

            debug!("Entry appended to room {}", room_id);
            Ok(())
        })
        .await
    }

    async fn length(&self, room_id: &str) -> Result<usize, StorageError> {
        let room_id = room_id.to_owned();
        self.blocking(move |conn| {
            let count: i64 = conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM members m JOIN rooms r ON r.room_id = m.room_id
                     WHERE m.room_id = :room AND {LIVE}"
                ),
                rusqlite::named_params! { ":room": room_id, ":now": current_timestamp_ms() },
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    async fn read_at(&self, room_id: &str, index: usize) -> Result<Option<String>, StorageError> {
        let room_id = room_id.to_owned();
        let index = i64::try_from(index).unwrap_or(i64::MAX);
        self.blocking(move |conn| {
            let entry = conn
                .query_row(
                    &format!(
                        "SELECT m.entry FROM members m JOIN rooms r ON r.room_id = m.room_id
                         WHERE m.room_id = :room AND {LIVE}
                         ORDER BY m.seq LIMIT 1 OFFSET :index"
                    ),
                    rusqlite::named_params! {
                        ":room": room_id,
                        ":now": current_timestamp_ms(),
                        ":index": index,
                    },
                    |row| row.get(0),
                )
                .optional()?;
            Ok(entry)
        })
        .await
    }

    async fn set_expiry(&self, room_id: &str, ttl: Duration) -> Result<(), StorageError> {
        let room_id = room_id.to_owned();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.blocking(move |conn| {
            let now = current_timestamp_ms();
            let expires_at = now.saturating_add(ttl_ms);

            conn.execute(
                &format!("UPDATE rooms SET expires_at = :expires WHERE room_id = :room AND {LIVE}"),
                rusqlite::named_params! { ":expires": expires_at, ":room": room_id, ":now": now },
            )?;
            Ok(())
        })
        .await
    }

    async fn purge_expired(&self) -> Result<usize, StorageError> {
        self.blocking(|conn| {
            let now = current_timestamp_ms();
            let tx = conn.transaction()?;

            // Delete members first (due to foreign key)
            tx.execute(
                "DELETE FROM members WHERE room_id IN
                 (SELECT room_id FROM rooms WHERE expires_at IS NOT NULL AND expires_at <= ?1)",
                params![now],
            )?;
            let count = tx.execute(
                "DELETE FROM rooms WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now],
            )?;
            tx.commit()?;

            if count > 0 {
                debug!("Purged {} expired rooms from storage", count);
            }
            Ok(count)
        })
        .await
    }

    async fn room_count(&self) -> Result<usize, StorageError> {
        self.blocking(|conn| {
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM rooms WHERE {LIVE}"),
                rusqlite::named_params! { ":now": current_timestamp_ms() },
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    async fn read_all(&self, room_id: &str) -> Result<Vec<String>, StorageError> {
        let room_id = room_id.to_owned();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT m.entry FROM members m JOIN rooms r ON r.room_id = m.room_id
                 WHERE m.room_id = :room AND {LIVE}
                 ORDER BY m.seq"
            ))?;

            let entries = stmt
                .query_map(
                    rusqlite::named_params! { ":room": room_id, ":now": current_timestamp_ms() },
                    |row| row.get(0),
                )?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(entries)
        })
        .await
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

/// Get current Unix timestamp in milliseconds
fn current_timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_storage_creation() {
        let storage = SqliteStore::in_memory().unwrap();
        assert_eq!(storage.room_count().await.unwrap(), 0);
        assert_eq!(storage.name(), "sqlite");
    }

    #[tokio::test]
    async fn test_list_operations() {
        let storage = SqliteStore::in_memory().unwrap();

        assert_ok!(storage.append("room", "a").await);
        assert_ok!(storage.append("room", "b").await);
        assert_ok!(storage.append("other", "c").await);

        assert_eq!(storage.length("room").await.unwrap(), 2);
        assert_eq!(storage.read_at("room", 0).await.unwrap().as_deref(), Some("a"));
        assert_eq!(storage.read_at("room", 1).await.unwrap().as_deref(), Some("b"));
        assert_eq!(storage.read_at("room", 2).await.unwrap(), None);
        assert_eq!(storage.read_all("room").await.unwrap(), vec!["a", "b"]);
        assert_eq!(storage.room_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_expired_room_reads_empty() {
        let storage = SqliteStore::in_memory().unwrap();
        storage.append("room", "a").await.unwrap();
        storage.set_expiry("room", Duration::ZERO).await.unwrap();

        assert_eq!(storage.length("room").await.unwrap(), 0);
        assert!(storage.read_all("room").await.unwrap().is_empty());
        assert_eq!(storage.room_count().await.unwrap(), 0);

        // Refreshing an expired room does not revive it
        storage.set_expiry("room", Duration::from_secs(60)).await.unwrap();
        assert_eq!(storage.length("room").await.unwrap(), 0);

        assert_eq!(storage.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_append_after_expiry_starts_fresh() {
        let storage = SqliteStore::in_memory().unwrap();
        storage.append("room", "old").await.unwrap();
        storage.set_expiry("room", Duration::ZERO).await.unwrap();

        storage.append("room", "new").await.unwrap();
        assert_eq!(storage.read_all("room").await.unwrap(), vec!["new"]);
    }

    #[tokio::test]
    async fn test_unrepresentable_ttl_keeps_room_live() {
        let storage = SqliteStore::in_memory().unwrap();
        storage.append("room", "a").await.unwrap();
        assert_ok!(storage.set_expiry("room", Duration::MAX).await);

        assert_eq!(storage.length("room").await.unwrap(), 1);
        assert_eq!(storage.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_calls_share_the_connection() {
        let storage = Arc::new(SqliteStore::in_memory().unwrap());

        let writers = (0..16).map(|i| {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move { storage.append("room", &format!("e{}", i)).await })
        });
        for writer in futures_util::future::join_all(writers).await {
            assert_ok!(writer.unwrap());
        }

        assert_eq!(storage.length("room").await.unwrap(), 16);
        assert_eq!(storage.read_all("room").await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rooms.db");

        {
            let storage = SqliteStore::open(&path).unwrap();
            storage.append("room", "a").await.unwrap();
            storage.set_expiry("room", Duration::from_secs(300)).await.unwrap();
        }

        let storage = SqliteStore::open(&path).unwrap();
        assert_eq!(storage.read_all("room").await.unwrap(), vec!["a"]);
    }
}
