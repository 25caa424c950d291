//! Redis room store
//!
//! Each room is a Redis list under `rendezvous:room:<id>`. Appends are
//! `RPUSH`, reads are `LLEN`/`LINDEX`/`LRANGE`, and the idle timeout is a
//! key expiry, so Redis reclaims idle rooms on its own.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info};

use crate::storage::{RoomStore, StorageError};

/// Prefix of every room key
const KEY_PREFIX: &str = "rendezvous:room:";

/// Keys requested per `SCAN` round trip when counting rooms
const SCAN_BATCH: usize = 256;

/// Largest expiry handed to `PEXPIRE`; Redis rejects deadlines that overflow
const MAX_EXPIRY_MS: i64 = i64::MAX / 2;

/// Redis storage backend
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to a Redis server. The connection is re-established
    /// automatically if it drops later.
    pub async fn connect(host: &str, port: u16) -> Result<Self, StorageError> {
        let url = redis_url(host, port);
        let client = redis::Client::open(url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to Redis room store at {}", url);
        Ok(Self { conn })
    }
}

fn redis_url(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("redis://[{}]:{}/", host, port)
    } else {
        format!("redis://{}:{}/", host, port)
    }
}

fn room_key(room_id: &str) -> String {
    format!("{KEY_PREFIX}{room_id}")
}

/// `PEXPIRE` argument for `ttl`, or `None` when it is too large to express
fn expiry_ms(ttl: Duration) -> Option<i64> {
    i64::try_from(ttl.as_millis())
        .ok()
        .filter(|ms| *ms <= MAX_EXPIRY_MS)
}

#[async_trait]
impl RoomStore for RedisStore {
    async fn append(&self, room_id: &str, entry: &str) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let _len: usize = conn.rpush(room_key(room_id), entry).await?;
        debug!("Entry appended to room {}", room_id);
        Ok(())
    }

    async fn length(&self, room_id: &str) -> Result<usize, StorageError> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(room_key(room_id)).await?)
    }

    async fn read_at(&self, room_id: &str, index: usize) -> Result<Option<String>, StorageError> {
        let mut conn = self.conn.clone();
        let index = isize::try_from(index).unwrap_or(isize::MAX);
        Ok(conn.lindex(room_key(room_id), index).await?)
    }

    async fn set_expiry(&self, room_id: &str, ttl: Duration) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let key = room_key(room_id);

        // Both commands leave absent keys alone
        let _applied: i64 = match expiry_ms(ttl) {
            Some(ms) => redis::cmd("PEXPIRE").arg(&key).arg(ms).query_async(&mut conn).await?,
            None => redis::cmd("PERSIST").arg(&key).query_async(&mut conn).await?,
        };
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, StorageError> {
        // Expired keys are dropped by Redis itself
        Ok(0)
    }

    async fn room_count(&self) -> Result<usize, StorageError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{KEY_PREFIX}*");
        let mut cursor: u64 = 0;
        let mut count = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            count += keys.len();
            if next == 0 {
                return Ok(count);
            }
            cursor = next;
        }
    }

    async fn read_all(&self, room_id: &str) -> Result<Vec<String>, StorageError> {
        let mut conn = self.conn.clone();
        Ok(conn.lrange(room_key(room_id), 0, -1).await?)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
