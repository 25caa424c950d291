//! Room registration and membership queries
//!
//! Rooms live entirely in the [`RoomStore`]: a room is the list of member
//! addresses stored under its id, and it exists for as long as that list is
//! non-empty and unexpired. Every registration and every query pushes the
//! expiry out by the configured idle timeout.
//!
//! Registrations and queries on the same room are not serialized against
//! each other. A query racing a registration may or may not see the new
//! member, and a query racing expiry may see a partial list.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use rendezvous_core::crypto::try_generate_room_id;
use rendezvous_core::{PeerAddress, RoomError, RoomId};

use crate::events::{Events, ServerEvent};
use crate::storage::{RoomStore, StorageError};

/// Attempts at drawing a room id that is not already live
const ROOM_ID_ATTEMPTS: usize = 3;

/// Why a registration was not stored
#[derive(Error, Debug)]
pub enum RegisterError {
    #[error("random id generation failed: {0}")]
    Rng(String),

    #[error("no unused room id after {0} attempts")]
    IdExhausted(usize),

    #[error("member encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{0}")]
    Storage(#[from] StorageError),
}

/// Room create/join/info semantics over a room store
pub struct RoomManager {
    store: Arc<dyn RoomStore>,
    idle_timeout: Duration,
    events: Events,
}

impl RoomManager {
    pub fn new(store: Arc<dyn RoomStore>, idle_timeout: Duration, events: Events) -> Self {
        Self {
            store,
            idle_timeout,
            events,
        }
    }

    /// Add a peer to a room, creating the room if `id` is absent.
    ///
    /// `source` is the transport-observed address. When the peer declares a
    /// different local port it will send from, that (ip, port) is stored as
    /// a second entry.
    pub async fn register(
        &self,
        id: Option<&str>,
        source: PeerAddress,
        declared_port: Option<u16>,
    ) -> Result<RoomId, RegisterError> {
        let room_id = match id {
            Some(id) => id.to_owned(),
            None => self.fresh_room_id().await?,
        };

        for entry in registration_entries(source, declared_port) {
            let encoded = serde_json::to_string(&entry)?;
            self.store.append(&room_id, &encoded).await?;
        }
        self.store.set_expiry(&room_id, self.idle_timeout).await?;

        if id.is_none() {
            info!("Room created: {} by {}", room_id, source);
        } else {
            debug!("Peer {} registered in room {}", source, room_id);
        }
        Ok(room_id)
    }

    /// Members of a room, excluding the requester's own entries.
    ///
    /// Entries equal to `requester` are removed, and when the requester
    /// declared a port, so are entries equal to (requester ip, that port).
    /// Store failures are reported as [`RoomError::NotFound`].
    pub async fn query(
        &self,
        id: &str,
        requester: PeerAddress,
        declared_port: Option<u16>,
    ) -> Result<Vec<PeerAddress>, RoomError> {
        let entries = self
            .store
            .read_all(id)
            .await
            .map_err(|e| self.store_failed(id, e))?;

        if entries.is_empty() {
            return Err(RoomError::NotFound);
        }

        self.store
            .set_expiry(id, self.idle_timeout)
            .await
            .map_err(|e| self.store_failed(id, e))?;

        let declared = declared_port.map(|port| requester.with_port(port));
        Ok(entries
            .iter()
            .filter_map(|raw| parse_member(id, raw))
            .filter(|member| *member != requester && Some(*member) != declared)
            .collect())
    }

    async fn fresh_room_id(&self) -> Result<RoomId, RegisterError> {
        for _ in 0..ROOM_ID_ATTEMPTS {
            let id = try_generate_room_id().map_err(|e| RegisterError::Rng(e.to_string()))?;
            if self.store.length(&id).await? == 0 {
                return Ok(id);
            }
            warn!("Generated room id {} is already live, drawing another", id);
        }
        Err(RegisterError::IdExhausted(ROOM_ID_ATTEMPTS))
    }

    fn store_failed(&self, room_id: &str, error: StorageError) -> RoomError {
        warn!("Store failure on room {}: {}", room_id, error);
        self.events.emit(ServerEvent::StoreFailed {
            room_id: room_id.to_owned(),
            error: error.to_string(),
        });
        RoomError::NotFound
    }
}

/// Entries stored for one registration
fn registration_entries(source: PeerAddress, declared_port: Option<u16>) -> Vec<PeerAddress> {
    let mut entries = vec![source];
    match declared_port {
        Some(port) if port != 0 && port != source.port => entries.push(source.with_port(port)),
        _ => {}
    }
    entries
}

fn parse_member(room_id: &str, raw: &str) -> Option<PeerAddress> {
    match serde_json::from_str(raw) {
        Ok(member) => Some(member),
        Err(e) => {
            debug!("Skipping unreadable entry in room {}: {}", room_id, e);
            None
        }
    }
}
