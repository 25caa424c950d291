//! Relay forwarding between room members
//!
//! A relay envelope is delivered only to an address that is currently
//! registered in the named room, so the server cannot be used to reflect
//! traffic at arbitrary hosts. Rejections are silent towards the sender;
//! an error reply would let a prober learn which rooms and members exist.

use std::sync::Arc;

use tracing::debug;

use rendezvous_core::{PeerAddress, RoomId};

use crate::messages::{Envelope, Protocol};
use crate::room::RoomManager;

/// An envelope cleared for delivery
#[derive(Debug, Clone, PartialEq)]
pub struct Forward {
    pub to: PeerAddress,
    pub envelope: Envelope,
}

/// Why a relay envelope was dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayRejected {
    /// `id` or `to` missing
    Incomplete,
    /// Room absent, expired, or unreadable
    UnknownRoom { room_id: RoomId, to: PeerAddress },
    /// Destination is not registered in the room
    NotAMember { room_id: RoomId, to: PeerAddress },
}

/// Validates relay envelopes against room membership
pub struct RelayForwarder {
    rooms: Arc<RoomManager>,
}

impl RelayForwarder {
    pub fn new(rooms: Arc<RoomManager>) -> Self {
        Self { rooms }
    }

    /// Decide whether `envelope`, received from `source`, may be forwarded.
    ///
    /// Any client-supplied `from` is replaced by `source`. The lookup goes
    /// through [`RoomManager::query`], so it also refreshes the room's
    /// idle expiry.
    pub async fn relay(
        &self,
        mut envelope: Envelope,
        source: PeerAddress,
    ) -> Result<Forward, RelayRejected> {
        let (Some(room_id), Some(to)) = (envelope.id.clone(), envelope.to) else {
            return Err(RelayRejected::Incomplete);
        };

        envelope.from = Some(source);
        envelope.protocol = Protocol::Relay;

        let members = match self.rooms.query(&room_id, source, None).await {
            Ok(members) => members,
            Err(e) => {
                debug!("Relay from {} into room {} dropped: {}", source, room_id, e);
                return Err(RelayRejected::UnknownRoom { room_id, to });
            }
        };

        if !members.contains(&to) {
            debug!("Relay from {} to non-member {} dropped", source, to);
            return Err(RelayRejected::NotAMember { room_id, to });
        }

        Ok(Forward { to, envelope })
    }
}
