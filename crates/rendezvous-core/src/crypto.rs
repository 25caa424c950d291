//! Random identifier generation
//!
//! Room ids are 160-bit digests of fresh entropy, rendered as lowercase hex.

use blake3::Hasher;
use tracing::debug;

use crate::types::RoomId;

/// Bytes of entropy hashed into each room id
const ROOM_ID_ENTROPY: usize = 256;

/// Room id length in bytes (160 bits)
pub const ROOM_ID_BYTES: usize = 20;

/// Try to generate a random room id, returning an error if RNG fails
pub fn try_generate_room_id() -> Result<RoomId, getrandom::Error> {
    let mut seed = [0u8; ROOM_ID_ENTROPY];
    getrandom::getrandom(&mut seed)?;

    let mut hasher = Hasher::new();
    hasher.update(&seed);
    let mut digest = [0u8; ROOM_ID_BYTES];
    hasher.finalize_xof().fill(&mut digest);

    let id = hex::encode(digest);
    debug!("Generated room id {}", id);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_format() {
        let id = try_generate_room_id().unwrap();
        assert_eq!(id.len(), ROOM_ID_BYTES * 2);
        assert!(id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')));
    }

    #[test]
    fn test_room_ids_are_unique() {
        let a = try_generate_room_id().unwrap();
        let b = try_generate_room_id().unwrap();
        assert_ne!(a, b);
    }
}
