//! Error types for the rendezvous protocol

use thiserror::Error;

/// Protocol-level errors
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("decode failed: {0}")]
    Decode(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Room-level failures surfaced by the room manager
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    /// Absent, expired, or unreadable room. Store failures are reported
    /// the same way as genuine absence.
    #[error("no such room")]
    NotFound,
}

impl RoomError {
    /// Reason string sent to clients in `error` envelopes
    pub fn reason(&self) -> &'static str {
        match self {
            RoomError::NotFound => "no such room",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_reason() {
        assert_eq!(RoomError::NotFound.reason(), "no such room");
        assert_eq!(RoomError::NotFound.to_string(), "no such room");
    }

    #[test]
    fn test_too_large_display() {
        let err = ProtocolError::MessageTooLarge { size: 70000, max: 65507 };
        assert_eq!(err.to_string(), "message too large: 70000 bytes (max 65507)");
    }
}
