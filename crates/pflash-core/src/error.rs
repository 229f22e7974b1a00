//! Crate-wide error taxonomy.

use thiserror::Error;

use crate::hex::HexError;
use crate::link::LinkError;
use crate::protocol::PacketError;

/// Failure modes of a partial flash attempt.
///
/// Image errors (`Decode`) abort the attempt outright; link errors
/// route to the full-update fallback after local recovery is exhausted.
#[derive(Error, Debug)]
pub enum FlashError {
    #[error("Image decoding failed: {0}")]
    Decode(#[from] HexError),

    #[error("Link failure: {0}")]
    Link(#[from] LinkError),

    #[error("Packet framing failed: {0}")]
    Packet(#[from] PacketError),

    #[error("Template hash does not match the device region hash")]
    NotEligible,

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Update cancelled")]
    Cancelled,
}

impl FlashError {
    /// Whether the fallback path should be attempted for this error.
    /// A defective image fails both paths, and a cancelled attempt must
    /// not silently turn into a full flash.
    pub fn is_fallback_candidate(&self) -> bool {
        match self {
            FlashError::Link(_) | FlashError::Protocol(_) | FlashError::NotEligible => true,
            FlashError::Decode(_) | FlashError::Packet(_) | FlashError::Cancelled => false,
        }
    }
}
