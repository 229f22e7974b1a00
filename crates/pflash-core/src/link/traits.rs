//! GATT link abstraction.
//!
//! Defines the `GattLink` trait at the seam between the protocol core
//! and the host platform's BLE stack, allowing a scripted mock for unit
//! testing. Device-facing operations are issued asynchronously; their
//! completions (and unsolicited notifications) are delivered as
//! `LinkEvent`s through `poll_event`, always bounded by a timeout.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::constants::{
    FLASH_CONTROL_CHARACTERISTIC, FLASH_WRITE_CHARACTERISTIC, MEMORY_MAP_CHARACTERISTIC,
};

/// Characteristics of the partial flashing service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharId {
    /// Region catalog: write selector, read reply.
    MemoryMap,
    /// Firmware data packets, write-without-response.
    FlashWrite,
    /// Flow-control signals by notification.
    FlashControl,
}

impl CharId {
    pub fn uuid(&self) -> &'static str {
        match self {
            CharId::MemoryMap => MEMORY_MAP_CHARACTERISTIC,
            CharId::FlashWrite => FLASH_WRITE_CHARACTERISTIC,
            CharId::FlashControl => FLASH_CONTROL_CHARACTERISTIC,
        }
    }
}

impl fmt::Display for CharId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CharId::MemoryMap => write!(f, "MemoryMap"),
            CharId::FlashWrite => write!(f, "FlashWrite"),
            CharId::FlashControl => write!(f, "FlashControl"),
        }
    }
}

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Not connected")]
    NotConnected,

    #[error("Partial flashing service not found")]
    ServiceNotFound,

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(CharId),

    #[error("Operation rejected: {0}")]
    OperationRejected(String),

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Device disconnected")]
    Disconnected,
}

/// Completion or notification delivered by the link.
///
/// The platform callback surface is modeled as this closed set of
/// variants, consumed by the state machine via pattern matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    ServicesDiscovered,
    CharacteristicRead {
        characteristic: CharId,
        value: Vec<u8>,
    },
    CharacteristicWritten {
        characteristic: CharId,
    },
    CharacteristicChanged {
        characteristic: CharId,
        value: Vec<u8>,
    },
    DescriptorWritten {
        characteristic: CharId,
    },
}

/// Abstract GATT link.
///
/// Operations on a single characteristic are strictly sequential: the
/// caller must consume the completion event for one operation before
/// issuing the next on that characteristic. `write_without_response` is
/// the exception; it returns the local queuing result synchronously and
/// produces no completion event.
pub trait GattLink: Send {
    /// Start connecting; completion arrives as `LinkEvent::Connected`.
    fn connect(&mut self) -> Result<(), LinkError>;

    /// Start service discovery; completion arrives as
    /// `LinkEvent::ServicesDiscovered`.
    fn discover_services(&mut self) -> Result<(), LinkError>;

    /// Whether the partial flashing service exposes this characteristic.
    fn has_characteristic(&self, id: CharId) -> bool;

    /// Acknowledged write; completion arrives as
    /// `LinkEvent::CharacteristicWritten`.
    fn write_characteristic(&mut self, id: CharId, value: &[u8]) -> Result<(), LinkError>;

    /// Read request; the value arrives as `LinkEvent::CharacteristicRead`.
    fn read_characteristic(&mut self, id: CharId) -> Result<(), LinkError>;

    /// Unacknowledged write. `Err` means the local stack rejected the
    /// packet (queuing failure), not a protocol-level NACK.
    fn write_without_response(&mut self, id: CharId, value: &[u8]) -> Result<(), LinkError>;

    /// Write the client characteristic configuration descriptor to
    /// enable notifications; completion arrives as
    /// `LinkEvent::DescriptorWritten`.
    fn enable_notifications(&mut self, id: CharId) -> Result<(), LinkError>;

    /// Wait up to `timeout` for the next event. `Timeout` if none
    /// arrives; never spins.
    fn poll_event(&mut self, timeout: Duration) -> Result<LinkEvent, LinkError>;

    /// Release the link. Safe to call in any state.
    fn disconnect(&mut self);
}
