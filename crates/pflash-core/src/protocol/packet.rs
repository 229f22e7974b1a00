//! Transfer packet framing and flow-control signal parsing.
//!
//! A transfer packet is the payload bytes followed by a four-byte
//! trailer: 16-bit offset then 16-bit sequence number, both big-endian.
//! The flow-control signal is one byte delivered by notification.

use std::fmt;

use thiserror::Error;

use crate::hex::Record;
use crate::protocol::constants::{
    END_OF_FLASH_OFFSET, END_OF_FLASH_PAYLOAD, END_OF_FLASH_SEQUENCE, LINK_MTU,
    PACKET_STATE_RETRANSMIT, PACKET_STATE_SENT, PACKET_STATE_WAITING, PACKET_TRAILER_LEN,
    RESYNC_OFFSET, RESYNC_PAYLOAD,
};

#[derive(Error, Debug)]
pub enum PacketError {
    #[error("Payload of {len} bytes exceeds the {mtu}-byte link MTU")]
    PayloadTooLarge { len: usize, mtu: usize },
}

/// Single-byte signal on the flash control characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSignal {
    /// No signal for the current batch yet.
    Waiting,
    /// Batch accepted.
    Sent,
    /// Device requests a resend from the last bookmark.
    Retransmit,
}

impl FlowSignal {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            PACKET_STATE_WAITING => Some(FlowSignal::Waiting),
            PACKET_STATE_SENT => Some(FlowSignal::Sent),
            PACKET_STATE_RETRANSMIT => Some(FlowSignal::Retransmit),
            _ => None,
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            FlowSignal::Waiting => PACKET_STATE_WAITING,
            FlowSignal::Sent => PACKET_STATE_SENT,
            FlowSignal::Retransmit => PACKET_STATE_RETRANSMIT,
        }
    }
}

impl fmt::Display for FlowSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowSignal::Waiting => write!(f, "WAITING"),
            FlowSignal::Sent => write!(f, "SENT"),
            FlowSignal::Retransmit => write!(f, "RETRANSMIT"),
        }
    }
}

/// One framed write on the flash data characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPacket {
    pub payload: Vec<u8>,
    pub offset: u16,
    pub sequence: u16,
}

impl TransferPacket {
    pub fn new(payload: Vec<u8>, offset: u16, sequence: u16) -> Result<Self, PacketError> {
        if payload.len() + PACKET_TRAILER_LEN > LINK_MTU {
            return Err(PacketError::PayloadTooLarge {
                len: payload.len(),
                mtu: LINK_MTU,
            });
        }
        Ok(Self {
            payload,
            offset,
            sequence,
        })
    }

    /// Frame a decoded record: its payload bytes at its record offset.
    pub fn from_record(record: &Record, sequence: u16) -> Result<Self, PacketError> {
        Self::new(record.payload_bytes(), record.address, sequence)
    }

    /// Synchronization packet sent after a local write failure. Carries
    /// the same sequence number as the failed packet; the device
    /// resynchronizes on the reserved offset.
    pub fn resync(sequence: u16) -> Self {
        Self {
            payload: decode_hex(RESYNC_PAYLOAD),
            offset: RESYNC_OFFSET,
            sequence,
        }
    }

    /// Terminal packet signaling end-of-image; offset and sequence are
    /// all bits set.
    pub fn end_of_flash() -> Self {
        Self {
            payload: decode_hex(END_OF_FLASH_PAYLOAD),
            offset: END_OF_FLASH_OFFSET,
            sequence: END_OF_FLASH_SEQUENCE,
        }
    }

    /// Wire encoding: payload || offset_be || sequence_be.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + PACKET_TRAILER_LEN);
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.offset.to_be_bytes());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out
    }
}

fn decode_hex(hex: &str) -> Vec<u8> {
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16).unwrap_or(0) as u8;
            let lo = (pair[1] as char).to_digit(16).unwrap_or(0) as u8;
            (hi << 4) | lo
        })
        .collect()
}
