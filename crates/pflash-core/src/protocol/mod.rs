//! Protocol module - partial flashing wire definitions.

pub mod constants;
pub mod packet;

pub use constants::*;
pub use packet::{FlowSignal, PacketError, TransferPacket};
