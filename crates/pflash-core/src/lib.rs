//! pflash-core: partial firmware updates for micro:bit-class devices over BLE.
//!
//! A full reflash replaces the entire image even though the runtime
//! template rarely changes between builds. This crate implements the
//! partial flashing protocol instead: it verifies that the image was
//! built against the template already on the device, then streams only
//! the program portion over the partial flashing GATT service.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Service UUIDs, flow-control signals, packet framing
//! - **Hex**: Intel HEX record decoding with bookmark/rewind
//! - **Link**: GATT abstraction (trait, event pump, mock)
//! - **Catalog**: Region listing via the memory map characteristic
//! - **Eligibility**: Template hash comparison
//! - **Transfer**: Batched streaming with retransmission
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator with full-update fallback
//!
//! # Example
//!
//! ```no_run
//! use pflash_core::session::{FlashSession, SessionConfig};
//! # fn open_link() -> pflash_core::link::MockLink { unimplemented!() }
//!
//! let config = SessionConfig {
//!     image_path: "firmware.hex".to_string(),
//!     ..Default::default()
//! };
//!
//! let session = FlashSession::new(config, open_link());
//! let outcome = session.run().expect("flash failed");
//! ```

pub mod catalog;
pub mod eligibility;
pub mod error;
pub mod events;
pub mod hex;
pub mod link;
pub mod protocol;
pub mod session;
pub mod transfer;

// Re-exports for convenience
pub use catalog::{MemoryMapClient, RegionDescriptor};
pub use eligibility::Eligibility;
pub use error::FlashError;
pub use events::{FlashEvent, FlashObserver, FlashPhase, LogLevel, NullObserver, TracingObserver};
pub use hex::{HexMetadata, HexReader, Record, RecordType};
pub use link::{CharId, EventPump, GattLink, LinkError, LinkEvent, MockLink};
pub use protocol::{FlowSignal, TransferPacket};
pub use session::{FallbackReason, FallbackRequest, FlashSession, Outcome, SessionConfig};
pub use transfer::{CancelToken, TransferEngine, TransferState, TransferStats};
