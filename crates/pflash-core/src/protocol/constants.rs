//! Partial flashing protocol constants.
//!
//! Derived from the micro:bit partial flashing service contract: a GATT
//! service with one memory-map characteristic (region catalog), one
//! write-without-response data characteristic, and one notify
//! characteristic carrying single-byte flow-control signals.

// ============================================================================
// GATT identifiers
// ============================================================================

/// Partial flashing service UUID.
pub const PARTIAL_FLASHING_SERVICE: &str = "e97dd91d-251d-470a-a062-fa1922dfa9a8";

/// Memory map characteristic (region catalog, write selector / read reply).
pub const MEMORY_MAP_CHARACTERISTIC: &str = "e97d3b10-251d-470a-a062-fa1922dfa9a8";

/// Flash write characteristic (write-without-response data packets).
pub const FLASH_WRITE_CHARACTERISTIC: &str = "e97d3b11-251d-470a-a062-fa1922dfa9a8";

/// Flash control characteristic (notify, single-byte flow signals).
pub const FLASH_CONTROL_CHARACTERISTIC: &str = "e97d3b12-251d-470a-a062-fa1922dfa9a8";

/// Client Characteristic Configuration descriptor (notification enable).
pub const CLIENT_CHARACTERISTIC_CONFIG: &str = "00002902-0000-1000-8000-00805f9b34fb";

// ============================================================================
// Flow-control signal bytes (Device -> Host, notification payload)
// ============================================================================

/// No signal received yet for the current batch.
pub const PACKET_STATE_WAITING: u8 = 0x00;

/// Batch accepted by the device.
pub const PACKET_STATE_SENT: u8 = 0xFF;

/// Device detected a gap or corruption; resend from the last bookmark.
pub const PACKET_STATE_RETRANSMIT: u8 = 0xAA;

// ============================================================================
// Image format markers
// ============================================================================

/// Magic record identifying the PXT metadata block. The record
/// immediately after it carries the template hash and program hash.
pub const PXT_MAGIC: &str = "708E3B92C615A841C49866C975EE5197";

/// Marker of the embedded-source section; records past it are not
/// flashed and are excluded from the progress denominator.
pub const EMBEDDED_SOURCE_MARKER: &str = "41140E2FB82FA2B";

/// Width of a hash rendered as hex characters (8 bytes).
pub const HASH_HEX_LEN: usize = 16;

// ============================================================================
// Region catalog
// ============================================================================

/// Selector byte requesting the region-name listing.
pub const REGION_LIST_SELECTOR: u8 = 0xFF;

/// Region names are fixed-width groups in the listing string.
pub const REGION_NAME_WIDTH: usize = 3;

/// The listing is terminated by a space rather than a count.
pub const REGION_LIST_TERMINATOR: char = ' ';

/// Upper bound on catalog size; guards a device that never sends the
/// terminator.
pub const MAX_REGIONS: usize = 255;

/// Region whose content hash gates partial-update eligibility.
pub const TARGET_REGION: &str = "DAL";

/// Byte span of the per-region addressing record (start LE at [0..4),
/// end LE at [8..12)).
pub const REGION_ADDRESS_RECORD_LEN: usize = 12;

// ============================================================================
// Transfer framing
// ============================================================================

/// Usable payload plus trailer must fit the link MTU.
pub const LINK_MTU: usize = 20;

/// Trailer appended to every packet: offset (2 BE) + sequence (2 BE).
pub const PACKET_TRAILER_LEN: usize = 4;

/// Packets per acknowledgement batch.
pub const ACK_BATCH_SIZE: usize = 4;

/// Inter-packet pacing delay inside a batch, milliseconds.
pub const PACING_DELAY_MS: u64 = 5;

/// Payload of the synchronization packet sent after a local write
/// failure.
pub const RESYNC_PAYLOAD: &str = "AAAAAAAAAAAAAAAA";

/// Reserved offset carried by the synchronization packet.
pub const RESYNC_OFFSET: u16 = 0x1234;

/// Payload of the end-of-flash packet.
pub const END_OF_FLASH_PAYLOAD: &str = "FFFFFFFFFFFFFFFF";

/// Terminal offset/sequence pair (all bits set).
pub const END_OF_FLASH_OFFSET: u16 = 0xFFFF;
pub const END_OF_FLASH_SEQUENCE: u16 = 0xFFFF;

// ============================================================================
// Timeouts
// ============================================================================

/// Default bound on any blocking wait for a device response.
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 5_000;

/// Resume phase handed to the full DFU collaborator on fallback.
pub const FALLBACK_RESUME_PHASE: u8 = 2;
