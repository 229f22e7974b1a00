//! Region catalog client.
//!
//! The device exposes its flashable memory layout through the memory
//! map characteristic: writing the 0xFF selector and reading back
//! yields a region-name listing (fixed-width names terminated by a
//! space); writing a region index then reading twice yields an
//! addressing record and a content hash. The device cannot multiplex,
//! so every operation waits for its completion before the next one is
//! issued.

use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, warn};

use crate::error::FlashError;
use crate::link::{CharId, EventPump, GattLink};
use crate::protocol::constants::{
    MAX_REGIONS, REGION_ADDRESS_RECORD_LEN, REGION_LIST_SELECTOR, REGION_LIST_TERMINATOR,
    REGION_NAME_WIDTH,
};

/// One named slice of the device's flashable memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionDescriptor {
    pub index: u8,
    pub name: String,
    pub start_address: u32,
    pub end_address: u32,
    /// 8 bytes rendered as 16 hex characters.
    pub content_hash: String,
}

/// Client for the memory map characteristic.
pub struct MemoryMapClient<'a, L: GattLink> {
    pump: &'a mut EventPump<L>,
    timeout: Duration,
}

impl<'a, L: GattLink> MemoryMapClient<'a, L> {
    pub fn new(pump: &'a mut EventPump<L>, timeout: Duration) -> Self {
        Self { pump, timeout }
    }

    /// Request the region-name listing: groups of three characters per
    /// region, terminated by a space.
    pub fn list_region_names(&mut self) -> Result<String, FlashError> {
        self.pump
            .link_mut()
            .write_characteristic(CharId::MemoryMap, &[REGION_LIST_SELECTOR])?;
        self.pump.await_written(CharId::MemoryMap, self.timeout)?;

        self.pump.link_mut().read_characteristic(CharId::MemoryMap)?;
        let value = self.pump.await_read(CharId::MemoryMap, self.timeout)?;

        let names = String::from_utf8_lossy(&value).into_owned();
        debug!(names = %names, "Region listing");
        Ok(names)
    }

    /// Query one region: write the index selector, then two sequential
    /// reads on the same characteristic (addressing record, then hash).
    pub fn describe_region(&mut self, index: u8, name: &str) -> Result<RegionDescriptor, FlashError> {
        self.pump
            .link_mut()
            .write_characteristic(CharId::MemoryMap, &[index])?;
        self.pump.await_written(CharId::MemoryMap, self.timeout)?;

        self.pump.link_mut().read_characteristic(CharId::MemoryMap)?;
        let addressing = self.pump.await_read(CharId::MemoryMap, self.timeout)?;
        if addressing.len() < REGION_ADDRESS_RECORD_LEN {
            return Err(FlashError::Protocol(format!(
                "addressing record for region {index} is {} bytes, expected at least {}",
                addressing.len(),
                REGION_ADDRESS_RECORD_LEN
            )));
        }
        let start_address = LittleEndian::read_u32(&addressing[0..4]);
        let end_address = LittleEndian::read_u32(&addressing[8..12]);

        self.pump.link_mut().read_characteristic(CharId::MemoryMap)?;
        let hash_value = self.pump.await_read(CharId::MemoryMap, self.timeout)?;
        if hash_value.len() < 8 {
            return Err(FlashError::Protocol(format!(
                "hash record for region {index} is {} bytes, expected at least 8",
                hash_value.len()
            )));
        }
        let content_hash = bytes_to_hex(&hash_value[..8]);

        debug!(
            index,
            name,
            start = %format!("0x{start_address:08X}"),
            end = %format!("0x{end_address:08X}"),
            hash = %content_hash,
            "Region described"
        );

        Ok(RegionDescriptor {
            index,
            name: name.to_string(),
            start_address,
            end_address,
            content_hash,
        })
    }

    /// Read the whole catalog: list names, then describe each region in
    /// order. Stops at the space terminator, at the end of the listing,
    /// or at the region cap, so a malformed listing can never index out
    /// of bounds.
    pub fn read_memory_map(&mut self) -> Result<Vec<RegionDescriptor>, FlashError> {
        let names = self.list_region_names()?;
        let chars: Vec<char> = names.chars().collect();

        let mut regions = Vec::new();
        let mut index = 0usize;
        loop {
            let start = index * REGION_NAME_WIDTH;
            match chars.get(start) {
                None => {
                    warn!("Region listing ended without terminator");
                    break;
                }
                Some(&c) if c == REGION_LIST_TERMINATOR => break,
                Some(_) => {}
            }
            if start + REGION_NAME_WIDTH > chars.len() {
                warn!("Truncated region name at end of listing");
                break;
            }
            let name: String = chars[start..start + REGION_NAME_WIDTH].iter().collect();
            regions.push(self.describe_region(index as u8, &name)?);

            index += 1;
            if index >= MAX_REGIONS {
                warn!("Region cap reached, stopping catalog walk");
                break;
            }
        }
        Ok(regions)
    }
}

/// Find a region by name.
pub fn find_region<'r>(
    regions: &'r [RegionDescriptor],
    name: &str,
) -> Option<&'r RegionDescriptor> {
    regions.iter().find(|r| r.name == name)
}

/// Uppercase hex rendering, two characters per byte.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        // Writing to a String cannot fail.
        let _ = write!(out, "{byte:02X}");
    }
    out
}
