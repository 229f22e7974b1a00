//! Partial-update eligibility gate.
//!
//! Partial flashing is viable only when the image was built against the
//! exact runtime already on the device, which the device attests by the
//! content hash of the target region. Equality of the two hash strings
//! is the sole gate.

/// Result of the eligibility check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    NotEligible,
}

/// Compare the image's template hash against the device's region hash.
/// Byte-for-byte, case-sensitive; no normalization.
pub fn check(template_hash: &str, region_hash: &str) -> Eligibility {
    if template_hash == region_hash {
        Eligibility::Eligible
    } else {
        Eligibility::NotEligible
    }
}
