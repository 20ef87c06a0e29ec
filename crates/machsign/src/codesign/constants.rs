//! Embedded code signature magic numbers, slots and flags.
//!
//! All multi-byte fields inside a signature are big-endian, independent of
//! the image's byte order.

// =============================================================================
// Blob magics
// =============================================================================

/// SuperBlob wrapping every signature component.
pub const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade0cc0;

pub const CSMAGIC_CODEDIRECTORY: u32 = 0xfade0c02;

/// Requirements set.
pub const CSMAGIC_REQUIREMENTS: u32 = 0xfade0c01;

/// XML entitlements plist.
pub const CSMAGIC_EMBEDDED_ENTITLEMENTS: u32 = 0xfade7171;

/// CMS signature wrapper; empty for ad-hoc signatures.
pub const CSMAGIC_BLOBWRAPPER: u32 = 0xfade0b01;

// =============================================================================
// SuperBlob index slots
// =============================================================================

pub const CSSLOT_CODEDIRECTORY: u32 = 0x0000;
pub const CSSLOT_INFOSLOT: u32 = 0x0001;
pub const CSSLOT_REQUIREMENTS: u32 = 0x0002;
pub const CSSLOT_RESOURCEDIR: u32 = 0x0003;
pub const CSSLOT_ENTITLEMENTS: u32 = 0x0005;

/// First alternate code directory slot.
pub const CSSLOT_ALTERNATE_CODEDIRECTORIES: u32 = 0x1000;

/// Number of alternate code directory slots.
pub const CSSLOT_ALTERNATE_CODEDIRECTORY_MAX: u32 = 5;

/// CMS signature slot.
pub const CSSLOT_SIGNATURESLOT: u32 = 0x10000;

/// Whether `slot` holds a code directory.
pub fn is_code_directory_slot(slot: u32) -> bool {
    slot == CSSLOT_CODEDIRECTORY
        || (CSSLOT_ALTERNATE_CODEDIRECTORIES
            ..CSSLOT_ALTERNATE_CODEDIRECTORIES + CSSLOT_ALTERNATE_CODEDIRECTORY_MAX)
            .contains(&slot)
}

// =============================================================================
// Hash types
// =============================================================================

pub const CS_HASHTYPE_SHA1: u8 = 1;
pub const CS_HASHTYPE_SHA256: u8 = 2;

pub const CS_SHA1_LEN: usize = 20;
pub const CS_SHA256_LEN: usize = 32;

/// Length cdhashes are truncated to in CMS attributes.
pub const CS_CDHASH_LEN: usize = 20;

// =============================================================================
// Code directory flags
// =============================================================================

/// Ad-hoc signed: no certificate chain backs the code directory.
pub const CS_ADHOC: u32 = 0x0000_0002;

pub const CS_EXECSEG_MAIN_BINARY: u64 = 0x0001;

/// Set when the entitlements grant `get-task-allow`.
pub const CS_EXECSEG_ALLOW_UNSIGNED: u64 = 0x0010;

// =============================================================================
// Code directory versions
// =============================================================================

pub const CODEDIRECTORY_VERSION_SCATTER: u32 = 0x20100;
pub const CODEDIRECTORY_VERSION_TEAMID: u32 = 0x20200;
pub const CODEDIRECTORY_VERSION_CODELIMIT64: u32 = 0x20300;
pub const CODEDIRECTORY_VERSION_EXECSEG: u32 = 0x20400;

/// Version written by this crate.
pub const CODEDIRECTORY_VERSION: u32 = CODEDIRECTORY_VERSION_EXECSEG;

/// Default page size (4 KiB).
pub const PAGE_SIZE_LOG2: u8 = 12;

/// Page sizes accepted for code hashing (4 KiB to 64 KiB). A `pageSize` of 0
/// is also valid in parsed directories and hashes the code as one page.
pub const PAGE_SIZE_LOG2_RANGE: std::ops::RangeInclusive<u8> = 12..=16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_directory_slots() {
        assert!(is_code_directory_slot(CSSLOT_CODEDIRECTORY));
        assert!(is_code_directory_slot(0x1000));
        assert!(is_code_directory_slot(0x1004));
        assert!(!is_code_directory_slot(0x1005));
        assert!(!is_code_directory_slot(CSSLOT_REQUIREMENTS));
        assert!(!is_code_directory_slot(CSSLOT_SIGNATURESLOT));
    }
}
