//! SuperBlob assembly and parsing.
//!
//! The SuperBlob is the top-level container of an embedded signature: a
//! 12-byte header (magic, total length, count), an index of `(slot, offset)`
//! pairs, then the blobs themselves. Every blob starts on an 8-byte boundary;
//! the gaps are zero-filled and counted in the header length.
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ magic 0xfade0cc0 | len | n   │
//! ├──────────────────────────────┤
//! │ slot | offset   (n entries)  │
//! ├──────────────────────────────┤
//! │ blob 0 ... pad ... blob 1 ...│
//! └──────────────────────────────┘
//! ```

use super::constants::*;
use super::read_be_u32;
use crate::{Error, Result};

/// Size of the SuperBlob header in bytes (magic + length + count)
const SUPERBLOB_HEADER_SIZE: usize = 12;

/// Size of each index entry in bytes (slot_type + offset)
const INDEX_ENTRY_SIZE: usize = 8;

/// Blob alignment inside the SuperBlob.
pub const BLOB_ALIGN: usize = 8;

/// Size of a generic blob header (magic + length).
const BLOB_HEADER_SIZE: usize = 8;

/// A blob entry for inclusion in a SuperBlob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    /// See the `CSSLOT_*` constants.
    pub slot_type: u32,
    /// The raw blob data, including its own magic and length header.
    pub data: Vec<u8>,
}

impl BlobEntry {
    pub fn new(slot_type: u32, data: Vec<u8>) -> Self {
        Self { slot_type, data }
    }
}

fn align_up(value: usize) -> usize {
    (value + BLOB_ALIGN - 1) & !(BLOB_ALIGN - 1)
}

/// Size of the SuperBlob [`build_superblob`] produces for blobs of these sizes.
pub fn superblob_len(blob_sizes: &[usize]) -> usize {
    blob_sizes
        .iter()
        .fold(SUPERBLOB_HEADER_SIZE + blob_sizes.len() * INDEX_ENTRY_SIZE, |offset, size| {
            align_up(offset) + size
        })
}

/// Serialize `entries` in the given order.
pub fn build_superblob(entries: &[BlobEntry]) -> Vec<u8> {
    let count = entries.len();
    let header_size = SUPERBLOB_HEADER_SIZE + count * INDEX_ENTRY_SIZE;

    let mut offsets = Vec::with_capacity(count);
    let mut current_offset = header_size;
    for entry in entries {
        current_offset = align_up(current_offset);
        offsets.push(current_offset);
        current_offset += entry.data.len();
    }
    let total_length = current_offset;

    let mut buf = Vec::with_capacity(total_length);
    buf.extend(&CSMAGIC_EMBEDDED_SIGNATURE.to_be_bytes());
    buf.extend(&(total_length as u32).to_be_bytes());
    buf.extend(&(count as u32).to_be_bytes());

    for (entry, offset) in entries.iter().zip(&offsets) {
        buf.extend(&entry.slot_type.to_be_bytes());
        buf.extend(&(*offset as u32).to_be_bytes());
    }

    for (entry, offset) in entries.iter().zip(&offsets) {
        buf.resize(*offset, 0);
        buf.extend(&entry.data);
    }

    buf
}

fn wrap_blob(magic: u32, payload: &[u8]) -> Vec<u8> {
    let total_len = BLOB_HEADER_SIZE + payload.len();
    let mut buf = Vec::with_capacity(total_len);
    buf.extend(&magic.to_be_bytes());
    buf.extend(&(total_len as u32).to_be_bytes());
    buf.extend(payload);
    buf
}

/// Entitlements blob around XML plist bytes.
pub fn build_entitlements_blob(plist_data: &[u8]) -> Vec<u8> {
    wrap_blob(CSMAGIC_EMBEDDED_ENTITLEMENTS, plist_data)
}

/// Empty requirements set (12 bytes, count 0).
pub fn build_requirements_blob() -> Vec<u8> {
    wrap_blob(CSMAGIC_REQUIREMENTS, &0u32.to_be_bytes())
}

/// CMS wrapper blob; an empty payload marks an ad-hoc signature.
pub fn build_signature_blob(cms_data: &[u8]) -> Vec<u8> {
    wrap_blob(CSMAGIC_BLOBWRAPPER, cms_data)
}

/// Payload of a generic blob (everything after magic and length).
pub fn blob_payload(blob: &[u8]) -> &[u8] {
    blob.get(BLOB_HEADER_SIZE..).unwrap_or(&[])
}

/// Magic of a blob, if it has a header.
pub fn blob_magic(blob: &[u8]) -> Option<u32> {
    (blob.len() >= 4).then(|| read_be_u32(blob, 0))
}

/// Builder for SuperBlobs in slot order.
///
/// # Example
///
/// ```
/// use machsign::codesign::superblob::{build_signature_blob, SuperBlobBuilder};
/// use machsign::codesign::constants::*;
///
/// let blob = SuperBlobBuilder::new()
///     .code_directory(CSSLOT_CODEDIRECTORY, vec![0u8; 100])
///     .cms_signature(build_signature_blob(&[]))
///     .build();
/// assert_eq!(&blob[0..4], &CSMAGIC_EMBEDDED_SIGNATURE.to_be_bytes());
/// ```
#[derive(Debug, Default)]
pub struct SuperBlobBuilder {
    code_directories: Vec<(u32, Vec<u8>)>,
    requirements: Option<Vec<u8>>,
    entitlements: Option<Vec<u8>>,
    cms_signature: Option<Vec<u8>>,
}

impl SuperBlobBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a code directory in `slot` (0 or 0x1000..0x1005).
    pub fn code_directory(mut self, slot: u32, cd: Vec<u8>) -> Self {
        self.code_directories.push((slot, cd));
        self
    }

    /// Set the requirements blob. An empty set is used when none is given.
    pub fn requirements(mut self, req: Vec<u8>) -> Self {
        self.requirements = Some(req);
        self
    }

    /// Set the entitlements blob.
    pub fn entitlements(mut self, ent: Vec<u8>) -> Self {
        self.entitlements = Some(ent);
        self
    }

    /// Set the CMS wrapper blob.
    pub fn cms_signature(mut self, sig: Vec<u8>) -> Self {
        self.cms_signature = Some(sig);
        self
    }

    /// Entries in ascending slot order.
    pub fn entries(self) -> Vec<BlobEntry> {
        let mut entries: Vec<BlobEntry> = self
            .code_directories
            .into_iter()
            .map(|(slot, cd)| BlobEntry::new(slot, cd))
            .collect();
        entries.push(BlobEntry::new(
            CSSLOT_REQUIREMENTS,
            self.requirements.unwrap_or_else(build_requirements_blob),
        ));
        if let Some(ent) = self.entitlements {
            entries.push(BlobEntry::new(CSSLOT_ENTITLEMENTS, ent));
        }
        if let Some(sig) = self.cms_signature {
            entries.push(BlobEntry::new(CSSLOT_SIGNATURESLOT, sig));
        }
        entries.sort_by_key(|e| e.slot_type);
        entries
    }

    pub fn build(self) -> Vec<u8> {
        build_superblob(&self.entries())
    }
}

/// A parsed SuperBlob borrowing the signature bytes.
#[derive(Debug, Clone)]
pub struct SuperBlob<'a> {
    entries: Vec<(u32, &'a [u8])>,
}

impl<'a> SuperBlob<'a> {
    /// Parse a SuperBlob. Trailing bytes past its declared length (the
    /// zero padding of a reserved signature area) are ignored.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < SUPERBLOB_HEADER_SIZE {
            return Err(Error::corrupt("signature shorter than a SuperBlob header"));
        }
        let magic = read_be_u32(data, 0);
        if magic != CSMAGIC_EMBEDDED_SIGNATURE {
            return Err(Error::corrupt(format!("bad SuperBlob magic {:#x}", magic)));
        }
        let length = read_be_u32(data, 4) as usize;
        let count = read_be_u32(data, 8) as usize;
        if length > data.len() {
            return Err(Error::corrupt(format!(
                "SuperBlob length {} exceeds {}-byte signature",
                length,
                data.len()
            )));
        }
        let index_end = count
            .checked_mul(INDEX_ENTRY_SIZE)
            .and_then(|n| n.checked_add(SUPERBLOB_HEADER_SIZE))
            .filter(|&end| end <= length)
            .ok_or_else(|| Error::corrupt(format!("SuperBlob index of {} entries overruns", count)))?;
        let data = &data[..length];

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let entry = SUPERBLOB_HEADER_SIZE + i * INDEX_ENTRY_SIZE;
            let slot = read_be_u32(data, entry);
            let offset = read_be_u32(data, entry + 4) as usize;
            if offset < index_end || offset + BLOB_HEADER_SIZE > length {
                return Err(Error::corrupt(format!("blob in slot {:#x} has bad offset {}", slot, offset)));
            }
            let blob_len = read_be_u32(data, offset + 4) as usize;
            if blob_len < BLOB_HEADER_SIZE || offset + blob_len > length {
                return Err(Error::corrupt(format!(
                    "blob in slot {:#x} of {} bytes overruns the SuperBlob",
                    slot, blob_len
                )));
            }
            entries.push((slot, &data[offset..offset + blob_len]));
        }

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[(u32, &'a [u8])] {
        &self.entries
    }

    /// Blob stored in `slot`.
    pub fn find(&self, slot: u32) -> Option<&'a [u8]> {
        self.entries.iter().find(|(s, _)| *s == slot).map(|(_, b)| *b)
    }

    /// Code directory blobs with their slots, primary first.
    pub fn code_directories(&self) -> impl Iterator<Item = (u32, &'a [u8])> + '_ {
        self.entries
            .iter()
            .filter(|(slot, _)| is_code_directory_slot(*slot))
            .copied()
    }
}
