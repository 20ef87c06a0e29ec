//! CodeDirectory construction and parsing.
//!
//! The CodeDirectory is the core of an embedded signature: a header naming the
//! signed code, followed by special-slot hashes (Info.plist, requirements,
//! resources, entitlements) stored in reverse order before `hashOffset`, and
//! one hash per code page after it.
//!
//! Page hashing runs on the rayon pool in chunks of [`PAGES_PER_CHUNK`] pages.
//! Results are merged in page order, and a [`Cancellation`] token is checked
//! before each chunk.

use super::constants::*;
use super::{read_be_u32, read_be_u64};
use crate::{Cancellation, Error, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::collections::BTreeMap;

/// CodeDirectory header size for version 0x20400 (with exec segment fields)
const CODEDIRECTORY_HEADER_SIZE: usize = 88;

/// Pages hashed per rayon task.
pub const PAGES_PER_CHUNK: usize = 64;

/// Minimum number of special slots written (info, requirements, resources).
const MIN_SPECIAL_SLOTS: u32 = 3;

/// Hash algorithm of a code directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestType {
    Sha1,
    Sha256,
}

impl DigestType {
    /// The `hashType` byte.
    pub fn hash_type(self) -> u8 {
        match self {
            DigestType::Sha1 => CS_HASHTYPE_SHA1,
            DigestType::Sha256 => CS_HASHTYPE_SHA256,
        }
    }

    pub fn from_hash_type(hash_type: u8) -> Option<Self> {
        match hash_type {
            CS_HASHTYPE_SHA1 => Some(DigestType::Sha1),
            CS_HASHTYPE_SHA256 => Some(DigestType::Sha256),
            _ => None,
        }
    }

    /// Digest length in bytes.
    pub fn len(self) -> usize {
        match self {
            DigestType::Sha1 => CS_SHA1_LEN,
            DigestType::Sha256 => CS_SHA256_LEN,
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            DigestType::Sha1 => Sha1::digest(data).to_vec(),
            DigestType::Sha256 => Sha256::digest(data).to_vec(),
        }
    }
}

/// A decoded CodeDirectory.
///
/// Special-slot hashes are keyed by positive slot number (1 = Info.plist,
/// 2 = requirements, 3 = resources, 5 = entitlements); empty slots are
/// absent from the map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeDirectory {
    pub version: u32,
    pub flags: u32,
    pub digest: DigestType,
    pub page_size_log2: u8,
    pub identifier: String,
    pub team_id: Option<String>,
    /// Bytes covered by the page hashes.
    pub code_limit: u32,
    pub exec_seg_base: u64,
    pub exec_seg_limit: u64,
    pub exec_seg_flags: u64,
    pub special_hashes: BTreeMap<u32, Vec<u8>>,
    pub code_hashes: Vec<Vec<u8>>,
}

impl CodeDirectory {
    /// Decode a CodeDirectory blob.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 44 {
            return Err(Error::corrupt("code directory shorter than its header"));
        }
        let magic = read_be_u32(data, 0);
        if magic != CSMAGIC_CODEDIRECTORY {
            return Err(Error::corrupt(format!("bad code directory magic {:#x}", magic)));
        }
        let length = read_be_u32(data, 4) as usize;
        if length > data.len() || length < 44 {
            return Err(Error::corrupt(format!(
                "code directory length {} exceeds {}-byte blob",
                length,
                data.len()
            )));
        }
        let data = &data[..length];

        let version = read_be_u32(data, 8);
        let flags = read_be_u32(data, 12);
        let hash_offset = read_be_u32(data, 16) as usize;
        let ident_offset = read_be_u32(data, 20) as usize;
        let n_special = read_be_u32(data, 24) as usize;
        let n_code = read_be_u32(data, 28) as usize;
        let code_limit = read_be_u32(data, 32);
        let hash_size = data[36] as usize;
        let hash_type = data[37];
        let page_size_log2 = data[39];

        let digest = DigestType::from_hash_type(hash_type)
            .ok_or_else(|| Error::FormatUnsupported(format!("code directory hash type {}", hash_type)))?;
        if hash_size != digest.len() {
            return Err(Error::corrupt(format!(
                "hash size {} does not match hash type {}",
                hash_size, hash_type
            )));
        }
        page_bytes(page_size_log2, code_limit as usize)?;

        let team_offset = if version >= CODEDIRECTORY_VERSION_TEAMID && length >= 52 {
            read_be_u32(data, 48) as usize
        } else {
            0
        };
        let (exec_seg_base, exec_seg_limit, exec_seg_flags) =
            if version >= CODEDIRECTORY_VERSION_EXECSEG && length >= CODEDIRECTORY_HEADER_SIZE {
                (read_be_u64(data, 64), read_be_u64(data, 72), read_be_u64(data, 80))
            } else {
                (0, 0, 0)
            };

        let identifier = read_cstr(data, ident_offset, "identifier")?;
        let team_id = if team_offset != 0 {
            Some(read_cstr(data, team_offset, "team id")?)
        } else {
            None
        };

        let special_start = hash_offset
            .checked_sub(n_special * hash_size)
            .ok_or_else(|| Error::corrupt("special slots precede the code directory"))?;
        let code_end = n_code
            .checked_mul(hash_size)
            .and_then(|n| n.checked_add(hash_offset))
            .filter(|&end| end <= length)
            .ok_or_else(|| Error::corrupt("code slots overrun the code directory"))?;
        if special_start < 44 {
            return Err(Error::corrupt("special slots overlap the code directory header"));
        }

        let mut special_hashes = BTreeMap::new();
        for slot in 1..=n_special {
            let start = hash_offset - slot * hash_size;
            let hash = &data[start..start + hash_size];
            if hash.iter().any(|&b| b != 0) {
                special_hashes.insert(slot as u32, hash.to_vec());
            }
        }
        let code_hashes = data[hash_offset..code_end]
            .chunks(hash_size)
            .map(<[u8]>::to_vec)
            .collect();

        Ok(Self {
            version,
            flags,
            digest,
            page_size_log2,
            identifier,
            team_id,
            code_limit,
            exec_seg_base,
            exec_seg_limit,
            exec_seg_flags,
            special_hashes,
            code_hashes,
        })
    }

    /// Bytes per hashed page: the whole code limit when `pageSize` is 0,
    /// `usize::MAX` for a size outside [`PAGE_SIZE_LOG2_RANGE`].
    pub fn page_size(&self) -> usize {
        page_bytes(self.page_size_log2, self.code_limit as usize).unwrap_or(usize::MAX)
    }

    /// Hash stored in special slot `slot` (positive number), if non-empty.
    pub fn special_hash(&self, slot: u32) -> Option<&[u8]> {
        self.special_hashes.get(&slot).map(Vec::as_slice)
    }

    /// Number of special slots written: the highest populated slot, at
    /// least three.
    pub fn special_slot_count(&self) -> u32 {
        special_slot_count(self.special_hashes.keys().copied())
    }

    pub fn encoded_len(&self) -> usize {
        encoded_len(
            &self.identifier,
            self.team_id.as_deref(),
            self.special_slot_count() as usize,
            self.code_hashes.len(),
            self.digest.len(),
        )
    }

    /// Encode as a version 0x20400 blob.
    pub fn to_bytes(&self) -> Vec<u8> {
        let hash_size = self.digest.len();
        let n_special = self.special_slot_count() as usize;
        let n_code = self.code_hashes.len();

        let ident_offset = CODEDIRECTORY_HEADER_SIZE;
        let ident_len = self.identifier.len() + 1;
        let team_offset = if self.team_id.is_some() {
            ident_offset + ident_len
        } else {
            0
        };
        let team_len = self.team_id.as_ref().map_or(0, |t| t.len() + 1);
        let hash_offset = ident_offset + ident_len + team_len + n_special * hash_size;
        let total_len = hash_offset + n_code * hash_size;

        let mut buf = Vec::with_capacity(total_len);
        buf.extend(&CSMAGIC_CODEDIRECTORY.to_be_bytes());
        buf.extend(&(total_len as u32).to_be_bytes());
        buf.extend(&CODEDIRECTORY_VERSION.to_be_bytes());
        buf.extend(&self.flags.to_be_bytes());
        buf.extend(&(hash_offset as u32).to_be_bytes());
        buf.extend(&(ident_offset as u32).to_be_bytes());
        buf.extend(&(n_special as u32).to_be_bytes());
        buf.extend(&(n_code as u32).to_be_bytes());
        buf.extend(&self.code_limit.to_be_bytes());
        buf.push(hash_size as u8);
        buf.push(self.digest.hash_type());
        buf.push(0); // platform
        buf.push(self.page_size_log2);
        buf.extend(&0u32.to_be_bytes()); // spare2
        buf.extend(&0u32.to_be_bytes()); // scatterOffset
        buf.extend(&(team_offset as u32).to_be_bytes());
        buf.extend(&0u32.to_be_bytes()); // spare3
        buf.extend(&0u64.to_be_bytes()); // codeLimit64
        buf.extend(&self.exec_seg_base.to_be_bytes());
        buf.extend(&self.exec_seg_limit.to_be_bytes());
        buf.extend(&self.exec_seg_flags.to_be_bytes());

        buf.extend(self.identifier.as_bytes());
        buf.push(0);
        if let Some(team) = &self.team_id {
            buf.extend(team.as_bytes());
            buf.push(0);
        }

        // Special slots run from -n up to -1.
        let empty = vec![0u8; hash_size];
        for slot in (1..=n_special as u32).rev() {
            buf.extend(self.special_hashes.get(&slot).unwrap_or(&empty));
        }
        for hash in &self.code_hashes {
            buf.extend(hash);
        }

        buf
    }
}

fn special_slot_count(populated: impl Iterator<Item = u32>) -> u32 {
    populated.max().unwrap_or(0).max(MIN_SPECIAL_SLOTS)
}

fn encoded_len(
    identifier: &str,
    team_id: Option<&str>,
    n_special: usize,
    n_code: usize,
    hash_size: usize,
) -> usize {
    CODEDIRECTORY_HEADER_SIZE
        + identifier.len()
        + 1
        + team_id.map_or(0, |t| t.len() + 1)
        + (n_special + n_code) * hash_size
}

/// Page length for a `pageSize` field over `code_len` bytes of code.
fn page_bytes(page_size_log2: u8, code_len: usize) -> Result<usize> {
    match page_size_log2 {
        0 => Ok(code_len.max(1)),
        log2 if PAGE_SIZE_LOG2_RANGE.contains(&log2) => Ok(1 << log2),
        log2 => Err(Error::corrupt(format!(
            "page size 2^{} outside 2^{}..=2^{}",
            log2,
            PAGE_SIZE_LOG2_RANGE.start(),
            PAGE_SIZE_LOG2_RANGE.end()
        ))),
    }
}

fn read_cstr(data: &[u8], offset: usize, what: &str) -> Result<String> {
    let bytes = data
        .get(offset..)
        .ok_or_else(|| Error::corrupt(format!("{} offset {} outside code directory", what, offset)))?;
    let end = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::corrupt(format!("{} is not NUL-terminated", what)))?;
    String::from_utf8(bytes[..end].to_vec())
        .map_err(|_| Error::corrupt(format!("{} is not valid UTF-8", what)))
}

/// Hash `code` page by page in parallel, in page order.
///
/// The last page may be short, and a `page_size_log2` of 0 hashes `code` as
/// a single page. Fails with [`Error::CorruptBinary`] for any other size
/// outside [`PAGE_SIZE_LOG2_RANGE`], and with [`Error::Cancelled`] if
/// `cancel` fires before all chunks have started.
pub fn hash_pages(
    code: &[u8],
    page_size_log2: u8,
    digest: DigestType,
    cancel: Option<&Cancellation>,
) -> Result<Vec<Vec<u8>>> {
    let page_size = page_bytes(page_size_log2, code.len())?;
    let chunks = code
        .par_chunks(page_size.saturating_mul(PAGES_PER_CHUNK))
        .map(|chunk| {
            if let Some(cancel) = cancel {
                cancel.check()?;
            }
            Ok(chunk
                .chunks(page_size)
                .map(|page| digest.digest(page))
                .collect::<Vec<_>>())
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(chunks.into_iter().flatten().collect())
}

/// Compute an ad-hoc style code directory over `image[..signed_length]`.
pub fn compute_code_directory(
    image: &[u8],
    signed_length: usize,
    page_size_log2: u8,
    digest: DigestType,
) -> Result<CodeDirectory> {
    let code = image.get(..signed_length).ok_or_else(|| {
        Error::corrupt(format!(
            "signed length {} exceeds {}-byte image",
            signed_length,
            image.len()
        ))
    })?;
    CodeDirectoryBuilder::new("", code)
        .page_size_log2(page_size_log2)
        .build(digest)
}

/// Builder for [`CodeDirectory`] values.
///
/// Special slots are given as the raw blob bytes and hashed with whichever
/// digest [`CodeDirectoryBuilder::build`] is called with, so one builder
/// produces matching SHA-1 and SHA-256 directories.
///
/// # Example
///
/// ```
/// use machsign::codesign::{CodeDirectoryBuilder, DigestType};
///
/// let code = vec![0u8; 8192];
/// let cd = CodeDirectoryBuilder::new("com.example.app", &code)
///     .team_id("TEAMID1234")
///     .exec_seg_limit(65536)
///     .build(DigestType::Sha256)
///     .unwrap();
/// assert_eq!(cd.code_hashes.len(), 2);
/// ```
pub struct CodeDirectoryBuilder<'a> {
    identifier: String,
    team_id: Option<String>,
    code: &'a [u8],
    page_size_log2: u8,
    special_data: BTreeMap<u32, &'a [u8]>,
    exec_seg_limit: u64,
    exec_seg_flags: u64,
    flags: u32,
    cancel: Option<&'a Cancellation>,
}

impl<'a> CodeDirectoryBuilder<'a> {
    /// Create a builder over the code bytes (everything up to the signature).
    pub fn new(identifier: impl Into<String>, code: &'a [u8]) -> Self {
        Self {
            identifier: identifier.into(),
            team_id: None,
            code,
            page_size_log2: PAGE_SIZE_LOG2,
            special_data: BTreeMap::new(),
            exec_seg_limit: 0,
            exec_seg_flags: 0,
            flags: 0,
            cancel: None,
        }
    }

    /// Set the team identifier.
    pub fn team_id(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }

    pub fn page_size_log2(mut self, page_size_log2: u8) -> Self {
        self.page_size_log2 = page_size_log2;
        self
    }

    /// Info.plist contents (special slot -1).
    pub fn info_plist(self, data: &'a [u8]) -> Self {
        self.special_slot(CSSLOT_INFOSLOT, data)
    }

    /// Requirements blob (special slot -2).
    pub fn requirements(self, blob: &'a [u8]) -> Self {
        self.special_slot(CSSLOT_REQUIREMENTS, blob)
    }

    /// Sealed `_CodeSignature/CodeResources` plist (special slot -3).
    pub fn code_resources(self, data: &'a [u8]) -> Self {
        self.special_slot(CSSLOT_RESOURCEDIR, data)
    }

    /// Entitlements blob (special slot -5).
    pub fn entitlements(self, blob: &'a [u8]) -> Self {
        self.special_slot(CSSLOT_ENTITLEMENTS, blob)
    }

    /// Data hashed into special slot `-slot`.
    pub fn special_slot(mut self, slot: u32, data: &'a [u8]) -> Self {
        self.special_data.insert(slot, data);
        self
    }

    /// Set the executable segment limit.
    ///
    /// This is typically the __TEXT segment size from the Mach-O header.
    pub fn exec_seg_limit(mut self, limit: u64) -> Self {
        self.exec_seg_limit = limit;
        self
    }

    /// Set the raw executable segment flags.
    pub fn exec_seg_flags(mut self, flags: u64) -> Self {
        self.exec_seg_flags = flags;
        self
    }

    /// Set the code signature flags (e.g. `CS_ADHOC`).
    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn cancellation(mut self, cancel: &'a Cancellation) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn page_count(&self) -> usize {
        page_bytes(self.page_size_log2, self.code.len())
            .map_or(0, |page_size| (self.code.len() + page_size - 1) / page_size)
    }

    /// Encoded size of the directory [`build`](Self::build) would produce,
    /// without hashing anything.
    pub fn encoded_len(&self, digest: DigestType) -> usize {
        encoded_len(
            &self.identifier,
            self.team_id.as_deref(),
            special_slot_count(self.special_data.keys().copied()) as usize,
            self.page_count(),
            digest.len(),
        )
    }

    /// Hash the code pages and special slots with `digest`.
    pub fn build(&self, digest: DigestType) -> Result<CodeDirectory> {
        let code_limit = u32::try_from(self.code.len()).map_err(|_| {
            Error::FormatUnsupported(format!("{}-byte code exceeds 32-bit code limit", self.code.len()))
        })?;
        let code_hashes = hash_pages(self.code, self.page_size_log2, digest, self.cancel)?;
        let special_hashes = self
            .special_data
            .iter()
            .map(|(&slot, data)| (slot, digest.digest(data)))
            .collect();

        Ok(CodeDirectory {
            version: CODEDIRECTORY_VERSION,
            flags: self.flags,
            digest,
            page_size_log2: self.page_size_log2,
            identifier: self.identifier.clone(),
            team_id: self.team_id.clone(),
            code_limit,
            exec_seg_base: 0,
            exec_seg_limit: self.exec_seg_limit,
            exec_seg_flags: self.exec_seg_flags,
            special_hashes,
            code_hashes,
        })
    }
}

/// Full-length cdhash of an encoded code directory.
pub fn cdhash(digest: DigestType, code_directory: &[u8]) -> Vec<u8> {
    digest.digest(code_directory)
}

#[cfg(test)]
mod tests {
    use super::*;

    // CodeDirectory header field offsets (version 0x20400):
    // nSpecialSlots: 24, nCodeSlots: 28, codeLimit: 32, hashSize: 36,
    // hashType: 37, pageSize: 39, teamOffset: 48, execSegLimit: 72,
    // execSegFlags: 80
    const OFF_HASH_SIZE: usize = 36;
    const OFF_HASH_TYPE: usize = 37;
    const OFF_PAGE_SIZE: usize = 39;

    fn be32(data: &[u8], offset: usize) -> u32 {
        read_be_u32(data, offset)
    }

    #[test]
    fn test_header_fields_sha256() {
        let code = vec![0u8; 8192];
        let cd = CodeDirectoryBuilder::new("com.example.app", &code)
            .build(DigestType::Sha256)
            .unwrap()
            .to_bytes();

        assert_eq!(be32(&cd, 0), CSMAGIC_CODEDIRECTORY);
        assert_eq!(be32(&cd, 8), CODEDIRECTORY_VERSION);
        assert_eq!(cd[OFF_HASH_SIZE], CS_SHA256_LEN as u8);
        assert_eq!(cd[OFF_HASH_TYPE], CS_HASHTYPE_SHA256);
        assert_eq!(cd[OFF_PAGE_SIZE], 12);
        assert_eq!(be32(&cd, 28), 2);
        assert_eq!(be32(&cd, 32), 8192);
    }

    #[test]
    fn test_page_hashes_match_pages() {
        let code: Vec<u8> = (0..65536u32).map(|i| (i * 7 % 256) as u8).collect();
        let cd = CodeDirectoryBuilder::new("test", &code)
            .build(DigestType::Sha256)
            .unwrap();

        assert_eq!(cd.code_hashes.len(), 16);
        for (k, hash) in cd.code_hashes.iter().enumerate() {
            assert_eq!(hash, &Sha256::digest(&code[k * 4096..(k + 1) * 4096]).to_vec());
        }
    }

    #[test]
    fn test_short_last_page() {
        let code = vec![0x5au8; 4096 * 2 + 100];
        let cd = CodeDirectoryBuilder::new("test", &code)
            .build(DigestType::Sha1)
            .unwrap();
        assert_eq!(cd.code_hashes.len(), 3);
        assert_eq!(cd.code_hashes[2], Sha1::digest(&code[8192..]).to_vec());
    }

    #[test]
    fn test_many_chunks_stay_ordered() {
        let pages = PAGES_PER_CHUNK * 3 + 5;
        let code: Vec<u8> = (0..pages * 4096).map(|i| (i / 4096) as u8).collect();
        let hashes = hash_pages(&code, 12, DigestType::Sha1, None).unwrap();
        assert_eq!(hashes.len(), pages);
        for (k, hash) in hashes.iter().enumerate() {
            assert_eq!(hash, &Sha1::digest(&code[k * 4096..(k + 1) * 4096]).to_vec());
        }
    }

    #[test]
    fn test_page_size_16k() {
        let code = vec![1u8; 0x4000 * 2 + 1];
        let cd = CodeDirectoryBuilder::new("test", &code)
            .page_size_log2(14)
            .build(DigestType::Sha256)
            .unwrap();
        assert_eq!(cd.code_hashes.len(), 3);
        assert_eq!(cd.to_bytes()[OFF_PAGE_SIZE], 14);
    }

    #[test]
    fn test_cancelled_hashing() {
        let cancel = Cancellation::new();
        cancel.cancel();
        let code = vec![0u8; 4096];
        let result = CodeDirectoryBuilder::new("test", &code)
            .cancellation(&cancel)
            .build(DigestType::Sha256);
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_special_slots_minimal() {
        let code = vec![0u8; 4096];
        let cd = CodeDirectoryBuilder::new("test", &code)
            .build(DigestType::Sha256)
            .unwrap();
        assert_eq!(be32(&cd.to_bytes(), 24), 3);
    }

    #[test]
    fn test_special_slots_with_entitlements() {
        let code = vec![0u8; 4096];
        let ents = b"<plist/>";
        let cd = CodeDirectoryBuilder::new("test", &code)
            .entitlements(ents)
            .build(DigestType::Sha256)
            .unwrap();
        assert_eq!(cd.special_slot_count(), 5);
        assert_eq!(cd.special_hash(CSSLOT_ENTITLEMENTS), Some(&Sha256::digest(ents)[..]));
        assert_eq!(cd.special_hash(4), None);
    }

    #[test]
    fn test_team_id_and_exec_seg_round_trip() {
        let code = vec![0xabu8; 5000];
        let built = CodeDirectoryBuilder::new("com.example.myapp", &code)
            .team_id("TEAM123456")
            .requirements(b"req")
            .info_plist(b"info")
            .exec_seg_limit(65536)
            .exec_seg_flags(CS_EXECSEG_MAIN_BINARY)
            .flags(CS_ADHOC)
            .build(DigestType::Sha1)
            .unwrap();
        let bytes = built.to_bytes();
        assert_eq!(bytes.len(), built.encoded_len());

        let parsed = CodeDirectory::parse(&bytes).unwrap();
        assert_eq!(parsed, built);
        assert_eq!(parsed.team_id.as_deref(), Some("TEAM123456"));
        assert_eq!(parsed.exec_seg_flags, CS_EXECSEG_MAIN_BINARY);
    }

    #[test]
    fn test_encoded_len_matches_build() {
        let code = vec![0u8; 10_000];
        let builder = CodeDirectoryBuilder::new("id", &code)
            .team_id("T")
            .entitlements(b"e");
        for digest in [DigestType::Sha1, DigestType::Sha256] {
            let built = builder.build(digest).unwrap();
            assert_eq!(builder.encoded_len(digest), built.to_bytes().len());
        }
    }

    #[test]
    fn test_parse_rejects_bad_magic() {
        let code = vec![0u8; 4096];
        let mut bytes = CodeDirectoryBuilder::new("t", &code)
            .build(DigestType::Sha256)
            .unwrap()
            .to_bytes();
        bytes[0] = 0;
        assert!(matches!(CodeDirectory::parse(&bytes), Err(Error::CorruptBinary(_))));
    }

    #[test]
    fn test_compute_code_directory_bounds() {
        let image = vec![0u8; 100];
        assert!(compute_code_directory(&image, 100, 12, DigestType::Sha256).is_ok());
        assert!(matches!(
            compute_code_directory(&image, 101, 12, DigestType::Sha256),
            Err(Error::CorruptBinary(_))
        ));
    }

    #[test]
    fn test_parse_rejects_page_size_out_of_range() {
        let code = vec![0u8; 8192];
        let bytes = CodeDirectoryBuilder::new("t", &code)
            .build(DigestType::Sha256)
            .unwrap()
            .to_bytes();
        for page_size in [11, 17, 58, 60, 64, 255] {
            let mut bytes = bytes.clone();
            bytes[OFF_PAGE_SIZE] = page_size;
            assert!(
                matches!(CodeDirectory::parse(&bytes), Err(Error::CorruptBinary(_))),
                "pageSize {}",
                page_size
            );
        }
    }

    #[test]
    fn test_hash_pages_rejects_page_size_out_of_range() {
        let code = vec![0u8; 4096];
        for page_size in [1, 60, 64, u8::MAX] {
            assert!(matches!(
                hash_pages(&code, page_size, DigestType::Sha1, None),
                Err(Error::CorruptBinary(_))
            ));
        }
        let built = CodeDirectoryBuilder::new("t", &code).page_size_log2(64);
        assert!(built.build(DigestType::Sha1).is_err());
        // header, "t\0" and three empty special slots; no pages
        assert_eq!(built.encoded_len(DigestType::Sha1), CODEDIRECTORY_HEADER_SIZE + 2 + 3 * CS_SHA1_LEN);
    }

    #[test]
    fn test_zero_page_size_is_one_page() {
        let code = vec![0x42u8; 3 * 4096 + 7];
        let hashes = hash_pages(&code, 0, DigestType::Sha256, None).unwrap();
        assert_eq!(hashes, vec![Sha256::digest(&code).to_vec()]);

        let mut bytes = CodeDirectoryBuilder::new("t", &code)
            .build(DigestType::Sha256)
            .unwrap()
            .to_bytes();
        bytes[OFF_PAGE_SIZE] = 0;
        let parsed = CodeDirectory::parse(&bytes).unwrap();
        assert_eq!(parsed.page_size(), code.len());
    }

    #[test]
    fn test_empty_code() {
        let cd = CodeDirectoryBuilder::new("test", &[])
            .build(DigestType::Sha256)
            .unwrap();
        assert!(cd.code_hashes.is_empty());
        assert_eq!(cd.code_limit, 0);
    }
}
