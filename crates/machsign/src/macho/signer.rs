//! Mach-O signing and verification.
//!
//! [`sign_image`] builds a fresh signature for one architecture slice:
//! - one CodeDirectory per configured digest (SHA-1 in slot 0 and SHA-256 in
//!   slot 0x1000 by default)
//! - an empty requirements set
//! - the entitlements blob, when entitlements are given
//! - a CMS signature with Apple CDHash attributes, or an empty wrapper for
//!   ad-hoc signatures
//!
//! The SuperBlob is sized before anything is hashed, so the load commands
//! that describe it are final when the pages are hashed.

use super::image::Image;
use super::writer::{prepare_signature_space, write_signature, SignatureSpace};
use super::align_to;
use crate::codesign::constants::*;
use crate::codesign::superblob::{
    blob_payload, build_entitlements_blob, build_requirements_blob, build_signature_blob,
    superblob_len,
};
use crate::codesign::{cdhash, hash_pages, CodeDirectory, CodeDirectoryBuilder, DigestType, SuperBlob, SuperBlobBuilder};
use crate::crypto::{cms, CdHash, SignerCertificate, SigningIdentity};
use crate::{Cancellation, Error, Result};
use chrono::{DateTime, Utc};
use goblin::mach::load_command::SIZEOF_LINKEDIT_DATA_COMMAND;
use tracing::debug;

/// Extra bytes reserved on top of a dry-run CMS signature. Covers signature
/// length jitter and the signing time attribute.
const CMS_SLACK: usize = 1024;

/// How a slice is signed.
#[derive(Debug, Clone, Copy)]
pub enum SigningMode<'a> {
    /// Ad-hoc: `CS_ADHOC` code directories and an empty CMS wrapper.
    AdHoc,
    /// CMS signature by a certificate-backed identity.
    Identity(&'a SigningIdentity),
}

impl SigningMode<'_> {
    pub fn is_ad_hoc(&self) -> bool {
        matches!(self, SigningMode::AdHoc)
    }
}

/// Inputs that shape a signature, independent of the signing key.
#[derive(Debug, Clone)]
pub struct SigningSettings {
    /// Code directory identifier (usually the bundle identifier).
    pub identifier: String,
    /// XML entitlements plist.
    pub entitlements: Option<Vec<u8>>,
    /// Info.plist contents, hashed into special slot 1.
    pub info_plist: Option<Vec<u8>>,
    /// The bundle's `_CodeSignature/CodeResources`, hashed into special slot 3.
    pub code_resources: Option<Vec<u8>>,
    /// Digests in slot order: the first is the primary code directory.
    pub digests: Vec<DigestType>,
    pub page_size_log2: u8,
    pub cancellation: Option<Cancellation>,
}

impl SigningSettings {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            entitlements: None,
            info_plist: None,
            code_resources: None,
            digests: vec![DigestType::Sha1, DigestType::Sha256],
            page_size_log2: PAGE_SIZE_LOG2,
            cancellation: None,
        }
    }

    pub fn entitlements(mut self, entitlements: Vec<u8>) -> Self {
        self.entitlements = Some(entitlements);
        self
    }

    pub fn info_plist(mut self, info_plist: Vec<u8>) -> Self {
        self.info_plist = Some(info_plist);
        self
    }

    pub fn code_resources(mut self, code_resources: Vec<u8>) -> Self {
        self.code_resources = Some(code_resources);
        self
    }

    pub fn digests(mut self, digests: Vec<DigestType>) -> Self {
        self.digests = digests;
        self
    }

    pub fn page_size_log2(mut self, page_size_log2: u8) -> Self {
        self.page_size_log2 = page_size_log2;
        self
    }

    pub fn cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.digests.is_empty() {
            return Err(Error::Config("at least one digest is required".into()));
        }
        if self.digests.len() > 1 + CSSLOT_ALTERNATE_CODEDIRECTORY_MAX as usize {
            return Err(Error::Config(format!("{} digests exceed the code directory slots", self.digests.len())));
        }
        if !PAGE_SIZE_LOG2_RANGE.contains(&self.page_size_log2) {
            return Err(Error::Config(format!(
                "page size 2^{} outside 2^{}..=2^{}",
                self.page_size_log2,
                PAGE_SIZE_LOG2_RANGE.start(),
                PAGE_SIZE_LOG2_RANGE.end()
            )));
        }
        Ok(())
    }
}

/// What [`sign_image`] wrote.
#[derive(Debug, Clone)]
pub struct SignatureSummary {
    /// Bytes covered by the page hashes (also the signature offset).
    pub code_limit: usize,
    /// Bytes reserved for the SuperBlob.
    pub reserved: usize,
    /// Bytes of SuperBlob actually written.
    pub used: usize,
    /// Full cdhash of every code directory, in slot order.
    pub cdhashes: Vec<CdHash>,
}

/// Outcome of a successful [`verify_image`].
#[derive(Debug, Clone)]
pub struct VerifyReport {
    /// Code directories in slot order, primary first.
    pub code_directories: Vec<CodeDirectory>,
    pub cdhashes: Vec<CdHash>,
    /// True when the CMS wrapper is empty.
    pub ad_hoc: bool,
    /// Certificates carried by the CMS signature.
    pub certificates: Vec<SignerCertificate>,
    pub has_entitlements: bool,
}

impl VerifyReport {
    pub fn identifier(&self) -> Option<&str> {
        self.code_directories.first().map(|cd| cd.identifier.as_str())
    }

    pub fn team_id(&self) -> Option<&str> {
        self.code_directories.first().and_then(|cd| cd.team_id.as_deref())
    }

    /// Check `data` against special slot `slot` of every code directory.
    ///
    /// Used for the slots whose contents live outside the image: Info.plist
    /// (1) and the sealed resources (3).
    pub fn check_special_slot(&self, slot: u32, data: &[u8]) -> Result<()> {
        for cd in &self.code_directories {
            match cd.special_hash(slot) {
                Some(stored) if stored == cd.digest.digest(data).as_slice() => {}
                Some(_) => {
                    return Err(Error::SignatureMismatch(format!(
                        "special slot {} does not match its {:?} hash",
                        slot, cd.digest
                    )))
                }
                None => {
                    return Err(Error::SignatureMismatch(format!(
                        "special slot {} is empty in the {:?} code directory",
                        slot, cd.digest
                    )))
                }
            }
        }
        Ok(())
    }
}

fn code_directory_slot(index: usize) -> u32 {
    if index == 0 {
        CSSLOT_CODEDIRECTORY
    } else {
        CSSLOT_ALTERNATE_CODEDIRECTORIES + index as u32 - 1
    }
}

/// Everything a code directory needs apart from the code bytes.
struct DirectoryInputs<'s> {
    settings: &'s SigningSettings,
    team_id: Option<String>,
    flags: u32,
    exec_seg_limit: u64,
    exec_seg_flags: u64,
    requirements: Vec<u8>,
    entitlements: Option<Vec<u8>>,
}

impl<'s> DirectoryInputs<'s> {
    fn builder<'a>(&'a self, code: &'a [u8]) -> CodeDirectoryBuilder<'a> {
        let mut builder = CodeDirectoryBuilder::new(self.settings.identifier.clone(), code)
            .page_size_log2(self.settings.page_size_log2)
            .flags(self.flags)
            .exec_seg_limit(self.exec_seg_limit)
            .exec_seg_flags(self.exec_seg_flags)
            .requirements(&self.requirements);
        if let Some(team_id) = &self.team_id {
            builder = builder.team_id(team_id.clone());
        }
        if let Some(info_plist) = &self.settings.info_plist {
            builder = builder.info_plist(info_plist);
        }
        if let Some(code_resources) = &self.settings.code_resources {
            builder = builder.code_resources(code_resources);
        }
        if let Some(entitlements) = &self.entitlements {
            builder = builder.entitlements(entitlements);
        }
        if let Some(cancel) = &self.settings.cancellation {
            builder = builder.cancellation(cancel);
        }
        builder
    }
}

/// Whether an entitlements plist grants `get-task-allow`.
fn allows_task_port(entitlements: &[u8]) -> Result<bool> {
    let dict: plist::Dictionary = plist::from_bytes(entitlements)?;
    Ok(dict
        .get("get-task-allow")
        .and_then(plist::Value::as_boolean)
        .unwrap_or(false))
}

/// Sign `image` in place, replacing any existing signature.
///
/// `image` is left unchanged when an error is returned.
///
/// # Errors
///
/// - [`Error::NoSpaceForPatch`] if the image has no `LC_CODE_SIGNATURE` and
///   no header room to add one
/// - [`Error::Plist`] if the entitlements are not a plist dictionary
/// - [`Error::Signing`] if CMS construction fails
/// - [`Error::Cancelled`] if cancellation fires during hashing
pub fn sign_image(image: &mut Image, settings: &SigningSettings, mode: SigningMode<'_>) -> Result<SignatureSummary> {
    settings.validate()?;

    let mut exec_seg_flags = 0;
    if image.is_executable() {
        exec_seg_flags |= CS_EXECSEG_MAIN_BINARY;
    }
    if let Some(entitlements) = &settings.entitlements {
        if allows_task_port(entitlements)? {
            exec_seg_flags |= CS_EXECSEG_ALLOW_UNSIGNED;
        }
    }

    let inputs = DirectoryInputs {
        settings,
        team_id: match mode {
            SigningMode::AdHoc => None,
            SigningMode::Identity(identity) => identity.team_id().map(str::to_string),
        },
        flags: if mode.is_ad_hoc() { CS_ADHOC } else { 0 },
        exec_seg_limit: image.segment("__TEXT").map_or(0, |seg| seg.vm_size),
        exec_seg_flags,
        requirements: build_requirements_blob(),
        entitlements: settings.entitlements.as_deref().map(build_entitlements_blob),
    };

    if !image.has_code_signature() && image.header_padding() < SIZEOF_LINKEDIT_DATA_COMMAND {
        return Err(Error::NoSpaceForPatch {
            needed: SIZEOF_LINKEDIT_DATA_COMMAND,
            available: image.header_padding(),
        });
    }

    // Built on a copy; `image` only changes once the signature is written.
    let mut signed = image.clone();
    let mut space = SignatureSpace::plan(&signed, 0);
    let code_limit = space.offset;

    // Settle the hashed length so directory sizes can be computed.
    signed.resize(space.code_length);
    signed.resize(code_limit);
    space.size = reserve_size(&signed, &inputs, mode)?;

    prepare_signature_space(&mut signed, &space)?;

    let code = &signed.data()[..code_limit];
    let builder = inputs.builder(code);
    let mut directories = Vec::with_capacity(settings.digests.len());
    for &digest in &settings.digests {
        directories.push((digest, builder.build(digest)?.to_bytes()));
    }
    let cdhashes: Vec<CdHash> = directories
        .iter()
        .map(|(digest, bytes)| CdHash {
            digest: *digest,
            hash: cdhash(*digest, bytes),
        })
        .collect();

    let cms = match mode {
        SigningMode::AdHoc => Vec::new(),
        SigningMode::Identity(identity) => cms::sign_code_directory(identity, &directories[0].1, &cdhashes)?,
    };

    let mut superblob = SuperBlobBuilder::new();
    for (index, (_, bytes)) in directories.into_iter().enumerate() {
        superblob = superblob.code_directory(code_directory_slot(index), bytes);
    }
    superblob = superblob
        .requirements(inputs.requirements.clone())
        .cms_signature(build_signature_blob(&cms));
    if let Some(entitlements) = &inputs.entitlements {
        superblob = superblob.entitlements(entitlements.clone());
    }
    let superblob = superblob.build();

    write_signature(&mut signed, &space, &superblob)?;
    *image = signed;

    debug!(
        identifier = %settings.identifier,
        code_limit,
        reserved = space.size,
        used = superblob.len(),
        ad_hoc = mode.is_ad_hoc(),
        "signed slice"
    );

    Ok(SignatureSummary {
        code_limit,
        reserved: space.size,
        used: superblob.len(),
        cdhashes,
    })
}

/// Bytes to reserve for the SuperBlob of an image whose hashed length is
/// the current image length.
fn reserve_size(image: &Image, inputs: &DirectoryInputs<'_>, mode: SigningMode<'_>) -> Result<usize> {
    let builder = inputs.builder(image.data());
    let directory_sizes: Vec<usize> = inputs
        .settings
        .digests
        .iter()
        .map(|&digest| builder.encoded_len(digest))
        .collect();

    let cms_len = match mode {
        SigningMode::AdHoc => 0,
        SigningMode::Identity(identity) => {
            let placeholder = vec![0u8; directory_sizes[0]];
            let cdhashes: Vec<CdHash> = inputs
                .settings
                .digests
                .iter()
                .map(|&digest| CdHash {
                    digest,
                    hash: vec![0u8; digest.len()],
                })
                .collect();
            cms::sign_code_directory(identity, &placeholder, &cdhashes)?.len() + CMS_SLACK
        }
    };

    let mut sizes = directory_sizes;
    sizes.push(inputs.requirements.len());
    if let Some(entitlements) = &inputs.entitlements {
        sizes.push(entitlements.len());
    }
    sizes.push(build_signature_blob(&[]).len() + cms_len);

    let len = superblob_len(&sizes);
    Ok(if mode.is_ad_hoc() { len } else { align_to(len, 16) })
}

/// Verify the embedded signature of `image` against the current time.
pub fn verify_image(image: &Image) -> Result<VerifyReport> {
    verify_image_at(image, Utc::now())
}

/// Verify the embedded signature of `image`, checking certificate expiry
/// against `now`.
///
/// # Errors
///
/// - [`Error::SignatureMismatch`] if the image is unsigned, a page or
///   special-slot hash differs, or the CMS signature does not verify
/// - [`Error::ExpiredCertificate`] if a certificate in the CMS signature has
///   expired at `now`
/// - [`Error::CorruptBinary`] if the signature blobs are malformed
pub fn verify_image_at(image: &Image, now: DateTime<Utc>) -> Result<VerifyReport> {
    let (offset, size) = image
        .code_signature()
        .ok_or_else(|| Error::SignatureMismatch("image has no code signature".into()))?;
    let offset = offset as usize;
    let signature = &image.data()[offset..offset + size as usize];
    let superblob = SuperBlob::parse(signature)?;

    let requirements = superblob.find(CSSLOT_REQUIREMENTS);
    let entitlements = superblob.find(CSSLOT_ENTITLEMENTS);

    let mut directories = Vec::new();
    let mut cdhashes = Vec::new();
    let mut primary_bytes: Option<&[u8]> = None;
    for (slot, blob) in superblob.code_directories() {
        let cd = CodeDirectory::parse(blob)?;
        verify_directory(image, &cd, offset, slot, requirements, entitlements)?;

        if slot == CSSLOT_CODEDIRECTORY {
            primary_bytes = Some(blob);
        }
        cdhashes.push(CdHash {
            digest: cd.digest,
            hash: cdhash(cd.digest, blob),
        });
        directories.push(cd);
    }
    let primary_bytes = primary_bytes.ok_or_else(|| Error::SignatureMismatch("no primary code directory".into()))?;

    let cms_payload = superblob.find(CSSLOT_SIGNATURESLOT).map(blob_payload).unwrap_or(&[]);
    let ad_hoc = cms_payload.is_empty();
    let certificates = if ad_hoc {
        Vec::new()
    } else {
        let certificates = cms::verify_detached(cms_payload, primary_bytes)?;
        if let Some(expired) = certificates.iter().find(|cert| cert.not_after < now) {
            return Err(Error::ExpiredCertificate {
                subject: expired.subject.clone().unwrap_or_else(|| "<unnamed>".to_string()),
                not_after: expired.not_after,
            });
        }
        certificates
    };

    debug!(directories = directories.len(), ad_hoc, "verified signature");
    Ok(VerifyReport {
        code_directories: directories,
        cdhashes,
        ad_hoc,
        certificates,
        has_entitlements: entitlements.is_some(),
    })
}

fn verify_directory(
    image: &Image,
    cd: &CodeDirectory,
    signature_offset: usize,
    slot: u32,
    requirements: Option<&[u8]>,
    entitlements: Option<&[u8]>,
) -> Result<()> {
    let code_limit = cd.code_limit as usize;
    if code_limit != signature_offset {
        return Err(Error::SignatureMismatch(format!(
            "code directory in slot {:#x} covers {} bytes, signature starts at {}",
            slot, code_limit, signature_offset
        )));
    }

    let hashes = hash_pages(&image.data()[..code_limit], cd.page_size_log2, cd.digest, None)?;
    if hashes.len() != cd.code_hashes.len() {
        return Err(Error::SignatureMismatch(format!(
            "code directory in slot {:#x} has {} page hashes, expected {}",
            slot,
            cd.code_hashes.len(),
            hashes.len()
        )));
    }
    if let Some(page) = hashes.iter().zip(&cd.code_hashes).position(|(a, b)| a != b) {
        return Err(Error::SignatureMismatch(format!(
            "page {} does not match its {:?} hash in slot {:#x}",
            page, cd.digest, slot
        )));
    }

    for (special, blob, name) in [
        (CSSLOT_REQUIREMENTS, requirements, "requirements"),
        (CSSLOT_ENTITLEMENTS, entitlements, "entitlements"),
    ] {
        let stored = cd.special_hash(special).filter(|hash| hash.iter().any(|&b| b != 0));
        match (stored, blob) {
            (Some(stored), Some(blob)) if stored == cd.digest.digest(blob).as_slice() => {}
            (None, None) => {}
            _ => {
                return Err(Error::SignatureMismatch(format!(
                    "{} hash in slot {:#x} does not match",
                    name, slot
                )))
            }
        }
    }
    Ok(())
}

/// Embedded XML entitlements of a signed image.
pub fn read_entitlements(image: &Image) -> Result<Option<Vec<u8>>> {
    let Some((offset, size)) = image.code_signature() else {
        return Ok(None);
    };
    let offset = offset as usize;
    let superblob = SuperBlob::parse(&image.data()[offset..offset + size as usize])?;
    Ok(superblob
        .find(CSSLOT_ENTITLEMENTS)
        .map(|blob| blob_payload(blob).to_vec()))
}
