//! Embedding signatures into images and writing files back.
//!
//! The signature always sits at the 16-byte aligned end of the code, so a
//! signed image grows instead of needing spare room:
//!
//! ```text
//! ┌──────────┬──────────────┬─────┬────────────────────┐
//! │ header   │ segments ... │ pad │ SuperBlob (+ zero) │
//! └──────────┴──────────────┴─────┴────────────────────┘
//! 0                      code_length  offset        offset + size
//! ```
//!
//! `LC_CODE_SIGNATURE` is rewritten (or appended to the command area) and
//! `__LINKEDIT` is stretched to cover the signature.

use super::image::Image;
use super::load_command::{CommandKind, LoadCommand};
use super::align_to;
use crate::{Error, Result};
use std::io::Write;
use std::path::Path;
use tracing::debug;

/// Signature offset alignment.
const SIGNATURE_ALIGN: usize = 16;

/// `__LINKEDIT` vmsize granularity (arm64 page).
const LINKEDIT_VM_ALIGN: u64 = 0x4000;

/// Where a signature of a given reserved size lives in an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureSpace {
    /// Length of the data covered by the code directory.
    pub code_length: usize,
    /// File offset of the SuperBlob (`code_length` rounded up to 16).
    pub offset: usize,
    /// Bytes reserved for the SuperBlob.
    pub size: usize,
}

impl SignatureSpace {
    /// Layout for `image` with `reserve` bytes of signature.
    pub fn plan(image: &Image, reserve: usize) -> Self {
        let code_length = image.signed_length();
        Self {
            code_length,
            offset: align_to(code_length, SIGNATURE_ALIGN),
            size: reserve,
        }
    }

    pub fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// Point `LC_CODE_SIGNATURE` and `__LINKEDIT` at `space` and size the image
/// to end with the reserved signature area, zero-filled.
///
/// # Errors
///
/// - [`Error::NoSpaceForPatch`] if `LC_CODE_SIGNATURE` must be added and the
///   header has no room for it
/// - [`Error::CorruptBinary`] if the image has no `__LINKEDIT` segment, or it
///   starts past the signature
pub fn prepare_signature_space(image: &mut Image, space: &SignatureSpace) -> Result<()> {
    let linkedit = image
        .segment("__LINKEDIT")
        .ok_or_else(|| Error::corrupt("no __LINKEDIT segment to hold the signature"))?;
    if linkedit.file_offset as usize > space.offset {
        return Err(Error::corrupt(format!(
            "__LINKEDIT at {:#x} starts past signature offset {:#x}",
            linkedit.file_offset, space.offset
        )));
    }
    let file_size = (space.end() as u64) - linkedit.file_offset;
    let vm_size = align_to(file_size as usize, LINKEDIT_VM_ALIGN as usize) as u64;

    let dataoff = u32::try_from(space.offset)
        .map_err(|_| Error::FormatUnsupported(format!("signature offset {:#x} exceeds 4 GiB", space.offset)))?;
    let datasize = u32::try_from(space.size)
        .map_err(|_| Error::FormatUnsupported(format!("signature size {:#x} exceeds 4 GiB", space.size)))?;

    let mut found = false;
    let mut commands = Vec::with_capacity(image.commands().len() + 1);
    for command in image.commands() {
        match command.kind() {
            CommandKind::CodeSignature { .. } => {
                found = true;
                commands.push(LoadCommand::code_signature(dataoff, datasize)?);
            }
            CommandKind::Segment(seg) if seg.name == "__LINKEDIT" => {
                commands.push(command.with_segment_sizes(vm_size, file_size)?);
            }
            _ => commands.push(command.clone()),
        }
    }
    if !found {
        commands.push(LoadCommand::code_signature(dataoff, datasize)?);
    }

    image.replace_commands(commands)?;

    // Drop any previous signature, then zero-fill up to the new end.
    image.resize(space.code_length);
    image.resize(space.end());

    debug!(
        offset = space.offset,
        size = space.size,
        added = !found,
        "reserved signature space"
    );
    Ok(())
}

/// Copy `superblob` into the space reserved by [`prepare_signature_space`].
///
/// The remainder of the reserved area stays zero.
pub fn write_signature(image: &mut Image, space: &SignatureSpace, superblob: &[u8]) -> Result<()> {
    if superblob.len() > space.size {
        return Err(Error::Signing(format!(
            "{}-byte signature exceeds the {} bytes reserved",
            superblob.len(),
            space.size
        )));
    }
    let target = image.bytes_mut(space.offset..space.offset + superblob.len())?;
    target.copy_from_slice(superblob);
    Ok(())
}

/// Replace the file at `path` with `bytes` atomically.
///
/// The data goes to a temporary file in the same directory, which takes over
/// the original's permissions and is then renamed over it. On failure the
/// original is untouched.
pub fn write_atomic(path: impl AsRef<Path>, bytes: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(|e| Error::from(e).with_path(path))?;
    temp.write_all(bytes).map_err(|e| Error::from(e).with_path(path))?;
    temp.as_file().sync_all().map_err(|e| Error::from(e).with_path(path))?;

    if let Ok(metadata) = std::fs::metadata(path) {
        std::fs::set_permissions(temp.path(), metadata.permissions())
            .map_err(|e| Error::from(e).with_path(path))?;
    }

    temp.persist(path)
        .map_err(|e| Error::from(e.error).with_path(path))?;
    debug!(path = %path.display(), len = bytes.len(), "wrote file");
    Ok(())
}
