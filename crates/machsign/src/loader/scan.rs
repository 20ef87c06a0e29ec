//! Byte-signature scanning over the loader's code.

use crate::macho::load_command::read;
use crate::macho::{CommandKind, LoadCommand};
use crate::{Error, Result};
use goblin::mach::header::{Header64, MH_MAGIC_64, SIZEOF_HEADER_64};
use goblin::mach::load_command::{LoadCommandHeader, SIZEOF_LOAD_COMMAND};

/// Where scanning starts, past the image header.
pub const SCAN_START: usize = 0x1000;

/// Bytes scanned after [`SCAN_START`].
pub const SCAN_WINDOW: usize = 0x80000;

/// Instruction alignment on arm64.
const INSN_ALIGN: usize = 4;

/// `mov x16, #0xc5; svc #0x80`: the loader's `mmap` syscall stub.
pub const MMAP_SIGNATURE: [u8; 8] = [0xB0, 0x18, 0x80, 0xD2, 0x01, 0x10, 0x00, 0xD4];

/// `mov x16, #0x5c; svc #0x80`: the loader's `fcntl` syscall stub.
pub const FCNTL_SIGNATURE: [u8; 8] = [0x90, 0x0B, 0x80, 0xD2, 0x01, 0x10, 0x00, 0xD4];

/// The part of `image` that is scanned: `SCAN_WINDOW` bytes from
/// `SCAN_START`, clamped to the image.
pub fn scan_window(image: &[u8]) -> &[u8] {
    let start = SCAN_START.min(image.len());
    let end = SCAN_START.saturating_add(SCAN_WINDOW).min(image.len());
    &image[start..end]
}

/// Offset (from the start of `image`) of the first 4-byte aligned
/// occurrence of `signature` inside the scan window.
pub fn find_signature(image: &[u8], signature: &[u8]) -> Option<usize> {
    if signature.is_empty() {
        return None;
    }
    let window = scan_window(image);
    (0..window.len().saturating_sub(signature.len() - 1))
        .step_by(INSN_ALIGN)
        .find(|&i| &window[i..i + signature.len()] == signature)
        .map(|i| SCAN_START + i)
}

/// Bytes of header and load commands at the start of a mapped image, as
/// recorded in its `mach_header_64`.
pub fn command_area_len(header: &[u8]) -> Result<usize> {
    let header: Header64 = read(header, 0, "loader header")?;
    if header.magic != MH_MAGIC_64 {
        return Err(Error::SignatureScanMiss(format!("loader magic {:#x}", header.magic)));
    }
    Ok(SIZEOF_HEADER_64 + header.sizeofcmds as usize)
}

/// `vmsize` of the `__TEXT` segment, read from the load commands at the
/// start of `image`.
pub fn text_vm_size(image: &[u8]) -> Result<usize> {
    let area = command_area_len(image)?;
    let header: Header64 = read(image, 0, "loader header")?;
    let commands = image
        .get(SIZEOF_HEADER_64..area)
        .ok_or_else(|| Error::corrupt("loader load commands exceed the mapped header"))?;

    let mut offset = 0;
    for _ in 0..header.ncmds {
        let Ok(head) = read::<LoadCommandHeader>(commands, offset, "load command header") else { break };
        let cmdsize = head.cmdsize as usize;
        let Some(raw) = commands.get(offset..offset + cmdsize) else { break };
        if let CommandKind::Segment(seg) = LoadCommand::parse(raw.to_vec())?.kind() {
            if seg.name == "__TEXT" {
                return Ok(seg.vm_size as usize);
            }
        }
        offset += cmdsize.max(SIZEOF_LOAD_COMMAND);
    }
    Err(Error::SignatureScanMiss("loader has no __TEXT segment".into()))
}
