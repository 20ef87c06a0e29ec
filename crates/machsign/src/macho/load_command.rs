//! Load command model.
//!
//! Every command keeps the exact bytes it was parsed from, so commands the
//! patcher does not touch are written back byte-for-byte. Only the kinds the
//! engine mutates or inspects are decoded, through goblin's command structs;
//! everything else is carried as [`CommandKind::Other`].

use crate::{Error, Result};
use goblin::mach::load_command::{
    Dylib, DylibCommand, LinkeditDataCommand, LoadCommandHeader, RpathCommand, Section64, SegmentCommand64,
    UuidCommand, LC_CODE_SIGNATURE, LC_LOAD_DYLIB, LC_LOAD_WEAK_DYLIB, LC_RPATH, LC_SEGMENT_64, LC_UUID,
    SIZEOF_LINKEDIT_DATA_COMMAND, SIZEOF_RPATH_COMMAND, SIZEOF_SECTION_64, SIZEOF_SEGMENT_COMMAND_64,
};
use scroll::ctx::{StrCtx, TryFromCtx, TryIntoCtx};
use scroll::{Endian, Pread, Pwrite, LE};

use super::align_to;

/// Size of a `dylib_command` before its path string. goblin's
/// `SIZEOF_DYLIB_COMMAND` leaves out the 4-byte name offset.
const DYLIB_COMMAND_SIZE: usize = 24;

/// Default `current_version` / `compatibility_version` written for injected
/// dylibs (1.0.0, matching what `insert_dylib` style tools emit).
const DEFAULT_DYLIB_VERSION: u32 = 0x0001_0000;

/// A section header inside a 64-bit segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub segment_name: String,
    pub addr: u64,
    pub size: u64,
    /// File offset of the section data; 0 for zero-fill sections.
    pub offset: u32,
}

/// A decoded `LC_SEGMENT_64`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    pub vm_addr: u64,
    pub vm_size: u64,
    pub file_offset: u64,
    pub file_size: u64,
    pub sections: Vec<Section>,
}

/// The decoded view of a load command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    /// `LC_LOAD_DYLIB` or `LC_LOAD_WEAK_DYLIB`.
    LoadDylib {
        path: String,
        weak: bool,
        timestamp: u32,
        current_version: u32,
        compatibility_version: u32,
    },
    /// `LC_RPATH`.
    RPath { path: String },
    /// `LC_SEGMENT_64`.
    Segment(Segment),
    /// `LC_CODE_SIGNATURE`.
    CodeSignature { data_offset: u32, data_size: u32 },
    /// `LC_UUID`.
    Uuid([u8; 16]),
    /// Any other command, passed through untouched.
    Other { cmd: u32 },
}

/// One load command: its decoded kind plus its exact encoded bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadCommand {
    cmd: u32,
    kind: CommandKind,
    raw: Vec<u8>,
}

impl LoadCommand {
    /// Decode a command from its raw bytes (`cmd`, `cmdsize` and payload).
    ///
    /// `raw.len()` must equal the command's `cmdsize`.
    pub fn parse(raw: Vec<u8>) -> Result<Self> {
        let header: LoadCommandHeader = read(&raw, 0, "load command header")?;
        let kind = match header.cmd {
            LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB => {
                let command: DylibCommand = read(&raw, 0, "dylib_command")?;
                CommandKind::LoadDylib {
                    path: read_cstr(&raw, command.dylib.name as usize, "dylib path")?,
                    weak: header.cmd == LC_LOAD_WEAK_DYLIB,
                    timestamp: command.dylib.timestamp,
                    current_version: command.dylib.current_version,
                    compatibility_version: command.dylib.compatibility_version,
                }
            }
            LC_RPATH => {
                let command: RpathCommand = read(&raw, 0, "rpath_command")?;
                CommandKind::RPath {
                    path: read_cstr(&raw, command.path as usize, "rpath")?,
                }
            }
            LC_SEGMENT_64 => CommandKind::Segment(parse_segment(&raw)?),
            LC_CODE_SIGNATURE => {
                let command: LinkeditDataCommand = read(&raw, 0, "linkedit_data_command")?;
                CommandKind::CodeSignature {
                    data_offset: command.dataoff,
                    data_size: command.datasize,
                }
            }
            LC_UUID => {
                let command: UuidCommand = read(&raw, 0, "uuid_command")?;
                CommandKind::Uuid(command.uuid)
            }
            other => CommandKind::Other { cmd: other },
        };

        Ok(Self {
            cmd: header.cmd,
            kind,
            raw,
        })
    }

    /// Build a new `LC_LOAD_DYLIB` / `LC_LOAD_WEAK_DYLIB` command.
    pub fn load_dylib(path: &str, weak: bool) -> Result<Self> {
        Self::load_dylib_with_versions(path, weak, 2, DEFAULT_DYLIB_VERSION, DEFAULT_DYLIB_VERSION)
    }

    fn load_dylib_with_versions(
        path: &str,
        weak: bool,
        timestamp: u32,
        current_version: u32,
        compatibility_version: u32,
    ) -> Result<Self> {
        let size = align_to(DYLIB_COMMAND_SIZE + path.len() + 1, 8);
        let command = DylibCommand {
            cmd: if weak { LC_LOAD_WEAK_DYLIB } else { LC_LOAD_DYLIB },
            cmdsize: size as u32,
            dylib: Dylib {
                name: DYLIB_COMMAND_SIZE as u32,
                timestamp,
                current_version,
                compatibility_version,
            },
        };
        Self::parse(encode(command, size, Some((DYLIB_COMMAND_SIZE, path)))?)
    }

    /// Build a new `LC_RPATH` command.
    pub fn rpath(path: &str) -> Result<Self> {
        let size = align_to(SIZEOF_RPATH_COMMAND + path.len() + 1, 8);
        let command = RpathCommand {
            cmd: LC_RPATH,
            cmdsize: size as u32,
            path: SIZEOF_RPATH_COMMAND as u32,
        };
        Self::parse(encode(command, size, Some((SIZEOF_RPATH_COMMAND, path)))?)
    }

    /// Build a new `LC_CODE_SIGNATURE` command.
    pub fn code_signature(data_offset: u32, data_size: u32) -> Result<Self> {
        let command = LinkeditDataCommand {
            cmd: LC_CODE_SIGNATURE,
            cmdsize: SIZEOF_LINKEDIT_DATA_COMMAND as u32,
            dataoff: data_offset,
            datasize: data_size,
        };
        Self::parse(encode(command, SIZEOF_LINKEDIT_DATA_COMMAND, None)?)
    }

    /// Copy of this dylib command pointing at `new_path`, keeping weak flag
    /// and version fields.
    pub fn with_dylib_path(&self, new_path: &str) -> Result<Self> {
        match self.kind {
            CommandKind::LoadDylib {
                weak,
                timestamp,
                current_version,
                compatibility_version,
                ..
            } => Self::load_dylib_with_versions(new_path, weak, timestamp, current_version, compatibility_version),
            _ => Err(self.wrong_kind("dylib")),
        }
    }

    /// Copy of this `LC_UUID` command carrying `uuid`.
    pub fn with_uuid(&self, uuid: [u8; 16]) -> Result<Self> {
        let mut command: UuidCommand = match self.kind {
            CommandKind::Uuid(_) => read(&self.raw, 0, "uuid_command")?,
            _ => return Err(self.wrong_kind("uuid")),
        };
        command.uuid = uuid;
        self.rewritten(command)
    }

    /// Copy of this segment command with new `vmsize` and `filesize`.
    pub fn with_segment_sizes(&self, vm_size: u64, file_size: u64) -> Result<Self> {
        let mut command: SegmentCommand64 = match self.kind {
            CommandKind::Segment(_) => read(&self.raw, 0, "segment_command_64")?,
            _ => return Err(self.wrong_kind("segment")),
        };
        command.vmsize = vm_size;
        command.filesize = file_size;
        self.rewritten(command)
    }

    /// This command with its fixed-size prefix replaced by `command`.
    fn rewritten<T>(&self, command: T) -> Result<Self>
    where
        T: TryIntoCtx<Endian, Error = scroll::Error>,
    {
        let mut raw = self.raw.clone();
        raw.pwrite_with(command, 0, LE)
            .map_err(|e| Error::corrupt(format!("rewriting load command {:#x}: {}", self.cmd, e)))?;
        Self::parse(raw)
    }

    fn wrong_kind(&self, expected: &str) -> Error {
        Error::corrupt(format!("load command {:#x} is not a {} command", self.cmd, expected))
    }

    /// The `cmd` field.
    pub fn cmd(&self) -> u32 {
        self.cmd
    }

    /// The `cmdsize` field (always equal to the raw length).
    pub fn size(&self) -> usize {
        self.raw.len()
    }

    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }

    /// Exact encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Path of a `LoadDylib` command.
    pub fn dylib_path(&self) -> Option<&str> {
        match &self.kind {
            CommandKind::LoadDylib { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Decoded segment, if this is an `LC_SEGMENT_64`.
    pub fn segment(&self) -> Option<&Segment> {
        match &self.kind {
            CommandKind::Segment(seg) => Some(seg),
            _ => None,
        }
    }
}

/// Decode a little-endian goblin structure at `offset`.
pub(crate) fn read<'a, T>(raw: &'a [u8], offset: usize, what: &str) -> Result<T>
where
    T: TryFromCtx<'a, Endian, Error = scroll::Error>,
{
    raw.pread_with(offset, LE)
        .map_err(|e| Error::corrupt(format!("{} at {:#x}: {}", what, offset, e)))
}

/// Zero-filled `size` bytes holding `command`, followed by `string` at its
/// offset when given.
fn encode<T>(command: T, size: usize, string: Option<(usize, &str)>) -> Result<Vec<u8>>
where
    T: TryIntoCtx<Endian, Error = scroll::Error>,
{
    let mut raw = vec![0u8; size];
    raw.pwrite_with(command, 0, LE)
        .map_err(|e| Error::corrupt(format!("encoding load command: {}", e)))?;
    if let Some((offset, string)) = string {
        raw.pwrite_with(string.as_bytes(), offset, ())
            .map_err(|e| Error::corrupt(format!("encoding load command string: {}", e)))?;
    }
    Ok(raw)
}

/// Read a NUL-terminated string starting at `offset` inside the command.
fn read_cstr(raw: &[u8], offset: usize, what: &str) -> Result<String> {
    let string: &str = raw
        .pread_with(offset, StrCtx::Delimiter(0))
        .map_err(|e| Error::corrupt(format!("{} at offset {}: {}", what, offset, e)))?;
    if offset + string.len() >= raw.len() {
        return Err(Error::corrupt(format!("{} is not NUL-terminated", what)));
    }
    Ok(string.to_string())
}

/// A 16-byte name field, NUL-padded unless it uses all 16 bytes.
fn fixed_name(bytes: &[u8; 16], what: &str) -> Result<String> {
    bytes[..]
        .pread_with::<&str>(0, StrCtx::Delimiter(0))
        .map(str::to_string)
        .map_err(|e| Error::corrupt(format!("{} name: {}", what, e)))
}

fn parse_segment(raw: &[u8]) -> Result<Segment> {
    let command: SegmentCommand64 = read(raw, 0, "segment_command_64")?;
    let nsects = command.nsects as usize;
    let needed = nsects
        .checked_mul(SIZEOF_SECTION_64)
        .and_then(|n| n.checked_add(SIZEOF_SEGMENT_COMMAND_64))
        .ok_or_else(|| Error::corrupt("segment section count overflows"))?;
    if needed > raw.len() {
        return Err(Error::corrupt(format!(
            "segment declares {} sections but cmdsize is {}",
            nsects,
            raw.len()
        )));
    }

    let sections: Vec<Section> = (0..nsects)
        .map(|i| -> Result<Section> {
            let section: Section64 = read(raw, SIZEOF_SEGMENT_COMMAND_64 + i * SIZEOF_SECTION_64, "section_64")?;
            Ok(Section {
                name: fixed_name(&section.sectname, "section")?,
                segment_name: fixed_name(&section.segname, "section segment")?,
                addr: section.addr,
                size: section.size,
                offset: section.offset,
            })
        })
        .collect::<Result<_>>()?;

    Ok(Segment {
        name: fixed_name(&command.segname, "segment")?,
        vm_addr: command.vmaddr,
        vm_size: command.vmsize,
        file_offset: command.fileoff,
        file_size: command.filesize,
        sections,
    })
}
