//! Thin 64-bit Mach-O images.
//!
//! An [`Image`] owns the bytes of a single architecture slice and a decoded
//! view of its header and load commands. Parsing is fail-fast: the first
//! malformed field aborts with [`Error::CorruptBinary`] and no partial image
//! is produced.

use crate::{Error, Result};
use goblin::mach::fat::FAT_MAGIC;
use goblin::mach::header::{Header64, MH_CIGAM, MH_CIGAM_64, MH_EXECUTE, MH_MAGIC, MH_MAGIC_64, SIZEOF_HEADER_64};
use goblin::mach::load_command::{LoadCommandHeader, SIZEOF_LOAD_COMMAND};
use scroll::{Pread, Pwrite, BE, LE};
use std::ops::Range;
use std::path::Path;
use tracing::debug;

use super::fat::MachOFile;
use super::load_command::{read, CommandKind, LoadCommand, Segment};

/// Size of `mach_header_64`; load commands start right after it.
pub const HEADER_SIZE: usize = SIZEOF_HEADER_64;

/// Decoded `mach_header_64` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub cpu_type: u32,
    pub cpu_subtype: u32,
    pub file_type: u32,
    pub flags: u32,
}

/// Selects which slices [`Image::open`] returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ArchFilter {
    /// Every slice.
    #[default]
    All,
    /// Slices with this CPU type (and subtype, when given).
    Cpu {
        cpu_type: u32,
        cpu_subtype: Option<u32>,
    },
}

/// Capability bits in the high byte of `cpusubtype`.
const CPU_SUBTYPE_MASK: u32 = 0x00ff_ffff;

impl ArchFilter {
    fn matches(&self, cpu_type: u32, cpu_subtype: u32) -> bool {
        match *self {
            ArchFilter::All => true,
            ArchFilter::Cpu {
                cpu_type: want_type,
                cpu_subtype: want_subtype,
            } => {
                want_type == cpu_type
                    && want_subtype.map_or(true, |sub| {
                        sub & CPU_SUBTYPE_MASK == cpu_subtype & CPU_SUBTYPE_MASK
                    })
            }
        }
    }
}

/// A parsed thin 64-bit Mach-O image.
#[derive(Debug, Clone)]
pub struct Image {
    header: Header,
    commands: Vec<LoadCommand>,
    data: Vec<u8>,
}

impl Image {
    /// Open a file and parse every slice matching `filter`.
    ///
    /// Slices are selected by the CPU type recorded in the container before
    /// they are parsed, so a corrupt slice outside the filter is never read.
    /// Fails on the first selected slice that does not parse.
    pub fn open(path: impl AsRef<Path>, filter: ArchFilter) -> Result<Vec<Image>> {
        let path = path.as_ref();
        let file = MachOFile::open(path).map_err(|e| e.with_path(path))?;

        let mut images = Vec::new();
        for slice in file.slices() {
            if !filter.matches(slice.cpu_type, slice.cpu_subtype) {
                continue;
            }
            let image = Image::parse(file.slice_bytes(slice).to_vec()).map_err(|e| e.with_path(path))?;
            images.push(image);
        }

        if images.is_empty() {
            return Err(Error::FormatUnsupported(format!("no slice matches {:?}", filter)).with_path(path));
        }
        debug!(path = %path.display(), slices = images.len(), "opened image");
        Ok(images)
    }

    /// Parse a thin image from its bytes.
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let magic: u32 = data
            .pread_with(0, LE)
            .map_err(|_| Error::corrupt(format!("{}-byte image has no magic", data.len())))?;
        match magic {
            MH_MAGIC_64 => {}
            MH_MAGIC => return Err(Error::FormatUnsupported("32-bit Mach-O images are not supported".into())),
            MH_CIGAM | MH_CIGAM_64 => {
                return Err(Error::FormatUnsupported("big-endian Mach-O images are not supported".into()))
            }
            _ if magic.swap_bytes() == FAT_MAGIC => {
                return Err(Error::FormatUnsupported("fat container passed where a thin image was expected".into()))
            }
            other => return Err(Error::corrupt(format!("unrecognized magic {:#010x}", other))),
        }

        let raw: Header64 = read(&data, 0, "mach_header_64")?;
        let header = Header {
            magic,
            cpu_type: raw.cputype,
            cpu_subtype: raw.cpusubtype,
            file_type: raw.filetype,
            flags: raw.flags,
        };
        let ncmds = raw.ncmds as usize;
        let sizeofcmds = raw.sizeofcmds as usize;

        let area_end = HEADER_SIZE
            .checked_add(sizeofcmds)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| {
                Error::corrupt(format!(
                    "sizeofcmds {} exceeds {}-byte image",
                    sizeofcmds,
                    data.len()
                ))
            })?;

        let mut commands = Vec::with_capacity(ncmds.min(sizeofcmds / SIZEOF_LOAD_COMMAND));
        let mut offset = HEADER_SIZE;
        for index in 0..ncmds {
            if offset + SIZEOF_LOAD_COMMAND > area_end {
                return Err(Error::corrupt(format!(
                    "load command {} starts past the {}-byte command area",
                    index, sizeofcmds
                )));
            }
            let command: LoadCommandHeader = read(&data, offset, "load command header")?;
            let cmdsize = command.cmdsize as usize;
            if cmdsize < SIZEOF_LOAD_COMMAND || cmdsize % 4 != 0 {
                return Err(Error::corrupt(format!(
                    "load command {} has invalid cmdsize {}",
                    index, cmdsize
                )));
            }
            if offset + cmdsize > area_end {
                return Err(Error::corrupt(format!(
                    "load command {} overruns the command area",
                    index
                )));
            }
            commands.push(LoadCommand::parse(data[offset..offset + cmdsize].to_vec())?);
            offset += cmdsize;
        }
        if offset != area_end {
            return Err(Error::corrupt(format!(
                "load commands cover {} bytes but sizeofcmds is {}",
                offset - HEADER_SIZE,
                sizeofcmds
            )));
        }

        let image = Self {
            header,
            commands,
            data,
        };
        image.validate_ranges()?;
        Ok(image)
    }

    fn validate_ranges(&self) -> Result<()> {
        let len = self.data.len() as u64;
        for seg in self.segments() {
            let end = seg.file_offset.checked_add(seg.file_size);
            if end.map_or(true, |end| end > len) {
                return Err(Error::corrupt(format!(
                    "segment {} file range {:#x}+{:#x} exceeds {}-byte image",
                    seg.name, seg.file_offset, seg.file_size, len
                )));
            }
        }
        if let Some((offset, size)) = self.code_signature() {
            if offset as u64 + size as u64 > len {
                return Err(Error::corrupt(format!(
                    "code signature {:#x}+{:#x} exceeds {}-byte image",
                    offset, size, len
                )));
            }
        }
        Ok(())
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn commands(&self) -> &[LoadCommand] {
        &self.commands
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn is_executable(&self) -> bool {
        self.header.file_type == MH_EXECUTE
    }

    /// Total size of the load commands; parsing guarantees it matches `sizeofcmds`.
    pub fn commands_size(&self) -> usize {
        self.commands.iter().map(LoadCommand::size).sum()
    }

    /// Raw bytes of the load command area.
    pub fn command_area(&self) -> &[u8] {
        &self.data[HEADER_SIZE..HEADER_SIZE + self.commands_size()]
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.commands.iter().filter_map(LoadCommand::segment)
    }

    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments().find(|seg| seg.name == name)
    }

    /// File bytes of a segment.
    pub fn segment_bytes(&self, name: &str) -> Option<&[u8]> {
        let seg = self.segment(name)?;
        let start = seg.file_offset as usize;
        Some(&self.data[start..start + seg.file_size as usize])
    }

    /// Mutable bytes in `range`, for writes that do not change the layout.
    pub fn bytes_mut(&mut self, range: Range<usize>) -> Result<&mut [u8]> {
        if range.start > range.end || range.end > self.data.len() {
            return Err(Error::corrupt(format!(
                "range {:?} outside {}-byte image",
                range,
                self.data.len()
            )));
        }
        Ok(&mut self.data[range])
    }

    /// Paths of all `LC_LOAD_DYLIB` / `LC_LOAD_WEAK_DYLIB` commands, in order.
    pub fn dylibs(&self) -> Vec<&str> {
        self.commands.iter().filter_map(LoadCommand::dylib_path).collect()
    }

    pub fn find_dylib(&self, path: &str) -> Option<&LoadCommand> {
        self.commands.iter().find(|c| c.dylib_path() == Some(path))
    }

    pub fn rpaths(&self) -> Vec<&str> {
        self.commands
            .iter()
            .filter_map(|c| match c.kind() {
                CommandKind::RPath { path } => Some(path.as_str()),
                _ => None,
            })
            .collect()
    }

    /// `(dataoff, datasize)` of `LC_CODE_SIGNATURE`.
    pub fn code_signature(&self) -> Option<(u32, u32)> {
        self.commands.iter().find_map(|c| match *c.kind() {
            CommandKind::CodeSignature {
                data_offset,
                data_size,
            } => Some((data_offset, data_size)),
            _ => None,
        })
    }

    pub fn has_code_signature(&self) -> bool {
        self.code_signature().is_some()
    }

    pub fn uuid(&self) -> Option<[u8; 16]> {
        self.commands.iter().find_map(|c| match *c.kind() {
            CommandKind::Uuid(uuid) => Some(uuid),
            _ => None,
        })
    }

    /// End of the last segment's file data, or the image length when there
    /// are no file-backed segments.
    pub fn code_end(&self) -> usize {
        self.segments()
            .map(|seg| (seg.file_offset + seg.file_size) as usize)
            .max()
            .filter(|&end| end > 0)
            .unwrap_or(self.data.len())
    }

    /// Length of the data covered by a signature: the existing signature
    /// offset, or the end of code for unsigned images.
    pub fn signed_length(&self) -> usize {
        self.code_signature()
            .map(|(offset, _)| offset as usize)
            .unwrap_or_else(|| self.code_end())
    }

    /// File offset of the first section or segment data after the header.
    pub fn first_data_offset(&self) -> usize {
        let sections = self
            .segments()
            .flat_map(|seg| seg.sections.iter())
            .map(|sect| sect.offset as usize)
            .filter(|&offset| offset > 0)
            .min();
        sections
            .or_else(|| {
                self.segments()
                    .filter(|seg| seg.file_size > 0 && seg.file_offset > 0)
                    .map(|seg| seg.file_offset as usize)
                    .min()
            })
            .unwrap_or(self.data.len())
    }

    /// Bytes available between the end of the load commands and the first
    /// section data.
    pub fn header_padding(&self) -> usize {
        self.first_data_offset()
            .saturating_sub(HEADER_SIZE + self.commands_size())
    }

    /// Replace the load command list, rewriting the command area in place.
    ///
    /// Fails with [`Error::NoSpaceForPatch`] when the new commands do not fit
    /// in the header padding; the image is untouched in that case. Bytes
    /// freed by a shrinking command area are zeroed.
    pub fn replace_commands(&mut self, commands: Vec<LoadCommand>) -> Result<()> {
        let old_size = self.commands_size();
        let new_size: usize = commands.iter().map(LoadCommand::size).sum();

        if new_size > old_size {
            let needed = new_size - old_size;
            let available = self.header_padding();
            if needed > available {
                return Err(Error::NoSpaceForPatch { needed, available });
            }
        }
        if HEADER_SIZE + new_size > self.data.len() {
            return Err(Error::NoSpaceForPatch {
                needed: new_size - old_size,
                available: self.data.len().saturating_sub(HEADER_SIZE + old_size),
            });
        }

        let mut header: Header64 = read(&self.data, 0, "mach_header_64")?;
        header.ncmds = commands.len() as u32;
        header.sizeofcmds = new_size as u32;
        self.data
            .pwrite_with(header, 0, LE)
            .map_err(|e| Error::corrupt(format!("rewriting mach_header_64: {}", e)))?;

        let mut offset = HEADER_SIZE;
        for command in &commands {
            self.data[offset..offset + command.size()].copy_from_slice(command.as_bytes());
            offset += command.size();
        }
        if new_size < old_size {
            self.data[HEADER_SIZE + new_size..HEADER_SIZE + old_size].fill(0);
        }

        debug!(
            ncmds = commands.len(),
            old_size, new_size, "rewrote load commands"
        );
        self.commands = commands;
        Ok(())
    }

    /// Resize the image, zero-filling any growth.
    pub(crate) fn resize(&mut self, len: usize) {
        self.data.resize(len, 0);
    }
}
