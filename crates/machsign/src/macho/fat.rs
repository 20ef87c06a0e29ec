//! Fat (universal) container handling.
//!
//! A [`MachOFile`] is the on-disk container: either one thin image or a fat
//! header followed by several architecture slices. Slices are handed out as
//! byte ranges and parsed independently with [`super::Image::parse`], so one
//! corrupt slice does not prevent the others from being processed.

use crate::{Error, Result};
use goblin::mach::cputype::get_arch_name_from_types;
use goblin::mach::fat::{FatArch, FatHeader, FAT_MAGIC, SIZEOF_FAT_ARCH, SIZEOF_FAT_HEADER};
use goblin::mach::header::{MH_CIGAM, MH_CIGAM_64, MH_MAGIC, MH_MAGIC_64};
use goblin::mach::MultiArch;
use scroll::{Pread, Pwrite, BE, LE};
use std::path::Path;

use super::align_to;

/// Fat containers larger than this are treated as Java class files, which
/// share the `0xCAFEBABE` magic.
const MAX_FAT_ARCHES: u32 = 0x20;

/// Alignment (log2) recorded for the slice of a thin file.
const THIN_ALIGN: u32 = 14;

/// One architecture slice of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchSlice {
    pub cpu_type: u32,
    pub cpu_subtype: u32,
    /// Offset of the slice inside the container.
    pub offset: usize,
    /// Size of the slice in bytes.
    pub size: usize,
    /// Slice alignment as a power of two.
    pub align: u32,
}

impl ArchSlice {
    /// Human-readable architecture name (`arm64`, `x86_64`, ...).
    pub fn arch_name(&self) -> &'static str {
        get_arch_name_from_types(self.cpu_type, self.cpu_subtype).unwrap_or("unknown")
    }

    fn from_fat_arch(arch: &FatArch) -> Self {
        Self {
            cpu_type: arch.cputype,
            cpu_subtype: arch.cpusubtype,
            offset: arch.offset as usize,
            size: arch.size as usize,
            align: arch.align,
        }
    }
}

/// A Mach-O container read from disk.
#[derive(Debug, Clone)]
pub struct MachOFile {
    data: Vec<u8>,
    is_fat: bool,
    slices: Vec<ArchSlice>,
}

impl MachOFile {
    /// Read and parse a container.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        Self::parse(data)
    }

    /// Parse a container from bytes.
    ///
    /// Only the fat header is validated here; slice contents are validated
    /// when each slice is parsed into an image.
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let magic: u32 = data
            .pread_with(0, BE)
            .map_err(|_| Error::corrupt(format!("{}-byte file has no magic", data.len())))?;

        if magic == FAT_MAGIC {
            let slices = parse_fat_arches(&data)?;
            return Ok(Self {
                data,
                is_fat: true,
                slices,
            });
        }

        let cpu = |offset: usize| -> Result<u32> {
            data.pread_with(offset, LE)
                .map_err(|_| Error::corrupt("truncated Mach-O header"))
        };
        let slice = ArchSlice {
            cpu_type: cpu(4)?,
            cpu_subtype: cpu(8)?,
            offset: 0,
            size: data.len(),
            align: THIN_ALIGN,
        };
        Ok(Self {
            data,
            is_fat: false,
            slices: vec![slice],
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_fat(&self) -> bool {
        self.is_fat
    }

    pub fn slices(&self) -> &[ArchSlice] {
        &self.slices
    }

    /// Bytes of one slice.
    pub fn slice_bytes(&self, slice: &ArchSlice) -> &[u8] {
        &self.data[slice.offset..slice.offset + slice.size]
    }

    /// Rebuild the container from (possibly resized) slice bytes, in the
    /// same order as [`MachOFile::slices`].
    pub fn assemble(&self, slice_data: &[Vec<u8>]) -> Result<Vec<u8>> {
        if slice_data.len() != self.slices.len() {
            return Err(Error::corrupt(format!(
                "expected {} slices, got {}",
                self.slices.len(),
                slice_data.len()
            )));
        }
        if !self.is_fat {
            return Ok(slice_data[0].clone());
        }
        assemble_fat(&self.slices, slice_data)
    }
}

/// Whether a file prefix looks like a Mach-O image or fat container.
pub fn is_macho(prefix: &[u8]) -> bool {
    if prefix.len() < SIZEOF_FAT_HEADER {
        return false;
    }
    match prefix.pread_with::<u32>(0, LE) {
        Ok(MH_MAGIC_64 | MH_MAGIC | MH_CIGAM_64 | MH_CIGAM) => true,
        _ => prefix
            .pread_with::<FatHeader>(0, BE)
            .map_or(false, |fat| fat.magic == FAT_MAGIC && fat.nfat_arch < MAX_FAT_ARCHES),
    }
}

fn parse_fat_arches(data: &[u8]) -> Result<Vec<ArchSlice>> {
    let fat = MultiArch::new(data).map_err(|e| Error::corrupt(format!("fat header: {}", e)))?;

    let mut slices = Vec::new();
    for (i, arch) in fat.iter_arches().enumerate() {
        let arch = arch.map_err(|e| Error::corrupt(format!("fat arch {}: {}", i, e)))?;
        let slice = ArchSlice::from_fat_arch(&arch);
        let end = slice
            .offset
            .checked_add(slice.size)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| {
                Error::corrupt(format!(
                    "fat arch {} range {:#x}+{:#x} exceeds {}-byte file",
                    i,
                    slice.offset,
                    slice.size,
                    data.len()
                ))
            })?;
        if slice.offset < SIZEOF_FAT_HEADER || end == slice.offset {
            return Err(Error::corrupt(format!("fat arch {} has an empty or overlapping range", i)));
        }
        slices.push(slice);
    }

    if slices.is_empty() {
        return Err(Error::corrupt("fat container has no architectures"));
    }
    Ok(slices)
}

/// Lay out a fat container: first slice page-aligned after the header, each
/// following slice at its own `1 << align` boundary.
fn assemble_fat(arches: &[ArchSlice], slice_data: &[Vec<u8>]) -> Result<Vec<u8>> {
    let header_size = SIZEOF_FAT_HEADER + arches.len() * SIZEOF_FAT_ARCH;

    let mut current_offset = align_to(header_size, 0x4000);
    let mut placements: Vec<(usize, usize)> = Vec::with_capacity(arches.len());
    for (arch, data) in arches.iter().zip(slice_data) {
        current_offset = align_to(current_offset, 1usize << arch.align.min(20));
        placements.push((current_offset, data.len()));
        current_offset += data.len();
    }
    if current_offset > u32::MAX as usize {
        return Err(Error::FormatUnsupported(format!(
            "fat container of {} bytes exceeds 32-bit offsets",
            current_offset
        )));
    }

    let mut output = vec![0u8; current_offset];
    let header = FatHeader {
        magic: FAT_MAGIC,
        nfat_arch: arches.len() as u32,
    };
    output.pwrite_with(header, 0, BE).map_err(write_error)?;

    for (i, (arch, &(offset, size))) in arches.iter().zip(&placements).enumerate() {
        let entry = FatArch {
            cputype: arch.cpu_type,
            cpusubtype: arch.cpu_subtype,
            offset: offset as u32,
            size: size as u32,
            align: arch.align,
        };
        output
            .pwrite_with(entry, SIZEOF_FAT_HEADER + i * SIZEOF_FAT_ARCH, BE)
            .map_err(write_error)?;
    }

    for (data, &(offset, size)) in slice_data.iter().zip(&placements) {
        output[offset..offset + size].copy_from_slice(data);
    }

    Ok(output)
}

fn write_error(e: scroll::Error) -> Error {
    Error::corrupt(format!("writing fat header: {}", e))
}
