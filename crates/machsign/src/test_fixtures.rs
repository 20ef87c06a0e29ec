//! Synthetic Mach-O images for tests.
//!
//! Shared between unit tests and the integration tests under `tests/`, so it
//! depends on nothing but std.

const MH_MAGIC_64: u32 = 0xfeed_facf;
const MH_EXECUTE: u32 = 0x2;
const LC_SEGMENT_64: u32 = 0x19;
const LC_LOAD_DYLIB: u32 = 0xc;
const LC_UUID: u32 = 0x1b;

pub const CPU_TYPE_ARM64: u32 = 0x0100_000c;
pub const CPU_TYPE_X86_64: u32 = 0x0100_0007;

/// Shape of a synthetic image.
#[derive(Debug, Clone)]
pub struct ImageSpec {
    pub cpu_type: u32,
    /// Bytes of `__text` content.
    pub code_size: usize,
    /// Gap between the load commands and `__text`. `None` places `__text`
    /// at 0x1000.
    pub padding: Option<usize>,
    pub dylibs: Vec<String>,
    pub linkedit_size: usize,
    /// Cut the file short after building it.
    pub truncate_to: Option<usize>,
    /// Seed for the code byte pattern.
    pub seed: u8,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            cpu_type: CPU_TYPE_ARM64,
            code_size: 0x3000,
            padding: None,
            dylibs: vec!["/usr/lib/libSystem.B.dylib".to_string()],
            linkedit_size: 0x100,
            truncate_to: None,
            seed: 1,
        }
    }
}

fn put32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_name(buf: &mut Vec<u8>, name: &str) {
    let mut field = [0u8; 16];
    field[..name.len()].copy_from_slice(name.as_bytes());
    buf.extend_from_slice(&field);
}

fn align(value: usize, to: usize) -> usize {
    (value + to - 1) & !(to - 1)
}

fn segment(name: &str, vm_addr: u64, vm_size: u64, file_off: u64, file_size: u64, section: Option<(u64, u64, u32)>) -> Vec<u8> {
    let nsects = section.is_some() as u32;
    let mut cmd = Vec::new();
    put32(&mut cmd, LC_SEGMENT_64);
    put32(&mut cmd, 72 + 80 * nsects);
    put_name(&mut cmd, name);
    put64(&mut cmd, vm_addr);
    put64(&mut cmd, vm_size);
    put64(&mut cmd, file_off);
    put64(&mut cmd, file_size);
    put32(&mut cmd, 5); // maxprot
    put32(&mut cmd, 5); // initprot
    put32(&mut cmd, nsects);
    put32(&mut cmd, 0);
    if let Some((addr, size, offset)) = section {
        put_name(&mut cmd, "__text");
        put_name(&mut cmd, name);
        put64(&mut cmd, addr);
        put64(&mut cmd, size);
        put32(&mut cmd, offset);
        put32(&mut cmd, 2); // align
        put32(&mut cmd, 0); // reloff
        put32(&mut cmd, 0); // nreloc
        put32(&mut cmd, 0x8000_0400); // flags
        put32(&mut cmd, 0);
        put32(&mut cmd, 0);
        put32(&mut cmd, 0);
    }
    cmd
}

fn dylib(path: &str) -> Vec<u8> {
    let size = align(24 + path.len() + 1, 8);
    let mut cmd = Vec::new();
    put32(&mut cmd, LC_LOAD_DYLIB);
    put32(&mut cmd, size as u32);
    put32(&mut cmd, 24);
    put32(&mut cmd, 2);
    put32(&mut cmd, 0x0501_0000);
    put32(&mut cmd, 0x0001_0000);
    cmd.extend_from_slice(path.as_bytes());
    cmd.resize(size, 0);
    cmd
}

fn uuid(seed: u8) -> Vec<u8> {
    let mut cmd = Vec::new();
    put32(&mut cmd, LC_UUID);
    put32(&mut cmd, 24);
    cmd.extend((0..16u8).map(|i| i.wrapping_mul(17).wrapping_add(seed)));
    cmd
}

/// Build a thin arm64-style executable: `__TEXT` with one `__text` section,
/// `__LINKEDIT`, the requested dylibs and an `LC_UUID`.
pub fn minimal_image(spec: &ImageSpec) -> Vec<u8> {
    const TEXT_VMADDR: u64 = 0x1_0000_0000;

    // Two passes: the command sizes do not depend on the offsets.
    let fixed_cmds: Vec<Vec<u8>> = spec
        .dylibs
        .iter()
        .map(|d| dylib(d))
        .chain(std::iter::once(uuid(spec.seed)))
        .collect();
    let sizeofcmds = (72 + 80) + 72 + fixed_cmds.iter().map(Vec::len).sum::<usize>();

    let text_offset = match spec.padding {
        Some(padding) => 32 + sizeofcmds + padding,
        None => 0x1000,
    };
    let text_end = align(text_offset + spec.code_size, 0x1000);
    let linkedit_end = text_end + spec.linkedit_size;

    let text = segment(
        "__TEXT",
        TEXT_VMADDR,
        align(text_end, 0x4000) as u64,
        0,
        text_end as u64,
        Some((
            TEXT_VMADDR + text_offset as u64,
            spec.code_size as u64,
            text_offset as u32,
        )),
    );
    let linkedit = segment(
        "__LINKEDIT",
        TEXT_VMADDR + align(text_end, 0x4000) as u64,
        align(spec.linkedit_size, 0x4000) as u64,
        text_end as u64,
        spec.linkedit_size as u64,
        None,
    );

    let mut out = Vec::with_capacity(linkedit_end);
    put32(&mut out, MH_MAGIC_64);
    put32(&mut out, spec.cpu_type);
    put32(&mut out, 0);
    put32(&mut out, MH_EXECUTE);
    put32(&mut out, 2 + fixed_cmds.len() as u32);
    put32(&mut out, sizeofcmds as u32);
    put32(&mut out, 0x0020_0085);
    put32(&mut out, 0);
    out.extend_from_slice(&text);
    out.extend_from_slice(&linkedit);
    for cmd in &fixed_cmds {
        out.extend_from_slice(cmd);
    }
    debug_assert_eq!(out.len(), 32 + sizeofcmds);

    out.resize(text_offset, 0);
    let mut state = spec.seed as u32 | 0x100;
    for _ in 0..spec.code_size {
        state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        out.push((state >> 16) as u8);
    }
    out.resize(text_end, 0);
    out.extend((0..spec.linkedit_size).map(|i| (i % 251) as u8));

    if let Some(len) = spec.truncate_to {
        out.truncate(len);
    }
    out
}

/// Wrap thin images in a fat container, page-aligned.
pub fn fat_image(slices: &[(u32, Vec<u8>)]) -> Vec<u8> {
    let header_size = 8 + 20 * slices.len();
    let mut offsets = Vec::new();
    let mut offset = align(header_size, 0x4000);
    for (_, data) in slices {
        offsets.push(offset);
        offset = align(offset + data.len(), 0x4000);
    }

    let mut out = Vec::new();
    out.extend_from_slice(&0xcafe_babeu32.to_be_bytes());
    out.extend_from_slice(&(slices.len() as u32).to_be_bytes());
    for ((cpu, data), off) in slices.iter().zip(&offsets) {
        for value in [*cpu, 0, *off as u32, data.len() as u32, 14] {
            out.extend_from_slice(&value.to_be_bytes());
        }
    }
    for ((_, data), off) in slices.iter().zip(&offsets) {
        out.resize(*off, 0);
        out.extend_from_slice(data);
    }
    out
}
