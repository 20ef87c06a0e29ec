//! Embedded code signature structures: code directories and SuperBlobs.

pub mod code_directory;
pub mod constants;
pub mod superblob;

pub use code_directory::{cdhash, compute_code_directory, hash_pages, CodeDirectory, CodeDirectoryBuilder, DigestType};
pub use superblob::{SuperBlob, SuperBlobBuilder};

pub(crate) fn read_be_u32(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_be_bytes(bytes)
}

pub(crate) fn read_be_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}
