//! Mach-O container parsing, patching, signing and writing.

pub mod fat;
pub mod image;
pub mod load_command;
pub mod patcher;
pub mod signer;
pub mod writer;

pub use fat::{ArchSlice, MachOFile};
pub use image::{ArchFilter, Header, Image};
pub use load_command::{CommandKind, LoadCommand, Section, Segment};
pub use patcher::{PatchEffect, PatchOp, PatchPlan};
pub use signer::{
    read_entitlements, sign_image, verify_image, verify_image_at, SignatureSummary, SigningMode, SigningSettings,
    VerifyReport,
};
pub use writer::{write_atomic, SignatureSpace};

/// Aligns a value up to the specified power-of-two alignment.
pub(crate) fn align_to(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}
