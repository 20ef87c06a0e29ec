//! Thunk encoding and patch planning.
//!
//! Each intercepted syscall stub is overwritten with a 16-byte absolute
//! branch:
//!
//! ```text
//! ldr x16, #8      ; 0x58000050
//! br  x16          ; 0xD61F0200
//! .quad hook
//! ```

use super::scan::{find_signature, FCNTL_SIGNATURE, MMAP_SIGNATURE};
use crate::{Error, Result};
use std::fmt;

/// Length of the branch thunk written over each stub.
pub const THUNK_LEN: usize = 16;

const LDR_X16_PC8: u32 = 0x5800_0050;
const BR_X16: u32 = 0xD61F_0200;

/// Encode `ldr x16, #8; br x16; .quad target`.
pub fn encode_thunk(target: u64) -> [u8; THUNK_LEN] {
    let mut thunk = [0u8; THUNK_LEN];
    thunk[0..4].copy_from_slice(&LDR_X16_PC8.to_le_bytes());
    thunk[4..8].copy_from_slice(&BR_X16.to_le_bytes());
    thunk[8..16].copy_from_slice(&target.to_le_bytes());
    thunk
}

/// A loader entry point that can be intercepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Symbol {
    Mmap,
    Fcntl,
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Symbol::Mmap => "mmap",
            Symbol::Fcntl => "fcntl",
        })
    }
}

/// Byte signatures identifying each symbol's stub in a given loader build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureSet {
    signatures: Vec<(Symbol, Vec<u8>)>,
}

impl Default for SignatureSet {
    /// Stubs of the arm64 system loader.
    fn default() -> Self {
        Self::empty()
            .with(Symbol::Mmap, MMAP_SIGNATURE.to_vec())
            .with(Symbol::Fcntl, FCNTL_SIGNATURE.to_vec())
    }
}

impl SignatureSet {
    pub fn empty() -> Self {
        Self { signatures: Vec::new() }
    }

    /// Set (or replace) the signature for `symbol`.
    pub fn with(mut self, symbol: Symbol, signature: Vec<u8>) -> Self {
        self.signatures.retain(|(s, _)| *s != symbol);
        self.signatures.push((symbol, signature));
        self
    }

    pub fn get(&self, symbol: Symbol) -> Option<&[u8]> {
        self.signatures
            .iter()
            .find(|(s, _)| *s == symbol)
            .map(|(_, sig)| sig.as_slice())
    }
}

/// One row of the interception table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interception {
    pub symbol: Symbol,
    pub signature: Vec<u8>,
    /// Address of the replacement function.
    pub replacement: u64,
}

/// Every interception to install, in installation order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterceptionTable {
    entries: Vec<Interception>,
}

impl InterceptionTable {
    /// Pair each hook with its symbol's signature from `signatures`.
    ///
    /// Fails with [`Error::SignatureScanMiss`] if a hooked symbol has no
    /// signature.
    pub fn new(signatures: &SignatureSet, hooks: &[(Symbol, u64)]) -> Result<Self> {
        let entries = hooks
            .iter()
            .map(|&(symbol, replacement)| {
                let signature = signatures
                    .get(symbol)
                    .ok_or_else(|| Error::SignatureScanMiss(format!("no signature known for {}", symbol)))?;
                Ok(Interception {
                    symbol,
                    signature: signature.to_vec(),
                    replacement,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[Interception] {
        &self.entries
    }

    /// Locate every stub in `image` (mapped at `base`) and plan its thunk.
    ///
    /// All or nothing: one missing stub fails the whole plan, so nothing is
    /// installed against a loader this table does not recognize.
    pub fn plan(&self, image: &[u8], base: u64) -> Result<Vec<BypassPatch>> {
        self.entries
            .iter()
            .map(|entry| {
                let offset = find_signature(image, &entry.signature)
                    .filter(|offset| offset + THUNK_LEN <= image.len())
                    .ok_or_else(|| Error::SignatureScanMiss(format!("{} stub not found in loader", entry.symbol)))?;
                Ok(BypassPatch {
                    symbol: entry.symbol,
                    target_address: base + offset as u64,
                    original: image[offset..offset + THUNK_LEN].to_vec(),
                    replacement: encode_thunk(entry.replacement),
                })
            })
            .collect()
    }
}

/// A planned code patch. Installed for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BypassPatch {
    pub symbol: Symbol,
    pub target_address: u64,
    pub original: Vec<u8>,
    pub replacement: [u8; THUNK_LEN],
}

/// `fcntl` command asking the kernel to attach a code signature.
pub const F_ADDFILESIGS_RETURN: i32 = 97;

/// `fcntl` command asking for library validation.
pub const F_CHECK_LV: i32 = 98;

/// What the `fcntl` replacement does with a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FcntlAction {
    /// Report a signature covering the whole file.
    ReportFullCoverage,
    /// Report success without calling the kernel.
    ReportSuccess,
    /// Forward to the real `fcntl`.
    PassThrough,
}

pub fn fcntl_action(cmd: i32) -> FcntlAction {
    match cmd {
        F_ADDFILESIGS_RETURN => FcntlAction::ReportFullCoverage,
        F_CHECK_LV => FcntlAction::ReportSuccess,
        _ => FcntlAction::PassThrough,
    }
}
