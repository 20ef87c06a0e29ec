//! In-process bypass of the system loader's code signature checks.
//!
//! The loader's `mmap` and `fcntl` system call stubs are located by exact
//! byte signature and overwritten with thunks into replacement functions
//! (see [`patch::InterceptionTable`]). When a signature is missing nothing is
//! written and the bypass reports itself unavailable.
//!
//! Only `aarch64` Apple targets can install the patches; elsewhere
//! [`enable`] always returns [`BypassStatus::Unavailable`].

pub mod patch;
pub mod scan;

#[cfg(all(target_arch = "aarch64", any(target_os = "ios", target_os = "macos")))]
mod darwin;

pub use patch::{
    encode_thunk, fcntl_action, BypassPatch, FcntlAction, Interception, InterceptionTable, SignatureSet, Symbol,
    THUNK_LEN,
};
pub use scan::find_signature;

use std::sync::OnceLock;
use tracing::{info, warn};

/// Result of [`enable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BypassStatus {
    /// Every interception was installed.
    Enabled { patches: usize },
    /// Nothing was patched; the reason is attached.
    Unavailable(String),
}

impl BypassStatus {
    pub fn is_enabled(&self) -> bool {
        matches!(self, BypassStatus::Enabled { .. })
    }
}

static STATUS: OnceLock<BypassStatus> = OnceLock::new();

/// Install the loader interceptions once per process.
///
/// Later calls return the first outcome without touching memory again.
pub fn enable() -> &'static BypassStatus {
    STATUS.get_or_init(|| {
        let status = install(&SignatureSet::default());
        match &status {
            BypassStatus::Enabled { patches } => info!(patches, "loader bypass enabled"),
            BypassStatus::Unavailable(reason) => warn!(%reason, "loader bypass unavailable"),
        }
        status
    })
}

#[cfg(all(target_arch = "aarch64", any(target_os = "ios", target_os = "macos")))]
fn install(signatures: &SignatureSet) -> BypassStatus {
    match darwin::install(signatures) {
        Ok(patches) => BypassStatus::Enabled { patches: patches.len() },
        Err(e) => BypassStatus::Unavailable(e.to_string()),
    }
}

#[cfg(not(all(target_arch = "aarch64", any(target_os = "ios", target_os = "macos"))))]
fn install(_signatures: &SignatureSet) -> BypassStatus {
    BypassStatus::Unavailable(format!(
        "not supported on {}-{}",
        std::env::consts::ARCH,
        std::env::consts::OS
    ))
}
