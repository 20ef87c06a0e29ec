//! Patch and re-sign 64-bit Mach-O images.
//!
//! - [`macho`]: parse thin and fat images, rewrite load commands, embed signatures
//! - [`codesign`]: code directories and SuperBlobs
//! - [`crypto`]: PKCS#12 identities and CMS
//! - [`bundle`]: the parallel bundle engine
//! - [`loader`]: the in-process loader validation bypass

pub mod bundle;
pub mod cancel;
pub mod codesign;
pub mod config;
pub mod crypto;
pub mod error;
pub mod loader;
pub mod macho;

#[cfg(test)]
mod test_fixtures;

pub use bundle::{Engine, FileOutcome, Progress, SignRequest, SliceOutcome, SliceReport};
pub use cancel::Cancellation;
pub use config::{EngineConfig, IdentityConfig, SlicePolicy};
pub use crypto::{CertificateStatus, ProvisioningProfile, SigningIdentity};
pub use error::Error;
pub use macho::{
    sign_image, verify_image, ArchFilter, Image, MachOFile, PatchEffect, PatchOp, PatchPlan, SigningMode,
    SigningSettings, VerifyReport,
};

pub type Result<T> = std::result::Result<T, Error>;
