//! Signing identities and CMS signatures.

pub mod cms;
pub mod identity;
pub mod profile;

pub use cms::{sign_code_directory, verify_detached, CdHash, SignerCertificate};
pub use identity::{team_id_from_p12, CertificateStatus, SigningIdentity, ValidityReport};
pub use profile::{ProvisioningProfile, EMBEDDED_PROFILE_NAME};
