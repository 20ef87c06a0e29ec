//! Signing identities loaded from PKCS#12 containers.
//!
//! A [`SigningIdentity`] bundles the private key, the leaf certificate, any
//! intermediate certificates and the Apple team id read from the leaf's
//! Organizational Unit. It is immutable once parsed and meant to be shared
//! read-only (`Arc<SigningIdentity>`) across a batch of files.
//!
//! # Examples
//!
//! ```no_run
//! use machsign::SigningIdentity;
//!
//! let p12 = std::fs::read("developer.p12")?;
//! let identity = SigningIdentity::from_p12(&p12, "password")?;
//! println!("team id: {:?}", identity.team_id());
//! # Ok::<(), machsign::Error>(())
//! ```

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::Path;
use tracing::debug;
use x509_certificate::{CapturedX509Certificate, InMemorySigningKeyPair, Sign, X509Certificate};

/// Validity of a certificate at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateStatus {
    Valid,
    Expired,
    NotYetValid,
}

/// Result of [`SigningIdentity::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidityReport {
    pub status: CertificateStatus,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// Private key, leaf certificate and chain used for identity signing.
pub struct SigningIdentity {
    key: InMemorySigningKeyPair,
    certificate: CapturedX509Certificate,
    chain: Vec<CapturedX509Certificate>,
    team_id: Option<String>,
}

impl fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("subject", &self.common_name())
            .field("team_id", &self.team_id)
            .field("chain", &self.chain.len())
            .finish_non_exhaustive()
    }
}

impl SigningIdentity {
    /// Assemble an identity from already-decoded parts.
    pub fn new(
        key: InMemorySigningKeyPair,
        certificate: CapturedX509Certificate,
        chain: Vec<CapturedX509Certificate>,
    ) -> Self {
        let team_id = extract_team_id(&certificate);
        Self {
            key,
            certificate,
            chain,
            team_id,
        }
    }

    /// Load from PKCS#12 bytes.
    ///
    /// # Errors
    ///
    /// - [`Error::BadPassword`] if the container's MAC does not verify with
    ///   `password`
    /// - [`Error::BadCertificateFormat`] if the container, key or certificates
    ///   cannot be decoded, or the key or certificate is missing
    pub fn from_p12(p12_data: &[u8], password: &str) -> Result<Self> {
        let pfx = p12::PFX::parse(p12_data)
            .map_err(|e| Error::BadCertificateFormat(format!("not a PKCS#12 container: {:?}", e)))?;

        if !pfx.verify_mac(password) {
            return Err(Error::BadPassword);
        }

        let keys = pfx
            .key_bags(password)
            .map_err(|e| Error::BadCertificateFormat(format!("cannot decrypt key bags: {:?}", e)))?;
        let certs = pfx
            .cert_x509_bags(password)
            .map_err(|e| Error::BadCertificateFormat(format!("cannot decrypt certificate bags: {:?}", e)))?;

        let key_der = keys
            .first()
            .ok_or_else(|| Error::BadCertificateFormat("no private key in PKCS#12".into()))?;
        if certs.is_empty() {
            return Err(Error::BadCertificateFormat("no certificate in PKCS#12".into()));
        }

        let key = InMemorySigningKeyPair::from_pkcs8_der(key_der)
            .map_err(|e| Error::BadCertificateFormat(format!("unsupported private key: {}", e)))?;

        let mut certificates = certs
            .iter()
            .map(|der| {
                CapturedX509Certificate::from_der(der.clone())
                    .map_err(|e| Error::BadCertificateFormat(format!("bad certificate DER: {}", e)))
            })
            .collect::<Result<Vec<_>>>()?;

        // The leaf is the certificate holding the key's public half.
        let public_key = key.public_key_data();
        let leaf_index = certificates
            .iter()
            .position(|cert| cert.public_key_data().as_ref() == public_key.as_ref())
            .unwrap_or(0);
        let certificate = certificates.remove(leaf_index);

        let identity = Self::new(key, certificate, certificates);
        debug!(subject = ?identity.common_name(), team_id = ?identity.team_id, "loaded signing identity");
        Ok(identity)
    }

    /// Load from a PKCS#12 file.
    pub fn from_p12_file(path: impl AsRef<Path>, password: &str) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| Error::from(e).with_path(path))?;
        Self::from_p12(&data, password).map_err(|e| e.with_path(path))
    }

    pub fn key(&self) -> &InMemorySigningKeyPair {
        &self.key
    }

    pub fn certificate(&self) -> &CapturedX509Certificate {
        &self.certificate
    }

    /// Intermediate certificates, excluding the leaf.
    pub fn chain(&self) -> &[CapturedX509Certificate] {
        &self.chain
    }

    /// Apple team id from the leaf certificate's OU.
    pub fn team_id(&self) -> Option<&str> {
        self.team_id.as_deref()
    }

    pub fn common_name(&self) -> Option<String> {
        self.certificate.subject_common_name()
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.certificate.validity_not_before()
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.certificate.validity_not_after()
    }

    /// Check the leaf certificate's validity window at `now`.
    ///
    /// No revocation check is performed.
    pub fn validate(&self, now: DateTime<Utc>) -> ValidityReport {
        let not_before = self.not_before();
        let not_after = self.not_after();
        let status = if now < not_before {
            CertificateStatus::NotYetValid
        } else if now > not_after {
            CertificateStatus::Expired
        } else {
            CertificateStatus::Valid
        };
        ValidityReport {
            status,
            not_before,
            not_after,
        }
    }
}

/// Team id of the leaf certificate in a PKCS#12 container.
pub fn team_id_from_p12(p12_data: &[u8], password: &str) -> Result<Option<String>> {
    Ok(SigningIdentity::from_p12(p12_data, password)?.team_id)
}

/// Extracts the Apple Team ID from a certificate's Organizational Unit field.
pub(crate) fn extract_team_id(cert: &X509Certificate) -> Option<String> {
    cert.subject_name()
        .iter_organizational_unit()
        .find_map(|atav| atav.to_string().ok())
}
