//! Engine configuration.
//!
//! An [`EngineConfig`] is an immutable snapshot: load it once (from a plist or
//! by hand), wrap it in an `Arc` and hand it to [`crate::Engine`]. The `with_*`
//! methods consume the snapshot and return an updated one.
//!
//! ```xml
//! <dict>
//!     <key>page_size_log2</key><integer>12</integer>
//!     <key>digests</key><array><string>sha256</string></array>
//!     <key>worker_threads</key><integer>4</integer>
//!     <key>slice_policy</key><string>all_or_nothing</string>
//!     <key>inject_weak</key><true/>
//!     <key>identity</key>
//!     <dict>
//!         <key>p12_path</key><string>/path/to/developer.p12</string>
//!         <key>password</key><string>secret</string>
//!     </dict>
//! </dict>
//! ```

use crate::codesign::constants::{CSSLOT_ALTERNATE_CODEDIRECTORY_MAX, PAGE_SIZE_LOG2, PAGE_SIZE_LOG2_RANGE};
use crate::codesign::DigestType;
use crate::crypto::SigningIdentity;
use crate::macho::SigningSettings;
use crate::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::{Path, PathBuf};

/// What to do with a fat file when some of its slices fail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlicePolicy {
    /// Write the slices that succeeded; failed slices keep their original
    /// bytes.
    #[default]
    KeepPartial,
    /// Leave the file untouched unless every slice succeeds.
    AllOrNothing,
}

/// Where to load the signing identity from.
#[derive(Deserialize)]
pub struct IdentityConfig {
    pub p12_path: PathBuf,
    #[serde(deserialize_with = "deserialize_secret")]
    pub password: SecretString,
}

impl fmt::Debug for IdentityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityConfig")
            .field("p12_path", &self.p12_path)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl IdentityConfig {
    pub fn new(p12_path: impl Into<PathBuf>, password: impl Into<String>) -> Self {
        Self {
            p12_path: p12_path.into(),
            password: SecretString::new(password.into()),
        }
    }

    /// Read and decode the PKCS#12 file.
    pub fn load(&self) -> Result<SigningIdentity> {
        SigningIdentity::from_p12_file(&self.p12_path, self.password.expose_secret())
    }
}

fn deserialize_secret<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<SecretString, D::Error> {
    String::deserialize(deserializer).map(SecretString::new)
}

/// Engine-wide settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// log2 of the code page size.
    pub page_size_log2: u8,
    /// Code directory digests in slot order.
    pub digests: Vec<DigestType>,
    /// Size of the file-level worker pool; `None` uses one thread per core.
    pub worker_threads: Option<usize>,
    pub slice_policy: SlicePolicy,
    pub identity: Option<IdentityConfig>,
    /// Inject support libraries as `LC_LOAD_WEAK_DYLIB`.
    pub inject_weak: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size_log2: PAGE_SIZE_LOG2,
            digests: vec![DigestType::Sha1, DigestType::Sha256],
            worker_threads: None,
            slice_policy: SlicePolicy::default(),
            identity: None,
            inject_weak: false,
        }
    }
}

impl EngineConfig {
    /// Parse a plist (XML or binary) configuration and validate it.
    pub fn from_plist_bytes(bytes: &[u8]) -> Result<Self> {
        let config: Self = plist::from_bytes(bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_plist_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config: Self = plist::from_file(path).map_err(|e| Error::from(e).with_path(path))?;
        config.validate().map_err(|e| e.with_path(path))?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if !PAGE_SIZE_LOG2_RANGE.contains(&self.page_size_log2) {
            return Err(Error::Config(format!(
                "page_size_log2 {} outside {}..={}",
                self.page_size_log2,
                PAGE_SIZE_LOG2_RANGE.start(),
                PAGE_SIZE_LOG2_RANGE.end()
            )));
        }
        if self.digests.is_empty() {
            return Err(Error::Config("digests must not be empty".into()));
        }
        if self.digests.len() > 1 + CSSLOT_ALTERNATE_CODEDIRECTORY_MAX as usize {
            return Err(Error::Config(format!("too many digests: {}", self.digests.len())));
        }
        for (i, digest) in self.digests.iter().enumerate() {
            if self.digests[..i].contains(digest) {
                return Err(Error::Config(format!("duplicate digest {:?}", digest)));
            }
        }
        if self.worker_threads == Some(0) {
            return Err(Error::Config("worker_threads must be at least 1".into()));
        }
        Ok(())
    }

    pub fn with_page_size_log2(self, page_size_log2: u8) -> Self {
        Self { page_size_log2, ..self }
    }

    pub fn with_digests(self, digests: Vec<DigestType>) -> Self {
        Self { digests, ..self }
    }

    pub fn with_worker_threads(self, worker_threads: usize) -> Self {
        Self {
            worker_threads: Some(worker_threads),
            ..self
        }
    }

    pub fn with_slice_policy(self, slice_policy: SlicePolicy) -> Self {
        Self { slice_policy, ..self }
    }

    pub fn with_identity(self, identity: IdentityConfig) -> Self {
        Self {
            identity: Some(identity),
            ..self
        }
    }

    pub fn with_inject_weak(self, inject_weak: bool) -> Self {
        Self { inject_weak, ..self }
    }

    /// Signing settings for one file under this configuration.
    pub fn signing_settings(&self, identifier: impl Into<String>) -> SigningSettings {
        SigningSettings::new(identifier)
            .digests(self.digests.clone())
            .page_size_log2(self.page_size_log2)
    }
}
