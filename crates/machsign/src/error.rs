//! Error types for machsign operations.
//!
//! This module defines the [`enum@Error`] enum covering every failure the
//! patch-and-sign engine can report: malformed or unsupported binaries,
//! header space exhaustion, credential problems, signature verification
//! failures and the loader bypass probe.
//!
//! # See Also
//!
//! - [`crate::Result`] - Convenience type alias using this error

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use thiserror::Error;

/// Error type for machsign operations.
///
/// All public functions in this crate return [`crate::Result<T>`], which uses this error type.
/// Match on variants to handle specific failure cases.
///
/// # Examples
///
/// ```no_run
/// use machsign::{Error, Image};
///
/// match Image::open("Payload/App.app/App", Default::default()) {
///     Ok(images) => println!("{} slice(s)", images.len()),
///     Err(Error::CorruptBinary(msg)) => eprintln!("corrupt: {msg}"),
///     Err(Error::FormatUnsupported(msg)) => eprintln!("unsupported: {msg}"),
///     Err(e) => eprintln!("other error: {e}"),
/// }
/// ```
#[derive(Debug, Error)]
pub enum Error {
    /// The binary is structurally invalid.
    ///
    /// Raised on the first malformed header field or load command; parsing
    /// never continues past it.
    #[error("corrupt binary: {0}")]
    CorruptBinary(String),

    /// The binary is well formed but uses a layout this engine does not handle
    /// (32-bit or byte-swapped thin images, for instance).
    #[error("unsupported format: {0}")]
    FormatUnsupported(String),

    /// The load command area cannot grow by the required number of bytes.
    ///
    /// The image is left byte-identical when this is returned.
    #[error("no space for patch: need {needed} bytes of header padding, {available} available")]
    NoSpaceForPatch {
        /// Bytes the new command set needs beyond the current command area.
        needed: usize,
        /// Bytes of padding between the command area and the first section.
        available: usize,
    },

    /// The PKCS#12 password did not verify the container's MAC.
    #[error("invalid password for PKCS#12 container")]
    BadPassword,

    /// The credential container or one of its certificates or keys is malformed.
    #[error("invalid certificate: {0}")]
    BadCertificateFormat(String),

    /// A certificate embedded in a signature has passed its `notAfter` date.
    #[error("certificate '{subject}' expired at {not_after}")]
    ExpiredCertificate {
        /// Common name (or full subject) of the expired certificate.
        subject: String,
        /// Expiration timestamp.
        not_after: DateTime<Utc>,
    },

    /// Stored and recomputed signature data differ.
    #[error("signature mismatch: {0}")]
    SignatureMismatch(String),

    /// The loader bypass could not find its byte signature in the loader image.
    #[error("loader signature not found: {0}")]
    SignatureScanMiss(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CMS signature construction failed.
    #[error("signing failed: {0}")]
    Signing(String),

    /// Property list parsing failed (entitlements, Info.plist, configuration).
    #[error("plist error: {0}")]
    Plist(#[from] plist::Error),

    /// Invalid engine configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The operation observed a cancellation request.
    #[error("operation cancelled")]
    Cancelled,

    /// A file-level failure annotated with the file it concerns.
    #[error("{}: {source}", path.display())]
    File {
        /// File being processed when the error occurred.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Attach the path of the file being processed.
    pub fn with_path(self, path: impl Into<PathBuf>) -> Self {
        match self {
            Error::File { .. } => self,
            other => Error::File {
                path: path.into(),
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, looking through [`Error::File`] wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::File { source, .. } => source.root(),
            other => other,
        }
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Error::CorruptBinary(msg.into())
    }
}
