//! Error types for cache operations.

use std::path::PathBuf;

use quire_common::{ContentHash, InternalError};

/// Errors that can occur during artifact store and ledger operations.
///
/// A corrupt or unreadable artifact surfaces as one of these; the engine
/// treats it as a cache miss and rebuilds.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// An I/O error occurred while reading or writing cache files.
    #[error("cache I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// No artifact is stored under the fingerprint.
    #[error("no artifact stored for {fingerprint}")]
    NotFound {
        /// The requested fingerprint.
        fingerprint: ContentHash,
    },

    /// An artifact file has an invalid or missing header.
    #[error("invalid artifact header in {path}: {reason}")]
    InvalidHeader {
        /// The artifact file path.
        path: PathBuf,
        /// Description of the header problem.
        reason: String,
    },

    /// The stored checksum does not match the computed checksum of the payload.
    #[error("checksum mismatch in {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// The artifact file path.
        path: PathBuf,
        /// The expected checksum from the header.
        expected: String,
        /// The actual checksum computed from the payload.
        actual: String,
    },

    /// The artifact format version does not match the current version.
    #[error("version mismatch in {path}: expected {expected}, got {actual}")]
    VersionMismatch {
        /// The artifact file path.
        path: PathBuf,
        /// The expected format version.
        expected: u32,
        /// The actual format version found in the file.
        actual: u32,
    },

    /// Payload and metadata disagree, or only one of them is present.
    #[error("inconsistent artifact {fingerprint}: {reason}")]
    Inconsistent {
        /// The affected fingerprint.
        fingerprint: ContentHash,
        /// What is out of step.
        reason: String,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {reason}")]
    Serialization {
        /// Description of the serialization failure.
        reason: String,
    },

    /// A remote key-value server refused or failed a request.
    #[error("remote store error at {url}: {reason}")]
    Remote {
        /// The request URL.
        url: String,
        /// Status or transport failure.
        reason: String,
    },

    /// A bug in the engine, such as an unencodable section list.
    #[error(transparent)]
    Internal(#[from] InternalError),
}

impl CacheError {
    /// Wraps an I/O error with the path it happened at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
