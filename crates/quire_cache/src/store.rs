//! The artifact store contract.

use std::collections::HashSet;

use quire_common::ContentHash;

use crate::error::CacheError;
use crate::metadata::ArtifactMeta;
use crate::payload::Payload;

/// An artifact loaded back from a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    /// Stored metadata.
    pub meta: ArtifactMeta,
    /// Stored payload.
    pub payload: Payload,
}

/// Persistent map from fingerprint to `(metadata, payload)`.
///
/// Implementations must make `save` idempotent and safe when two threads
/// save the same fingerprint at once, and must never let `has` report an
/// entry whose payload is not fully written.
pub trait ArtifactStore: Send + Sync {
    /// Returns `true` if a complete entry exists for `fingerprint`.
    fn has(&self, fingerprint: &ContentHash) -> Result<bool, CacheError>;

    /// Loads the entry for `fingerprint`.
    fn load(&self, fingerprint: &ContentHash) -> Result<StoredArtifact, CacheError>;

    /// Stores an entry. Saving an existing fingerprint again is a no-op.
    fn save(
        &self,
        fingerprint: &ContentHash,
        meta: &ArtifactMeta,
        payload: &Payload,
    ) -> Result<(), CacheError>;

    /// Removes the entry for `fingerprint`. Returns `true` if anything was
    /// removed. Metadata goes first so a half-removed entry is never visible.
    fn remove(&self, fingerprint: &ContentHash) -> Result<bool, CacheError>;

    /// Removes every entry whose fingerprint is not in `live`. Returns the
    /// number of entries removed.
    fn gc(&self, live: &HashSet<ContentHash>) -> Result<usize, CacheError>;

    /// Removes every entry. Returns the number of entries removed.
    fn purge(&self) -> Result<usize, CacheError> {
        self.gc(&HashSet::new())
    }
}

/// Fails with [`CacheError::Inconsistent`] unless `meta` describes `fingerprint`.
pub(crate) fn check_meta(fingerprint: &ContentHash, meta: &ArtifactMeta) -> Result<(), CacheError> {
    if meta.fingerprint != *fingerprint {
        return Err(CacheError::Inconsistent {
            fingerprint: *fingerprint,
            reason: format!("metadata describes {}", meta.fingerprint),
        });
    }
    Ok(())
}

/// Fails with [`CacheError::Inconsistent`] unless the payload shape matches
/// what the metadata declares.
pub(crate) fn check_kind(meta: &ArtifactMeta, payload: &Payload) -> Result<(), CacheError> {
    if meta.payload_kind != payload.kind() {
        return Err(CacheError::Inconsistent {
            fingerprint: meta.fingerprint,
            reason: format!(
                "metadata declares {:?} payload, got {:?}",
                meta.payload_kind,
                payload.kind()
            ),
        });
    }
    Ok(())
}
