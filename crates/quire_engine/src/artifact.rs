//! The result of one build step.

use quire_cache::{ArtifactMeta, BuildStatus, Payload, PayloadKind, StoredArtifact};
use quire_common::{ContentHash, ENGINE_VERSION};

/// One step of a document's chain: the raw source or a filter's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Key of the owning document.
    pub document_key: String,
    /// Document name plus the filters applied so far.
    pub key: String,
    /// Cache key.
    pub fingerprint: ContentHash,
    /// Filter that produced the payload; `None` for the source step.
    pub filter_alias: Option<String>,
    /// Version of that filter.
    pub filter_version: Option<String>,
    /// Fingerprints the step consumed, in order.
    pub input_fingerprints: Vec<ContentHash>,
    /// Output extension, including the leading dot.
    pub ext: String,
    /// Output content.
    pub payload: Payload,
    /// Whether the payload was loaded or produced in this batch.
    pub status: BuildStatus,
}

impl Artifact {
    /// Metadata to persist alongside the payload.
    pub fn meta(&self) -> ArtifactMeta {
        ArtifactMeta {
            fingerprint: self.fingerprint,
            document_key: self.document_key.clone(),
            artifact_key: self.key.clone(),
            filter_alias: self.filter_alias.clone(),
            filter_version: self.filter_version.clone(),
            input_fingerprints: self.input_fingerprints.clone(),
            ext: self.ext.clone(),
            payload_kind: self.payload.kind(),
            engine_version: ENGINE_VERSION.to_string(),
        }
    }

    /// Rebuilds an artifact from a store entry.
    pub fn from_stored(stored: StoredArtifact) -> Self {
        let StoredArtifact { meta, payload } = stored;
        Self {
            document_key: meta.document_key,
            key: meta.artifact_key,
            fingerprint: meta.fingerprint,
            filter_alias: meta.filter_alias,
            filter_version: meta.filter_version,
            input_fingerprints: meta.input_fingerprints,
            ext: meta.ext,
            payload,
            status: BuildStatus::Cached,
        }
    }

    /// Shape of the payload.
    pub fn kind(&self) -> PayloadKind {
        self.payload.kind()
    }
}
