//! Metadata persisted alongside every artifact payload.

use quire_common::ContentHash;
use serde::{Deserialize, Serialize};

use crate::payload::PayloadKind;

/// Description of a stored build step.
///
/// Everything needed to reconstruct an artifact without re-running its
/// filter. Only `fingerprint` is used for lookups; the other fields are for
/// consistency checks and reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    /// The step's fingerprint.
    pub fingerprint: ContentHash,
    /// Key of the owning document (`name|filter1|filter2`).
    pub document_key: String,
    /// Key of the step (document name plus the filters applied so far).
    pub artifact_key: String,
    /// Alias of the filter that produced the payload; `None` for the source step.
    pub filter_alias: Option<String>,
    /// Version identifier of that filter.
    pub filter_version: Option<String>,
    /// Fingerprints this step consumed, in order.
    pub input_fingerprints: Vec<ContentHash>,
    /// Output extension, including the leading dot.
    pub ext: String,
    /// Shape of the stored payload.
    pub payload_kind: PayloadKind,
    /// Engine version that wrote the artifact.
    pub engine_version: String,
}
