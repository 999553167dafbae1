//! Content-addressed artifact storage and the run ledger.
//!
//! Every build step is identified by a fingerprint computed with
//! [`Fingerprinter`]. An [`ArtifactStore`] maps fingerprints to
//! `(metadata, payload)` pairs and a [`RunDatabase`] records which
//! fingerprints each batch produced, so that an unchanged step is loaded
//! instead of rebuilt.

#![warn(missing_docs)]

pub mod error;
pub mod fs_store;
pub mod hasher;
pub mod kv_store;
pub mod ledger;
pub mod metadata;
pub mod payload;
pub mod sections;
pub mod store;

pub use error::CacheError;
pub use fs_store::FsStore;
pub use hasher::{hash_file, Fingerprinter, SourceStat};
pub use kv_store::{DirKv, HttpKv, KvBackend, KvStore, MemoryKv};
pub use ledger::{BuildStatus, JsonlRunDb, MemoryRunDb, RunDatabase, RunRecord};
pub use metadata::ArtifactMeta;
pub use payload::{Payload, PayloadKind, Section};
pub use sections::{decode_sections, encode_sections, MAX_SECTIONS};
pub use store::{ArtifactStore, StoredArtifact};
