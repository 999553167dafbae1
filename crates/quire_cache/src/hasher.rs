//! Fingerprint computation and source file change detection.
//!
//! A fingerprint is a hash over a named bag of attributes. Attributes are
//! sorted by name and length-prefixed before hashing, so the result does not
//! depend on insertion order and no two distinct bags collide by
//! concatenation.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::Path;

use quire_common::{ContentHash, InternalError, QuireResult};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

use crate::error::CacheError;

/// Builder for a fingerprint over named attributes.
#[derive(Debug, Clone, Default)]
pub struct Fingerprinter {
    attrs: BTreeMap<String, String>,
}

impl Fingerprinter {
    /// Creates an empty fingerprint builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an attribute. Setting the same name twice keeps the last value.
    pub fn attr(mut self, name: &str, value: impl Display) -> Self {
        self.attrs.insert(name.to_string(), value.to_string());
        self
    }

    /// Sets an attribute to the canonical JSON text of `value`.
    pub fn attr_json(self, name: &str, value: &serde_json::Value) -> Self {
        // serde_json maps are sorted, so the text is canonical.
        let text = value.to_string();
        self.attr(name, text)
    }

    /// Sets an attribute to an ordered list of hashes.
    pub fn attr_hashes(self, name: &str, hashes: &[ContentHash]) -> Self {
        let joined = hashes
            .iter()
            .map(ContentHash::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.attr(name, joined)
    }

    /// Returns `true` if the attribute has been set.
    pub fn has(&self, name: &str) -> bool {
        self.attrs.contains_key(name)
    }

    /// Computes the fingerprint over every attribute set so far.
    pub fn finish(&self) -> ContentHash {
        let mut hasher = Xxh3::new();
        for (name, value) in &self.attrs {
            hasher.update(&(name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            hasher.update(&(value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        }
        ContentHash::from_u128(hasher.digest128())
    }

    /// Like [`finish`](Self::finish), but fails if any of `required` is missing.
    pub fn finish_checked(&self, required: &[&str]) -> QuireResult<ContentHash> {
        if let Some(missing) = required.iter().find(|name| !self.has(name)) {
            return Err(InternalError::new(format!(
                "fingerprint attribute '{missing}' was never set"
            )));
        }
        Ok(self.finish())
    }
}

/// Computes the content hash of a single file.
pub fn hash_file(path: &Path) -> Result<ContentHash, CacheError> {
    let content = std::fs::read(path).map_err(|e| CacheError::io(path, e))?;
    Ok(ContentHash::from_bytes(&content))
}

/// File system identity of a source file, used to skip re-reading files that
/// have not been touched since the previous run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceStat {
    /// Inode change time, seconds since the epoch.
    pub ctime: i64,
    /// Modification time, nanoseconds since the epoch.
    pub mtime: i64,
    /// Inode number (0 where the platform has none).
    pub inode: u64,
}

impl SourceStat {
    /// Reads the stat of `path`.
    #[cfg(unix)]
    pub fn of(path: &Path) -> Result<Self, CacheError> {
        use std::os::unix::fs::MetadataExt;

        let meta = std::fs::metadata(path).map_err(|e| CacheError::io(path, e))?;
        Ok(Self {
            ctime: meta.ctime(),
            mtime: meta.mtime() * 1_000_000_000 + meta.mtime_nsec(),
            inode: meta.ino(),
        })
    }

    /// Reads the stat of `path`.
    #[cfg(not(unix))]
    pub fn of(path: &Path) -> Result<Self, CacheError> {
        let meta = std::fs::metadata(path).map_err(|e| CacheError::io(path, e))?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or_default();
        Ok(Self {
            ctime: 0,
            mtime,
            inode: 0,
        })
    }
}
