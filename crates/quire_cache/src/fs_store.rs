//! Filesystem artifact store.
//!
//! Each artifact is a pair of files in a two-character fanout directory:
//! `<dir>/<fp[0..2]>/<fp>.payload` and `<dir>/<fp[0..2]>/<fp>.meta.json`.
//! The payload file carries a binary header with magic bytes, format version,
//! and a checksum so that a truncated or foreign file is detected on load.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use quire_common::{ContentHash, ENGINE_VERSION};
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::metadata::ArtifactMeta;
use crate::payload::Payload;
use crate::store::{check_kind, check_meta, ArtifactStore, StoredArtifact};

/// Magic bytes identifying a Quire payload file.
const ARTIFACT_MAGIC: [u8; 4] = *b"QUIR";

/// Current payload file format version. Increment on breaking changes to
/// the header or payload format.
const ARTIFACT_FORMAT_VERSION: u32 = 1;

const PAYLOAD_SUFFIX: &str = ".payload";
const META_SUFFIX: &str = ".meta.json";

/// Header prepended to every payload file for validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactHeader {
    /// Magic bytes: must be `b"QUIR"`.
    pub magic: [u8; 4],

    /// Payload file format version.
    pub format_version: u32,

    /// Engine version that produced this artifact.
    pub engine_version: String,

    /// Content hash of the payload bytes.
    pub checksum: ContentHash,
}

/// Content-addressed store on the local filesystem.
pub struct FsStore {
    dir: PathBuf,
    tmp_counter: AtomicU64,
}

impl FsStore {
    /// Creates a store rooted at `dir`. The directory is created lazily.
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            tmp_counter: AtomicU64::new(0),
        }
    }

    /// Returns the store's root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_dir(&self, fingerprint: &ContentHash) -> PathBuf {
        let hex = fingerprint.to_string();
        self.dir.join(&hex[..2])
    }

    /// Returns the payload file path for a fingerprint.
    pub fn payload_path(&self, fingerprint: &ContentHash) -> PathBuf {
        self.entry_dir(fingerprint)
            .join(format!("{fingerprint}{PAYLOAD_SUFFIX}"))
    }

    /// Returns the metadata file path for a fingerprint.
    pub fn meta_path(&self, fingerprint: &ContentHash) -> PathBuf {
        self.entry_dir(fingerprint)
            .join(format!("{fingerprint}{META_SUFFIX}"))
    }

    /// Writes `data` to a unique temporary file next to `path`, then renames
    /// it into place. Concurrent writers of the same path each rename their
    /// own complete file, so readers never observe a partial write.
    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), CacheError> {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let file_name = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!("{file_name}.tmp-{}-{n}", std::process::id()));
        std::fs::write(&tmp, data).map_err(|e| CacheError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            CacheError::io(path, e)
        })
    }

    fn encode_payload_file(payload: &Payload) -> Result<Vec<u8>, CacheError> {
        let data = payload.encode()?;
        let header = ArtifactHeader {
            magic: ARTIFACT_MAGIC,
            format_version: ARTIFACT_FORMAT_VERSION,
            engine_version: ENGINE_VERSION.to_string(),
            checksum: ContentHash::from_bytes(&data),
        };
        let header_bytes = bincode::serde::encode_to_vec(&header, bincode::config::standard())
            .map_err(|e| CacheError::Serialization {
                reason: e.to_string(),
            })?;

        // 4-byte header length (little-endian) + header + payload
        let header_len = header_bytes.len() as u32;
        let mut output = Vec::with_capacity(4 + header_bytes.len() + data.len());
        output.extend_from_slice(&header_len.to_le_bytes());
        output.extend_from_slice(&header_bytes);
        output.extend_from_slice(&data);
        Ok(output)
    }

    fn read_payload_file(path: &Path) -> Result<Vec<u8>, CacheError> {
        let raw = std::fs::read(path).map_err(|e| CacheError::io(path, e))?;
        let invalid = |reason: &str| CacheError::InvalidHeader {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        if raw.len() < 4 {
            return Err(invalid("file shorter than header length"));
        }
        let header_len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
        if raw.len() < 4 + header_len {
            return Err(invalid("truncated header"));
        }

        let (header, _): (ArtifactHeader, usize) =
            bincode::serde::decode_from_slice(&raw[4..4 + header_len], bincode::config::standard())
                .map_err(|e| invalid(&e.to_string()))?;

        if header.magic != ARTIFACT_MAGIC {
            return Err(invalid("bad magic bytes"));
        }
        if header.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(CacheError::VersionMismatch {
                path: path.to_path_buf(),
                expected: ARTIFACT_FORMAT_VERSION,
                actual: header.format_version,
            });
        }

        let payload = &raw[4 + header_len..];
        let actual = ContentHash::from_bytes(payload);
        if actual != header.checksum {
            return Err(CacheError::ChecksumMismatch {
                path: path.to_path_buf(),
                expected: header.checksum.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(payload.to_vec())
    }

    fn fanout_dirs(&self) -> Result<Vec<PathBuf>, CacheError> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&self.dir).map_err(|e| CacheError::io(&self.dir, e))?;
        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CacheError::io(&self.dir, e))?;
            if entry.path().is_dir() {
                dirs.push(entry.path());
            }
        }
        Ok(dirs)
    }
}

impl ArtifactStore for FsStore {
    fn has(&self, fingerprint: &ContentHash) -> Result<bool, CacheError> {
        let meta = self.meta_path(fingerprint).is_file();
        let payload = self.payload_path(fingerprint).is_file();
        if meta && !payload {
            return Err(CacheError::Inconsistent {
                fingerprint: *fingerprint,
                reason: "metadata without payload".to_string(),
            });
        }
        // Payload without metadata is a save in progress.
        Ok(meta && payload)
    }

    fn load(&self, fingerprint: &ContentHash) -> Result<StoredArtifact, CacheError> {
        let meta_path = self.meta_path(fingerprint);
        if !meta_path.is_file() {
            return Err(CacheError::NotFound {
                fingerprint: *fingerprint,
            });
        }
        let text = std::fs::read_to_string(&meta_path).map_err(|e| CacheError::io(&meta_path, e))?;
        let meta: ArtifactMeta =
            serde_json::from_str(&text).map_err(|e| CacheError::Serialization {
                reason: format!("{}: {e}", meta_path.display()),
            })?;
        check_meta(fingerprint, &meta)?;

        let bytes = Self::read_payload_file(&self.payload_path(fingerprint))?;
        let payload = Payload::decode(meta.payload_kind, bytes)?;
        Ok(StoredArtifact { meta, payload })
    }

    fn save(
        &self,
        fingerprint: &ContentHash,
        meta: &ArtifactMeta,
        payload: &Payload,
    ) -> Result<(), CacheError> {
        check_meta(fingerprint, meta)?;
        check_kind(meta, payload)?;
        if self.has(fingerprint).unwrap_or(false) {
            return Ok(());
        }

        let entry_dir = self.entry_dir(fingerprint);
        std::fs::create_dir_all(&entry_dir).map_err(|e| CacheError::io(&entry_dir, e))?;

        // Payload first: metadata is what makes the entry visible.
        let payload_bytes = Self::encode_payload_file(payload)?;
        self.write_atomic(&self.payload_path(fingerprint), &payload_bytes)?;

        let meta_json =
            serde_json::to_vec_pretty(meta).map_err(|e| CacheError::Serialization {
                reason: e.to_string(),
            })?;
        self.write_atomic(&self.meta_path(fingerprint), &meta_json)?;

        tracing::trace!(fingerprint = %fingerprint, "saved artifact");
        Ok(())
    }

    fn remove(&self, fingerprint: &ContentHash) -> Result<bool, CacheError> {
        let mut removed = false;
        for path in [self.meta_path(fingerprint), self.payload_path(fingerprint)] {
            match std::fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::io(&path, e)),
            }
        }
        Ok(removed)
    }

    fn gc(&self, live: &HashSet<ContentHash>) -> Result<usize, CacheError> {
        let mut removed = 0;
        for dir in self.fanout_dirs()? {
            let entries = std::fs::read_dir(&dir).map_err(|e| CacheError::io(&dir, e))?;
            for entry in entries {
                let entry = entry.map_err(|e| CacheError::io(&dir, e))?;
                let path = entry.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let stem = name.split('.').next().unwrap_or_default();
                let keep = ContentHash::from_hex(stem)
                    .map(|fp| live.contains(&fp))
                    .unwrap_or(false);
                if keep {
                    continue;
                }
                if name.ends_with(META_SUFFIX) {
                    removed += 1;
                }
                std::fs::remove_file(&path).map_err(|e| CacheError::io(&path, e))?;
            }
            // Ignore failure: the directory still holds live entries.
            let _ = std::fs::remove_dir(&dir);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{PayloadKind, Section};

    fn make_store() -> (tempfile::TempDir, FsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(&dir.path().join("artifacts"));
        (dir, store)
    }

    fn meta_for(seed: &str, payload: &Payload) -> ArtifactMeta {
        ArtifactMeta {
            fingerprint: ContentHash::from_bytes(seed.as_bytes()),
            document_key: "hello.txt|dexy".into(),
            artifact_key: "hello.txt|dexy".into(),
            filter_alias: Some("dexy".into()),
            filter_version: Some("1".into()),
            input_fingerprints: Vec::new(),
            ext: ".txt".into(),
            payload_kind: payload.kind(),
            engine_version: ENGINE_VERSION.into(),
        }
    }

    fn save(store: &FsStore, seed: &str, payload: &Payload) -> ContentHash {
        let meta = meta_for(seed, payload);
        store.save(&meta.fingerprint, &meta, payload).unwrap();
        meta.fingerprint
    }

    #[test]
    fn save_and_load_roundtrip() {
        let (_dir, store) = make_store();
        for (seed, payload) in [
            ("text", Payload::Text("hi".into())),
            ("bytes", Payload::Bytes(vec![0, 159, 146, 150])),
            (
                "sections",
                Payload::Sections(vec![Section::new("b", "2"), Section::new("a", "1")]),
            ),
        ] {
            let fp = save(&store, seed, &payload);
            assert!(store.has(&fp).unwrap());
            let loaded = store.load(&fp).unwrap();
            assert_eq!(loaded.payload, payload);
            assert_eq!(loaded.meta.fingerprint, fp);
        }
    }

    #[test]
    fn missing_entry() {
        let (_dir, store) = make_store();
        let fp = ContentHash::from_bytes(b"nothing");
        assert!(!store.has(&fp).unwrap());
        assert!(matches!(
            store.load(&fp).unwrap_err(),
            CacheError::NotFound { .. }
        ));
    }

    #[test]
    fn fanout_layout() {
        let (_dir, store) = make_store();
        let fp = ContentHash::from_bytes(b"layout");
        let hex = fp.to_string();
        let path = store.payload_path(&fp);
        assert!(path.ends_with(format!("{}/{hex}.payload", &hex[..2])));
    }

    #[test]
    fn save_is_idempotent() {
        let (_dir, store) = make_store();
        let payload = Payload::Text("same".into());
        let fp = save(&store, "idem", &payload);
        let first = std::fs::read(store.payload_path(&fp)).unwrap();
        save(&store, "idem", &payload);
        assert_eq!(std::fs::read(store.payload_path(&fp)).unwrap(), first);
        assert_eq!(store.load(&fp).unwrap().payload, payload);
    }

    #[test]
    fn concurrent_saves_of_one_fingerprint() {
        let (_dir, store) = make_store();
        let payload = Payload::Text("racy".into());
        let meta = meta_for("race", &payload);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| store.save(&meta.fingerprint, &meta, &payload).unwrap());
            }
        });
        assert_eq!(store.load(&meta.fingerprint).unwrap().payload, payload);
        let leftovers = std::fs::read_dir(store.payload_path(&meta.fingerprint).parent().unwrap())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .contains(".tmp-")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn tampered_payload_is_detected() {
        let (_dir, store) = make_store();
        let fp = save(&store, "tamper", &Payload::Text("original".into()));
        let path = store.payload_path(&fp);
        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        std::fs::write(&path, raw).unwrap();
        assert!(matches!(
            store.load(&fp).unwrap_err(),
            CacheError::ChecksumMismatch { .. }
        ));
    }

    #[test]
    fn garbage_payload_is_invalid_header() {
        let (_dir, store) = make_store();
        let fp = save(&store, "garbage", &Payload::Text("x".into()));
        std::fs::write(store.payload_path(&fp), b"AB").unwrap();
        assert!(matches!(
            store.load(&fp).unwrap_err(),
            CacheError::InvalidHeader { .. }
        ));
    }

    #[test]
    fn wrong_magic_is_invalid_header() {
        let (_dir, store) = make_store();
        let fp = save(&store, "magic", &Payload::Text("data".into()));
        let header = ArtifactHeader {
            magic: *b"BAAD",
            format_version: ARTIFACT_FORMAT_VERSION,
            engine_version: ENGINE_VERSION.to_string(),
            checksum: ContentHash::from_bytes(b"data"),
        };
        let header_bytes =
            bincode::serde::encode_to_vec(&header, bincode::config::standard()).unwrap();
        let mut output = Vec::new();
        output.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
        output.extend_from_slice(&header_bytes);
        output.extend_from_slice(b"data");
        std::fs::write(store.payload_path(&fp), output).unwrap();
        assert!(matches!(
            store.load(&fp).unwrap_err(),
            CacheError::InvalidHeader { .. }
        ));
    }

    #[test]
    fn wrong_version_is_reported() {
        let (_dir, store) = make_store();
        let fp = save(&store, "version", &Payload::Text("data".into()));
        let header = ArtifactHeader {
            magic: ARTIFACT_MAGIC,
            format_version: 999,
            engine_version: ENGINE_VERSION.to_string(),
            checksum: ContentHash::from_bytes(b"data"),
        };
        let header_bytes =
            bincode::serde::encode_to_vec(&header, bincode::config::standard()).unwrap();
        let mut output = Vec::new();
        output.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
        output.extend_from_slice(&header_bytes);
        output.extend_from_slice(b"data");
        std::fs::write(store.payload_path(&fp), output).unwrap();
        assert!(matches!(
            store.load(&fp).unwrap_err(),
            CacheError::VersionMismatch { actual: 999, .. }
        ));
    }

    #[test]
    fn metadata_without_payload_is_inconsistent() {
        let (_dir, store) = make_store();
        let fp = save(&store, "half", &Payload::Text("x".into()));
        std::fs::remove_file(store.payload_path(&fp)).unwrap();
        assert!(matches!(
            store.has(&fp).unwrap_err(),
            CacheError::Inconsistent { .. }
        ));
    }

    #[test]
    fn mismatched_metadata_is_rejected() {
        let (_dir, store) = make_store();
        let payload = Payload::Text("x".into());
        let meta = meta_for("one", &payload);
        let other = ContentHash::from_bytes(b"two");
        assert!(matches!(
            store.save(&other, &meta, &payload).unwrap_err(),
            CacheError::Inconsistent { .. }
        ));
        let mut wrong_kind = meta.clone();
        wrong_kind.payload_kind = PayloadKind::Bytes;
        assert!(store
            .save(&meta.fingerprint, &wrong_kind, &payload)
            .is_err());
    }

    #[test]
    fn remove_single_entry() {
        let (_dir, store) = make_store();
        let fp = save(&store, "a", &Payload::Text("a".into()));
        assert!(store.remove(&fp).unwrap());
        assert!(!store.has(&fp).unwrap());
        assert!(!store.remove(&fp).unwrap());
    }

    #[test]
    fn gc_removes_unreferenced() {
        let (_dir, store) = make_store();
        let keep = save(&store, "keep", &Payload::Text("a".into()));
        let drop = save(&store, "drop", &Payload::Text("b".into()));
        let live: HashSet<_> = [keep].into_iter().collect();
        assert_eq!(store.gc(&live).unwrap(), 1);
        assert!(store.has(&keep).unwrap());
        assert!(!store.has(&drop).unwrap());
    }

    #[test]
    fn purge_removes_everything() {
        let (_dir, store) = make_store();
        let a = save(&store, "a", &Payload::Text("a".into()));
        save(&store, "b", &Payload::Text("b".into()));
        assert_eq!(store.purge().unwrap(), 2);
        assert!(!store.has(&a).unwrap());
    }

    #[test]
    fn gc_on_missing_dir_is_zero() {
        let (_dir, store) = make_store();
        assert_eq!(store.gc(&HashSet::new()).unwrap(), 0);
    }
}
