//! Artifact store over a generic key-value backend.
//!
//! The payload lives under the fingerprint's hex key and the metadata under
//! `<fp>-meta`. Backends only need byte-level `get`/`put`; section ordering
//! is carried by the index-prefixed encoding in [`crate::sections`].
//!
//! Three backends ship: [`MemoryKv`] in process memory, [`DirKv`] as a flat
//! directory, and [`HttpKv`] talking to a remote server with the
//! `/buckets/<bucket>/keys/<key>` HTTP layout.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use quire_common::ContentHash;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::CacheError;
use crate::metadata::ArtifactMeta;
use crate::payload::Payload;
use crate::store::{check_kind, check_meta, ArtifactStore, StoredArtifact};

const META_KEY_SUFFIX: &str = "-meta";

/// Byte-oriented key-value storage.
pub trait KvBackend: Send + Sync {
    /// Returns the value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Stores `value` under `key`, replacing any previous value atomically.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), CacheError>;

    /// Returns `true` if `key` is present.
    fn contains(&self, key: &str) -> Result<bool, CacheError>;

    /// Removes `key`. Returns `true` if it was present.
    fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Lists every key.
    fn keys(&self) -> Result<Vec<String>, CacheError>;
}

/// In-process backend. Contents are lost when the value is dropped.
#[derive(Default)]
pub struct MemoryKv {
    map: DashMap<String, Vec<u8>>,
}

impl MemoryKv {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvBackend for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.map.get(key).map(|v| v.value().clone()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        self.map.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn contains(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.map.contains_key(key))
    }

    fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.map.remove(key).is_some())
    }

    fn keys(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.map.iter().map(|e| e.key().clone()).collect())
    }
}

/// Backend storing one file per key in a flat directory.
pub struct DirKv {
    dir: PathBuf,
    tmp_counter: AtomicU64,
}

impl DirKv {
    /// Creates a backend rooted at `dir`. The directory is created lazily.
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            tmp_counter: AtomicU64::new(0),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, CacheError> {
        check_key(key)?;
        Ok(self.dir.join(key))
    }
}

/// Keys are fingerprints and their meta suffix: ASCII letters, digits and `-`.
fn check_key(key: &str) -> Result<(), CacheError> {
    if key.is_empty() || !key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
        return Err(CacheError::Serialization {
            reason: format!("unsupported key '{key}'"),
        });
    }
    Ok(())
}

impl KvBackend for DirKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::io(path, e)),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        let path = self.path_for(key)?;
        std::fs::create_dir_all(&self.dir).map_err(|e| CacheError::io(&self.dir, e))?;
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp = self
            .dir
            .join(format!(".{key}.tmp-{}-{n}", std::process::id()));
        std::fs::write(&tmp, value).map_err(|e| CacheError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            CacheError::io(&path, e)
        })
    }

    fn contains(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.path_for(key)?.is_file())
    }

    fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::io(path, e)),
        }
    }

    fn keys(&self) -> Result<Vec<String>, CacheError> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&self.dir).map_err(|e| CacheError::io(&self.dir, e))?;
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CacheError::io(&self.dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                keys.push(name);
            }
        }
        Ok(keys)
    }
}

/// Body of a key listing.
#[derive(Deserialize)]
struct KeyList {
    keys: Vec<String>,
}

/// Backend on a remote key-value server.
///
/// Objects live at `<base>/buckets/<bucket>/keys/<key>`: `GET` reads, `PUT`
/// writes, `HEAD` tests presence and `DELETE` removes. A `404` means the key
/// is absent. `GET <base>/buckets/<bucket>/keys?keys=true` lists keys as
/// `{"keys": [...]}`.
pub struct HttpKv {
    keys_url: String,
    client: Client,
}

impl HttpKv {
    /// Creates a backend for `bucket` on the server at `base_url`. No request
    /// is made until the first operation.
    pub fn new(base_url: &str, bucket: &str) -> Result<Self, CacheError> {
        check_key(bucket)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CacheError::Remote {
                url: base_url.to_string(),
                reason: format!("cannot create HTTP client: {e}"),
            })?;
        Ok(Self {
            keys_url: format!("{}/buckets/{bucket}/keys", base_url.trim_end_matches('/')),
            client,
        })
    }

    fn url_for(&self, key: &str) -> Result<String, CacheError> {
        check_key(key)?;
        Ok(format!("{}/{key}", self.keys_url))
    }

    /// Sends `request`, passing through success and `404`.
    fn send(&self, url: &str, request: RequestBuilder) -> Result<Response, CacheError> {
        let response = request.send().map_err(|e| CacheError::Remote {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(response)
        } else {
            Err(CacheError::Remote {
                url: url.to_string(),
                reason: format!("server returned {status}"),
            })
        }
    }

    fn body(url: &str, response: Response) -> Result<Vec<u8>, CacheError> {
        response
            .bytes()
            .map(|b| b.to_vec())
            .map_err(|e| CacheError::Remote {
                url: url.to_string(),
                reason: e.to_string(),
            })
    }
}

impl KvBackend for HttpKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let url = self.url_for(key)?;
        let response = self.send(&url, self.client.get(&url))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::body(&url, response).map(Some)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        let url = self.url_for(key)?;
        let request = self
            .client
            .put(&url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(value.to_vec());
        let response = self.send(&url, request)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(CacheError::Remote {
                url,
                reason: format!("server returned {}", StatusCode::NOT_FOUND),
            });
        }
        tracing::trace!(key, bytes = value.len(), "stored remote key");
        Ok(())
    }

    fn contains(&self, key: &str) -> Result<bool, CacheError> {
        let url = self.url_for(key)?;
        let response = self.send(&url, self.client.head(&url))?;
        Ok(response.status() != StatusCode::NOT_FOUND)
    }

    fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let url = self.url_for(key)?;
        let response = self.send(&url, self.client.delete(&url))?;
        Ok(response.status() != StatusCode::NOT_FOUND)
    }

    fn keys(&self) -> Result<Vec<String>, CacheError> {
        let url = format!("{}?keys=true", self.keys_url);
        let response = self.send(&url, self.client.get(&url))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let bytes = Self::body(&url, response)?;
        let list: KeyList = serde_json::from_slice(&bytes).map_err(|e| CacheError::Serialization {
            reason: format!("key listing from {url}: {e}"),
        })?;
        Ok(list.keys)
    }
}

/// [`ArtifactStore`] over any [`KvBackend`].
pub struct KvStore<B: KvBackend> {
    backend: B,
}

impl<B: KvBackend> KvStore<B> {
    /// Wraps a backend.
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Returns the wrapped backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn meta_key(fingerprint: &ContentHash) -> String {
        format!("{fingerprint}{META_KEY_SUFFIX}")
    }
}

impl<B: KvBackend> ArtifactStore for KvStore<B> {
    fn has(&self, fingerprint: &ContentHash) -> Result<bool, CacheError> {
        let payload = self.backend.contains(&fingerprint.to_string())?;
        let meta = self.backend.contains(&Self::meta_key(fingerprint))?;
        if meta && !payload {
            return Err(CacheError::Inconsistent {
                fingerprint: *fingerprint,
                reason: "metadata without payload".to_string(),
            });
        }
        Ok(meta && payload)
    }

    fn load(&self, fingerprint: &ContentHash) -> Result<StoredArtifact, CacheError> {
        let meta_bytes = self
            .backend
            .get(&Self::meta_key(fingerprint))?
            .ok_or(CacheError::NotFound {
                fingerprint: *fingerprint,
            })?;
        let meta: ArtifactMeta =
            serde_json::from_slice(&meta_bytes).map_err(|e| CacheError::Serialization {
                reason: e.to_string(),
            })?;
        check_meta(fingerprint, &meta)?;

        let bytes = self
            .backend
            .get(&fingerprint.to_string())?
            .ok_or_else(|| CacheError::Inconsistent {
                fingerprint: *fingerprint,
                reason: "metadata without payload".to_string(),
            })?;
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
        self.backend.put(&fingerprint.to_string(), &payload.encode()?)?;
        let meta_json = serde_json::to_vec(meta).map_err(|e| CacheError::Serialization {
            reason: e.to_string(),
        })?;
        self.backend.put(&Self::meta_key(fingerprint), &meta_json)
    }

    fn remove(&self, fingerprint: &ContentHash) -> Result<bool, CacheError> {
        let meta = self.backend.delete(&Self::meta_key(fingerprint))?;
        let payload = self.backend.delete(&fingerprint.to_string())?;
        Ok(meta || payload)
    }

    fn gc(&self, live: &HashSet<ContentHash>) -> Result<usize, CacheError> {
        let mut removed = 0;
        for key in self.backend.keys()? {
            let (hex, is_meta) = match key.strip_suffix(META_KEY_SUFFIX) {
                Some(hex) => (hex, true),
                None => (key.as_str(), false),
            };
            let live_entry = ContentHash::from_hex(hex)
                .map(|fp| live.contains(&fp))
                .unwrap_or(false);
            if !live_entry && self.backend.delete(&key)? && is_meta {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
