//! Reading the raw content a document chain starts from.
//!
//! Local files are read as bytes (text when valid UTF-8), literal contents
//! come straight from the config entry, and URLs are fetched over HTTP with
//! a local copy kept under `<workdir>/remote`. The local copy is revalidated
//! with `ETag` / `Last-Modified` and used as a fallback when the network is
//! unavailable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use quire_cache::{Payload, SourceStat};
use quire_common::ContentHash;
use quire_graph::SourceSpec;
use reqwest::blocking::Client;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Raw content of a document plus what the cache needs to know about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedSource {
    /// The content.
    pub payload: Payload,
    /// Hash of the raw bytes.
    pub hash: ContentHash,
}

/// Validators saved next to a fetched file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RemoteHeaders {
    url: String,
    etag: Option<String>,
    last_modified: Option<String>,
}

/// Loads document sources for one run, reading each file or URL at most once.
pub struct SourceLoader {
    remote_dir: PathBuf,
    use_local_files: bool,
    client: OnceLock<Client>,
    memo: Mutex<HashMap<String, Arc<LoadedSource>>>,
}

impl SourceLoader {
    /// Creates a loader keeping fetched files under `remote_dir`.
    pub fn new(remote_dir: PathBuf, use_local_files: bool) -> Self {
        Self {
            remote_dir,
            use_local_files,
            client: OnceLock::new(),
            memo: Mutex::new(HashMap::new()),
        }
    }

    /// Stat of the file behind `source`, for local files only.
    pub fn stat(&self, source: &SourceSpec) -> Option<SourceStat> {
        match source {
            SourceSpec::File(path) => SourceStat::of(path).ok(),
            _ => None,
        }
    }

    /// Loads the content of `source` for the document `document_key`,
    /// whose name is `name`.
    pub fn load(
        &self,
        document_key: &str,
        name: &str,
        source: &SourceSpec,
    ) -> Result<Arc<LoadedSource>, EngineError> {
        let memo_key = match source {
            SourceSpec::Literal(contents) => {
                return Ok(Arc::new(loaded(contents.as_bytes().to_vec())));
            }
            SourceSpec::File(path) => format!("file:{}", path.display()),
            SourceSpec::Url(url) => format!("url:{url}"),
        };
        if let Some(hit) = self.memo.lock().unwrap_or_else(PoisonError::into_inner).get(&memo_key) {
            return Ok(Arc::clone(hit));
        }

        let bytes = match source {
            SourceSpec::File(path) => std::fs::read(path).map_err(|e| EngineError::Source {
                document: document_key.to_string(),
                path: path.clone(),
                source: e,
            })?,
            SourceSpec::Url(url) => self.fetch(name, url)?,
            SourceSpec::Literal(contents) => contents.as_bytes().to_vec(),
        };
        let source = Arc::new(loaded(bytes));
        self.memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(memo_key, Arc::clone(&source));
        Ok(source)
    }

    /// Path of the local copy of the remote document `name`.
    pub fn local_copy(&self, name: &str) -> PathBuf {
        self.remote_dir.join(name)
    }

    fn client(&self) -> Result<&Client, EngineError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| EngineError::Fetch {
                url: String::new(),
                reason: format!("cannot create HTTP client: {e}"),
            })?;
        Ok(self.client.get_or_init(|| client))
    }

    fn fetch(&self, name: &str, url: &str) -> Result<Vec<u8>, EngineError> {
        let local = self.local_copy(name);
        let headers_path = headers_path(&local);
        let have_local = local.is_file();

        if self.use_local_files && have_local {
            tracing::debug!(url, path = %local.display(), "using local copy");
            return read_local(url, &local);
        }
        if self.use_local_files {
            tracing::info!(url, "no local copy found, fetching");
        }

        let headers = if have_local {
            read_headers(&headers_path).filter(|h| h.url == url)
        } else {
            None
        };
        let mut request = self.client()?.get(url);
        if let Some(headers) = &headers {
            if let Some(etag) = &headers.etag {
                request = request.header(IF_NONE_MATCH, etag);
            }
            if let Some(modified) = &headers.last_modified {
                request = request.header(IF_MODIFIED_SINCE, modified);
            }
        }

        let response = match request.send() {
            Ok(response) => response,
            Err(e) if have_local => {
                tracing::warn!(url, error = %e, path = %local.display(), "fetch failed, using stale local copy");
                return read_local(url, &local);
            }
            Err(e) => {
                return Err(EngineError::Fetch {
                    url: url.to_string(),
                    reason: format!("{e}; no local copy at {}", local.display()),
                })
            }
        };

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED && have_local {
            tracing::debug!(url, "not modified, using local copy");
            return read_local(url, &local);
        }
        if !status.is_success() {
            return Err(EngineError::Fetch {
                url: url.to_string(),
                reason: format!("server returned {status}"),
            });
        }

        let header_value = |name: reqwest::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let fresh = RemoteHeaders {
            url: url.to_string(),
            etag: header_value(ETAG),
            last_modified: header_value(LAST_MODIFIED),
        };
        let body = response.bytes().map_err(|e| EngineError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        tracing::info!(url, bytes = body.len(), "downloaded");

        save_local(url, &local, &body)?;
        if let Ok(json) = serde_json::to_vec_pretty(&fresh) {
            save_local(url, &headers_path, &json)?;
        }
        Ok(body.to_vec())
    }
}

fn loaded(bytes: Vec<u8>) -> LoadedSource {
    let hash = ContentHash::from_bytes(&bytes);
    LoadedSource {
        payload: Payload::from_source_bytes(bytes),
        hash,
    }
}

fn headers_path(local: &Path) -> PathBuf {
    let mut name = local.as_os_str().to_owned();
    name.push(".headers");
    PathBuf::from(name)
}

fn read_headers(path: &Path) -> Option<RemoteHeaders> {
    let text = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

fn read_local(url: &str, path: &Path) -> Result<Vec<u8>, EngineError> {
    std::fs::read(path).map_err(|e| EngineError::Fetch {
        url: url.to_string(),
        reason: format!("cannot read local copy {}: {e}", path.display()),
    })
}

fn save_local(url: &str, path: &Path, data: &[u8]) -> Result<(), EngineError> {
    let fail = |e: std::io::Error| EngineError::Fetch {
        url: url.to_string(),
        reason: format!("cannot save local copy {}: {e}", path.display()),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(fail)?;
    }
    std::fs::write(path, data).map_err(fail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread::JoinHandle;

    const MODIFIED: &str = "Wed, 21 Oct 2015 07:28:00 GMT";

    fn response(status: &str, headers: &[(&str, &str)], body: &str) -> String {
        let mut out = format!("HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n", body.len());
        for (name, value) in headers {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        out.push_str("\r\n");
        out.push_str(body);
        out
    }

    /// Answers one connection per canned response, in order. The handle
    /// yields each request head, lowercased.
    fn serve(responses: Vec<String>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = std::thread::spawn(move || {
            let mut heads = Vec::new();
            for canned in responses {
                let (mut stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut head = String::new();
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).unwrap() == 0 || line == "\r\n" {
                        break;
                    }
                    head.push_str(&line);
                }
                stream.write_all(canned.as_bytes()).unwrap();
                heads.push(head.to_ascii_lowercase());
            }
            heads
        });
        (base, handle)
    }

    fn write_copy(loader: &SourceLoader, name: &str, body: &str, headers: &RemoteHeaders) {
        let local = loader.local_copy(name);
        std::fs::create_dir_all(local.parent().unwrap()).unwrap();
        std::fs::write(&local, body).unwrap();
        std::fs::write(headers_path(&local), serde_json::to_vec(headers).unwrap()).unwrap();
    }

    #[test]
    fn literal_source() {
        let loader = SourceLoader::new(PathBuf::from("unused"), false);
        let src = loader
            .load("hello.txt|dexy", "hello.txt", &SourceSpec::Literal("hi".into()))
            .unwrap();
        assert_eq!(src.payload, Payload::Text("hi".into()));
        assert_eq!(src.hash, ContentHash::from_bytes(b"hi"));
    }

    #[test]
    fn file_source_is_memoized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "one").unwrap();
        let loader = SourceLoader::new(dir.path().join("remote"), false);
        let spec = SourceSpec::File(path.clone());

        let first = loader.load("a.txt", "a.txt", &spec).unwrap();
        std::fs::write(&path, "two").unwrap();
        let second = loader.load("a.txt|x", "a.txt", &spec).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.payload, Payload::Text("one".into()));
    }

    #[test]
    fn binary_file_stays_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.png");
        std::fs::write(&path, [0x89, 0x50, 0xff, 0x00]).unwrap();
        let loader = SourceLoader::new(dir.path().join("remote"), false);
        let src = loader.load("img.png", "img.png", &SourceSpec::File(path)).unwrap();
        assert_eq!(src.payload, Payload::Bytes(vec![0x89, 0x50, 0xff, 0x00]));
    }

    #[test]
    fn missing_file_names_document() {
        let dir = tempfile::tempdir().unwrap();
        let loader = SourceLoader::new(dir.path().join("remote"), false);
        let err = loader
            .load("gone.txt|dexy", "gone.txt", &SourceSpec::File(dir.path().join("gone.txt")))
            .unwrap_err();
        assert!(matches!(err, EngineError::Source { ref document, .. } if document == "gone.txt|dexy"));
    }

    #[test]
    fn stat_only_for_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "x").unwrap();
        let loader = SourceLoader::new(dir.path().join("remote"), false);
        assert!(loader.stat(&SourceSpec::File(path)).is_some());
        assert!(loader.stat(&SourceSpec::Literal("x".into())).is_none());
    }

    #[test]
    fn local_files_skip_the_network() {
        let dir = tempfile::tempdir().unwrap();
        let loader = SourceLoader::new(dir.path().join("remote"), true);
        let local = loader.local_copy("data/r.txt");
        std::fs::create_dir_all(local.parent().unwrap()).unwrap();
        std::fs::write(&local, "cached copy").unwrap();

        // The host does not resolve; only the local copy can satisfy this.
        let src = loader
            .load("data/r.txt", "data/r.txt", &SourceSpec::Url("http://quire.invalid/r.txt".into()))
            .unwrap();
        assert_eq!(src.payload, Payload::Text("cached copy".into()));
    }

    #[test]
    fn unreachable_url_falls_back_to_stale_copy() {
        let dir = tempfile::tempdir().unwrap();
        let loader = SourceLoader::new(dir.path().join("remote"), false);
        let local = loader.local_copy("r.txt");
        std::fs::create_dir_all(local.parent().unwrap()).unwrap();
        std::fs::write(&local, "stale").unwrap();

        let src = loader
            .load("r.txt", "r.txt", &SourceSpec::Url("http://quire.invalid/r.txt".into()))
            .unwrap();
        assert_eq!(src.payload, Payload::Text("stale".into()));
    }

    #[test]
    fn unreachable_url_without_copy_fails() {
        let dir = tempfile::tempdir().unwrap();
        let loader = SourceLoader::new(dir.path().join("remote"), false);
        let err = loader
            .load("r.txt", "r.txt", &SourceSpec::Url("http://quire.invalid/r.txt".into()))
            .unwrap_err();
        assert!(matches!(err, EngineError::Fetch { .. }));
    }

    #[test]
    fn headers_path_appends_suffix() {
        assert_eq!(
            headers_path(Path::new("/w/remote/a.txt")),
            PathBuf::from("/w/remote/a.txt.headers")
        );
    }

    #[test]
    fn fetch_saves_validators_and_revalidates() {
        let (base, server) = serve(vec![
            response("200 OK", &[("ETag", "\"v1\""), ("Last-Modified", MODIFIED)], "hello"),
            response("304 Not Modified", &[], ""),
        ]);
        let url = format!("{base}/r.txt");
        let dir = tempfile::tempdir().unwrap();
        let remote = dir.path().join("remote");

        let first = SourceLoader::new(remote.clone(), false);
        let src = first.load("r.txt", "r.txt", &SourceSpec::Url(url.clone())).unwrap();
        assert_eq!(src.payload, Payload::Text("hello".into()));
        let local = first.local_copy("r.txt");
        assert_eq!(std::fs::read_to_string(&local).unwrap(), "hello");
        let saved = read_headers(&headers_path(&local)).unwrap();
        assert_eq!(saved.url, url);
        assert_eq!(saved.etag.as_deref(), Some("\"v1\""));
        assert_eq!(saved.last_modified.as_deref(), Some(MODIFIED));

        // A fresh loader has no memo, so it must go back to the server.
        let second = SourceLoader::new(remote, false);
        let src = second.load("r.txt", "r.txt", &SourceSpec::Url(url)).unwrap();
        assert_eq!(src.payload, Payload::Text("hello".into()));

        let heads = server.join().unwrap();
        assert_eq!(heads.len(), 2);
        assert!(!heads[0].contains("if-none-match"), "{}", heads[0]);
        assert!(heads[1].contains("if-none-match: \"v1\""), "{}", heads[1]);
        assert!(
            heads[1].contains(&format!("if-modified-since: {}", MODIFIED.to_ascii_lowercase())),
            "{}",
            heads[1]
        );
    }

    #[test]
    fn changed_remote_replaces_local_copy() {
        let (base, server) = serve(vec![response("200 OK", &[("ETag", "\"v2\"")], "new")]);
        let url = format!("{base}/r.txt");
        let dir = tempfile::tempdir().unwrap();
        let loader = SourceLoader::new(dir.path().join("remote"), false);
        write_copy(
            &loader,
            "r.txt",
            "old",
            &RemoteHeaders {
                url: url.clone(),
                etag: Some("\"v1\"".into()),
                last_modified: None,
            },
        );

        let src = loader.load("r.txt", "r.txt", &SourceSpec::Url(url)).unwrap();
        assert_eq!(src.payload, Payload::Text("new".into()));
        let local = loader.local_copy("r.txt");
        assert_eq!(std::fs::read_to_string(&local).unwrap(), "new");
        let saved = read_headers(&headers_path(&local)).unwrap();
        assert_eq!(saved.etag.as_deref(), Some("\"v2\""));
        assert!(saved.last_modified.is_none());

        let heads = server.join().unwrap();
        assert!(heads[0].contains("if-none-match: \"v1\""));
        assert!(!heads[0].contains("if-modified-since"));
    }

    #[test]
    fn error_status_is_fatal_even_with_a_local_copy() {
        let (base, server) = serve(vec![response("500 Internal Server Error", &[], "oops")]);
        let url = format!("{base}/r.txt");
        let dir = tempfile::tempdir().unwrap();
        let loader = SourceLoader::new(dir.path().join("remote"), false);
        write_copy(
            &loader,
            "r.txt",
            "stale",
            &RemoteHeaders {
                url: url.clone(),
                etag: None,
                last_modified: Some(MODIFIED.into()),
            },
        );

        let err = loader.load("r.txt", "r.txt", &SourceSpec::Url(url.clone())).unwrap_err();
        match err {
            EngineError::Fetch { url: failed, reason } => {
                assert_eq!(failed, url);
                assert!(reason.contains("500"), "{reason}");
            }
            other => panic!("expected a fetch error, got {other}"),
        }
        let heads = server.join().unwrap();
        assert!(heads[0].contains("if-modified-since"));
        assert!(!heads[0].contains("if-none-match"));
    }

    #[test]
    fn validators_for_another_url_are_not_sent() {
        let (base, server) = serve(vec![response("200 OK", &[], "fresh")]);
        let url = format!("{base}/r.txt");
        let dir = tempfile::tempdir().unwrap();
        let loader = SourceLoader::new(dir.path().join("remote"), false);
        write_copy(
            &loader,
            "r.txt",
            "stale",
            &RemoteHeaders {
                url: "http://elsewhere.invalid/r.txt".into(),
                etag: Some("\"v9\"".into()),
                last_modified: Some(MODIFIED.into()),
            },
        );

        let src = loader.load("r.txt", "r.txt", &SourceSpec::Url(url)).unwrap();
        assert_eq!(src.payload, Payload::Text("fresh".into()));
        let heads = server.join().unwrap();
        assert!(!heads[0].contains("if-none-match"));
        assert!(!heads[0].contains("if-modified-since"));
    }
}
