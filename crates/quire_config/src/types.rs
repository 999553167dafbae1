//! Configuration types deserialized from `quire.toml`.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// The top-level project configuration parsed from `quire.toml`.
///
/// Every section is optional. A project without `quire.toml` runs with
/// [`ProjectConfig::default`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectConfig {
    /// Project metadata.
    #[serde(default)]
    pub project: ProjectMeta,
    /// Engine settings (working directory, workers, run mode, store).
    #[serde(default)]
    pub build: BuildConfig,
    /// Arguments merged into every document entry. These win over any
    /// `$globals` declared in directory config files.
    #[serde(default)]
    pub globals: BTreeMap<String, serde_json::Value>,
    /// External command filters keyed by alias.
    #[serde(default)]
    pub filters: BTreeMap<String, CommandFilterConfig>,
}

/// Project metadata.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectMeta {
    /// The project name, used in reports.
    #[serde(default)]
    pub name: String,
}

/// Engine settings from the `[build]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Working directory (relative to the project root) holding artifacts,
    /// the run ledger, fetched remote files and batch reports.
    pub workdir: String,
    /// Directory (relative to the project root) the output reporter writes to.
    pub output_dir: String,
    /// Name of the per-directory document config file.
    pub config_file: String,
    /// Worker threads. `0` means available parallelism, `1` runs sequentially.
    pub workers: usize,
    /// What to do when a document fails.
    pub mode: RunMode,
    /// Artifact store backend.
    pub store: StoreKind,
    /// Base URL of the remote key-value server, for `store = "http"`.
    pub store_url: Option<String>,
    /// Bucket holding this project's artifacts on the remote server.
    pub store_bucket: String,
    /// Allow virtual documents without `contents` (remote fetches).
    pub allow_remote: bool,
    /// Skip the network when a local copy of a remote file exists.
    pub use_local_files: bool,
    /// Walk subdirectories looking for config files.
    pub recurse: bool,
    /// Directory-name regexes skipped at every level.
    #[serde(deserialize_with = "deserialize_string_or_vec")]
    pub exclude: Vec<String>,
    /// Default timeout in seconds for external command filters.
    pub filter_timeout_secs: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            workdir: ".quire-work".to_string(),
            output_dir: "output".to_string(),
            config_file: ".quire".to_string(),
            workers: 0,
            mode: RunMode::FailFast,
            store: StoreKind::Filesystem,
            store_url: None,
            store_bucket: "quire-artifacts".to_string(),
            allow_remote: false,
            use_local_files: false,
            recurse: true,
            exclude: Vec::new(),
            filter_timeout_secs: 30,
        }
    }
}

/// Deserializes a field that can be either a single string or a list of strings.
///
/// A single string is split on whitespace so that `exclude = "drafts tmp"`
/// behaves like `exclude = ["drafts", "tmp"]`.
fn deserialize_string_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct StringOrVec;

    impl<'de> Visitor<'de> for StringOrVec {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            formatter.write_str("a string or a list of strings")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(v.split_whitespace().map(str::to_string).collect())
        }

        fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut vec = Vec::new();
            while let Some(val) = seq.next_element::<String>()? {
                vec.push(val);
            }
            Ok(vec)
        }
    }

    deserializer.deserialize_any(StringOrVec)
}

/// How a run reacts to a failing document.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Stop dispatching new work at the first failure (default).
    #[default]
    FailFast,
    /// Keep building independent subtrees, skip dependents of failed
    /// documents and report every failure at the end.
    Continue,
    /// Downgrade filter failures to warnings. The failing document completes
    /// with the artifacts built before the failure.
    IgnoreErrors,
}

/// Artifact store backend selection.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StoreKind {
    /// Header-validated files under `<workdir>/artifacts` (default).
    #[default]
    Filesystem,
    /// Key-value store held in process memory. Nothing survives the run.
    Memory,
    /// Key-value store backed by one file per key under `<workdir>/kv`.
    KvDir,
    /// Key-value store on a remote HTTP server at `build.store_url`. The
    /// run ledger stays in the working directory.
    Http,
}

/// An external command filter declared under `[filters.<alias>]`.
///
/// The command receives the previous step's text on stdin and its stdout
/// becomes the next step's text.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandFilterConfig {
    /// Program and arguments.
    #[serde(default)]
    pub command: Vec<String>,
    /// Accepted input extensions. Defaults to `.*` (anything).
    #[serde(default = "wildcard_extensions")]
    pub input_extensions: Vec<String>,
    /// Produced extensions. Defaults to `.*` (same as input).
    #[serde(default = "wildcard_extensions")]
    pub output_extensions: Vec<String>,
    /// Timeout override in seconds.
    pub timeout_secs: Option<u64>,
    /// Version identifier mixed into fingerprints. Bump it when the command
    /// changes behaviour without changing its arguments.
    #[serde(default = "default_filter_version")]
    pub version: String,
}

fn wildcard_extensions() -> Vec<String> {
    vec![".*".to_string()]
}

fn default_filter_version() -> String {
    "1".to_string()
}
