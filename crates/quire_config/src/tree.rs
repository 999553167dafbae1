//! Discovery and root-to-leaf merging of per-directory document config files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use regex::Regex;
use serde_json::{Map, Value};
use walkdir::{DirEntry, WalkDir};

use crate::error::ConfigError;
use crate::types::ProjectConfig;

/// Directory names never descended into.
const EXCLUDE_EVERYWHERE: &[&str] = &[".git", ".hg", ".svn", ".bzr"];

/// Marker file that removes a directory and everything below it from the run.
const SKIP_MARKER: &str = ".noquire";

/// Key that discards everything inherited from parent directories.
const RESET_KEY: &str = "$reset";

/// Key holding arguments merged into every entry of a directory and below.
const GLOBALS_KEY: &str = "$globals";

/// Effective document configuration for one directory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirectoryConfig {
    /// Path relative to the project root, `/`-separated. The root is `"."`.
    pub path: String,
    /// Entries in declaration order, parents first.
    pub entries: IndexMap<String, Value>,
    /// Accumulated `$globals`, project-level globals applied last.
    pub globals: Map<String, Value>,
}

/// The merged configuration of every directory taking part in a run.
#[derive(Debug, Clone, Default)]
pub struct ConfigTree {
    /// Absolute (or caller-relative) project root.
    pub root: PathBuf,
    /// Directories in walk order (root first, children sorted by name).
    pub dirs: Vec<DirectoryConfig>,
}

impl ConfigTree {
    /// Builds a tree from an in-memory `{"dir": {"pattern": {...}}}` object.
    ///
    /// No inheritance is applied: each directory gets exactly the entries
    /// listed for it. A `$globals` object inside a directory is lifted into
    /// [`DirectoryConfig::globals`].
    pub fn from_value(root: &Path, value: &Value) -> Result<Self, ConfigError> {
        let Value::Object(dirs) = value else {
            return Err(ConfigError::ValidationError(
                "document config must be an object keyed by directory".to_string(),
            ));
        };
        let mut tree = ConfigTree {
            root: root.to_path_buf(),
            dirs: Vec::new(),
        };
        for (path, entries) in dirs {
            let Value::Object(entries) = entries else {
                return Err(ConfigError::ValidationError(format!(
                    "entries for directory '{path}' must be an object"
                )));
            };
            let mut dir = DirectoryConfig {
                path: path.clone(),
                ..Default::default()
            };
            for (pattern, params) in entries {
                if pattern == GLOBALS_KEY {
                    dir.globals = globals_object(path, params)?;
                } else if !pattern.starts_with('$') {
                    dir.entries.insert(pattern.clone(), params.clone());
                }
            }
            tree.dirs.push(dir);
        }
        Ok(tree)
    }

    /// Total number of entries over all directories.
    pub fn entry_count(&self) -> usize {
        self.dirs.iter().map(|d| d.entries.len()).sum()
    }
}

/// Walks the project rooted at `root` and merges every directory's config.
///
/// Directories are skipped when they are version-control metadata, contain a
/// `.noquire` marker, match one of `build.exclude`, or (at the root only)
/// are the working or output directory. With `build.recurse` off only the
/// root is considered.
pub fn load_tree(root: &Path, config: &ProjectConfig) -> Result<ConfigTree, ConfigError> {
    let excludes = config
        .build
        .exclude
        .iter()
        .map(|p| {
            Regex::new(&format!("^(?:{p})"))
                .map_err(|e| ConfigError::ValidationError(format!("bad exclude '{p}': {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let root_excludes: Vec<String> = [&config.build.workdir, &config.build.output_dir]
        .iter()
        .filter_map(|d| first_component(d))
        .collect();

    let mut walker = WalkDir::new(root).sort_by_file_name();
    if !config.build.recurse {
        walker = walker.max_depth(0);
    }

    let mut loader = ConfigFileCache::new(root, &config.build.config_file);
    let mut tree = ConfigTree {
        root: root.to_path_buf(),
        dirs: Vec::new(),
    };

    let entries = walker
        .into_iter()
        .filter_entry(|e| keep_dir(e, &root_excludes, &excludes));
    for entry in entries {
        let entry = entry.map_err(|e| {
            ConfigError::IoError(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
            )
        })?;
        let rel = relative_path(root, entry.path());
        let mut dir = loader.config_for_directory(&rel)?;
        for (key, value) in &config.globals {
            dir.globals.insert(key.clone(), value.clone());
        }
        tracing::debug!(dir = %dir.path, entries = dir.entries.len(), "loaded directory config");
        tree.dirs.push(dir);
    }
    Ok(tree)
}

fn keep_dir(entry: &DirEntry, root_excludes: &[String], excludes: &[Regex]) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    if entry.path().join(SKIP_MARKER).is_file() {
        tracing::info!(dir = %entry.path().display(), "skip marker found");
        return false;
    }
    if entry.depth() == 0 {
        return true;
    }
    let name = entry.file_name().to_string_lossy();
    if EXCLUDE_EVERYWHERE.contains(&name.as_ref()) {
        return false;
    }
    if entry.depth() == 1 && root_excludes.iter().any(|d| d == name.as_ref()) {
        return false;
    }
    !excludes.iter().any(|re| re.is_match(&name))
}

fn first_component(path: &str) -> Option<String> {
    path.trim_start_matches("./")
        .split('/')
        .find(|c| !c.is_empty())
        .map(str::to_string)
}

fn relative_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

fn globals_object(path: &str, value: &Value) -> Result<Map<String, Value>, ConfigError> {
    match value {
        Value::Object(map) => Ok(map.clone()),
        _ => Err(ConfigError::InvalidEntry {
            pattern: format!("{path}/{GLOBALS_KEY}"),
            reason: "$globals should be an object".to_string(),
        }),
    }
}

/// Parsed config files, read at most once per run.
struct ConfigFileCache {
    root: PathBuf,
    file_name: String,
    parsed: HashMap<String, Option<IndexMap<String, Value>>>,
}

impl ConfigFileCache {
    fn new(root: &Path, file_name: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            file_name: file_name.to_string(),
            parsed: HashMap::new(),
        }
    }

    fn file_for(&mut self, rel: &str) -> Result<Option<&IndexMap<String, Value>>, ConfigError> {
        if !self.parsed.contains_key(rel) {
            let dir = if rel == "." {
                self.root.clone()
            } else {
                self.root.join(rel)
            };
            let path = dir.join(&self.file_name);
            let parsed = if path.is_file() {
                tracing::info!(file = %path.display(), "loading config file");
                let text = std::fs::read_to_string(&path)?;
                let map: IndexMap<String, Value> =
                    serde_json::from_str(&text).map_err(|e| ConfigError::InvalidJson {
                        path: path.clone(),
                        reason: e.to_string(),
                    })?;
                Some(map)
            } else {
                None
            };
            self.parsed.insert(rel.to_string(), parsed);
        }
        Ok(self.parsed.get(rel).and_then(Option::as_ref))
    }

    /// Merges config files from the root down to `rel`. Subdirectories
    /// override parents; `@` virtual entries are dropped on the way down
    /// unless the subdirectory redeclares them.
    fn config_for_directory(&mut self, rel: &str) -> Result<DirectoryConfig, ConfigError> {
        let mut chain = vec![".".to_string()];
        if rel != "." {
            let mut prefix = String::new();
            for part in rel.split('/') {
                if !prefix.is_empty() {
                    prefix.push('/');
                }
                prefix.push_str(part);
                chain.push(prefix.clone());
            }
        }

        let mut entries: IndexMap<String, Value> = IndexMap::new();
        let mut globals = Map::new();
        for dir in &chain {
            let Some(file) = self.file_for(dir)? else {
                continue;
            };
            if file.contains_key(RESET_KEY) {
                entries = file.clone();
            } else {
                entries.retain(|k, _| !k.starts_with('@') || file.contains_key(k));
                for (k, v) in file {
                    entries.insert(k.clone(), v.clone());
                }
            }
            if let Some(g) = file.get(GLOBALS_KEY) {
                globals.extend(globals_object(dir, g)?);
            }
        }
        entries.retain(|k, _| !k.starts_with('$'));

        Ok(DirectoryConfig {
            path: rel.to_string(),
            entries,
            globals,
        })
    }
}
