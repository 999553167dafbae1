//! The per-step build protocol: fingerprint, look up, build on a miss,
//! persist, record.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use quire_cache::{
    ArtifactStore, BuildStatus, Fingerprinter, Payload, RunDatabase, RunRecord, SourceStat,
};
use quire_common::{ContentHash, QuireResult, ENGINE_VERSION};
use quire_graph::DocumentSpec;
use serde_json::{Map, Value};

use crate::artifact::Artifact;
use crate::error::EngineError;
use crate::filter::{apply, Filter, FilterContext};
use crate::source::SourceLoader;

/// Attributes every fingerprint must carry.
const REQUIRED_ATTRS: &[&str] = &[
    "document_key",
    "artifact_key",
    "filter_alias",
    "filter_version",
    "input_fingerprints",
    "ext",
    "args",
    "engine_version",
];

/// One mutex per fingerprint, so that two builds resolving to the same
/// fingerprint never run the filter at the same time.
///
/// Share one table between controllers in a process to extend the guarantee
/// across them.
#[derive(Debug, Default)]
pub struct BuildLocks {
    locks: DashMap<ContentHash, Arc<Mutex<()>>>,
}

impl BuildLocks {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lock for `fingerprint`, creating it on first use.
    pub fn lock_for(&self, fingerprint: ContentHash) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(fingerprint).or_default().value())
    }
}

/// Arguments that take part in a step's fingerprint: `contents`, `url` and
/// the block named after the step's filter alias. Anything else a document
/// declares does not invalidate its artifacts.
pub fn declared_args(doc: &DocumentSpec, filter_alias: Option<&str>) -> Value {
    let mut args = Map::new();
    for key in ["contents", "url"] {
        if let Some(value) = doc.params.args.get(key) {
            args.insert(key.to_string(), value.clone());
        }
    }
    if let Some(alias) = filter_alias {
        if let Some(block) = doc.params.filter_args(alias) {
            args.insert(alias.to_string(), block.clone());
        }
    }
    Value::Object(args)
}

/// Everything that identifies a step, minus its payload.
#[derive(Debug, Clone)]
pub struct StepIdentity {
    /// Key of the owning document.
    pub document_key: String,
    /// Key of the step.
    pub artifact_key: String,
    /// Filter alias, `None` for the source step.
    pub filter_alias: Option<String>,
    /// Filter version, `None` for the source step.
    pub filter_version: Option<String>,
    /// Consumed fingerprints. For the source step this is the hash of the
    /// raw content; otherwise the previous step followed by the final
    /// artifact of every input document.
    pub input_fingerprints: Vec<ContentHash>,
    /// Output extension.
    pub ext: String,
    /// Declared arguments, see [`declared_args`].
    pub args: Value,
}

impl StepIdentity {
    /// Computes the step's fingerprint.
    pub fn fingerprint(&self) -> QuireResult<ContentHash> {
        Fingerprinter::new()
            .attr("document_key", &self.document_key)
            .attr("artifact_key", &self.artifact_key)
            .attr("filter_alias", self.filter_alias.as_deref().unwrap_or_default())
            .attr("filter_version", self.filter_version.as_deref().unwrap_or_default())
            .attr_hashes("input_fingerprints", &self.input_fingerprints)
            .attr("ext", &self.ext)
            .attr_json("args", &self.args)
            .attr("engine_version", ENGINE_VERSION)
            .finish_checked(REQUIRED_ATTRS)
    }

    fn into_artifact(self, fingerprint: ContentHash, payload: Payload, status: BuildStatus) -> Artifact {
        Artifact {
            document_key: self.document_key,
            key: self.artifact_key,
            fingerprint,
            filter_alias: self.filter_alias,
            filter_version: self.filter_version,
            input_fingerprints: self.input_fingerprints,
            ext: self.ext,
            payload,
            status,
        }
    }
}

/// Builds steps against one store and ledger for one batch.
pub struct Builder<'a> {
    store: &'a dyn ArtifactStore,
    ledger: &'a dyn RunDatabase,
    locks: &'a BuildLocks,
    batch_id: u64,
    work_root: PathBuf,
}

impl<'a> Builder<'a> {
    /// Creates a builder. Filter scratch directories go under `work_root`.
    pub fn new(
        store: &'a dyn ArtifactStore,
        ledger: &'a dyn RunDatabase,
        locks: &'a BuildLocks,
        batch_id: u64,
        work_root: PathBuf,
    ) -> Self {
        Self {
            store,
            ledger,
            locks,
            batch_id,
            work_root,
        }
    }

    /// The batch every record goes to.
    pub fn batch_id(&self) -> u64 {
        self.batch_id
    }

    /// Builds step 0 of `doc`: its raw content with extension `ext`.
    ///
    /// When the source is a local file whose stat matches a ledger record,
    /// the recorded artifact is reused without reading the file, provided
    /// the store still holds it and its fingerprint is still valid.
    pub fn build_source(
        &self,
        doc: &DocumentSpec,
        loader: &SourceLoader,
        ext: &str,
    ) -> Result<Artifact, EngineError> {
        let artifact_key = doc.artifact_key(0);
        let stat = loader.stat(&doc.source);
        let identity = |source_hash: ContentHash| StepIdentity {
            document_key: doc.key.clone(),
            artifact_key: artifact_key.clone(),
            filter_alias: None,
            filter_version: None,
            input_fingerprints: vec![source_hash],
            ext: ext.to_string(),
            args: declared_args(doc, None),
        };

        if let Some(stat) = &stat {
            if let Some(prior) = self.ledger.find_prior_match(&doc.key, &artifact_key, stat) {
                if let Some(cached) = self.try_load(&prior.fingerprint) {
                    let still_valid = match cached.input_fingerprints.as_slice() {
                        [source_hash] => identity(*source_hash).fingerprint()? == prior.fingerprint,
                        _ => false,
                    };
                    if still_valid {
                        tracing::debug!(document = %doc.key, fingerprint = %prior.fingerprint, "source unchanged since last batch");
                        self.record(&cached, Some(*stat))?;
                        return Ok(cached);
                    }
                }
            }
        }

        let loaded = loader.load(&doc.key, &doc.name, &doc.source)?;
        let identity = identity(loaded.hash);
        self.obtain(identity, stat, |_| Ok(loaded.payload.clone()))
    }

    /// Builds step `step` (1-based) of `doc` by applying `filter` to `prev`.
    pub fn build_filter_step(
        &self,
        doc: &DocumentSpec,
        step: usize,
        filter: &dyn Filter,
        ext: &str,
        prev: &Artifact,
        inputs: &[Artifact],
    ) -> Result<Artifact, EngineError> {
        let info = filter.info();
        let mut input_fingerprints = Vec::with_capacity(inputs.len() + 1);
        input_fingerprints.push(prev.fingerprint);
        input_fingerprints.extend(inputs.iter().map(|a| a.fingerprint));
        let identity = StepIdentity {
            document_key: doc.key.clone(),
            artifact_key: doc.artifact_key(step),
            filter_alias: Some(info.alias.clone()),
            filter_version: Some(info.version.clone()),
            input_fingerprints,
            ext: ext.to_string(),
            args: declared_args(doc, Some(&info.alias)),
        };
        let args = doc.params.filter_args(&info.alias);
        let artifact_key = identity.artifact_key.clone();

        self.obtain(identity, None, |work_dir| {
            let ctx = FilterContext {
                document_key: &doc.key,
                artifact_key: &artifact_key,
                input_ext: &prev.ext,
                output_ext: ext,
                args,
                work_dir: work_dir.to_path_buf(),
                inputs,
            };
            match apply(filter, &ctx, &prev.payload) {
                Ok(payload) => {
                    let _ = std::fs::remove_dir_all(work_dir);
                    Ok(payload)
                }
                Err(source) => {
                    log_work_dir(work_dir, &prev.payload, &prev.ext, &doc.key, &artifact_key);
                    Err(EngineError::Filter {
                        document: doc.key.clone(),
                        artifact: artifact_key.clone(),
                        source,
                    })
                }
            }
        })
    }

    /// Loads `identity` from the store or produces and saves it, holding the
    /// fingerprint's lock throughout, then records it in the ledger.
    fn obtain(
        &self,
        identity: StepIdentity,
        stat: Option<SourceStat>,
        produce: impl FnOnce(&Path) -> Result<Payload, EngineError>,
    ) -> Result<Artifact, EngineError> {
        let fingerprint = identity.fingerprint()?;
        let lock = self.locks.lock_for(fingerprint);
        // The guarded value is `()`, so a holder that panicked left nothing
        // half-written behind.
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let artifact = match self.try_load(&fingerprint) {
            Some(cached) => {
                tracing::debug!(artifact = %identity.artifact_key, %fingerprint, "cached");
                cached
            }
            None => {
                let work_dir = self.work_root.join(fingerprint.to_string());
                let payload = produce(&work_dir)?;
                let artifact = identity.into_artifact(fingerprint, payload, BuildStatus::Generated);
                self.store.save(&fingerprint, &artifact.meta(), &artifact.payload)?;
                tracing::debug!(artifact = %artifact.key, %fingerprint, "generated");
                artifact
            }
        };
        self.record(&artifact, stat)?;
        Ok(artifact)
    }

    /// Loads a stored artifact. Unreadable entries count as misses.
    fn try_load(&self, fingerprint: &ContentHash) -> Option<Artifact> {
        match self.store.has(fingerprint) {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                tracing::warn!(%fingerprint, error = %e, "unreadable cache entry, rebuilding");
                return None;
            }
        }
        match self.store.load(fingerprint) {
            Ok(stored) => Some(Artifact::from_stored(stored)),
            Err(e) => {
                tracing::warn!(%fingerprint, error = %e, "corrupt cache entry, rebuilding");
                if let Err(e) = self.store.remove(fingerprint) {
                    tracing::warn!(%fingerprint, error = %e, "cannot remove corrupt cache entry");
                }
                None
            }
        }
    }

    fn record(&self, artifact: &Artifact, stat: Option<SourceStat>) -> Result<(), EngineError> {
        self.ledger.append(RunRecord {
            batch_id: self.batch_id,
            batch_order: 0,
            document_key: artifact.document_key.clone(),
            artifact_key: artifact.key.clone(),
            fingerprint: artifact.fingerprint,
            status: artifact.status,
            filter_alias: artifact.filter_alias.clone(),
            ext: artifact.ext.clone(),
            source_stat: stat,
        })?;
        Ok(())
    }
}

/// Leaves the failing step's input in its scratch directory and logs what
/// the directory holds.
fn log_work_dir(work_dir: &Path, input: &Payload, input_ext: &str, document: &str, artifact: &str) {
    let input_path = work_dir.join(format!("input{input_ext}"));
    let saved = std::fs::create_dir_all(work_dir)
        .and_then(|_| input.encode().map_err(std::io::Error::other))
        .and_then(|bytes| std::fs::write(&input_path, bytes));
    if let Err(e) = saved {
        tracing::warn!(path = %input_path.display(), error = %e, "cannot save failing input");
    }
    let mut files: Vec<String> = std::fs::read_dir(work_dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    tracing::error!(
        document,
        artifact,
        work_dir = %work_dir.display(),
        files = %files.join(", "),
        "filter failed"
    );
}
