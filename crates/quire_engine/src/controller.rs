//! Top-level driver: configuration in, finished batch out.
//!
//! A [`Controller`] owns the project settings, the filter registry, the
//! artifact store and the run ledger. [`Controller::run`] loads the
//! directory configuration, resolves and orders the documents, checks that
//! every filter exists, schedules the batch, persists the ledger and hands
//! the result to each reporter. Configuration and graph errors abort before
//! anything is built; failures during the batch are collected in the
//! returned [`BatchReport`].

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use quire_cache::{
    ArtifactStore, CacheError, DirKv, FsStore, HttpKv, JsonlRunDb, KvStore, MemoryKv,
    MemoryRunDb, RunDatabase, RunRecord,
};
use quire_config::{
    load_config_or_default, load_tree, ConfigError, ProjectConfig, RunMode, StoreKind,
};
use quire_graph::{resolve, ResolveOptions, ResolvedGraph};

use crate::build::{BuildLocks, Builder};
use crate::document::{DocumentHook, ExecContext};
use crate::error::EngineError;
use crate::registry::FilterRegistry;
use crate::report::{BatchInfoReporter, BatchReport, OutputReporter, Reporter};
use crate::scheduler::schedule;
use crate::source::SourceLoader;

/// Per-run overrides of the project settings.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Restrict the run to these documents and their inputs.
    pub targets: Vec<String>,
    /// Worker count; `None` uses `build.workers`.
    pub workers: Option<usize>,
    /// Failure handling; `None` uses `build.mode`.
    pub mode: Option<RunMode>,
}

/// Drives batches for one project.
pub struct Controller {
    root: PathBuf,
    config: ProjectConfig,
    registry: FilterRegistry,
    store: Arc<dyn ArtifactStore>,
    ledger: Arc<dyn RunDatabase>,
    locks: Arc<BuildLocks>,
    hooks: Vec<Arc<dyn DocumentHook>>,
    reporters: Vec<Box<dyn Reporter>>,
}

impl Controller {
    /// Opens the project at `root`, reading `quire.toml` when present.
    pub fn open_project(root: &Path) -> Result<Self, EngineError> {
        let config = load_config_or_default(root)?;
        Self::open(root, config)
    }

    /// Opens the project at `root` with already-loaded settings.
    ///
    /// The store and ledger are chosen by `build.store`: the filesystem and
    /// key-value directory backends live under the working directory and
    /// keep a JSON-lines ledger there; the HTTP backend keeps artifacts on
    /// a remote server and the ledger locally; the memory backend keeps
    /// everything in the process.
    pub fn open(root: &Path, config: ProjectConfig) -> Result<Self, EngineError> {
        let workdir = root.join(&config.build.workdir);
        let (store, ledger): (Arc<dyn ArtifactStore>, Arc<dyn RunDatabase>) = match config.build.store {
            StoreKind::Filesystem => (
                Arc::new(FsStore::new(&workdir.join("artifacts"))),
                Arc::new(JsonlRunDb::open(&workdir.join("ledger.jsonl"))?),
            ),
            StoreKind::KvDir => (
                Arc::new(KvStore::new(DirKv::new(&workdir.join("kv")))),
                Arc::new(JsonlRunDb::open(&workdir.join("ledger.jsonl"))?),
            ),
            StoreKind::Memory => (
                Arc::new(KvStore::new(MemoryKv::new())),
                Arc::new(MemoryRunDb::new()),
            ),
            StoreKind::Http => {
                let url = config
                    .build
                    .store_url
                    .as_deref()
                    .ok_or_else(|| ConfigError::MissingField("build.store_url".to_string()))?;
                (
                    Arc::new(KvStore::new(HttpKv::new(url, &config.build.store_bucket)?)),
                    Arc::new(JsonlRunDb::open(&workdir.join("ledger.jsonl"))?),
                )
            }
        };
        let registry = FilterRegistry::from_config(&config)?;
        let reporters: Vec<Box<dyn Reporter>> = vec![
            Box::new(OutputReporter::new(root.join(&config.build.output_dir))),
            Box::new(BatchInfoReporter::new(workdir.join("batches"))),
        ];
        tracing::debug!(
            root = %root.display(),
            workdir = %workdir.display(),
            store = ?config.build.store,
            filters = registry.len(),
            "opened project"
        );
        Ok(Self {
            root: root.to_path_buf(),
            config,
            registry,
            store,
            ledger,
            locks: Arc::new(BuildLocks::new()),
            hooks: Vec::new(),
            reporters,
        })
    }

    /// Shares a lock table with other controllers in this process.
    pub fn with_locks(mut self, locks: Arc<BuildLocks>) -> Self {
        self.locks = locks;
        self
    }

    /// Adds a hook run around every document.
    pub fn add_hook(&mut self, hook: Arc<dyn DocumentHook>) {
        self.hooks.push(hook);
    }

    /// Replaces the reporters run after each batch.
    pub fn set_reporters(&mut self, reporters: Vec<Box<dyn Reporter>>) {
        self.reporters = reporters;
    }

    /// The filter registry, for registering filters before a run.
    pub fn registry_mut(&mut self) -> &mut FilterRegistry {
        &mut self.registry
    }

    /// The filter registry.
    pub fn registry(&self) -> &FilterRegistry {
        &self.registry
    }

    /// The project settings.
    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    /// The artifact store.
    pub fn store(&self) -> &dyn ArtifactStore {
        self.store.as_ref()
    }

    /// The run ledger.
    pub fn ledger(&self) -> &dyn RunDatabase {
        self.ledger.as_ref()
    }

    /// Absolute path of the working directory.
    pub fn workdir(&self) -> PathBuf {
        self.root.join(&self.config.build.workdir)
    }

    /// Loads the directory configuration and resolves it into an ordered
    /// graph, restricted to `targets` when any are given.
    pub fn plan(&self, targets: &[String]) -> Result<ResolvedGraph, EngineError> {
        let tree = load_tree(&self.root, &self.config)?;
        let options = ResolveOptions {
            allow_remote: self.config.build.allow_remote,
        };
        let graph = resolve(&tree, &options)?;
        let graph = if targets.is_empty() {
            graph
        } else {
            graph.select(targets)?
        };
        for note in &graph.notes {
            tracing::info!("{note}");
        }
        self.check_filters(&graph)?;
        Ok(graph)
    }

    /// Fails on the first document that names an unregistered filter.
    fn check_filters(&self, graph: &ResolvedGraph) -> Result<(), EngineError> {
        for doc in &graph.documents {
            if let Some(alias) = doc.filters.iter().find(|a| !self.registry.contains(a)) {
                return Err(EngineError::UnknownFilter {
                    document: doc.key.clone(),
                    alias: alias.clone(),
                });
            }
        }
        Ok(())
    }

    /// Runs one batch.
    pub fn run(&self, options: &RunOptions) -> Result<BatchReport, EngineError> {
        let graph = self.plan(&options.targets)?;
        let workers = effective_workers(options.workers.unwrap_or(self.config.build.workers));
        let mode = options.mode.unwrap_or(self.config.build.mode);
        let workdir = self.workdir();
        let batch_id = self.ledger.next_batch_id();
        tracing::info!(batch = batch_id, documents = graph.len(), workers, ?mode, "starting batch");

        let loader = SourceLoader::new(workdir.join("remote"), self.config.build.use_local_files);
        let ctx = ExecContext {
            builder: Builder::new(
                self.store.as_ref(),
                self.ledger.as_ref(),
                &self.locks,
                batch_id,
                workdir.join("work"),
            ),
            registry: &self.registry,
            loader: &loader,
            hooks: &self.hooks,
            mode,
        };
        let result = schedule(&graph, &ctx, workers);
        self.ledger.persist()?;

        let mut report = BatchReport {
            batch_id,
            documents: result.reports,
            notes: graph.notes,
            failures: result.errors,
        };
        let mut reporter_errors = Vec::new();
        for reporter in &self.reporters {
            if let Err(e) = reporter.report(&report) {
                tracing::error!(reporter = reporter.name(), error = %e, "reporter failed");
                reporter_errors.push(e);
            }
        }
        report.failures.extend(reporter_errors);

        tracing::info!(
            batch = batch_id,
            generated = report.artifacts_with(quire_cache::BuildStatus::Generated),
            cached = report.artifacts_with(quire_cache::BuildStatus::Cached),
            failures = report.failures.len(),
            "batch finished"
        );
        Ok(report)
    }

    /// Ledger records of `batch_id`, or of the latest batch when `None`.
    pub fn history(&self, batch_id: Option<u64>) -> Option<(u64, Vec<RunRecord>)> {
        let id = batch_id.or_else(|| self.ledger.latest_batch_id())?;
        let records = self.ledger.records_for_batch(id);
        if records.is_empty() {
            None
        } else {
            Some((id, records))
        }
    }

    /// Every recorded batch id, ascending.
    pub fn batch_ids(&self) -> Vec<u64> {
        self.ledger.batch_ids()
    }

    /// Removes every stored artifact the latest batch did not reference.
    /// Returns the number of entries removed.
    pub fn gc(&self) -> Result<usize, EngineError> {
        let live: HashSet<_> = match self.ledger.latest_batch_id() {
            Some(id) => self
                .ledger
                .records_for_batch(id)
                .into_iter()
                .map(|r| r.fingerprint)
                .collect(),
            None => HashSet::new(),
        };
        let removed = self.store.gc(&live)?;
        tracing::info!(removed, kept = live.len(), "garbage collected artifact store");
        Ok(removed)
    }

    /// Deletes the working directory: artifacts, ledger, fetched files and
    /// batch reports.
    pub fn reset(self) -> Result<(), EngineError> {
        let workdir = self.workdir();
        if workdir.exists() {
            std::fs::remove_dir_all(&workdir).map_err(|e| CacheError::io(&workdir, e))?;
            tracing::info!(workdir = %workdir.display(), "removed working directory");
        }
        Ok(())
    }
}

/// Resolves `0` to the available parallelism.
fn effective_workers(configured: usize) -> usize {
    if configured == 0 {
        std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    } else {
        configured
    }
}
