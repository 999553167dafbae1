//! The run ledger: an append-only record of every artifact each batch built
//! or loaded.
//!
//! The ledger is history, not truth. Fingerprints decide what is cached; the
//! ledger only lets a later run skip re-reading a source file whose stat has
//! not changed, and feeds the `history` command.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use quire_common::ContentHash;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::hasher::SourceStat;

/// Whether a step ran its filter or was satisfied from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    /// Loaded from the artifact store; the filter did not run.
    Cached,
    /// Produced by running the filter in this batch.
    Generated,
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cached => write!(f, "cached"),
            Self::Generated => write!(f, "generated"),
        }
    }
}

/// One ledger line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Batch that recorded the step.
    pub batch_id: u64,
    /// Position within the batch. Assigned by the ledger on append and only
    /// meaningful for display.
    pub batch_order: u64,
    /// Key of the owning document.
    pub document_key: String,
    /// Key of the step.
    pub artifact_key: String,
    /// The step's fingerprint.
    pub fingerprint: ContentHash,
    /// Cached or generated.
    pub status: BuildStatus,
    /// Filter alias, `None` for the source step.
    #[serde(default)]
    pub filter_alias: Option<String>,
    /// Output extension.
    pub ext: String,
    /// Stat of the local source file, for source steps that read one.
    #[serde(default)]
    pub source_stat: Option<SourceStat>,
}

/// Append-only ledger of built artifacts, keyed by `(batch_id, batch_order)`.
pub trait RunDatabase: Send + Sync {
    /// Reserves a batch id one higher than any recorded or previously reserved.
    fn next_batch_id(&self) -> u64;

    /// Highest batch id with at least one record.
    fn latest_batch_id(&self) -> Option<u64>;

    /// Every batch id with at least one record, ascending.
    fn batch_ids(&self) -> Vec<u64>;

    /// Appends a record, overwriting its `batch_order` with the next position
    /// in its batch. Returns the assigned position.
    fn append(&self, record: RunRecord) -> Result<u64, CacheError>;

    /// Records of one batch in `batch_order`.
    fn records_for_batch(&self, batch_id: u64) -> Vec<RunRecord>;

    /// Most recent record for the same step whose source stat equals `stat`.
    fn find_prior_match(
        &self,
        document_key: &str,
        artifact_key: &str,
        stat: &SourceStat,
    ) -> Option<RunRecord>;

    /// Flushes pending records to durable storage.
    fn persist(&self) -> Result<(), CacheError>;
}

#[derive(Default)]
struct LedgerState {
    records: Vec<RunRecord>,
    /// Positions in `records`, per batch.
    by_batch: BTreeMap<u64, Vec<usize>>,
    /// Positions in `records` of steps that carry a source stat, per
    /// document and artifact key.
    by_step: HashMap<String, HashMap<String, Vec<usize>>>,
    pending: Vec<RunRecord>,
    reserved: u64,
}

impl LedgerState {
    fn insert(&mut self, record: RunRecord) {
        let at = self.records.len();
        self.by_batch.entry(record.batch_id).or_default().push(at);
        if record.source_stat.is_some() {
            self.by_step
                .entry(record.document_key.clone())
                .or_default()
                .entry(record.artifact_key.clone())
                .or_default()
                .push(at);
        }
        self.records.push(record);
    }

    fn max_recorded(&self) -> Option<u64> {
        self.by_batch.keys().next_back().copied()
    }

    fn next_batch_id(&mut self) -> u64 {
        let next = self.max_recorded().unwrap_or(0).max(self.reserved) + 1;
        self.reserved = next;
        next
    }

    fn append(&mut self, mut record: RunRecord) -> u64 {
        let order = self.by_batch.get(&record.batch_id).map_or(0, Vec::len) as u64 + 1;
        record.batch_order = order;
        self.insert(record.clone());
        self.pending.push(record);
        order
    }

    fn batch_ids(&self) -> Vec<u64> {
        self.by_batch.keys().copied().collect()
    }

    fn records_for_batch(&self, batch_id: u64) -> Vec<RunRecord> {
        let mut records: Vec<RunRecord> = self
            .by_batch
            .get(&batch_id)
            .into_iter()
            .flatten()
            .map(|&at| self.records[at].clone())
            .collect();
        records.sort_by_key(|r| r.batch_order);
        records
    }

    fn find_prior_match(
        &self,
        document_key: &str,
        artifact_key: &str,
        stat: &SourceStat,
    ) -> Option<RunRecord> {
        self.by_step
            .get(document_key)?
            .get(artifact_key)?
            .iter()
            .map(|&at| &self.records[at])
            .filter(|r| r.source_stat.as_ref() == Some(stat))
            .max_by_key(|r| (r.batch_id, r.batch_order))
            .cloned()
    }
}

fn lock(state: &Mutex<LedgerState>) -> MutexGuard<'_, LedgerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ledger held in memory for the lifetime of the value.
#[derive(Default)]
pub struct MemoryRunDb {
    state: Mutex<LedgerState>,
}

impl MemoryRunDb {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunDatabase for MemoryRunDb {
    fn next_batch_id(&self) -> u64 {
        lock(&self.state).next_batch_id()
    }

    fn latest_batch_id(&self) -> Option<u64> {
        lock(&self.state).max_recorded()
    }

    fn batch_ids(&self) -> Vec<u64> {
        lock(&self.state).batch_ids()
    }

    fn append(&self, record: RunRecord) -> Result<u64, CacheError> {
        let mut state = lock(&self.state);
        let order = state.append(record);
        state.pending.clear();
        Ok(order)
    }

    fn records_for_batch(&self, batch_id: u64) -> Vec<RunRecord> {
        lock(&self.state).records_for_batch(batch_id)
    }

    fn find_prior_match(
        &self,
        document_key: &str,
        artifact_key: &str,
        stat: &SourceStat,
    ) -> Option<RunRecord> {
        lock(&self.state).find_prior_match(document_key, artifact_key, stat)
    }

    fn persist(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Ledger stored as one JSON object per line. New records are buffered and
/// appended to the file on [`persist`](RunDatabase::persist).
pub struct JsonlRunDb {
    path: PathBuf,
    state: Mutex<LedgerState>,
}

impl JsonlRunDb {
    /// Opens the ledger at `path`, reading any existing records. Lines that
    /// fail to parse are skipped with a warning.
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        let mut state = LedgerState::default();
        if path.is_file() {
            let text = std::fs::read_to_string(path).map_err(|e| CacheError::io(path, e))?;
            for (n, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<RunRecord>(line) {
                    Ok(record) => state.insert(record),
                    Err(e) => tracing::warn!(
                        ledger = %path.display(),
                        line = n + 1,
                        error = %e,
                        "skipping unreadable ledger line"
                    ),
                }
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    /// Returns the ledger file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RunDatabase for JsonlRunDb {
    fn next_batch_id(&self) -> u64 {
        lock(&self.state).next_batch_id()
    }

    fn latest_batch_id(&self) -> Option<u64> {
        lock(&self.state).max_recorded()
    }

    fn batch_ids(&self) -> Vec<u64> {
        lock(&self.state).batch_ids()
    }

    fn append(&self, record: RunRecord) -> Result<u64, CacheError> {
        Ok(lock(&self.state).append(record))
    }

    fn records_for_batch(&self, batch_id: u64) -> Vec<RunRecord> {
        lock(&self.state).records_for_batch(batch_id)
    }

    fn find_prior_match(
        &self,
        document_key: &str,
        artifact_key: &str,
        stat: &SourceStat,
    ) -> Option<RunRecord> {
        lock(&self.state).find_prior_match(document_key, artifact_key, stat)
    }

    fn persist(&self) -> Result<(), CacheError> {
        let mut state = lock(&self.state);
        if state.pending.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
        }
        let mut out = String::new();
        for record in &state.pending {
            let line = serde_json::to_string(record).map_err(|e| CacheError::Serialization {
                reason: e.to_string(),
            })?;
            out.push_str(&line);
            out.push('\n');
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| CacheError::io(&self.path, e))?;
        file.write_all(out.as_bytes())
            .map_err(|e| CacheError::io(&self.path, e))?;
        state.pending.clear();
        Ok(())
    }
}
