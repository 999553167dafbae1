//! The finished batch and the reporters that consume it.
//!
//! Reporters receive the batch through a shared reference and can only read
//! it. The output reporter writes the final payload of every public document
//! to the output directory; the batch info reporter writes a JSON summary of
//! fingerprints and statuses to the working directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use quire_cache::BuildStatus;
use quire_common::ContentHash;
use serde::Serialize;

use crate::artifact::Artifact;
use crate::error::EngineError;
use crate::scheduler::{DocOutcome, DocReport};

/// Everything a batch produced.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Id the batch was recorded under.
    pub batch_id: u64,
    /// One entry per scheduled document, dependencies first.
    pub documents: Vec<DocReport>,
    /// Resolver notes about disabled or excluded entries.
    pub notes: Vec<String>,
    /// Every error raised during the batch, in order.
    pub failures: Vec<EngineError>,
}

impl BatchReport {
    /// Returns `true` when every document completed.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.documents.iter().all(|d| d.outcome.is_completed())
    }

    /// Number of documents with the given outcome kind.
    pub fn count(&self, pred: impl Fn(&DocOutcome) -> bool) -> usize {
        self.documents.iter().filter(|d| pred(&d.outcome)).count()
    }

    /// Number of artifacts with `status` across all documents.
    pub fn artifacts_with(&self, status: BuildStatus) -> usize {
        self.documents
            .iter()
            .flat_map(|d| &d.artifacts)
            .filter(|a| a.status == status)
            .count()
    }

    /// Report for the document with `key`.
    pub fn document(&self, key: &str) -> Option<&DocReport> {
        self.documents.iter().find(|d| d.key == key)
    }

    /// Fingerprints of every artifact in the batch.
    pub fn fingerprints(&self) -> HashSet<ContentHash> {
        self.documents
            .iter()
            .flat_map(|d| &d.artifacts)
            .map(|a| a.fingerprint)
            .collect()
    }
}

/// Consumer of a finished batch.
pub trait Reporter: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Processes the batch.
    fn report(&self, batch: &BatchReport) -> Result<(), EngineError>;
}

/// Writes the final payload of every completed, non-private document.
pub struct OutputReporter {
    dir: PathBuf,
}

impl OutputReporter {
    /// Creates a reporter writing below `dir`.
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Relative output path for `doc`'s final artifact: the document name
    /// with its extension replaced by the artifact's.
    pub fn output_name(doc: &DocReport, artifact: &Artifact) -> String {
        let file_start = doc.name.rfind('/').map_or(0, |i| i + 1);
        let stem = match doc.name[file_start..].rfind('.') {
            Some(0) | None => &doc.name[..],
            Some(i) => &doc.name[..file_start + i],
        };
        format!("{stem}{}", artifact.ext)
    }

    /// Fallback path used when two documents share an output name.
    fn fallback_name(doc: &DocReport, artifact: &Artifact) -> String {
        format!("{}{}", doc.key.replace('|', "-"), artifact.ext)
    }

    fn write(&self, rel: &str, artifact: &Artifact) -> Result<(), EngineError> {
        let path = self.dir.join(rel);
        let fail = |e: std::io::Error| EngineError::Report {
            reporter: self.name().to_string(),
            path: path.clone(),
            source: e,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(fail)?;
        }
        let bytes = match &artifact.payload {
            quire_cache::Payload::Bytes(bytes) => bytes.clone(),
            other => other.to_text().into_bytes(),
        };
        std::fs::write(&path, bytes).map_err(fail)
    }
}

impl Reporter for OutputReporter {
    fn name(&self) -> &str {
        "output"
    }

    fn report(&self, batch: &BatchReport) -> Result<(), EngineError> {
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir).map_err(|e| EngineError::Report {
                reporter: self.name().to_string(),
                path: self.dir.clone(),
                source: e,
            })?;
        }
        let mut used = HashSet::new();
        let mut written = 0usize;
        for doc in batch.documents.iter().filter(|d| !d.private) {
            let Some(artifact) = doc.final_artifact() else {
                continue;
            };
            let mut rel = Self::output_name(doc, artifact);
            if !used.insert(rel.clone()) {
                rel = Self::fallback_name(doc, artifact);
                tracing::debug!(document = %doc.key, path = %rel, "output name taken, using key");
                used.insert(rel.clone());
            }
            self.write(&rel, artifact)?;
            written += 1;
        }
        tracing::info!(dir = %self.dir.display(), documents = written, "wrote output");
        Ok(())
    }
}

#[derive(Serialize)]
struct BatchInfo<'a> {
    batch_id: u64,
    success: bool,
    documents: Vec<DocumentInfo<'a>>,
    notes: &'a [String],
    failures: Vec<String>,
}

#[derive(Serialize)]
struct DocumentInfo<'a> {
    key: &'a str,
    outcome: String,
    artifacts: Vec<ArtifactInfo<'a>>,
}

#[derive(Serialize)]
struct ArtifactInfo<'a> {
    key: &'a str,
    fingerprint: ContentHash,
    status: BuildStatus,
    ext: &'a str,
}

fn outcome_label(outcome: &DocOutcome) -> String {
    match outcome {
        DocOutcome::Completed { warning: None } => "completed".to_string(),
        DocOutcome::Completed { warning: Some(w) } => format!("completed with warning: {w}"),
        DocOutcome::Failed(e) => format!("failed: {e}"),
        DocOutcome::Skipped { input } => format!("skipped: input {input} did not complete"),
        DocOutcome::NotRun => "not run".to_string(),
    }
}

/// Writes `batch-NNNNN.json` summaries into a directory.
pub struct BatchInfoReporter {
    dir: PathBuf,
}

impl BatchInfoReporter {
    /// Creates a reporter writing into `dir`.
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Path of the summary for `batch_id`.
    pub fn path_for(dir: &Path, batch_id: u64) -> PathBuf {
        dir.join(format!("batch-{batch_id:05}.json"))
    }
}

impl Reporter for BatchInfoReporter {
    fn name(&self) -> &str {
        "batch-info"
    }

    fn report(&self, batch: &BatchReport) -> Result<(), EngineError> {
        let info = BatchInfo {
            batch_id: batch.batch_id,
            success: batch.is_success(),
            documents: batch
                .documents
                .iter()
                .map(|d| DocumentInfo {
                    key: &d.key,
                    outcome: outcome_label(&d.outcome),
                    artifacts: d
                        .artifacts
                        .iter()
                        .map(|a| ArtifactInfo {
                            key: &a.key,
                            fingerprint: a.fingerprint,
                            status: a.status,
                            ext: &a.ext,
                        })
                        .collect(),
                })
                .collect(),
            notes: &batch.notes,
            failures: batch.failures.iter().map(|e| e.to_string()).collect(),
        };
        let path = Self::path_for(&self.dir, batch.batch_id);
        let fail = |e: std::io::Error| EngineError::Report {
            reporter: self.name().to_string(),
            path: path.clone(),
            source: e,
        };
        let json = serde_json::to_string_pretty(&info).map_err(|e| fail(std::io::Error::other(e)))?;
        std::fs::create_dir_all(&self.dir).map_err(fail)?;
        std::fs::write(&path, json).map_err(fail)?;
        tracing::debug!(path = %path.display(), "wrote batch info");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_cache::Payload;

    fn artifact(key: &str, ext: &str, text: &str) -> Artifact {
        Artifact {
            document_key: key.into(),
            key: key.into(),
            fingerprint: ContentHash::from_bytes(text.as_bytes()),
            filter_alias: None,
            filter_version: None,
            input_fingerprints: Vec::new(),
            ext: ext.into(),
            payload: Payload::Text(text.into()),
            status: BuildStatus::Generated,
        }
    }

    fn report(key: &str, name: &str, ext: &str, text: &str) -> DocReport {
        DocReport {
            key: key.into(),
            name: name.into(),
            private: name.rsplit('/').next().is_some_and(|n| n.starts_with('_')),
            artifacts: vec![artifact(key, ext, text)],
            outcome: DocOutcome::Completed { warning: None },
        }
    }

    #[test]
    fn output_name_swaps_extension() {
        let doc = report("docs/a.md|md", "docs/a.md", ".html", "x");
        assert_eq!(OutputReporter::output_name(&doc, &doc.artifacts[0]), "docs/a.html");
        let bare = report("v1.2/README|x", "v1.2/README", ".txt", "x");
        assert_eq!(OutputReporter::output_name(&bare, &bare.artifacts[0]), "v1.2/README.txt");
    }

    #[test]
    fn output_skips_private_and_failed_and_resolves_clashes() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("output");
        let mut failed = report("c.txt|x", "c.txt", ".txt", "nope");
        failed.outcome = DocOutcome::Failed("boom".into());
        let batch = BatchReport {
            batch_id: 1,
            documents: vec![
                report("a.txt", "a.txt", ".txt", "plain"),
                report("a.txt|up", "a.txt", ".txt", "PLAIN"),
                report("_b.txt", "_b.txt", ".txt", "hidden"),
                failed,
            ],
            ..Default::default()
        };
        OutputReporter::new(out.clone()).report(&batch).unwrap();
        assert_eq!(std::fs::read_to_string(out.join("a.txt")).unwrap(), "plain");
        assert_eq!(std::fs::read_to_string(out.join("a.txt-up.txt")).unwrap(), "PLAIN");
        assert!(!out.join("_b.txt").exists());
        assert!(!out.join("c.txt").exists());
    }

    #[test]
    fn batch_info_lists_fingerprints() {
        let dir = tempfile::tempdir().unwrap();
        let batch = BatchReport {
            batch_id: 3,
            documents: vec![report("a.txt", "a.txt", ".txt", "plain")],
            ..Default::default()
        };
        BatchInfoReporter::new(dir.path().to_path_buf()).report(&batch).unwrap();
        let text = std::fs::read_to_string(dir.path().join("batch-00003.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["documents"][0]["outcome"], "completed");
        assert_eq!(
            json["documents"][0]["artifacts"][0]["fingerprint"],
            ContentHash::from_bytes(b"plain").to_string()
        );
        assert_eq!(json["documents"][0]["artifacts"][0]["status"], "generated");
    }

    #[test]
    fn success_requires_every_document() {
        let mut batch = BatchReport {
            documents: vec![report("a.txt", "a.txt", ".txt", "x")],
            ..Default::default()
        };
        assert!(batch.is_success());
        batch.documents[0].outcome = DocOutcome::NotRun;
        assert!(!batch.is_success());
        assert_eq!(batch.artifacts_with(BuildStatus::Generated), 1);
    }
}
