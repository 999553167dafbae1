//! Whole-project runs through the controller.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use quire_cache::BuildStatus;
use quire_config::{load_config_from_str, RunMode};
use quire_engine::{
    Artifact, BatchReport, Controller, DocOutcome, DocumentHook, EngineError, Filter,
    FilterContext, FilterError, FilterInfo, FilterMode, RunOptions,
};
use quire_graph::{DocumentSpec, GraphError};
use tempfile::TempDir;

fn project(config: &str, files: &[(&str, &str)]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(".quire"), config).unwrap();
    for (name, contents) in files {
        let path = dir.path().join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }
    dir
}

fn open(root: &Path, toml: &str) -> Controller {
    Controller::open(root, load_config_from_str(toml).unwrap()).unwrap()
}

fn final_of<'r>(report: &'r BatchReport, key: &str) -> &'r Artifact {
    report
        .document(key)
        .and_then(|d| d.final_artifact())
        .unwrap_or_else(|| panic!("{key} did not complete"))
}

/// Rewrites a file and moves its mtime forward so the change is visible
/// even on filesystems with coarse timestamps.
fn touch_with(path: &Path, contents: &str) {
    std::fs::write(path, contents).unwrap();
    std::fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::now() + Duration::from_secs(10))
        .unwrap();
}

/// Upper-cases text and counts invocations.
struct Upper {
    info: FilterInfo,
    calls: Arc<AtomicUsize>,
}

impl Filter for Upper {
    fn info(&self) -> &FilterInfo {
        &self.info
    }

    fn process_text(&self, _ctx: &FilterContext<'_>, input: &str) -> Result<String, FilterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(input.to_uppercase())
    }
}

fn upper(alias: &str, inputs: &[&str], outputs: &[&str], calls: &Arc<AtomicUsize>) -> Arc<Upper> {
    Arc::new(Upper {
        info: FilterInfo::new(alias, FilterMode::TextToText)
            .inputs(inputs)
            .outputs(outputs),
        calls: Arc::clone(calls),
    })
}

#[test]
fn second_run_is_cached_and_byte_identical() {
    let dir = project(r#"{"hello.txt|dexy": {"contents": "hi"}}"#, &[]);

    let first = open(dir.path(), "").run(&RunOptions::default()).unwrap();
    assert!(first.is_success());
    let a1 = final_of(&first, "hello.txt|dexy");
    assert_eq!(a1.status, BuildStatus::Generated);
    let out = dir.path().join("output").join("hello.txt");
    let bytes1 = std::fs::read(&out).unwrap();
    assert_eq!(bytes1, b"hi");

    // A fresh controller reads the persisted store and ledger.
    let second = open(dir.path(), "").run(&RunOptions::default()).unwrap();
    let a2 = final_of(&second, "hello.txt|dexy");
    assert_eq!(a2.status, BuildStatus::Cached);
    assert_eq!(a2.fingerprint, a1.fingerprint);
    assert_eq!(std::fs::read(&out).unwrap(), bytes1);
    assert_eq!(second.artifacts_with(BuildStatus::Generated), 0);
    assert!(second.batch_id > first.batch_id);
}

#[test]
fn batch_info_and_history_are_written() {
    let dir = project(r#"{"a.txt|dexy": {"contents": "a"}}"#, &[]);
    let controller = open(dir.path(), "");
    let report = controller.run(&RunOptions::default()).unwrap();
    let info = controller
        .workdir()
        .join("batches")
        .join(format!("batch-{:05}.json", report.batch_id));
    assert!(info.is_file());

    let (id, records) = controller.history(None).unwrap();
    assert_eq!(id, report.batch_id);
    let keys: Vec<_> = records.iter().map(|r| r.artifact_key.as_str()).collect();
    assert_eq!(keys, vec!["a.txt", "a.txt|dexy"]);
    assert_eq!(records[1].batch_order, 2);
}

#[test]
fn source_change_invalidates_only_its_subtree() {
    let config = r#"{
        "a.txt|join": {},
        "b.txt|join": {},
        "index.txt|join": {"contents": "index", "inputs": ["a.txt|join"]}
    }"#;
    let dir = project(config, &[("a.txt", "alpha"), ("b.txt", "beta")]);

    let first = open(dir.path(), "").run(&RunOptions::default()).unwrap();
    touch_with(&dir.path().join("a.txt"), "alpha, edited");
    let second = open(dir.path(), "").run(&RunOptions::default()).unwrap();

    for key in ["a.txt|join", "index.txt|join"] {
        assert_ne!(
            final_of(&first, key).fingerprint,
            final_of(&second, key).fingerprint,
            "{key} should be rebuilt"
        );
        assert_eq!(final_of(&second, key).status, BuildStatus::Generated);
    }
    let b1 = final_of(&first, "b.txt|join");
    let b2 = final_of(&second, "b.txt|join");
    assert_eq!(b1.fingerprint, b2.fingerprint);
    assert_eq!(b2.status, BuildStatus::Cached);
}

#[test]
fn static_cycle_aborts_before_building() {
    let config = r#"{
        "a.txt": {"inputs": ["b.txt"]},
        "b.txt": {"inputs": ["a.txt"]}
    }"#;
    let dir = project(config, &[("a.txt", "a"), ("b.txt", "b")]);
    let controller = open(dir.path(), "");
    let err = controller.run(&RunOptions::default()).unwrap_err();
    match err {
        EngineError::Graph(GraphError::Cycle { chain }) => {
            assert_eq!(chain.first(), chain.last());
            assert!(chain.contains(&"a.txt".to_string()));
            assert!(chain.contains(&"b.txt".to_string()));
        }
        other => panic!("expected a cycle, got {other}"),
    }
    assert!(controller.batch_ids().is_empty());
}

#[test]
fn extension_mismatch_fails_one_document_before_any_filter_runs() {
    let config = r#"{
        "x.txt|upper|lower": {"contents": "x"},
        "ok.txt|dexy": {"contents": "ok"}
    }"#;
    let dir = project(config, &[]);
    let calls = Arc::new(AtomicUsize::new(0));
    let mut controller = open(dir.path(), "[build]\nmode = \"continue\"\n");
    let registry = controller.registry_mut();
    registry.register(upper("upper", &[".txt"], &[".txt"], &calls)).unwrap();
    registry.register(upper("lower", &[".md"], &[".md"], &calls)).unwrap();

    let report = controller.run(&RunOptions::default()).unwrap();
    assert!(!report.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(matches!(
        report.failures[0],
        EngineError::NoCommonExtension { ref document, .. } if document == "x.txt|upper|lower"
    ));
    let x = report.document("x.txt|upper|lower").unwrap();
    assert!(x.artifacts.is_empty());
    assert!(report.document("ok.txt|dexy").unwrap().outcome.is_completed());
}

#[test]
fn negotiated_extension_reaches_the_output() {
    let config = r#"{"x.txt|upper|lower": {"contents": "x"}}"#;
    let dir = project(config, &[]);
    let calls = Arc::new(AtomicUsize::new(0));
    let mut controller = open(dir.path(), "");
    let registry = controller.registry_mut();
    registry.register(upper("upper", &[".txt"], &[".txt", ".md"], &calls)).unwrap();
    registry.register(upper("lower", &[".md"], &[".md"], &calls)).unwrap();

    let report = controller.run(&RunOptions::default()).unwrap();
    let x = final_of(&report, "x.txt|upper|lower");
    assert_eq!(x.ext, ".md");
    assert_eq!(
        std::fs::read_to_string(dir.path().join("output").join("x.md")).unwrap(),
        "X"
    );
}

#[test]
fn parallel_and_sequential_runs_agree() {
    let config = r##"{
        "*.txt|join": {},
        "index.md|join": {"contents": "# index", "allinputs": true}
    }"##;
    let files = [("a.txt", "a"), ("b.txt", "b"), ("c.txt", "c"), ("d.txt", "d")];
    let seq_dir = project(config, &files);
    let par_dir = project(config, &files);

    let seq = open(seq_dir.path(), "[build]\nworkers = 1\n")
        .run(&RunOptions::default())
        .unwrap();
    let par = open(par_dir.path(), "")
        .run(&RunOptions {
            workers: Some(4),
            ..Default::default()
        })
        .unwrap();

    let fingerprints = |r: &BatchReport| -> Vec<(String, String)> {
        r.documents
            .iter()
            .map(|d| (d.key.clone(), d.final_artifact().unwrap().fingerprint.to_string()))
            .collect()
    };
    assert_eq!(fingerprints(&seq), fingerprints(&par));
    assert_eq!(seq.documents.last().unwrap().key, "index.md|join");
}

#[cfg(unix)]
#[test]
fn continue_mode_skips_dependents_of_a_failure() {
    let config = r#"{
        "bad.txt|fails": {"contents": "x"},
        "user.txt|dexy": {"contents": "u", "inputs": ["bad.txt|fails"]},
        "free.txt|dexy": {"contents": "f"}
    }"#;
    let dir = project(config, &[]);
    let toml = "[build]\nmode = \"continue\"\n\n[filters.fails]\ncommand = [\"false\"]\n";
    let report = open(dir.path(), toml).run(&RunOptions::default()).unwrap();

    assert!(matches!(
        report.document("bad.txt|fails").unwrap().outcome,
        DocOutcome::Failed(_)
    ));
    assert_eq!(
        report.document("user.txt|dexy").unwrap().outcome,
        DocOutcome::Skipped {
            input: "bad.txt|fails".into()
        }
    );
    assert!(report.document("free.txt|dexy").unwrap().outcome.is_completed());
    assert_eq!(report.failures.len(), 1);
}

#[cfg(unix)]
#[test]
fn ignore_errors_keeps_the_partial_chain() {
    let config = r#"{"bad.txt|fails": {"contents": "raw"}}"#;
    let dir = project(config, &[]);
    let toml = "[build]\nmode = \"ignore-errors\"\n\n[filters.fails]\ncommand = [\"false\"]\n";
    let report = open(dir.path(), toml).run(&RunOptions::default()).unwrap();
    assert!(report.failures.is_empty());
    let doc = report.document("bad.txt|fails").unwrap();
    assert!(matches!(doc.outcome, DocOutcome::Completed { warning: Some(_) }));
    assert_eq!(doc.final_artifact().unwrap().payload.to_text(), "raw");
}

#[cfg(unix)]
#[test]
fn command_filter_output_is_cached() {
    let config = r#"{"a.txt|shout": {"contents": "quiet words"}}"#;
    let dir = project(config, &[]);
    let toml = "[filters.shout]\ncommand = [\"tr\", \"a-z\", \"A-Z\"]\n";
    let first = open(dir.path(), toml).run(&RunOptions::default()).unwrap();
    assert_eq!(final_of(&first, "a.txt|shout").payload.to_text(), "QUIET WORDS");
    let second = open(dir.path(), toml).run(&RunOptions::default()).unwrap();
    assert_eq!(final_of(&second, "a.txt|shout").status, BuildStatus::Cached);
}

#[test]
fn targets_restrict_the_run() {
    let config = r#"{
        "a.txt|dexy": {"contents": "a"},
        "b.txt|dexy": {"contents": "b", "inputs": ["a.txt|dexy"]},
        "c.txt|dexy": {"contents": "c"}
    }"#;
    let dir = project(config, &[]);
    let report = open(dir.path(), "")
        .run(&RunOptions {
            targets: vec!["b.txt|dexy".into()],
            ..Default::default()
        })
        .unwrap();
    let keys: Vec<_> = report.documents.iter().map(|d| d.key.as_str()).collect();
    assert_eq!(keys, vec!["a.txt|dexy", "b.txt|dexy"]);
}

#[test]
fn gc_drops_artifacts_the_latest_batch_did_not_use() {
    let dir = project(
        r#"{"a.txt|dexy": {"contents": "a"}, "b.txt|dexy": {"contents": "b"}}"#,
        &[],
    );
    open(dir.path(), "").run(&RunOptions::default()).unwrap();
    std::fs::write(dir.path().join(".quire"), r#"{"a.txt|dexy": {"contents": "a"}}"#).unwrap();
    let controller = open(dir.path(), "");
    controller.run(&RunOptions::default()).unwrap();

    assert_eq!(controller.gc().unwrap(), 2);
    let again = controller.run(&RunOptions::default()).unwrap();
    assert_eq!(final_of(&again, "a.txt|dexy").status, BuildStatus::Cached);
}

#[test]
fn memory_store_keeps_artifacts_in_process() {
    let dir = project(r#"{"a.txt|dexy": {"contents": "a"}}"#, &[]);
    let controller = open(dir.path(), "[build]\nstore = \"memory\"\n");
    let first = controller.run(&RunOptions::default()).unwrap();
    let second = controller.run(&RunOptions::default()).unwrap();
    assert_eq!(final_of(&first, "a.txt|dexy").status, BuildStatus::Generated);
    assert_eq!(final_of(&second, "a.txt|dexy").status, BuildStatus::Cached);
    assert!(!controller.workdir().join("artifacts").exists());
}

struct Tally {
    before: AtomicUsize,
    after: AtomicUsize,
}

impl DocumentHook for Tally {
    fn before(&self, _doc: &DocumentSpec) -> Result<(), EngineError> {
        self.before.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn after(&self, _doc: &DocumentSpec, artifacts: &[Artifact]) -> Result<(), EngineError> {
        assert!(!artifacts.is_empty());
        self.after.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn hooks_wrap_every_document() {
    let dir = project(
        r#"{"a.txt|dexy": {"contents": "a"}, "b.txt|dexy": {"contents": "b"}}"#,
        &[],
    );
    let tally = Arc::new(Tally {
        before: AtomicUsize::new(0),
        after: AtomicUsize::new(0),
    });
    let mut controller = open(dir.path(), "");
    controller.add_hook(tally.clone());
    let report = controller
        .run(&RunOptions {
            mode: Some(RunMode::FailFast),
            ..Default::default()
        })
        .unwrap();
    assert!(report.is_success());
    assert_eq!(tally.before.load(Ordering::SeqCst), 2);
    assert_eq!(tally.after.load(Ordering::SeqCst), 2);
}
