//! Running resolved documents in dependency order.
//!
//! With one worker every document is executed on the calling thread in
//! topological order, and the keys of the documents currently being built
//! are threaded through as a call stack so that a re-entered document is
//! reported with the chain that reached it. With more workers a coordinator
//! keeps an in-degree count per document, hands ready documents to a pool
//! of scoped threads over a channel, and enqueues dependents as results come
//! back.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex, PoisonError};

use quire_common::InternalError;
use quire_config::RunMode;
use quire_graph::{DocumentSpec, ResolvedGraph};

use crate::artifact::Artifact;
use crate::document::{DocState, DocumentRun, ExecContext};
use crate::error::EngineError;
use crate::filter::panic_message;

/// How one document ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocOutcome {
    /// Every step was built. `warning` is set when `ignore-errors` cut the
    /// chain short.
    Completed {
        /// The swallowed filter failure.
        warning: Option<String>,
    },
    /// The document failed with this message.
    Failed(String),
    /// An input failed or was skipped, so the document never started.
    Skipped {
        /// Key of the input that failed first.
        input: String,
    },
    /// The run stopped before the document was started.
    NotRun,
}

impl DocOutcome {
    /// Returns `true` for [`DocOutcome::Completed`].
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// The result of one document within a batch.
#[derive(Debug, Clone)]
pub struct DocReport {
    /// Document key.
    pub key: String,
    /// Document name.
    pub name: String,
    /// Left out of default output.
    pub private: bool,
    /// Artifacts built, source step first. Empty when the document never ran.
    pub artifacts: Vec<Artifact>,
    /// How it ended.
    pub outcome: DocOutcome,
}

impl DocReport {
    fn new(doc: &DocumentSpec) -> Self {
        Self {
            key: doc.key.clone(),
            name: doc.name.clone(),
            private: doc.is_private(),
            artifacts: Vec::new(),
            outcome: DocOutcome::NotRun,
        }
    }

    /// The final artifact of a completed document.
    pub fn final_artifact(&self) -> Option<&Artifact> {
        if self.outcome.is_completed() {
            self.artifacts.last()
        } else {
            None
        }
    }
}

/// Per-document reports in graph order plus every error raised.
#[derive(Debug, Default)]
pub struct Schedule {
    /// One report per document of the graph, same order.
    pub reports: Vec<DocReport>,
    /// Errors in the order they were raised.
    pub errors: Vec<EngineError>,
}

/// Whether `err` ends dispatch under `mode`.
fn stops_run(mode: RunMode, err: &EngineError) -> bool {
    err.is_always_fatal() || mode == RunMode::FailFast
}

/// Runs every document of `graph` with up to `workers` threads.
pub fn schedule(graph: &ResolvedGraph, ctx: &ExecContext<'_>, workers: usize) -> Schedule {
    let workers = workers.max(1).min(graph.len().max(1));
    tracing::debug!(documents = graph.len(), workers, mode = ?ctx.mode, "scheduling");
    if workers == 1 {
        Sequential::new(graph, ctx).run()
    } else {
        run_parallel(graph, ctx, workers)
    }
}

/// Depth-first execution on the calling thread.
struct Sequential<'a> {
    graph: &'a ResolvedGraph,
    ctx: &'a ExecContext<'a>,
    runs: Vec<DocumentRun>,
    result: Schedule,
    stopped: bool,
}

impl<'a> Sequential<'a> {
    fn new(graph: &'a ResolvedGraph, ctx: &'a ExecContext<'a>) -> Self {
        Self {
            graph,
            ctx,
            runs: graph.documents.iter().map(|d| DocumentRun::new(&d.key)).collect(),
            result: Schedule {
                reports: graph.documents.iter().map(DocReport::new).collect(),
                errors: Vec::new(),
            },
            stopped: false,
        }
    }

    fn run(mut self) -> Schedule {
        let mut stack = Vec::new();
        for i in 0..self.graph.len() {
            if self.stopped {
                break;
            }
            self.ensure(i, &mut stack);
        }
        self.result
    }

    /// Builds document `i` after its inputs. Returns `true` when the
    /// document completed.
    fn ensure(&mut self, i: usize, stack: &mut Vec<String>) -> bool {
        match &self.result.reports[i].outcome {
            DocOutcome::Completed { .. } => return true,
            DocOutcome::NotRun => {}
            _ => return false,
        }
        if self.stopped {
            return false;
        }
        let (graph, ctx) = (self.graph, self.ctx);
        let doc = &graph.documents[i];

        if self.runs[i].state() != DocState::New {
            // Only reachable when a document is requested again while it is
            // still running.
            let err = self.runs[i]
                .transition(DocState::Running, stack)
                .err()
                .unwrap_or_else(|| EngineError::CircularDependency {
                    chain: stack.iter().cloned().chain([doc.key.clone()]).collect(),
                });
            self.fail(i, err);
            return false;
        }
        if let Err(e) = ctx.start(doc, &mut self.runs[i], stack) {
            self.fail(i, e);
            return false;
        }

        stack.push(doc.key.clone());
        let mut inputs = Vec::with_capacity(doc.inputs.len());
        let mut failed_input = None;
        for &j in &doc.inputs {
            if self.ensure(j, stack) {
                if let Some(artifact) = self.result.reports[j].final_artifact() {
                    inputs.push(artifact.clone());
                }
            } else if failed_input.is_none() {
                failed_input = Some(graph.documents[j].key.clone());
            }
        }
        stack.pop();

        if let Some(input) = failed_input {
            if !self.stopped {
                tracing::warn!(document = %doc.key, %input, "skipping document, input did not complete");
                self.result.reports[i].outcome = DocOutcome::Skipped { input };
            }
            return false;
        }

        let run = &mut self.runs[i];
        let outcome = ctx
            .run_chain(doc, run, &inputs)
            .and_then(|()| ctx.finish(doc, run));
        self.result.reports[i].artifacts = run.artifacts.clone();
        match outcome {
            Ok(()) => {
                self.result.reports[i].outcome = DocOutcome::Completed {
                    warning: run.warning.clone(),
                };
                true
            }
            Err(e) => {
                self.fail(i, e);
                false
            }
        }
    }

    fn fail(&mut self, i: usize, err: EngineError) {
        tracing::error!(document = %self.graph.documents[i].key, error = %err, "document failed");
        self.result.reports[i].outcome = DocOutcome::Failed(err.to_string());
        if stops_run(self.ctx.mode, &err) {
            self.stopped = true;
        }
        self.result.errors.push(err);
    }
}

/// A ready document handed to a worker along with its input artifacts.
struct Job {
    index: usize,
    inputs: Vec<Artifact>,
}

/// What a worker sends back.
struct JobResult {
    index: usize,
    run: DocumentRun,
    result: Result<(), EngineError>,
}

fn run_parallel(graph: &ResolvedGraph, ctx: &ExecContext<'_>, workers: usize) -> Schedule {
    let total = graph.len();
    let dependents = graph.dependents();
    let mut in_degree: Vec<usize> = graph.documents.iter().map(|d| d.inputs.len()).collect();
    let mut result = Schedule {
        reports: graph.documents.iter().map(DocReport::new).collect(),
        errors: Vec::new(),
    };
    let mut ready: Vec<usize> = (0..total).filter(|&i| in_degree[i] == 0).collect();

    let (job_tx, job_rx) = mpsc::channel::<Job>();
    let (result_tx, result_rx) = mpsc::channel::<JobResult>();
    let job_rx = Arc::new(Mutex::new(job_rx));

    std::thread::scope(|s| {
        for _ in 0..workers {
            let job_rx = Arc::clone(&job_rx);
            let result_tx = result_tx.clone();
            s.spawn(move || loop {
                let job = match job_rx.lock().unwrap_or_else(PoisonError::into_inner).recv() {
                    Ok(job) => job,
                    Err(_) => break,
                };
                let doc = &graph.documents[job.index];
                let mut run = DocumentRun::new(&doc.key);
                // Every job must answer, or the coordinator waits forever.
                let result = panic::catch_unwind(AssertUnwindSafe(|| ctx.execute(doc, &mut run, &job.inputs, &[])))
                    .unwrap_or_else(|cause| {
                        Err(EngineError::Internal(InternalError::new(format!(
                            "worker panicked while building {}: {}",
                            doc.key,
                            panic_message(cause.as_ref())
                        ))))
                    });
                let sent = result_tx.send(JobResult {
                    index: job.index,
                    run,
                    result,
                });
                if sent.is_err() {
                    break;
                }
            });
        }
        drop(result_tx);

        let mut in_flight = 0usize;
        let mut stopped = false;
        loop {
            if !stopped {
                for index in ready.drain(..) {
                    let inputs = graph.documents[index]
                        .inputs
                        .iter()
                        .filter_map(|&j| result.reports[j].final_artifact().cloned())
                        .collect();
                    if job_tx.send(Job { index, inputs }).is_ok() {
                        in_flight += 1;
                    }
                }
            }
            if in_flight == 0 {
                break;
            }
            let Ok(done) = result_rx.recv() else {
                break;
            };
            in_flight -= 1;

            let i = done.index;
            let report = &mut result.reports[i];
            report.artifacts = done.run.artifacts;
            match done.result {
                Ok(()) => {
                    report.outcome = DocOutcome::Completed {
                        warning: done.run.warning,
                    };
                    for &d in &dependents[i] {
                        in_degree[d] -= 1;
                        if in_degree[d] == 0 && result.reports[d].outcome == DocOutcome::NotRun {
                            ready.push(d);
                        }
                    }
                }
                Err(err) => {
                    tracing::error!(document = %graph.documents[i].key, error = %err, "document failed");
                    report.outcome = DocOutcome::Failed(err.to_string());
                    if stops_run(ctx.mode, &err) {
                        stopped = true;
                    } else {
                        skip_dependents(graph, &dependents, &mut result.reports, i);
                    }
                    result.errors.push(err);
                }
            }
        }
        drop(job_tx);
    });
    result
}

/// Marks everything downstream of the failed document `failed` as skipped.
fn skip_dependents(
    graph: &ResolvedGraph,
    dependents: &[Vec<usize>],
    reports: &mut [DocReport],
    failed: usize,
) {
    let input = graph.documents[failed].key.clone();
    let mut pending = dependents[failed].clone();
    while let Some(d) = pending.pop() {
        if reports[d].outcome != DocOutcome::NotRun {
            continue;
        }
        tracing::warn!(document = %graph.documents[d].key, %input, "skipping document, input did not complete");
        reports[d].outcome = DocOutcome::Skipped {
            input: input.clone(),
        };
        pending.extend(dependents[d].iter().copied());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{BuildLocks, Builder};
    use crate::document::DocumentHook;
    use crate::error::FilterError;
    use crate::filter::{Filter, FilterContext, FilterInfo, FilterMode};
    use crate::registry::FilterRegistry;
    use crate::source::SourceLoader;
    use quire_cache::{KvStore, MemoryKv, MemoryRunDb, Section, MAX_SECTIONS};
    use quire_config::DocParams;
    use quire_graph::SourceSpec;
    use std::time::Duration;

    /// Fails on any text containing "bad".
    struct Picky {
        info: FilterInfo,
    }

    impl Filter for Picky {
        fn info(&self) -> &FilterInfo {
            &self.info
        }

        fn process_text(&self, ctx: &FilterContext<'_>, input: &str) -> Result<String, FilterError> {
            if input.contains("bad") {
                return Err(FilterError::Failed {
                    alias: "picky".into(),
                    reason: "refusing bad input".into(),
                });
            }
            let deps: Vec<String> = ctx.inputs.iter().map(|a| a.payload.to_text()).collect();
            Ok(format!("{input}[{}]", deps.join(",")))
        }
    }

    /// Panics on every input.
    struct Boom {
        info: FilterInfo,
    }

    impl Filter for Boom {
        fn info(&self) -> &FilterInfo {
            &self.info
        }

        fn process_text(&self, _ctx: &FilterContext<'_>, _input: &str) -> Result<String, FilterError> {
            panic!("boom");
        }
    }

    /// Splits its input into more sections than a payload can hold.
    struct Many {
        info: FilterInfo,
    }

    impl Filter for Many {
        fn info(&self) -> &FilterInfo {
            &self.info
        }

        fn split_sections(&self, _ctx: &FilterContext<'_>, input: &str) -> Result<Vec<Section>, FilterError> {
            Ok((0..=MAX_SECTIONS).map(|i| Section::new(i.to_string(), input)).collect())
        }
    }

    /// Panics before the named document starts.
    struct PanickingHook(&'static str);

    impl DocumentHook for PanickingHook {
        fn before(&self, doc: &DocumentSpec) -> Result<(), EngineError> {
            if doc.name == self.0 {
                panic!("hook exploded");
            }
            Ok(())
        }
    }

    fn doc(name: &str, contents: &str, inputs: &[usize]) -> DocumentSpec {
        doc_with(name, contents, "picky", inputs)
    }

    fn doc_with(name: &str, contents: &str, filter: &str, inputs: &[usize]) -> DocumentSpec {
        let filters = vec![filter.to_string()];
        DocumentSpec {
            key: DocumentSpec::make_key(name, &filters),
            name: name.to_string(),
            filters,
            source: SourceSpec::Literal(contents.to_string()),
            params: DocParams::default(),
            input_keys: Vec::new(),
            inputs: inputs.to_vec(),
            is_virtual: true,
            use_all_inputs: false,
        }
    }

    /// a, b(bad), c <- a, d <- b, e <- d
    fn graph() -> ResolvedGraph {
        ResolvedGraph {
            documents: vec![
                doc("a.txt", "a", &[]),
                doc("b.txt", "bad", &[]),
                doc("c.txt", "c", &[0]),
                doc("d.txt", "d", &[1]),
                doc("e.txt", "e", &[3]),
            ],
            notes: Vec::new(),
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        store: KvStore<MemoryKv>,
        ledger: MemoryRunDb,
        locks: BuildLocks,
        registry: FilterRegistry,
        loader: SourceLoader,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut registry = FilterRegistry::new();
            registry
                .register(Arc::new(Picky {
                    info: FilterInfo::new("picky", FilterMode::TextToText),
                }))
                .unwrap();
            registry
                .register(Arc::new(Boom {
                    info: FilterInfo::new("boom", FilterMode::TextToText),
                }))
                .unwrap();
            registry
                .register(Arc::new(Many {
                    info: FilterInfo::new("many", FilterMode::TextToSections),
                }))
                .unwrap();
            let loader = SourceLoader::new(dir.path().join("remote"), false);
            Self {
                dir,
                store: KvStore::new(MemoryKv::new()),
                ledger: MemoryRunDb::new(),
                locks: BuildLocks::new(),
                registry,
                loader,
            }
        }

        fn run(&self, graph: &ResolvedGraph, mode: RunMode, workers: usize) -> Schedule {
            self.run_hooked(graph, mode, workers, &[])
        }

        fn run_hooked(
            &self,
            graph: &ResolvedGraph,
            mode: RunMode,
            workers: usize,
            hooks: &[Arc<dyn DocumentHook>],
        ) -> Schedule {
            let ctx = ExecContext {
                builder: Builder::new(&self.store, &self.ledger, &self.locks, 1, self.dir.path().join("work")),
                registry: &self.registry,
                loader: &self.loader,
                hooks,
                mode,
            };
            schedule(graph, &ctx, workers)
        }
    }

    /// Outcomes plus whether each error was always fatal.
    type Summary = (Vec<DocOutcome>, Vec<bool>);

    fn summarize(result: &Schedule) -> Summary {
        (
            result.reports.iter().map(|r| r.outcome.clone()).collect(),
            result.errors.iter().map(EngineError::is_always_fatal).collect(),
        )
    }

    /// Runs `f` on its own thread and fails the test if it does not return
    /// within `secs` seconds.
    fn within<T: Send + 'static>(secs: u64, f: impl FnOnce() -> T + Send + 'static) -> T {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(f());
        });
        rx.recv_timeout(Duration::from_secs(secs))
            .expect("schedule did not finish, coordinator is stuck")
    }

    fn outcomes(schedule: &Schedule) -> Vec<&DocOutcome> {
        schedule.reports.iter().map(|r| &r.outcome).collect()
    }

    #[test]
    fn continue_mode_skips_only_dependents() {
        for workers in [1, 3] {
            let fx = Fixture::new();
            let result = fx.run(&graph(), RunMode::Continue, workers);
            let o = outcomes(&result);
            assert!(o[0].is_completed(), "workers={workers}");
            assert!(matches!(o[1], DocOutcome::Failed(_)));
            assert!(o[2].is_completed());
            assert_eq!(o[3], &DocOutcome::Skipped { input: "b.txt|picky".into() });
            assert!(matches!(o[4], DocOutcome::Skipped { .. }));
            assert_eq!(result.errors.len(), 1);
            assert_eq!(
                result.reports[2].final_artifact().unwrap().payload.to_text(),
                "c[a[]]"
            );
        }
    }

    #[test]
    fn fail_fast_stops_after_first_failure() {
        let fx = Fixture::new();
        let result = fx.run(&graph(), RunMode::FailFast, 1);
        let o = outcomes(&result);
        assert!(o[0].is_completed());
        assert!(matches!(o[1], DocOutcome::Failed(_)));
        assert_eq!(o[2], &DocOutcome::NotRun);
        assert_eq!(o[4], &DocOutcome::NotRun);
        assert_eq!(result.errors.len(), 1);
    }

    #[test]
    fn ignore_errors_completes_with_partial_chain() {
        let fx = Fixture::new();
        let result = fx.run(&graph(), RunMode::IgnoreErrors, 2);
        assert!(result.errors.is_empty());
        let b = &result.reports[1];
        assert!(matches!(&b.outcome, DocOutcome::Completed { warning: Some(_) }));
        assert_eq!(b.artifacts.len(), 1);
        // d consumes the raw source of b.
        let d = result.reports[3].final_artifact().unwrap();
        assert_eq!(d.payload.to_text(), "d[bad]");
    }

    #[test]
    fn parallel_matches_sequential() {
        let good = ResolvedGraph {
            documents: vec![
                doc("a.txt", "a", &[]),
                doc("b.txt", "b", &[]),
                doc("c.txt", "c", &[0, 1]),
                doc("d.txt", "d", &[2, 0]),
            ],
            notes: Vec::new(),
        };
        let seq = Fixture::new().run(&good, RunMode::FailFast, 1);
        let par = Fixture::new().run(&good, RunMode::FailFast, 4);
        for (s, p) in seq.reports.iter().zip(&par.reports) {
            assert!(s.outcome.is_completed() && p.outcome.is_completed());
            let (s, p) = (s.final_artifact().unwrap(), p.final_artifact().unwrap());
            assert_eq!(s.fingerprint, p.fingerprint);
            assert_eq!(s.payload, p.payload);
        }
        assert_eq!(
            par.reports[3].final_artifact().unwrap().payload.to_text(),
            "d[c[a[],b[]],a[]]"
        );
    }

    #[test]
    fn unknown_filter_fails_the_document() {
        let fx = Fixture::new();
        let mut g = graph();
        g.documents.truncate(1);
        g.documents[0].filters = vec!["nope".into()];
        let result = fx.run(&g, RunMode::Continue, 1);
        assert!(matches!(result.errors[0], EngineError::UnknownFilter { .. }));
    }

    #[test]
    fn reentry_reports_the_call_chain() {
        let fx = Fixture::new();
        let ctx = ExecContext {
            builder: Builder::new(&fx.store, &fx.ledger, &fx.locks, 1, fx.dir.path().join("work")),
            registry: &fx.registry,
            loader: &fx.loader,
            hooks: &[],
            mode: RunMode::Continue,
        };
        // An input list that loops back, as a dependency the static graph
        // could not see would.
        let g = ResolvedGraph {
            documents: vec![doc("a.txt", "a", &[1]), doc("b.txt", "b", &[0])],
            notes: Vec::new(),
        };
        let result = Sequential::new(&g, &ctx).run();
        match &result.errors[0] {
            EngineError::CircularDependency { chain } => {
                assert_eq!(chain, &vec!["a.txt|picky", "b.txt|picky", "a.txt|picky"]);
            }
            other => panic!("expected circular dependency, got {other}"),
        }
    }

    #[test]
    fn panicking_filter_fails_only_its_document() {
        let (outcomes, fatal) = within(30, || {
            let fx = Fixture::new();
            let g = ResolvedGraph {
                documents: vec![
                    doc_with("a.txt", "a", "boom", &[]),
                    doc("b.txt", "b", &[]),
                    doc("c.txt", "c", &[]),
                    doc("d.txt", "d", &[0]),
                ],
                notes: Vec::new(),
            };
            summarize(&fx.run(&g, RunMode::Continue, 3))
        });
        match &outcomes[0] {
            DocOutcome::Failed(msg) => assert!(msg.contains("filter 'boom' panicked: boom"), "{msg}"),
            other => panic!("expected a failure, got {other:?}"),
        }
        assert!(outcomes[1].is_completed());
        assert!(outcomes[2].is_completed());
        assert_eq!(outcomes[3], DocOutcome::Skipped { input: "a.txt|boom".into() });
        assert_eq!(fatal, vec![false]);
    }

    #[test]
    fn panicking_filter_is_a_warning_when_ignoring_errors() {
        let (outcomes, fatal) = within(30, || {
            let fx = Fixture::new();
            let g = ResolvedGraph {
                documents: vec![doc_with("a.txt", "a", "boom", &[]), doc("b.txt", "b", &[])],
                notes: Vec::new(),
            };
            summarize(&fx.run(&g, RunMode::IgnoreErrors, 2))
        });
        assert!(matches!(&outcomes[0], DocOutcome::Completed { warning: Some(w) } if w.contains("panicked")));
        assert!(outcomes[1].is_completed());
        assert!(fatal.is_empty());
    }

    #[test]
    fn panic_outside_a_filter_stops_the_run_without_hanging() {
        let (outcomes, fatal) = within(30, || {
            let fx = Fixture::new();
            let g = ResolvedGraph {
                documents: vec![doc("a.txt", "a", &[]), doc("b.txt", "b", &[0])],
                notes: Vec::new(),
            };
            let hooks: Vec<Arc<dyn DocumentHook>> = vec![Arc::new(PanickingHook("a.txt"))];
            summarize(&fx.run_hooked(&g, RunMode::Continue, 2, &hooks))
        });
        match &outcomes[0] {
            DocOutcome::Failed(msg) => {
                assert!(msg.contains("worker panicked while building a.txt|picky: hook exploded"), "{msg}")
            }
            other => panic!("expected a failure, got {other:?}"),
        }
        assert_eq!(outcomes[1], DocOutcome::NotRun);
        assert_eq!(fatal, vec![true]);
    }

    #[test]
    fn internal_error_stops_a_continue_run() {
        for mode in [RunMode::Continue, RunMode::IgnoreErrors] {
            let fx = Fixture::new();
            let g = ResolvedGraph {
                documents: vec![doc_with("a.txt", "a", "many", &[]), doc("b.txt", "b", &[])],
                notes: Vec::new(),
            };
            let result = fx.run(&g, mode, 1);
            let (outcomes, fatal) = summarize(&result);
            match &outcomes[0] {
                DocOutcome::Failed(msg) => assert!(msg.contains("exceed the limit"), "{msg}"),
                other => panic!("expected a failure, got {other:?}"),
            }
            assert_eq!(outcomes[1], DocOutcome::NotRun, "{mode:?}");
            assert_eq!(fatal, vec![true]);
        }
    }
}
