//! Runtime execution of one document: the state machine and its filter chain.
//!
//! A document moves `new → setup → running → complete`. Setup runs the
//! pre-hooks, running builds the source step and then every filter in
//! order, complete runs the post-hooks. Entering `running` again while the
//! document is already running means the build re-entered it through a
//! dependency, which is reported as a circular dependency with the call
//! chain that led there.

use std::fmt;
use std::sync::Arc;

use quire_config::RunMode;
use quire_graph::DocumentSpec;

use crate::artifact::Artifact;
use crate::build::Builder;
use crate::error::EngineError;
use crate::filter::{Filter, FilterInfo};
use crate::negotiate::negotiate;
use crate::registry::FilterRegistry;
use crate::source::SourceLoader;

/// Lifecycle state of a document within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocState {
    /// Not started.
    New,
    /// Pre-hooks are running.
    Setup,
    /// The filter chain is running.
    Running,
    /// Every step is built and post-hooks have run.
    Complete,
}

impl fmt::Display for DocState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Setup => "setup",
            Self::Running => "running",
            Self::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// Observer called around each document's chain.
///
/// Hooks see documents and artifacts through shared references only.
pub trait DocumentHook: Send + Sync {
    /// Called while the document is in `setup`.
    fn before(&self, _doc: &DocumentSpec) -> Result<(), EngineError> {
        Ok(())
    }

    /// Called once the document is `complete`.
    fn after(&self, _doc: &DocumentSpec, _artifacts: &[Artifact]) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Runtime state of one document.
#[derive(Debug, Clone)]
pub struct DocumentRun {
    key: String,
    state: DocState,
    /// Artifacts built so far, source step first.
    pub artifacts: Vec<Artifact>,
    /// Set when `ignore-errors` swallowed a filter failure.
    pub warning: Option<String>,
}

impl DocumentRun {
    /// Creates a run in state `new`.
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            state: DocState::New,
            artifacts: Vec::new(),
            warning: None,
        }
    }

    /// The document key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current state.
    pub fn state(&self) -> DocState {
        self.state
    }

    /// The last artifact of the chain.
    pub fn final_artifact(&self) -> Option<&Artifact> {
        self.artifacts.last()
    }

    /// Moves to `to`. `call_stack` holds the keys of the documents whose
    /// builds led here and is only used to describe a re-entry.
    pub fn transition(&mut self, to: DocState, call_stack: &[String]) -> Result<(), EngineError> {
        use DocState::*;
        match (self.state, to) {
            (New, Setup) | (Setup, Running) | (Running, Complete) => {
                tracing::trace!(document = %self.key, from = %self.state, %to, "state change");
                self.state = to;
                Ok(())
            }
            (Running, Running) => {
                let mut chain = call_stack.to_vec();
                chain.push(self.key.clone());
                Err(EngineError::CircularDependency { chain })
            }
            (from, to) => Err(EngineError::InvalidStateTransition {
                document: self.key.clone(),
                from,
                to,
            }),
        }
    }
}

/// Everything a worker needs to execute documents in one batch.
pub struct ExecContext<'a> {
    /// Step builder bound to this batch.
    pub builder: Builder<'a>,
    /// Filters by alias.
    pub registry: &'a FilterRegistry,
    /// Run-scoped source reader.
    pub loader: &'a SourceLoader,
    /// Hooks around every document.
    pub hooks: &'a [Arc<dyn DocumentHook>],
    /// Failure handling.
    pub mode: RunMode,
}

impl ExecContext<'_> {
    /// `new → setup → running`, running pre-hooks in between.
    pub fn start(
        &self,
        doc: &DocumentSpec,
        run: &mut DocumentRun,
        call_stack: &[String],
    ) -> Result<(), EngineError> {
        run.transition(DocState::Setup, call_stack)?;
        for hook in self.hooks {
            hook.before(doc)?;
        }
        run.transition(DocState::Running, call_stack)
    }

    /// Builds the source step and every filter step. `inputs` holds the final
    /// artifact of each input document in declared order.
    ///
    /// In `ignore-errors` mode a filter failure is logged and the chain stops
    /// with the artifacts built so far; every other failure is returned.
    pub fn run_chain(
        &self,
        doc: &DocumentSpec,
        run: &mut DocumentRun,
        inputs: &[Artifact],
    ) -> Result<(), EngineError> {
        let filters: Vec<Arc<dyn Filter>> = doc
            .filters
            .iter()
            .map(|alias| {
                self.registry.get(alias).ok_or_else(|| EngineError::UnknownFilter {
                    document: doc.key.clone(),
                    alias: alias.clone(),
                })
            })
            .collect::<Result<_, _>>()?;
        let infos: Vec<&FilterInfo> = filters.iter().map(|f| f.info()).collect();
        let source_ext = doc.source_ext();
        let exts = negotiate(&doc.key, &source_ext, &infos)?;

        let source = self.builder.build_source(doc, self.loader, &source_ext)?;
        run.artifacts.push(source);

        for (i, (filter, ext)) in filters.iter().zip(&exts).enumerate() {
            let Some(prev) = run.artifacts.last() else {
                break;
            };
            match self
                .builder
                .build_filter_step(doc, i + 1, filter.as_ref(), ext, prev, inputs)
            {
                Ok(artifact) => run.artifacts.push(artifact),
                Err(e) if self.mode == RunMode::IgnoreErrors && e.is_filter_failure() => {
                    tracing::warn!(document = %doc.key, error = %e, "ignoring filter failure");
                    run.warning = Some(e.to_string());
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// `running → complete`, then post-hooks.
    pub fn finish(&self, doc: &DocumentSpec, run: &mut DocumentRun) -> Result<(), EngineError> {
        run.transition(DocState::Complete, &[])?;
        for hook in self.hooks {
            hook.after(doc, &run.artifacts)?;
        }
        Ok(())
    }

    /// Runs a document whose inputs are already complete, start to finish.
    pub fn execute(
        &self,
        doc: &DocumentSpec,
        run: &mut DocumentRun,
        inputs: &[Artifact],
        call_stack: &[String],
    ) -> Result<(), EngineError> {
        self.start(doc, run, call_stack)?;
        self.run_chain(doc, run, inputs)?;
        self.finish(doc, run)
    }
}
