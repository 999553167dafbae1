//! The Quire execution engine.
//!
//! Takes the ordered graph produced by `quire_graph`, runs every document's
//! filter chain against a content-addressed artifact store, and records each
//! step in the run ledger. A step whose fingerprint is already stored is
//! loaded instead of rebuilt; concurrent builds of one fingerprint are
//! collapsed into a single filter invocation.
//!
//! The entry point is [`Controller`]:
//!
//! ```no_run
//! use quire_engine::{Controller, RunOptions};
//!
//! let controller = Controller::open_project(std::path::Path::new("."))?;
//! let report = controller.run(&RunOptions::default())?;
//! println!("batch {} finished", report.batch_id);
//! # Ok::<(), quire_engine::EngineError>(())
//! ```

#![warn(missing_docs)]

pub mod artifact;
pub mod build;
pub mod builtin;
pub mod controller;
pub mod document;
pub mod error;
pub mod filter;
pub mod negotiate;
pub mod registry;
pub mod report;
pub mod scheduler;
pub mod source;

pub use artifact::Artifact;
pub use build::{declared_args, BuildLocks, Builder, StepIdentity};
pub use builtin::{builtin_filters, CommandFilter, DexyFilter, JoinFilter, SectionsFilter};
pub use controller::{Controller, RunOptions};
pub use document::{DocState, DocumentHook, DocumentRun, ExecContext};
pub use error::{EngineError, FilterError};
pub use filter::{apply, Filter, FilterContext, FilterInfo, FilterMode, WILDCARD_EXT};
pub use negotiate::negotiate;
pub use registry::FilterRegistry;
pub use report::{BatchInfoReporter, BatchReport, OutputReporter, Reporter};
pub use scheduler::{schedule, DocOutcome, DocReport, Schedule};
pub use source::{LoadedSource, SourceLoader};
