//! The filter contract.
//!
//! A filter turns the payload of one build step into the payload of the next.
//! It declares which extensions it accepts and produces, a version that is
//! mixed into fingerprints, and a [`FilterMode`] describing the payload
//! shapes on each side. The engine dispatches on the mode; a filter only
//! implements the processing method its mode needs.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::time::Duration;

use quire_cache::{Payload, Section};
use serde_json::Value;

use crate::artifact::Artifact;
use crate::error::FilterError;

/// Extension that matches anything.
pub const WILDCARD_EXT: &str = ".*";

/// Payload shapes a filter consumes and produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    /// Text in, text out. Sectioned input is flattened first.
    TextToText,
    /// Text in, sections out.
    TextToSections,
    /// Sections in, sections out. Flat text arrives as one section named `1`.
    SectionsToSections,
    /// The payload is passed through untouched.
    Passthrough,
}

/// Static description of a filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterInfo {
    /// Alias used in document keys.
    pub alias: String,
    /// Version identifier mixed into fingerprints.
    pub version: String,
    /// Accepted input extensions; `.*` accepts anything.
    pub input_extensions: Vec<String>,
    /// Output extensions in order of preference; `.*` keeps the input's.
    pub output_extensions: Vec<String>,
    /// Processing mode.
    pub mode: FilterMode,
    /// Timeout for filters that run external processes.
    pub timeout: Option<Duration>,
}

impl FilterInfo {
    /// Creates a description accepting and producing any extension.
    pub fn new(alias: &str, mode: FilterMode) -> Self {
        Self {
            alias: alias.to_string(),
            version: "1".to_string(),
            input_extensions: vec![WILDCARD_EXT.to_string()],
            output_extensions: vec![WILDCARD_EXT.to_string()],
            mode,
            timeout: None,
        }
    }

    /// Replaces the accepted input extensions.
    pub fn inputs(mut self, exts: &[&str]) -> Self {
        self.input_extensions = exts.iter().map(|e| e.to_string()).collect();
        self
    }

    /// Replaces the output extensions.
    pub fn outputs(mut self, exts: &[&str]) -> Self {
        self.output_extensions = exts.iter().map(|e| e.to_string()).collect();
        self
    }

    /// Returns `true` if `ext` is an accepted input.
    pub fn accepts(&self, ext: &str) -> bool {
        self.accepts_anything() || self.input_extensions.iter().any(|e| e == ext)
    }

    /// Returns `true` if the filter declares a wildcard input.
    pub fn accepts_anything(&self) -> bool {
        self.input_extensions.iter().any(|e| e == WILDCARD_EXT)
    }

    /// Returns `true` if the filter declares a wildcard output.
    pub fn keeps_extension(&self) -> bool {
        self.output_extensions.iter().any(|e| e == WILDCARD_EXT)
    }
}

/// Everything a filter may look at besides its input payload.
#[derive(Debug, Clone)]
pub struct FilterContext<'a> {
    /// Key of the document being built.
    pub document_key: &'a str,
    /// Key of the artifact being produced.
    pub artifact_key: &'a str,
    /// Extension of the input payload.
    pub input_ext: &'a str,
    /// Extension the output will carry.
    pub output_ext: &'a str,
    /// The argument block keyed by this filter's alias, if declared.
    pub args: Option<&'a Value>,
    /// Scratch directory for this step. Left in place when the step fails.
    pub work_dir: PathBuf,
    /// Final artifacts of the document's inputs, in declared order.
    pub inputs: &'a [Artifact],
}

/// A content transformation applied to one build step.
pub trait Filter: Send + Sync {
    /// Static description.
    fn info(&self) -> &FilterInfo;

    /// Processes text for [`FilterMode::TextToText`].
    fn process_text(&self, _ctx: &FilterContext<'_>, _input: &str) -> Result<String, FilterError> {
        Err(self.unsupported(quire_cache::PayloadKind::Text))
    }

    /// Splits text into sections for [`FilterMode::TextToSections`].
    fn split_sections(
        &self,
        _ctx: &FilterContext<'_>,
        _input: &str,
    ) -> Result<Vec<Section>, FilterError> {
        Err(self.unsupported(quire_cache::PayloadKind::Text))
    }

    /// Transforms sections for [`FilterMode::SectionsToSections`].
    fn process_sections(
        &self,
        _ctx: &FilterContext<'_>,
        _input: &[Section],
    ) -> Result<Vec<Section>, FilterError> {
        Err(self.unsupported(quire_cache::PayloadKind::Sections))
    }

    /// Builds the error for a payload this filter cannot consume.
    fn unsupported(&self, kind: quire_cache::PayloadKind) -> FilterError {
        FilterError::Unsupported {
            alias: self.info().alias.clone(),
            kind,
        }
    }
}

/// Runs `filter` on `payload` according to its mode.
///
/// A panic inside the filter is caught and reported as
/// [`FilterError::Panicked`], so it fails the step like any other filter
/// error instead of unwinding through the engine.
pub fn apply(
    filter: &dyn Filter,
    ctx: &FilterContext<'_>,
    payload: &Payload,
) -> Result<Payload, FilterError> {
    panic::catch_unwind(AssertUnwindSafe(|| dispatch(filter, ctx, payload))).unwrap_or_else(|cause| {
        let message = panic_message(cause.as_ref());
        tracing::error!(filter = %filter.info().alias, document = ctx.document_key, %message, "filter panicked");
        Err(FilterError::Panicked {
            alias: filter.info().alias.clone(),
            message,
        })
    })
}

/// Renders a caught panic payload.
pub(crate) fn panic_message(cause: &(dyn Any + Send)) -> String {
    if let Some(s) = cause.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn dispatch(filter: &dyn Filter, ctx: &FilterContext<'_>, payload: &Payload) -> Result<Payload, FilterError> {
    match filter.info().mode {
        FilterMode::Passthrough => Ok(payload.clone()),
        FilterMode::TextToText => {
            let text = text_input(filter, payload)?;
            filter.process_text(ctx, &text).map(Payload::Text)
        }
        FilterMode::TextToSections => {
            let text = text_input(filter, payload)?;
            filter.split_sections(ctx, &text).map(Payload::Sections)
        }
        FilterMode::SectionsToSections => {
            let sections = match payload {
                Payload::Sections(sections) => sections.clone(),
                Payload::Text(text) => vec![Section::new("1", text.clone())],
                Payload::Bytes(_) => return Err(filter.unsupported(payload.kind())),
            };
            filter.process_sections(ctx, &sections).map(Payload::Sections)
        }
    }
}

fn text_input(filter: &dyn Filter, payload: &Payload) -> Result<String, FilterError> {
    match payload {
        Payload::Text(text) => Ok(text.clone()),
        Payload::Sections(_) => Ok(payload.to_text()),
        Payload::Bytes(_) => Err(filter.unsupported(payload.kind())),
    }
}
