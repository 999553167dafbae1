//! Static description of a document: what to read and which filters to apply.

use std::path::PathBuf;

use quire_config::DocParams;

/// Where a document's raw content comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    /// A file on disk.
    File(PathBuf),
    /// Literal `contents` from the config entry.
    Literal(String),
    /// A remote resource.
    Url(String),
}

/// One resolved document.
///
/// Immutable once the resolver returns. `inputs` holds indices into the
/// owning [`ResolvedGraph`](crate::ResolvedGraph), each smaller than the
/// document's own index.
#[derive(Debug, Clone)]
pub struct DocumentSpec {
    /// Unique key: the name followed by each filter alias, joined with `|`.
    pub key: String,
    /// Path relative to the project root, `/`-separated.
    pub name: String,
    /// Filter aliases in application order.
    pub filters: Vec<String>,
    /// Raw content source.
    pub source: SourceSpec,
    /// Merged entry parameters.
    pub params: DocParams,
    /// Keys of declared inputs, in declaration order.
    pub input_keys: Vec<String>,
    /// Resolved input indices, in declaration order.
    pub inputs: Vec<usize>,
    /// Declared with a leading `@`: no backing file.
    pub is_virtual: bool,
    /// Depends on every document that does not itself use `allinputs`.
    pub use_all_inputs: bool,
}

impl DocumentSpec {
    /// Builds the key for `name` with `filters`.
    pub fn make_key(name: &str, filters: &[String]) -> String {
        if filters.is_empty() {
            name.to_string()
        } else {
            format!("{name}|{}", filters.join("|"))
        }
    }

    /// Key of the artifact after `step` filters have been applied. Step 0 is
    /// the raw source and is keyed by the bare name.
    pub fn artifact_key(&self, step: usize) -> String {
        Self::make_key(&self.name, &self.filters[..step.min(self.filters.len())])
    }

    /// Extension of the source name including the leading dot, or an empty
    /// string when the name has none.
    pub fn source_ext(&self) -> String {
        let file_name = self.name.rsplit('/').next().unwrap_or(&self.name);
        match file_name.rfind('.') {
            Some(0) | None => String::new(),
            Some(i) => file_name[i..].to_string(),
        }
    }

    /// Private documents are built and cached but left out of default output.
    /// A document is private when its file name starts with `_`.
    pub fn is_private(&self) -> bool {
        self.name
            .rsplit('/')
            .next()
            .is_some_and(|file_name| file_name.starts_with('_'))
    }
}
