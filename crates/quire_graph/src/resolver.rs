//! Expansion of config entries into documents, then linking and ordering.

use std::collections::HashMap;
use std::path::PathBuf;

use indexmap::IndexMap;
use quire_config::{ConfigError, ConfigTree, DocParams};
use regex::Regex;

use crate::document::{DocumentSpec, SourceSpec};
use crate::error::GraphError;
use crate::graph::ResolvedGraph;
use crate::pattern::{join_dir, parse_pattern, EntryPattern, FileMatcher};
use crate::toposort::topological_order;

/// Switches that change what the resolver accepts.
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Permit virtual documents that are fetched from a URL.
    pub allow_remote: bool,
}

/// Resolves every entry of `tree` into an ordered graph.
///
/// Entries are processed directory by directory in declaration order.
/// Documents named in `inputs` or matched by `ifinput` are created on the
/// spot when no entry declared them yet; a later entry with arguments for the
/// same key replaces the arguments, while an entry without arguments never
/// does. Input keys are linked only after every entry has been processed, so
/// forward references work.
pub fn resolve(tree: &ConfigTree, options: &ResolveOptions) -> Result<ResolvedGraph, GraphError> {
    let mut resolver = Resolver::new(tree.root.clone(), options);
    for dir in &tree.dirs {
        for (pattern, entry) in &dir.entries {
            let params = DocParams::from_entry(pattern, entry, &dir.globals)?;
            resolver.parse_doc(&dir.path, pattern, params)?;
        }
    }
    resolver.finish()
}

struct Resolver<'a> {
    root: PathBuf,
    options: &'a ResolveOptions,
    members: IndexMap<String, DocumentSpec>,
    listings: HashMap<String, Vec<String>>,
    notes: Vec<String>,
}

impl<'a> Resolver<'a> {
    fn new(root: PathBuf, options: &'a ResolveOptions) -> Self {
        Self {
            root,
            options,
            members: IndexMap::new(),
            listings: HashMap::new(),
            notes: Vec::new(),
        }
    }

    /// Sorted names of the regular files directly inside `dir`.
    fn list_files(&mut self, dir: &str) -> Result<Vec<String>, GraphError> {
        if let Some(files) = self.listings.get(dir) {
            return Ok(files.clone());
        }
        let path = if dir == "." {
            self.root.clone()
        } else {
            self.root.join(dir)
        };
        let mut files = Vec::new();
        match std::fs::read_dir(&path) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry.map_err(|e| GraphError::Io {
                        path: path.clone(),
                        source: e,
                    })?;
                    if entry.path().is_file() {
                        files.push(entry.file_name().to_string_lossy().into_owned());
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(GraphError::Io { path, source: e }),
        }
        files.sort();
        self.listings.insert(dir.to_string(), files.clone());
        Ok(files)
    }

    /// `(name, file_name)` pairs a pattern expands to.
    fn candidates(
        &mut self,
        dir: &str,
        pattern: &EntryPattern,
        matcher: &FileMatcher,
    ) -> Result<Vec<(String, String)>, GraphError> {
        if pattern.is_virtual {
            return Ok(vec![(join_dir(dir, &pattern.token), pattern.token.clone())]);
        }
        Ok(self
            .list_files(dir)?
            .into_iter()
            .filter(|f| matcher.is_match(f))
            .map(|f| (join_dir(dir, &f), f))
            .collect())
    }

    /// Returns `true` if `directive` would produce at least one document.
    /// Creates nothing.
    fn would_match(&mut self, dir: &str, directive: &str) -> Result<bool, GraphError> {
        let pattern = parse_pattern(directive)?;
        if pattern.is_virtual {
            let name = join_dir(dir, &pattern.token);
            return Ok(self
                .members
                .contains_key(&DocumentSpec::make_key(&name, &pattern.filters)));
        }
        let matcher = FileMatcher::new(&pattern.token)?;
        Ok(!self.candidates(dir, &pattern, &matcher)?.is_empty())
    }

    fn parse_doc(
        &mut self,
        dir: &str,
        directive: &str,
        params: DocParams,
    ) -> Result<Vec<String>, GraphError> {
        let mut pattern = parse_pattern(directive)?;
        let mut filters = pattern.filters.clone();
        filters.extend(params.filters.iter().cloned());
        if !pattern.is_virtual
            && is_plain_name(&pattern.token)
            && !self.list_files(dir)?.contains(&pattern.token)
        {
            // Literal contents under a plain name stand in for a missing
            // file, and later references by that name find the document.
            let key = DocumentSpec::make_key(&join_dir(dir, &pattern.token), &filters);
            if params.contents.is_some() || self.members.contains_key(&key) {
                pattern.is_virtual = true;
            }
        }
        let matcher = FileMatcher::new(&pattern.token)?;

        if pattern.is_virtual {
            let name = join_dir(dir, &pattern.token);
            let key = DocumentSpec::make_key(&name, &filters);
            if params.is_blank() && self.members.contains_key(&key) {
                return Ok(vec![key]);
            }
            if params.contents.is_none() {
                if params.url.is_none() {
                    return Err(GraphError::InvalidPattern {
                        pattern: directive.to_string(),
                        reason: "virtual documents need contents or a url".to_string(),
                    });
                }
                if !self.options.allow_remote {
                    return Err(GraphError::RemoteNotAllowed { name });
                }
            }
        }

        let except = params
            .except
            .as_deref()
            .map(|ex| {
                Regex::new(&format!("^(?:{ex})")).map_err(|e| {
                    GraphError::Config(ConfigError::InvalidEntry {
                        pattern: directive.to_string(),
                        reason: format!(
                            "except '{ex}' is not a valid regular expression (not a glob): {e}"
                        ),
                    })
                })
            })
            .transpose()?;

        let mut keys = Vec::new();
        for (name, file_name) in self.candidates(dir, &pattern, &matcher)? {
            let key = DocumentSpec::make_key(&name, &filters);
            let mut create = true;

            if params.disabled {
                create = false;
                self.notes.push(format!("document {key} disabled"));
            }

            let mut input_keys = Vec::new();
            for input in &params.inputs {
                let nested = match &input.params {
                    Some(map) => DocParams::from_map(&input.pattern, map.clone())?,
                    None => DocParams::default(),
                };
                input_keys.extend(self.parse_doc(dir, &input.pattern, nested)?);
            }

            let rootname = matcher.rootname(&file_name);
            if !params.ifinput.is_empty() {
                let mut found = 0;
                for conditional in &params.ifinput {
                    let directive = conditional.replace('%', &rootname);
                    let docs = self.parse_doc(dir, &directive, DocParams::default())?;
                    found += docs.len();
                    input_keys.extend(docs);
                }
                if found == 0 {
                    create = false;
                }
            }

            if let Some(conditional) = &params.ifnoinput {
                let directive = conditional.replace('%', &rootname);
                if self.would_match(dir, &directive)? {
                    create = false;
                }
            }

            if let Some(except) = &except {
                if except.is_match(&name) {
                    create = false;
                    self.notes.push(format!(
                        "skipping {name} for {directive}: matches except pattern"
                    ));
                }
            }

            if create {
                self.register(key.clone(), name, &filters, pattern.is_virtual, &params, input_keys);
                keys.push(key);
            }
        }
        Ok(keys)
    }

    fn register(
        &mut self,
        key: String,
        name: String,
        filters: &[String],
        is_virtual: bool,
        params: &DocParams,
        input_keys: Vec<String>,
    ) {
        let source = match (is_virtual, &params.contents, &params.url) {
            (true, Some(contents), _) => SourceSpec::Literal(contents.clone()),
            (true, None, Some(url)) => SourceSpec::Url(url.clone()),
            _ => SourceSpec::File(self.root.join(&name)),
        };

        if let Some(existing) = self.members.get_mut(&key) {
            if params.is_blank() {
                return;
            }
            tracing::debug!(document = %key, "arguments replaced by later entry");
            existing.params = params.clone();
            existing.use_all_inputs = params.allinputs;
            existing.source = source;
            for input in input_keys {
                if !existing.input_keys.contains(&input) {
                    existing.input_keys.push(input);
                }
            }
            return;
        }

        let mut deduped: Vec<String> = Vec::with_capacity(input_keys.len());
        for input in input_keys {
            if !deduped.contains(&input) {
                deduped.push(input);
            }
        }
        tracing::debug!(document = %key, "creating document");
        self.members.insert(
            key.clone(),
            DocumentSpec {
                key,
                name,
                filters: filters.to_vec(),
                source,
                params: params.clone(),
                input_keys: deduped,
                inputs: Vec::new(),
                is_virtual,
                use_all_inputs: params.allinputs,
            },
        );
    }

    fn finish(self) -> Result<ResolvedGraph, GraphError> {
        let mut documents: Vec<DocumentSpec> = self.members.into_values().collect();
        let index: HashMap<String, usize> = documents
            .iter()
            .enumerate()
            .map(|(i, d)| (d.key.clone(), i))
            .collect();

        let mut edges = Vec::new();
        for i in 0..documents.len() {
            let inputs: Vec<usize> = if documents[i].use_all_inputs {
                (0..documents.len())
                    .filter(|&j| j != i && !documents[j].use_all_inputs)
                    .collect()
            } else {
                documents[i]
                    .input_keys
                    .iter()
                    .map(|k| {
                        index.get(k).copied().ok_or_else(|| GraphError::UnknownInput {
                            document: documents[i].key.clone(),
                            input: k.clone(),
                        })
                    })
                    .collect::<Result<_, _>>()?
            };
            edges.extend(inputs.iter().map(|&j| (j, i)));
            documents[i].inputs = inputs;
        }

        let order = topological_order(documents.len(), &edges).map_err(|cycle| {
            GraphError::Cycle {
                chain: cycle.iter().map(|&i| documents[i].key.clone()).collect(),
            }
        })?;

        let mut position = vec![0; documents.len()];
        for (new, &old) in order.iter().enumerate() {
            position[old] = new;
        }
        let mut slots: Vec<Option<DocumentSpec>> = documents.into_iter().map(Some).collect();
        let mut ordered = Vec::with_capacity(slots.len());
        for &old in &order {
            if let Some(mut doc) = slots[old].take() {
                doc.inputs = doc.inputs.iter().map(|&j| position[j]).collect();
                ordered.push(doc);
            }
        }

        tracing::debug!(documents = ordered.len(), "resolved document graph");
        Ok(ResolvedGraph {
            documents: ordered,
            notes: self.notes,
        })
    }
}

/// Returns `true` if `token` contains no glob syntax.
fn is_plain_name(token: &str) -> bool {
    !token.contains(['*', '?', '[', '{'])
}
