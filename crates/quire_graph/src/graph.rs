//! The ordered result of resolution.

use std::collections::BTreeSet;

use crate::document::DocumentSpec;
use crate::error::GraphError;

/// Documents in dependency order plus notes about skipped entries.
#[derive(Debug, Clone, Default)]
pub struct ResolvedGraph {
    /// Every document after all of its inputs.
    pub documents: Vec<DocumentSpec>,
    /// Human-readable notes (disabled or excluded entries).
    pub notes: Vec<String>,
}

impl ResolvedGraph {
    /// Number of documents.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Returns `true` if there are no documents.
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Index of the document with `key`.
    pub fn find(&self, key: &str) -> Option<usize> {
        self.documents.iter().position(|d| d.key == key)
    }

    /// For each document, the indices of documents that list it as an input.
    pub fn dependents(&self) -> Vec<Vec<usize>> {
        let mut dependents = vec![Vec::new(); self.documents.len()];
        for (i, doc) in self.documents.iter().enumerate() {
            for &input in &doc.inputs {
                dependents[input].push(i);
            }
        }
        dependents
    }

    /// Restricts the graph to documents matching `targets` and everything
    /// they transitively depend on.
    ///
    /// A target matches a document whose key equals it exactly; failing
    /// that, every document whose key or name starts with it.
    pub fn select(&self, targets: &[String]) -> Result<ResolvedGraph, GraphError> {
        let mut wanted = BTreeSet::new();
        for target in targets {
            let exact = self.find(target);
            let matched: Vec<usize> = match exact {
                Some(i) => vec![i],
                None => self
                    .documents
                    .iter()
                    .enumerate()
                    .filter(|(_, d)| d.key.starts_with(target.as_str()) || d.name.starts_with(target.as_str()))
                    .map(|(i, _)| i)
                    .collect(),
            };
            if matched.is_empty() {
                return Err(GraphError::UnknownTarget(target.clone()));
            }
            let mut stack = matched;
            while let Some(i) = stack.pop() {
                if wanted.insert(i) {
                    stack.extend(self.documents[i].inputs.iter().copied());
                }
            }
        }

        let mut new_index = vec![usize::MAX; self.documents.len()];
        for (new, &old) in wanted.iter().enumerate() {
            new_index[old] = new;
        }
        let documents = wanted
            .iter()
            .map(|&old| {
                let mut doc = self.documents[old].clone();
                doc.inputs = doc.inputs.iter().map(|&i| new_index[i]).collect();
                doc
            })
            .collect();
        Ok(ResolvedGraph {
            documents,
            notes: self.notes.clone(),
        })
    }
}
