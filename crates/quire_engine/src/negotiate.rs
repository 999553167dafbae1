//! Choosing the extension each step of a filter chain produces.
//!
//! Runs before any filter of the chain so an impossible chain fails without
//! doing work.

use crate::error::EngineError;
use crate::filter::FilterInfo;

/// Returns the output extension of every filter in `chain`, in order.
///
/// For each filter: the incoming extension must be accepted; a wildcard
/// output keeps the incoming extension; otherwise the first output the next
/// filter accepts is chosen when that filter is picky, and the filter's
/// first output when it is not (or when there is no next filter).
pub fn negotiate(
    document_key: &str,
    source_ext: &str,
    chain: &[&FilterInfo],
) -> Result<Vec<String>, EngineError> {
    let mut exts = Vec::with_capacity(chain.len());
    let mut current = source_ext.to_string();

    for (i, filter) in chain.iter().enumerate() {
        if !filter.accepts(&current) {
            return Err(EngineError::IncompatibleExtension {
                document: document_key.to_string(),
                filter: filter.alias.clone(),
                ext: current,
                accepted: filter.input_extensions.clone(),
            });
        }

        let next = chain.get(i + 1).filter(|next| !next.accepts_anything());
        current = if filter.keeps_extension() {
            current
        } else if let Some(next) = next {
            match filter.output_extensions.iter().find(|ext| next.accepts(ext)) {
                Some(ext) => ext.clone(),
                None => {
                    return Err(EngineError::NoCommonExtension {
                        document: document_key.to_string(),
                        filter: filter.alias.clone(),
                        next: next.alias.clone(),
                        outputs: filter.output_extensions.clone(),
                        accepted: next.input_extensions.clone(),
                    })
                }
            }
        } else {
            match filter.output_extensions.first() {
                Some(ext) => ext.clone(),
                None => current,
            }
        };
        exts.push(current.clone());
    }
    Ok(exts)
}
