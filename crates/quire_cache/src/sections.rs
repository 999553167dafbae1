//! Encoding of ordered section lists as JSON objects.
//!
//! JSON objects carry no ordering guarantee, so each key is prefixed with a
//! zero-padded index (`0000:intro`, `0001:body`). Decoding sorts by key and
//! strips the prefix, which restores the original order exactly.

use quire_common::InternalError;
use serde_json::{Map, Value};

use crate::error::CacheError;
use crate::payload::Section;

/// Largest number of sections a single payload can hold.
pub const MAX_SECTIONS: usize = 9999;

/// Encodes sections as an index-prefixed JSON object.
///
/// More than [`MAX_SECTIONS`] sections is an internal error; the list is
/// never truncated.
pub fn encode_sections(sections: &[Section]) -> Result<String, InternalError> {
    if sections.len() > MAX_SECTIONS {
        return Err(InternalError::new(format!(
            "{} sections exceed the limit of {MAX_SECTIONS}",
            sections.len()
        )));
    }
    let mut map = Map::new();
    for (i, section) in sections.iter().enumerate() {
        map.insert(
            format!("{i:04}:{}", section.name),
            Value::String(section.value.clone()),
        );
    }
    serde_json::to_string(&Value::Object(map))
        .map_err(|e| InternalError::new(format!("failed to encode sections: {e}")))
}

/// Decodes an object produced by [`encode_sections`].
pub fn decode_sections(json: &str) -> Result<Vec<Section>, CacheError> {
    let map: Map<String, Value> =
        serde_json::from_str(json).map_err(|e| CacheError::Serialization {
            reason: format!("invalid section JSON: {e}"),
        })?;

    let mut keyed = Vec::with_capacity(map.len());
    for (key, value) in map {
        let (index, name) = key
            .split_once(':')
            .filter(|(index, _)| index.len() == 4 && index.bytes().all(|b| b.is_ascii_digit()))
            .ok_or_else(|| CacheError::Serialization {
                reason: format!("section key '{key}' has no index prefix"),
            })?;
        let Value::String(text) = value else {
            return Err(CacheError::Serialization {
                reason: format!("section '{name}' is not a string"),
            });
        };
        keyed.push((index.to_string(), Section::new(name, text)));
    }
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(keyed.into_iter().map(|(_, section)| section).collect())
}
