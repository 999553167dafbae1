//! The output of one build step.

use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::sections::{decode_sections, encode_sections};

/// One named section of a sectioned payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    /// Section name, unique within its payload.
    pub name: String,
    /// Section text.
    pub value: String,
}

impl Section {
    /// Creates a section.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A step output: flat text, flat bytes, or an ordered list of sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// UTF-8 text.
    Text(String),
    /// Arbitrary bytes (binary sources such as images).
    Bytes(Vec<u8>),
    /// Named sections in document order.
    Sections(Vec<Section>),
}

/// Shape tag of a [`Payload`], persisted in artifact metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    /// See [`Payload::Text`].
    Text,
    /// See [`Payload::Bytes`].
    Bytes,
    /// See [`Payload::Sections`].
    Sections,
}

impl Payload {
    /// Wraps raw source bytes, preferring text when they are valid UTF-8.
    pub fn from_source_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => Self::Text(text),
            Err(e) => Self::Bytes(e.into_bytes()),
        }
    }

    /// Returns the shape tag.
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Text(_) => PayloadKind::Text,
            Self::Bytes(_) => PayloadKind::Bytes,
            Self::Sections(_) => PayloadKind::Sections,
        }
    }

    /// Returns the text of a [`Payload::Text`].
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Flattens the payload into text. Sections are concatenated in order;
    /// bytes are decoded lossily.
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            Self::Sections(sections) => sections.iter().map(|s| s.value.as_str()).collect(),
        }
    }

    /// Serializes the payload for storage.
    pub fn encode(&self) -> Result<Vec<u8>, CacheError> {
        Ok(match self {
            Self::Text(text) => text.as_bytes().to_vec(),
            Self::Bytes(bytes) => bytes.clone(),
            Self::Sections(sections) => encode_sections(sections)?.into_bytes(),
        })
    }

    /// Restores a payload stored with [`encode`](Self::encode).
    pub fn decode(kind: PayloadKind, bytes: Vec<u8>) -> Result<Self, CacheError> {
        match kind {
            PayloadKind::Bytes => Ok(Self::Bytes(bytes)),
            PayloadKind::Text => String::from_utf8(bytes)
                .map(Self::Text)
                .map_err(|e| CacheError::Serialization {
                    reason: format!("stored text is not UTF-8: {e}"),
                }),
            PayloadKind::Sections => {
                let text = std::str::from_utf8(&bytes).map_err(|e| CacheError::Serialization {
                    reason: format!("stored sections are not UTF-8: {e}"),
                })?;
                decode_sections(text).map(Self::Sections)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_bytes_prefer_text() {
        assert_eq!(
            Payload::from_source_bytes(b"hi".to_vec()),
            Payload::Text("hi".into())
        );
        assert_eq!(
            Payload::from_source_bytes(vec![0xff, 0xfe]).kind(),
            PayloadKind::Bytes
        );
    }

    #[test]
    fn sections_flatten_in_order() {
        let payload = Payload::Sections(vec![Section::new("b", "2"), Section::new("a", "1")]);
        assert_eq!(payload.to_text(), "21");
    }

    #[test]
    fn sections_survive_storage() {
        let payload = Payload::Sections(vec![
            Section::new("zeta", "last name first"),
            Section::new("alpha", "second"),
        ]);
        let back = Payload::decode(PayloadKind::Sections, payload.encode().unwrap()).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn bad_utf8_text_is_an_error() {
        let err = Payload::decode(PayloadKind::Text, vec![0xff]).unwrap_err();
        assert!(matches!(err, CacheError::Serialization { .. }));
    }
}
