//! Shared foundational types used across the Quire build engine.
//!
//! This crate provides the content hash used as the artifact fingerprint and
//! the internal error type reserved for engine bugs.

#![warn(missing_docs)]

pub mod hash;
pub mod result;

pub use hash::{ContentHash, ParseHashError};
pub use result::{InternalError, QuireResult};

/// Version of the engine, mixed into every fingerprint so that a format
/// change invalidates previously stored artifacts.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
