//! Envelope serialization (C2).
//!
//! Two wire formats are supported: a compact MessagePack binary form
//! (preferred for RPC/events) and textual JSON (compatibility / human
//! debugging). The writer format is a per-connection configuration choice;
//! the reader always auto-detects by inspecting the first byte of the
//! payload, so a binary producer and a JSON producer can coexist on the same
//! subject during a migration.

use crate::error::{Error, Result};
use serde::{Serialize, de::DeserializeOwned};

/// Format a [`crate::runtime::config::ServiceConfig`] selects for its own
/// outgoing envelopes. The reader side never needs this — it auto-detects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[allow(missing_docs)]
pub enum WireFormat {
    #[default]
    Binary,
    Text,
}

/// Encodes `value` using the requested format.
pub fn encode<T: Serialize>(value: &T, format: WireFormat) -> Result<Vec<u8>> {
    match format {
        WireFormat::Binary => {
            rmp_serde::to_vec_named(value).map_err(|e| Error::SerializationError(e.to_string()))
        }
        WireFormat::Text => {
            serde_json::to_vec(value).map_err(|e| Error::SerializationError(e.to_string()))
        }
    }
}

/// Decodes `bytes` into `T`, auto-detecting the format from the first byte.
///
/// Detection follows the MessagePack type-marker ranges: fixmap
/// (`0x80..=0x8f`), fixarray (`0x90..=0x9f`), nil (`0xc0`), bool
/// (`0xc2`/`0xc3`), and the explicit `map16`/`map32` markers (`0xde`/`0xdf`).
/// Anything else — including any ASCII text, since JSON envelopes are always
/// objects starting with `{` (`0x7b`) — falls through to the JSON decoder.
/// An empty payload is rejected outright rather than handed to either
/// decoder, since neither format can represent a message in zero bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if bytes.is_empty() {
        return Err(Error::SerializationError("empty payload".into()));
    }
    if is_binary(bytes) {
        rmp_serde::from_slice(bytes).map_err(|e| Error::SerializationError(e.to_string()))
    } else {
        serde_json::from_slice(bytes).map_err(|e| Error::SerializationError(e.to_string()))
    }
}

/// Returns whether `bytes` looks like a MessagePack-encoded value, per the
/// marker ranges documented on [`decode`].
pub fn is_binary(bytes: &[u8]) -> bool {
    match bytes.first() {
        None => false,
        Some(&b) => matches!(b, 0x80..=0x8f | 0x90..=0x9f | 0xc0 | 0xc2 | 0xc3 | 0xde | 0xdf),
    }
}
