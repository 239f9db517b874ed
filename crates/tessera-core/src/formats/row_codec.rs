//! # Row Codec
//!
//! Binary encoding for stored rows and row keys.
//!
//! Row format: Header (5 bytes) + postcard-serialized column map.
//! - 4 bytes: Magic ("TSRA")
//! - 1 byte: Version
//!
//! Keys carry no header. A key is the postcard encoding of the id (or of a
//! tuple starting with it), so encodings that share leading fields share a
//! byte prefix and can be range-scanned.
//!
//! Sizes are checked before decoding so a corrupted value cannot drive a
//! large allocation.

use crate::primitives::{FORMAT_VERSION, MAGIC_BYTES, MAX_ROW_PAYLOAD_SIZE};
use crate::{ObjectId, TesseraError, Value};
use serde::Serialize;
use std::collections::BTreeMap;

/// Header length in bytes.
const HEADER_LEN: usize = 5;

// =============================================================================
// HEADER
// =============================================================================

/// The header that precedes every encoded row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowHeader {
    pub magic: [u8; 4],
    pub version: u8,
}

impl RowHeader {
    /// Header for the current format version.
    #[must_use]
    pub fn new() -> Self {
        Self {
            magic: *MAGIC_BYTES,
            version: FORMAT_VERSION,
        }
    }

    pub fn validate(&self) -> Result<(), TesseraError> {
        if &self.magic != MAGIC_BYTES {
            return Err(TesseraError::DeserializationError(
                "Invalid row magic bytes".to_string(),
            ));
        }
        if self.version != FORMAT_VERSION {
            return Err(TesseraError::DeserializationError(format!(
                "Unsupported row version: {} (expected {})",
                self.version, FORMAT_VERSION
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let [a, b, c, d] = self.magic;
        [a, b, c, d, self.version]
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TesseraError> {
        match bytes {
            [a, b, c, d, version, ..] => Ok(Self {
                magic: [*a, *b, *c, *d],
                version: *version,
            }),
            _ => Err(TesseraError::DeserializationError(
                "Row header too short".to_string(),
            )),
        }
    }
}

impl Default for RowHeader {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// ROWS
// =============================================================================

/// Encode a row's column values (header + payload).
pub fn row_to_bytes(values: &BTreeMap<String, Value>) -> Result<Vec<u8>, TesseraError> {
    let payload = postcard::to_stdvec(values)
        .map_err(|e| TesseraError::SerializationError(e.to_string()))?;
    if payload.len() > MAX_ROW_PAYLOAD_SIZE {
        return Err(TesseraError::SerializationError(format!(
            "Row of {} bytes exceeds maximum {} bytes",
            payload.len(),
            MAX_ROW_PAYLOAD_SIZE
        )));
    }
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&RowHeader::new().to_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Decode a row written by [`row_to_bytes`].
pub fn row_from_bytes(bytes: &[u8]) -> Result<BTreeMap<String, Value>, TesseraError> {
    if bytes.len() > HEADER_LEN + MAX_ROW_PAYLOAD_SIZE {
        return Err(TesseraError::DeserializationError(format!(
            "Row of {} bytes exceeds maximum {} bytes",
            bytes.len(),
            MAX_ROW_PAYLOAD_SIZE
        )));
    }
    RowHeader::from_bytes(bytes)?.validate()?;
    let payload = bytes.get(HEADER_LEN..).unwrap_or_default();
    postcard::from_bytes(payload)
        .map_err(|e| TesseraError::DeserializationError(format!("Failed to decode row: {e}")))
}

// =============================================================================
// KEYS
// =============================================================================

/// Encode any key tuple.
pub fn key_to_bytes<K: Serialize + ?Sized>(key: &K) -> Result<Vec<u8>, TesseraError> {
    postcard::to_stdvec(key).map_err(|e| TesseraError::SerializationError(e.to_string()))
}

/// Decode an id written by [`key_to_bytes`].
pub fn id_from_bytes(bytes: &[u8]) -> Result<ObjectId, TesseraError> {
    postcard::from_bytes(bytes)
        .map_err(|e| TesseraError::DeserializationError(format!("Failed to decode key: {e}")))
}

// =============================================================================
// TESTS
// =============================================================================
