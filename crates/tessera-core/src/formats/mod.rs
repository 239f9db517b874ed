//! # Formats
//!
//! Byte encodings used by the persistent store.

pub mod row_codec;

pub use row_codec::{RowHeader, id_from_bytes, key_to_bytes, row_from_bytes, row_to_bytes};
