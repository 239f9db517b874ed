//! # Primitives
//!
//! Hardcoded constants for the Tessera core.
//!
//! These values are compiled in and never change at runtime. Anything a
//! deployment may want to tune lives in [`crate::config::ContextConfig`].

/// Recorder marker set when a commit starts.
///
/// Operations recorded after this marker belong to the commit itself
/// (identity swaps) and are reported in the commit-completed event.
pub const COMMIT_MARKER: &str = "commit";

/// Recorder marker moved on every flush.
///
/// `flush_changes` reports the operations recorded since this marker.
pub const FLUSH_MARKER: &str = "flush";

/// Magic bytes for the row codec header.
///
/// - Row Header = Magic Bytes ("TSRA") + Version (u8) before payload.
pub const MAGIC_BYTES: &[u8; 4] = b"TSRA";

/// Current row codec version.
///
/// Increment this when making breaking changes to the row encoding.
pub const FORMAT_VERSION: u8 = 1;

/// Maximum encoded size of a single stored row (16 MB).
///
/// Checked before decoding so a corrupted length cannot drive allocation.
pub const MAX_ROW_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Maximum depth of cascading deletes started from one `delete_object` call.
///
/// Delete rules can form cycles through the object graph; objects already
/// marked deleted are skipped, and this bound stops pathological chains.
pub const MAX_CASCADE_DEPTH: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_are_distinct() {
        assert_ne!(COMMIT_MARKER, FLUSH_MARKER);
    }

    #[test]
    fn magic_bytes_correct() {
        assert_eq!(MAGIC_BYTES, b"TSRA");
    }
}
