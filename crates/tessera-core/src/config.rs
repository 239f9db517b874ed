//! # Context Configuration
//!
//! Settings handed to [`crate::ObjectContext::new`]. There is no global
//! configuration; two contexts in one process can be configured differently.
//!
//! ```
//! use tessera_core::ContextConfig;
//!
//! let config = ContextConfig::from_toml_str("change_events = false").expect("parse");
//! assert!(!config.change_events);
//! assert!(config.lifecycle_events);
//! ```

use crate::TesseraError;
use serde::{Deserialize, Serialize};

/// Per-context behavior switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContextConfig {
    /// Publish a `Change` event for every recorded operation.
    pub change_events: bool,
    /// Publish commit, rollback and flush events.
    pub lifecycle_events: bool,
    /// Check relationship metadata for every arc before a commit dispatches.
    pub validate_relationships: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            change_events: true,
            lifecycle_events: true,
            validate_relationships: true,
        }
    }
}

impl ContextConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, TesseraError> {
        toml::from_str(source).map_err(|e| TesseraError::DeserializationError(e.to_string()))
    }

    /// A configuration that publishes nothing.
    #[must_use]
    pub fn silent() -> Self {
        Self {
            change_events: false,
            lifecycle_events: false,
            ..Self::default()
        }
    }
}
