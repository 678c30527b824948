//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Tunables for a [`crate::ModuleMatches`] engine.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleMatchesConfig {
    /// Per-subscription stream buffer capacity.
    pub stream_capacity: usize,
    /// Re-run selector matching on attribute-only mutations.
    pub observe_attributes: bool,
    /// Max event-loop turns in one `run_until_idle` call.
    pub max_turns_per_run: usize,
}

impl Default for ModuleMatchesConfig {
    fn default() -> Self {
        Self {
            stream_capacity: 1024,
            observe_attributes: true,
            max_turns_per_run: 64,
        }
    }
}

impl ModuleMatchesConfig {
    /// Parses a JSON object; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidConfig` for malformed JSON or
    /// mistyped fields.
    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        let cfg: Self = serde_json::from_str(json).map_err(|e| ConfigurationError::InvalidConfig {
            reason: e.to_string(),
        })?;
        Ok(cfg.clamped())
    }

    /// Raises zero capacities to one.
    #[must_use]
    pub fn clamped(self) -> Self {
        Self {
            stream_capacity: self.stream_capacity.max(1),
            max_turns_per_run: self.max_turns_per_run.max(1),
            ..self
        }
    }
}
