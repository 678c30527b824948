//! Error types for lazymatch.
//!
//! All errors are strongly typed using thiserror. Configuration problems fail
//! synchronously at registration; import and dispatch failures are recorded
//! and surfaced through the registry event channel.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rule::RuleId;

/// Errors raised while validating a rule at registration time.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("Invalid selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("Invalid media query '{query}': {reason}")]
    InvalidMediaQuery { query: String, reason: String },

    #[error("Invalid container query '{query}': {reason}")]
    InvalidContainerQuery { query: String, reason: String },

    #[error("Invalid root margin '{margin}': {reason}")]
    InvalidRootMargin { margin: String, reason: String },

    #[error("Intersection threshold {value} is out of range [0.0, 1.0]")]
    InvalidThreshold { value: f64 },

    #[error("Required field '{field}' is missing")]
    MissingField { field: String },

    #[error("Scope node {node} is not an element known to the host")]
    UnknownScope { node: u64 },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

/// Failure of an import producer.
///
/// Clonable so that every current and future waiter observes the same value.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImportError {
    #[error("Import rejected: {reason}")]
    Rejected { reason: String },

    #[error("Import producer was dropped before settling")]
    ProducerDropped,

    #[error("Import producer panicked: {message}")]
    Panicked { message: String },
}

impl ImportError {
    /// Creates a rejection with the given reason.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

/// A host observation primitive could not be used.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObservationError {
    #[error("Observation primitive '{primitive}' is unavailable in this host")]
    Unavailable { primitive: String },

    #[error("Observation primitive '{primitive}' rejected the request: {reason}")]
    Rejected { primitive: String, reason: String },
}

/// Failure isolated to a single (rule, element) dispatch.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchError {
    #[error("Activation predicate failed: {reason}")]
    PredicateFailed { reason: String },

    #[error("Callback failed: {reason}")]
    CallbackFailed { reason: String },

    #[error("Callback panicked: {message}")]
    Panicked { message: String },
}

/// Top-level error type for lazymatch.
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Import error: {0}")]
    Import(#[from] ImportError),

    #[error("Unknown rule: {id}")]
    UnknownRule { id: RuleId },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("Channel disconnected: {path}")]
    Disconnected { path: String },
}

impl MatchError {
    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Returns true if this is an import error.
    #[must_use]
    pub const fn is_import(&self) -> bool {
        matches!(self, Self::Import(_))
    }

    /// Returns true if this is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Result type alias for lazymatch operations.
pub type MatchResult<T> = Result<T, MatchError>;
