//! Event types for the match registry.
//!
//! Events are serializable so they can be logged or forwarded to external
//! observers as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::activation::ActivationTrigger;
use crate::dispatch::SkipReason;
use crate::error::{DispatchError, ImportError, ObservationError};
use crate::rule::RuleId;
use crate::tracker::MatchedElement;

/// Unique identifier for a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenerId(Uuid);

impl ListenerId {
    /// Create a new random listener id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Discriminant of a [`MatchEventPayload`], used to filter listeners and streams.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Matched,
    Unmatched,
    Activated,
    ImportStarted,
    ModuleLoaded,
    ModuleLoadFailed,
    CallbackDispatched,
    CallbackSkipped,
    DispatchFailed,
    ObservationFallback,
    Stopped,
}

/// Lifecycle event payload.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MatchEventPayload {
    /// An element started matching the rule's selector.
    Matched { element: MatchedElement },

    /// An element stopped matching, was detached, or was reclaimed.
    Unmatched { element: MatchedElement },

    /// An element's activation condition became true.
    Activated {
        element: MatchedElement,
        trigger: ActivationTrigger,
    },

    /// The import producer was invoked.
    ImportStarted,

    /// The import settled successfully.
    ModuleLoaded,

    /// The import failed. Emitted once at settlement without an element and
    /// once for every element that activates against the failed import.
    ModuleLoadFailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        element: Option<MatchedElement>,
        error: ImportError,
    },

    /// The callback ran for an element.
    CallbackDispatched { element: MatchedElement },

    /// The pair was decided without running the callback.
    CallbackSkipped {
        element: MatchedElement,
        reason: SkipReason,
    },

    /// The predicate or callback failed for an element.
    DispatchFailed {
        element: MatchedElement,
        error: DispatchError,
    },

    /// A condition's host primitive was unavailable; activation fell back.
    ObservationFallback { error: ObservationError },

    /// Observation for the rule stopped.
    Stopped,
}

impl MatchEventPayload {
    /// The kind of this payload.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Matched { .. } => EventKind::Matched,
            Self::Unmatched { .. } => EventKind::Unmatched,
            Self::Activated { .. } => EventKind::Activated,
            Self::ImportStarted => EventKind::ImportStarted,
            Self::ModuleLoaded => EventKind::ModuleLoaded,
            Self::ModuleLoadFailed { .. } => EventKind::ModuleLoadFailed,
            Self::CallbackDispatched { .. } => EventKind::CallbackDispatched,
            Self::CallbackSkipped { .. } => EventKind::CallbackSkipped,
            Self::DispatchFailed { .. } => EventKind::DispatchFailed,
            Self::ObservationFallback { .. } => EventKind::ObservationFallback,
            Self::Stopped => EventKind::Stopped,
        }
    }

    /// The element the event concerns, if any.
    #[must_use]
    pub const fn element(&self) -> Option<&MatchedElement> {
        match self {
            Self::Matched { element }
            | Self::Unmatched { element }
            | Self::Activated { element, .. }
            | Self::CallbackDispatched { element }
            | Self::CallbackSkipped { element, .. }
            | Self::DispatchFailed { element, .. } => Some(element),
            Self::ModuleLoadFailed { element, .. } => element.as_ref(),
            Self::ImportStarted | Self::ModuleLoaded | Self::ObservationFallback { .. } | Self::Stopped => None,
        }
    }
}

/// An emitted registry event.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchEvent {
    pub event_id: Uuid,
    pub rule_id: RuleId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: MatchEventPayload,
}

impl MatchEvent {
    /// Stamps a payload with a fresh id and the current time.
    #[must_use]
    pub fn new(rule_id: RuleId, link_id: Option<String>, payload: MatchEventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            rule_id,
            link_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Shorthand for `self.payload.kind()`.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}
