//! Host collaborator traits.
//!
//! These traits define the contract a host environment must implement for the
//! engine to track selector matches and evaluate activation conditions:
//! - `DocumentHost`: subtree scanning, element inspection, mutation records
//! - `IntersectionHost`: per-observer visibility entries
//! - `MediaHost`: media query evaluation with change notification
//! - `ContainerHost`: size containers for container queries
//!
//! Only `DocumentHost` is mandatory. A missing observation primitive degrades
//! to immediate activation.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ObservationError;
use crate::query::MediaQueryList;
use crate::rule::IntersectionOptions;

/// Opaque handle to a node owned by the host.
///
/// Holding a `NodeId` never keeps the node alive; use
/// [`DocumentHost::is_connected`] before relying on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    /// Wrap a raw host handle.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw host handle.
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Handle for a host-side observer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObserverId(u64);

impl ObserverId {
    /// Wrap a raw observer handle.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// Point-in-time view of an element, used for selector matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementSnapshot {
    /// Lowercase tag name.
    pub tag: String,
    /// Attributes keyed by lowercase name. `id` and `class` live here too.
    pub attributes: BTreeMap<String, String>,
}

impl ElementSnapshot {
    /// Creates a snapshot with no attributes.
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into().to_ascii_lowercase(),
            attributes: BTreeMap::new(),
        }
    }

    /// The `id` attribute, if present.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.attributes.get("id").map(String::as_str)
    }

    /// Whitespace-separated entries of the `class` attribute.
    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .get("class")
            .map(String::as_str)
            .unwrap_or_default()
            .split_whitespace()
    }

    /// Attribute value by (case-insensitive) name.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// What changed in an observed subtree.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MutationKind {
    /// Children were inserted or removed under `target`.
    ChildList,
    /// An attribute of `target` changed.
    Attributes { name: String },
}

/// A single mutation observed under a scope.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub target: NodeId,
    pub kind: MutationKind,
}

impl MutationRecord {
    /// Returns true for attribute-only mutations.
    #[must_use]
    pub const fn is_attribute(&self) -> bool {
        matches!(self.kind, MutationKind::Attributes { .. })
    }
}

/// Document-like structure: scanning, inspection, and mutation notification.
pub trait DocumentHost {
    /// Returns true if the host knows `node` (attached or not).
    fn contains(&self, node: NodeId) -> bool;

    /// Descendant elements of `scope` in document order, excluding `scope`.
    fn scan(&self, scope: NodeId) -> Vec<NodeId>;

    /// Snapshot of an element, or `None` if the node is gone.
    fn element(&self, node: NodeId) -> Option<ElementSnapshot>;

    /// Parent of `node`, if attached to one.
    fn parent(&self, node: NodeId) -> Option<NodeId>;

    /// Returns true if `node` is still a descendant of `scope`.
    fn is_connected(&self, node: NodeId, scope: NodeId) -> bool;

    /// Begin recording mutations (child list and attributes) under `scope`.
    fn observe(&self, scope: NodeId) -> ObserverId;

    /// Drain the records queued for `observer` since the last call.
    fn take_records(&self, observer: ObserverId) -> Vec<MutationRecord>;

    /// Stop recording for `observer`. Idempotent.
    fn disconnect(&self, observer: ObserverId);
}

/// A visibility report for one observed element.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntersectionEntry {
    pub node: NodeId,
    pub ratio: f64,
    pub is_intersecting: bool,
}

/// Intersection observation primitive.
pub trait IntersectionHost {
    /// Create an observer for the given options.
    fn create_observer(&self, options: &IntersectionOptions) -> Result<ObserverId, ObservationError>;

    /// Start reporting visibility for `node`.
    ///
    /// Hosts deliver an initial entry for every newly observed node.
    fn observe(&self, observer: ObserverId, node: NodeId);

    /// Stop reporting visibility for `node`.
    fn unobserve(&self, observer: ObserverId, node: NodeId);

    /// Drain queued entries in delivery order.
    fn take_entries(&self, observer: ObserverId) -> Vec<IntersectionEntry>;

    /// Release the observer. Idempotent.
    fn disconnect(&self, observer: ObserverId);
}

/// Media environment primitive.
pub trait MediaHost {
    /// Whether `query` currently matches the environment.
    fn evaluate(&self, query: &MediaQueryList) -> bool;

    /// Monotonic counter bumped on every environment change. Callers may
    /// reuse an earlier `evaluate` result while the revision is unchanged.
    fn revision(&self) -> u64;
}

/// A size container established by an element.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub width: f64,
    pub height: f64,
}

/// Container query primitive.
pub trait ContainerHost {
    /// Container established by `node`, if it is a size container.
    fn container(&self, node: NodeId) -> Option<ContainerInfo>;
}
