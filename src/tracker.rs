//! Selector tracking.
//!
//! A `SelectorTracker` keeps the live, ordered set of elements under a scope
//! that match a selector. Matching is re-evaluated on every relevant mutation
//! batch rather than cached: attribute and class changes can start or stop a
//! match without any structural change. Attribute-triggered rescans can be
//! disabled through `ModuleMatchesConfig::observe_attributes`.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigurationError;
use crate::host::{DocumentHost, ElementSnapshot, NodeId, ObserverId};
use crate::rule::RuleId;
use crate::selector::Selector;

/// Non-owning handle to an element that matched a rule.
///
/// The handle does not keep the element alive. Check it with
/// [`MatchedElement::is_alive`] or [`MatchedElement::upgrade`] before use.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedElement {
    pub node: NodeId,
    pub scope: NodeId,
    pub rule_id: RuleId,
    pub matched_at: DateTime<Utc>,
}

impl MatchedElement {
    /// Returns true if the element is still attached under its scope.
    #[must_use]
    pub fn is_alive(&self, doc: &dyn DocumentHost) -> bool {
        doc.is_connected(self.node, self.scope)
    }

    /// Snapshot of the element if it is still alive.
    #[must_use]
    pub fn upgrade(&self, doc: &dyn DocumentHost) -> Option<ElementSnapshot> {
        if self.is_alive(doc) {
            doc.element(self.node)
        } else {
            None
        }
    }
}

/// A change in the matched set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerChange {
    /// A new element started matching.
    Matched(MatchedElement),
    /// A previously matched element stopped matching or became unreachable.
    Unmatched(MatchedElement),
}

/// Live selector matches for one rule.
#[derive(Debug)]
pub struct SelectorTracker {
    rule_id: RuleId,
    selector: Selector,
    scope: NodeId,
    observer: Option<ObserverId>,
    observe_attributes: bool,
    needs_scan: bool,
    matched: Vec<MatchedElement>,
}

impl SelectorTracker {
    /// Begins observing `scope`. The initial scan runs on the first `poll`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::UnknownScope` if the host does not know `scope`.
    pub fn start(
        rule_id: RuleId,
        selector: Selector,
        scope: NodeId,
        doc: &dyn DocumentHost,
        observe_attributes: bool,
    ) -> Result<Self, ConfigurationError> {
        if !doc.contains(scope) {
            return Err(ConfigurationError::UnknownScope {
                node: scope.as_raw(),
            });
        }
        let observer = doc.observe(scope);
        debug!(rule = %rule_id, selector = %selector, scope = %scope, "selector tracker started");

        Ok(Self {
            rule_id,
            selector,
            scope,
            observer: Some(observer),
            observe_attributes,
            needs_scan: true,
            matched: Vec::new(),
        })
    }

    /// Current matches in first-observed order.
    #[must_use]
    pub fn matched(&self) -> &[MatchedElement] {
        &self.matched
    }

    /// Returns true until `stop` is called.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.observer.is_some()
    }

    /// Drains pending mutation records and reports changes to the matched set.
    ///
    /// Elements that are no longer attached are pruned on every poll, even
    /// without a mutation record.
    pub fn poll(&mut self, doc: &dyn DocumentHost) -> Vec<TrackerChange> {
        let Some(observer) = self.observer else {
            return Vec::new();
        };

        let records = doc.take_records(observer);
        let relevant = records
            .iter()
            .any(|r| self.observe_attributes || !r.is_attribute());

        let mut changes = Vec::new();
        if self.needs_scan || relevant {
            self.needs_scan = false;
            self.rescan(doc, &mut changes);
        } else {
            self.prune(doc, &mut changes);
        }
        changes
    }

    fn rescan(&mut self, doc: &dyn DocumentHost, changes: &mut Vec<TrackerChange>) {
        let current: Vec<NodeId> = doc
            .scan(self.scope)
            .into_iter()
            .filter(|n| self.selector.matches(doc, *n, self.scope))
            .collect();
        let current_set: HashSet<NodeId> = current.iter().copied().collect();

        let (kept, gone): (Vec<_>, Vec<_>) = std::mem::take(&mut self.matched)
            .into_iter()
            .partition(|m| current_set.contains(&m.node));
        changes.extend(gone.into_iter().map(TrackerChange::Unmatched));

        let known: HashSet<NodeId> = kept.iter().map(|m| m.node).collect();
        self.matched = kept;

        let now = Utc::now();
        for node in current.into_iter().filter(|n| !known.contains(n)) {
            let element = MatchedElement {
                node,
                scope: self.scope,
                rule_id: self.rule_id,
                matched_at: now,
            };
            self.matched.push(element.clone());
            changes.push(TrackerChange::Matched(element));
        }

        if !changes.is_empty() {
            debug!(rule = %self.rule_id, changes = changes.len(), matched = self.matched.len(), "selector rescan");
        }
    }

    fn prune(&mut self, doc: &dyn DocumentHost, changes: &mut Vec<TrackerChange>) {
        let (alive, dead): (Vec<_>, Vec<_>) = std::mem::take(&mut self.matched)
            .into_iter()
            .partition(|m| m.is_alive(doc));
        self.matched = alive;
        changes.extend(dead.into_iter().map(TrackerChange::Unmatched));
    }

    /// Releases mutation observation and forgets all matches. Idempotent.
    pub fn stop(&mut self, doc: &dyn DocumentHost) {
        if let Some(observer) = self.observer.take() {
            doc.disconnect(observer);
            self.matched.clear();
            debug!(rule = %self.rule_id, "selector tracker stopped");
        }
    }
}
