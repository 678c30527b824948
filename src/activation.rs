//! Activation evaluation.
//!
//! An `ActivationEvaluator` watches the matched elements of one rule and
//! emits an `ActivationEvent` on the rising edge of the rule's conditions.
//! Every configured condition (intersection, media, container) must hold at
//! the same time; `eager` loading skips them all. Under
//! `ActivationRepeat::Once` a node activates at most once per rule, even if
//! it stops matching and matches again later.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ObservationError;
use crate::host::{Hosts, NodeId, ObserverId};
use crate::query::ContainerQuery;
use crate::rule::{ActivationPolicy, ActivationRepeat, LoadingMode, RuleId};
use crate::tracker::MatchedElement;

/// Which condition produced an activation.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivationTrigger {
    /// No condition configured (or all fell back).
    Immediate,
    /// `loading: eager` bypassed the policy.
    Eager,
    Intersection { ratio: f64 },
    Media { query: String },
    ContainerQuery { query: String },
    /// Several conditions held together.
    Combined,
}

/// The instant an element's activation condition became true.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationEvent {
    pub rule_id: RuleId,
    pub element: MatchedElement,
    pub trigger: ActivationTrigger,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct ElementState {
    element: MatchedElement,
    visible: bool,
    ratio: f64,
    satisfied: bool,
}

/// Per-rule activation state machine.
#[derive(Debug)]
pub struct ActivationEvaluator {
    rule_id: RuleId,
    policy: ActivationPolicy,
    eager: bool,
    repeat: ActivationRepeat,
    observer: Option<ObserverId>,
    elements: Vec<ElementState>,
    activated: HashSet<NodeId>,
    /// Last media evaluation, keyed by the host's media revision.
    media_seen: Option<(u64, bool)>,
    active: bool,
}

impl ActivationEvaluator {
    /// Sets up observation for a rule's policy.
    ///
    /// Conditions whose host primitive is missing or refuses the request are
    /// dropped; the returned errors describe each fallback.
    pub fn new(
        rule_id: RuleId,
        policy: &ActivationPolicy,
        loading: LoadingMode,
        repeat: ActivationRepeat,
        hosts: &Hosts,
    ) -> (Self, Vec<ObservationError>) {
        let eager = loading == LoadingMode::Eager;
        let mut effective = policy.clone();
        let mut fallbacks = Vec::new();
        let mut observer = None;

        if eager {
            effective = ActivationPolicy::default();
        } else {
            if let Some(options) = &policy.intersection {
                let created = match &hosts.intersection {
                    Some(io) => io.create_observer(options),
                    None => Err(unavailable("intersection")),
                };
                match created {
                    Ok(id) => observer = Some(id),
                    Err(err) => {
                        effective.intersection = None;
                        fallbacks.push(err);
                    }
                }
            }
            if policy.media.is_some() && hosts.media.is_none() {
                effective.media = None;
                fallbacks.push(unavailable("media"));
            }
            if policy.container.is_some() && hosts.container.is_none() {
                effective.container = None;
                fallbacks.push(unavailable("container"));
            }
        }

        for err in &fallbacks {
            warn!(rule = %rule_id, error = %err, "observation unavailable; falling back to immediate activation");
        }

        let evaluator = Self {
            rule_id,
            policy: effective,
            eager,
            repeat,
            observer,
            elements: Vec::new(),
            activated: HashSet::new(),
            media_seen: None,
            active: true,
        };
        (evaluator, fallbacks)
    }

    /// Returns true until `stop` is called.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Number of elements currently under evaluation.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.elements.len()
    }

    /// Starts evaluating a newly matched element.
    ///
    /// Fires at once when the conditions already hold (immediate, eager, or a
    /// media/container condition that is currently true).
    pub fn track(&mut self, element: MatchedElement, hosts: &Hosts) -> Option<ActivationEvent> {
        if !self.active || self.elements.iter().any(|s| s.element.node == element.node) {
            return None;
        }
        if let (Some(observer), Some(io)) = (self.observer, &hosts.intersection) {
            io.observe(observer, element.node);
        }
        let media_ok = self.media_holds(hosts);
        self.elements.push(ElementState {
            element,
            visible: false,
            ratio: 0.0,
            satisfied: false,
        });

        let idx = self.elements.len() - 1;
        let state = &mut self.elements[idx];
        step(
            self.rule_id,
            &self.policy,
            self.eager,
            self.repeat,
            state,
            &mut self.activated,
            media_ok,
            hosts,
        )
    }

    /// Stops evaluating an element that no longer matches. Its activation
    /// history is kept.
    pub fn untrack(&mut self, node: NodeId, hosts: &Hosts) {
        let before = self.elements.len();
        self.elements.retain(|s| s.element.node != node);
        if self.elements.len() != before {
            if let (Some(observer), Some(io)) = (self.observer, &hosts.intersection) {
                io.unobserve(observer, node);
            }
        }
    }

    /// Applies pending visibility entries and re-evaluates every element.
    pub fn poll(&mut self, hosts: &Hosts) -> Vec<ActivationEvent> {
        if !self.active {
            return Vec::new();
        }

        if let (Some(observer), Some(io), Some(options)) =
            (self.observer, &hosts.intersection, &self.policy.intersection)
        {
            for entry in io.take_entries(observer) {
                if let Some(state) = self.elements.iter_mut().find(|s| s.element.node == entry.node) {
                    state.visible = options.is_satisfied(&entry);
                    state.ratio = entry.ratio;
                }
            }
        }

        let media_ok = self.media_holds(hosts);
        let mut events = Vec::new();
        for state in &mut self.elements {
            if let Some(ev) = step(
                self.rule_id,
                &self.policy,
                self.eager,
                self.repeat,
                state,
                &mut self.activated,
                media_ok,
                hosts,
            ) {
                events.push(ev);
            }
        }
        events
    }

    /// Releases observation. Idempotent.
    pub fn stop(&mut self, hosts: &Hosts) {
        if !self.active {
            return;
        }
        self.active = false;
        if let (Some(observer), Some(io)) = (self.observer.take(), &hosts.intersection) {
            io.disconnect(observer);
        }
        self.elements.clear();
        debug!(rule = %self.rule_id, "activation evaluator stopped");
    }
}

impl ActivationEvaluator {
    /// Evaluates the media condition, reusing the previous result while the
    /// host's media revision is unchanged.
    fn media_holds(&mut self, hosts: &Hosts) -> bool {
        let (Some(query), Some(media)) = (&self.policy.media, &hosts.media) else {
            return true;
        };
        let revision = media.revision();
        if let Some((seen, matches)) = self.media_seen {
            if seen == revision {
                return matches;
            }
        }
        let matches = media.evaluate(query);
        self.media_seen = Some((revision, matches));
        matches
    }
}

fn unavailable(primitive: &str) -> ObservationError {
    ObservationError::Unavailable {
        primitive: primitive.to_string(),
    }
}

/// Re-evaluates one element and returns an event on a qualifying rising edge.
#[allow(clippy::too_many_arguments)]
fn step(
    rule_id: RuleId,
    policy: &ActivationPolicy,
    eager: bool,
    repeat: ActivationRepeat,
    state: &mut ElementState,
    activated: &mut HashSet<NodeId>,
    media_ok: bool,
    hosts: &Hosts,
) -> Option<ActivationEvent> {
    let now = eager || (media_ok && conditions_hold(policy, state, hosts));
    let rising = now && !state.satisfied;
    state.satisfied = now;

    let node = state.element.node;
    if !rising || (repeat == ActivationRepeat::Once && activated.contains(&node)) {
        return None;
    }
    activated.insert(node);

    let trigger = trigger_for(policy, eager, state.ratio);
    debug!(rule = %rule_id, node = %state.element.node, ?trigger, "element activated");
    Some(ActivationEvent {
        rule_id,
        element: state.element.clone(),
        trigger,
        timestamp: Utc::now(),
    })
}

fn conditions_hold(policy: &ActivationPolicy, state: &ElementState, hosts: &Hosts) -> bool {
    if policy.intersection.is_some() && !state.visible {
        return false;
    }
    if let Some(query) = &policy.container {
        if !container_matches(query, state.element.node, hosts) {
            return false;
        }
    }
    true
}

/// Evaluates `query` against the nearest qualifying ancestor container.
fn container_matches(query: &ContainerQuery, node: NodeId, hosts: &Hosts) -> bool {
    let Some(containers) = &hosts.container else {
        return true;
    };
    let mut cursor = hosts.document.parent(node);
    while let Some(ancestor) = cursor {
        if let Some(info) = containers.container(ancestor) {
            if query.accepts(&info) {
                return query.evaluate(&info);
            }
        }
        cursor = hosts.document.parent(ancestor);
    }
    false
}

fn trigger_for(policy: &ActivationPolicy, eager: bool, ratio: f64) -> ActivationTrigger {
    if eager {
        return ActivationTrigger::Eager;
    }
    let configured = [
        policy.intersection.is_some(),
        policy.media.is_some(),
        policy.container.is_some(),
    ]
    .iter()
    .filter(|c| **c)
    .count();

    match (configured, &policy.media, &policy.container) {
        (0, _, _) => ActivationTrigger::Immediate,
        (1, Some(q), _) => ActivationTrigger::Media {
            query: q.source().to_string(),
        },
        (1, _, Some(q)) => ActivationTrigger::ContainerQuery {
            query: q.source().to_string(),
        },
        (1, _, _) => ActivationTrigger::Intersection { ratio },
        _ => ActivationTrigger::Combined,
    }
}
