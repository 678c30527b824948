//! Callback dispatch.
//!
//! The dispatcher pairs activation events with settled imports. Each
//! (rule, element) pair is decided at most once: the callback runs, the
//! predicate rejects it, or the import failure is reported. Activations that
//! arrive while the import is pending are queued until it settles.
//!
//! Failures inside predicates or callbacks (errors and panics alike) are
//! isolated to their pair and reported as outcomes.

use std::any::Any;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::activation::ActivationEvent;
use crate::error::{DispatchError, ImportError};
use crate::host::{DocumentHost, NodeId};
use crate::import::ImportState;
use crate::rule::{MatchRule, RuleId};
use crate::tracker::MatchedElement;

/// Why a pair was decided without invoking the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// `doCallbackIf` returned false.
    PredicateRejected,
    /// The element was detached or reclaimed before the module arrived.
    ElementDetached,
    /// The rule has no callback.
    NoCallback,
}

/// Result of deciding one (rule, element) pair.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Dispatched { element: MatchedElement },
    Skipped { element: MatchedElement, reason: SkipReason },
    Failed { element: MatchedElement, error: DispatchError },
    ImportFailed { element: MatchedElement, error: ImportError },
}

impl DispatchOutcome {
    /// The element the outcome concerns.
    #[must_use]
    pub const fn element(&self) -> &MatchedElement {
        match self {
            Self::Dispatched { element }
            | Self::Skipped { element, .. }
            | Self::Failed { element, .. }
            | Self::ImportFailed { element, .. } => element,
        }
    }
}

/// Pairs activations with modules and invokes callbacks at most once.
#[derive(Debug, Default)]
pub struct CallbackDispatcher {
    decided: HashSet<(RuleId, NodeId)>,
    queued: Vec<ActivationEvent>,
}

impl CallbackDispatcher {
    /// Creates an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles one activation against the rule's current import state.
    ///
    /// Returns `None` when the pair was already decided or the activation was
    /// queued behind a pending import.
    pub fn notify<M>(
        &mut self,
        event: ActivationEvent,
        state: &ImportState<M>,
        rule: &MatchRule<M>,
        doc: &dyn DocumentHost,
    ) -> Option<DispatchOutcome> {
        let key = (event.rule_id, event.element.node);
        if self.decided.contains(&key) {
            return None;
        }

        match state {
            ImportState::Pending => {
                let already = self
                    .queued
                    .iter()
                    .any(|q| q.rule_id == key.0 && q.element.node == key.1);
                if !already {
                    debug!(rule = %key.0, node = %key.1, "activation queued behind pending import");
                    self.queued.push(event);
                }
                None
            }
            ImportState::Succeeded(module) => Some(self.run(event, module.as_ref(), rule, doc)),
            ImportState::Failed(error) => {
                self.decided.insert(key);
                Some(DispatchOutcome::ImportFailed {
                    element: event.element,
                    error: error.clone(),
                })
            }
        }
    }

    /// Drains the rule's queued activations once its import settled, in
    /// activation order.
    pub fn settle<M>(
        &mut self,
        rule: &MatchRule<M>,
        state: &ImportState<M>,
        doc: &dyn DocumentHost,
    ) -> Vec<DispatchOutcome> {
        if !state.is_settled() {
            return Vec::new();
        }
        let (ready, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.queued)
            .into_iter()
            .partition(|q| q.rule_id == rule.id());
        self.queued = rest;

        ready
            .into_iter()
            .filter_map(|event| self.notify(event, state, rule, doc))
            .collect()
    }

    /// Drops queued activations and dispatch history for a torn-down rule.
    ///
    /// Returns the number of discarded activations.
    pub fn discard(&mut self, rule: RuleId) -> usize {
        let before = self.queued.len();
        self.queued.retain(|q| q.rule_id != rule);
        self.decided.retain(|(r, _)| *r != rule);
        before - self.queued.len()
    }

    /// Activations waiting on the rule's import.
    #[must_use]
    pub fn queued(&self, rule: RuleId) -> usize {
        self.queued.iter().filter(|q| q.rule_id == rule).count()
    }

    /// Returns true once the pair has been decided.
    #[must_use]
    pub fn is_decided(&self, rule: RuleId, node: NodeId) -> bool {
        self.decided.contains(&(rule, node))
    }

    fn run<M>(
        &mut self,
        event: ActivationEvent,
        module: &M,
        rule: &MatchRule<M>,
        doc: &dyn DocumentHost,
    ) -> DispatchOutcome {
        let element = event.element;
        self.decided.insert((rule.id(), element.node));

        if !element.is_alive(doc) {
            return DispatchOutcome::Skipped {
                element,
                reason: SkipReason::ElementDetached,
            };
        }

        if let Some(predicate) = rule.predicate() {
            match catch_unwind(AssertUnwindSafe(|| predicate(module, &element))) {
                Ok(true) => {}
                Ok(false) => {
                    return DispatchOutcome::Skipped {
                        element,
                        reason: SkipReason::PredicateRejected,
                    };
                }
                Err(payload) => {
                    let reason = panic_message(payload.as_ref());
                    warn!(rule = %rule.id(), node = %element.node, %reason, "activation predicate panicked");
                    return DispatchOutcome::Failed {
                        element,
                        error: DispatchError::PredicateFailed { reason },
                    };
                }
            }
        }

        let Some(callback) = rule.callback() else {
            return DispatchOutcome::Skipped {
                element,
                reason: SkipReason::NoCallback,
            };
        };

        match catch_unwind(AssertUnwindSafe(|| callback(module, &element))) {
            Ok(Ok(())) => {
                debug!(rule = %rule.id(), node = %element.node, "callback dispatched");
                DispatchOutcome::Dispatched { element }
            }
            Ok(Err(err)) => {
                let reason = err.to_string();
                warn!(rule = %rule.id(), node = %element.node, %reason, "callback failed");
                DispatchOutcome::Failed {
                    element,
                    error: DispatchError::CallbackFailed { reason },
                }
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(rule = %rule.id(), node = %element.node, %message, "callback panicked");
                DispatchOutcome::Failed {
                    element,
                    error: DispatchError::Panicked { message },
                }
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
