//! The `ModuleMatches` engine.
//!
//! This module wires the components together and drives them cooperatively:
//! every call to [`ModuleMatches::turn`] drains settled imports, pending
//! mutation records, visibility entries, and environment changes, then
//! routes the resulting activations through the import gate and dispatcher.
//! Nothing runs in the background; the embedder owns the loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::activation::{ActivationEvaluator, ActivationEvent};
use crate::config::ModuleMatchesConfig;
use crate::dispatch::{CallbackDispatcher, DispatchOutcome};
use crate::error::{MatchError, MatchResult};
use crate::host::{DocumentHost, Hosts};
use crate::import::{ImportGate, ImportState};
use crate::registry::{EventKind, EventStream, ListenerId, MatchEvent, MatchEventPayload, MatchRegistry};
use crate::rule::{LoadingMode, MatchRule, ModuleMatchInit, RuleId};
use crate::tracker::{MatchedElement, SelectorTracker, TrackerChange};

struct RuleRuntime<M> {
    rule: MatchRule<M>,
    tracker: SelectorTracker,
    evaluator: ActivationEvaluator,
    stopped: bool,
}

/// Registry of lazy module bindings.
///
/// ```
/// use std::sync::Arc;
/// use lazymatch::{Hosts, InMemoryHost, ModuleMatchInit, ModuleMatches, PendingModule};
///
/// let host = Arc::new(InMemoryHost::new());
/// host.append_element(host.root(), "div", &[("class", "widget")]);
///
/// let mut engine = ModuleMatches::new(Hosts::in_memory(&host));
/// let rule = engine
///     .register(
///         ModuleMatchInit::new()
///             .selector(".widget")
///             .root_node(host.root())
///             .import(|| PendingModule::resolved("widget module")),
///     )
///     .unwrap();
///
/// engine.run_until_idle();
/// assert_eq!(engine.module(rule).as_deref(), Some(&"widget module"));
/// ```
pub struct ModuleMatches<M> {
    hosts: Hosts,
    config: ModuleMatchesConfig,
    rules: Vec<RuleRuntime<M>>,
    gate: ImportGate<M>,
    dispatcher: CallbackDispatcher,
    registry: MatchRegistry,
}

impl<M> std::fmt::Debug for ModuleMatches<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleMatches")
            .field("hosts", &self.hosts)
            .field("config", &self.config)
            .field("rules", &self.rules.len())
            .field("gate", &self.gate)
            .field("registry", &self.registry)
            .finish()
    }
}

impl<M> ModuleMatches<M> {
    /// Creates an engine with default configuration.
    #[must_use]
    pub fn new(hosts: Hosts) -> Self {
        Self::with_config(hosts, ModuleMatchesConfig::default())
    }

    /// Creates an engine with explicit configuration.
    #[must_use]
    pub fn with_config(hosts: Hosts, config: ModuleMatchesConfig) -> Self {
        let config = config.clamped();
        Self {
            registry: MatchRegistry::new(config.stream_capacity),
            hosts,
            config,
            rules: Vec::new(),
            gate: ImportGate::new(),
            dispatcher: CallbackDispatcher::new(),
        }
    }

    /// Registers a rule and runs the loop until idle, so elements that
    /// already match and already qualify activate before this returns.
    ///
    /// # Errors
    ///
    /// Returns `MatchError::Configuration` for missing fields, invalid
    /// selector or query syntax, or an unknown scope.
    pub fn register(&mut self, init: ModuleMatchInit<M>) -> MatchResult<RuleId> {
        let (rule, producer) = init.build()?;
        let id = rule.id();

        let tracker = SelectorTracker::start(
            id,
            rule.selector().clone(),
            rule.scope(),
            self.hosts.document.as_ref(),
            self.config.observe_attributes,
        )?;
        let (evaluator, fallbacks) =
            ActivationEvaluator::new(id, rule.policy(), rule.loading(), rule.repeat(), &self.hosts);

        info!(rule = %id, selector = %rule.selector(), loading = ?rule.loading(), "registered match rule");
        self.gate.insert(id, producer);
        self.registry.insert_rule(id, rule.link_id().map(str::to_string));
        for error in fallbacks {
            self.registry.emit(id, MatchEventPayload::ObservationFallback { error });
        }

        let eager = rule.loading() == LoadingMode::Eager;
        self.rules.push(RuleRuntime {
            rule,
            tracker,
            evaluator,
            stopped: false,
        });

        if eager {
            if let Some((_, true)) = self.gate.request(id) {
                self.registry.emit(id, MatchEventPayload::ImportStarted);
            }
        }

        self.run_until_idle();
        Ok(id)
    }

    /// Halts observation for a rule. Idempotent.
    ///
    /// An in-flight import is not cancelled, and callbacks for elements that
    /// activated before the stop still run once it settles. No events are
    /// emitted for the rule after its `Stopped` event.
    ///
    /// # Errors
    ///
    /// Returns `MatchError::UnknownRule` if the rule is not registered.
    pub fn stop(&mut self, id: RuleId) -> MatchResult<()> {
        let rt = self
            .rules
            .iter_mut()
            .find(|rt| rt.rule.id() == id)
            .ok_or(MatchError::UnknownRule { id })?;
        if rt.stopped {
            return Ok(());
        }

        rt.stopped = true;
        rt.tracker.stop(self.hosts.document.as_ref());
        rt.evaluator.stop(&self.hosts);
        self.registry.clear_matches(id);
        self.registry.emit(id, MatchEventPayload::Stopped);
        self.registry.mute(id);
        info!(rule = %id, "match rule stopped");
        Ok(())
    }

    /// Tears a rule down: stops it, discards queued callbacks, and abandons
    /// any in-flight import.
    ///
    /// # Errors
    ///
    /// Returns `MatchError::UnknownRule` if the rule is not registered.
    pub fn unregister(&mut self, id: RuleId) -> MatchResult<()> {
        self.stop(id)?;
        self.rules.retain(|rt| rt.rule.id() != id);
        let discarded = self.dispatcher.discard(id);
        self.gate.remove(id);
        self.registry.remove_rule(id);
        info!(rule = %id, discarded, "match rule unregistered");
        Ok(())
    }

    /// Runs one loop turn. Returns true if anything happened.
    pub fn turn(&mut self) -> bool {
        let Self {
            hosts,
            rules,
            gate,
            dispatcher,
            registry,
            ..
        } = self;
        let hosts: &Hosts = hosts;
        let doc = hosts.document.as_ref();
        let mut progressed = false;

        for (id, state) in gate.poll() {
            progressed = true;
            let Some(rt) = rules.iter().find(|rt| rt.rule.id() == id) else {
                continue;
            };
            match &state {
                ImportState::Succeeded(_) => {
                    registry.emit(id, MatchEventPayload::ModuleLoaded);
                }
                ImportState::Failed(error) => {
                    registry.emit(
                        id,
                        MatchEventPayload::ModuleLoadFailed {
                            element: None,
                            error: error.clone(),
                        },
                    );
                }
                ImportState::Pending => {}
            }
            for outcome in dispatcher.settle(&rt.rule, &state, doc) {
                emit_outcome(registry, id, outcome);
            }
        }

        for rt in rules.iter_mut().filter(|rt| !rt.stopped) {
            let id = rt.rule.id();
            let mut activations = Vec::new();

            for change in rt.tracker.poll(doc) {
                progressed = true;
                match change {
                    TrackerChange::Matched(element) => {
                        registry.record_match(&element);
                        registry.emit(
                            id,
                            MatchEventPayload::Matched {
                                element: element.clone(),
                            },
                        );
                        activations.extend(rt.evaluator.track(element, hosts));
                    }
                    TrackerChange::Unmatched(element) => {
                        registry.record_unmatch(id, element.node);
                        rt.evaluator.untrack(element.node, hosts);
                        registry.emit(id, MatchEventPayload::Unmatched { element });
                    }
                }
            }
            activations.extend(rt.evaluator.poll(hosts));

            for event in activations {
                progressed = true;
                activate(gate, dispatcher, registry, doc, &rt.rule, event);
            }
        }

        progressed
    }

    /// Runs turns until nothing happens or `max_turns_per_run` is reached.
    /// Returns the number of turns that made progress.
    pub fn run_until_idle(&mut self) -> usize {
        let mut turns = 0;
        while turns < self.config.max_turns_per_run && self.turn() {
            turns += 1;
        }
        turns
    }

    /// Drives the loop until every started import has settled and its
    /// callbacks have run.
    ///
    /// # Errors
    ///
    /// Returns `MatchError::Timeout` if imports are still pending when
    /// `timeout` elapses.
    pub fn wait_for_imports(&mut self, timeout: Duration) -> MatchResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            self.run_until_idle();
            if self.gate.pending_count() == 0 {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(MatchError::Timeout {
                    duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            debug!(pending = self.gate.pending_count(), "waiting for imports");
            self.gate.wait(deadline - now);
        }
    }

    /// Live matched elements of a rule, in first-observed order.
    ///
    /// # Errors
    ///
    /// Returns `MatchError::UnknownRule` if the rule is not registered.
    pub fn matches(&self, id: RuleId) -> MatchResult<Vec<MatchedElement>> {
        if self.rule(id).is_none() {
            return Err(MatchError::UnknownRule { id });
        }
        Ok(self.registry.live_matches(id, self.hosts.document.as_ref()))
    }

    /// The rule's module once its import succeeded.
    #[must_use]
    pub fn module(&self, id: RuleId) -> Option<Arc<M>> {
        self.gate.state(id).and_then(|s| s.module().cloned())
    }

    /// The rule's import state; `None` before the import was requested.
    #[must_use]
    pub fn import_state(&self, id: RuleId) -> Option<ImportState<M>> {
        self.gate.state(id)
    }

    /// A registered rule.
    #[must_use]
    pub fn rule(&self, id: RuleId) -> Option<&MatchRule<M>> {
        self.rules.iter().find(|rt| rt.rule.id() == id).map(|rt| &rt.rule)
    }

    /// Registered rules in registration order.
    #[must_use]
    pub fn rule_ids(&self) -> Vec<RuleId> {
        self.rules.iter().map(|rt| rt.rule.id()).collect()
    }

    /// Rules registered with the given correlation id.
    #[must_use]
    pub fn linked(&self, link_id: &str) -> Vec<RuleId> {
        self.rules
            .iter()
            .filter(|rt| rt.rule.link_id() == Some(link_id))
            .map(|rt| rt.rule.id())
            .collect()
    }

    /// Returns true once `stop` was called for the rule.
    #[must_use]
    pub fn is_stopped(&self, id: RuleId) -> bool {
        self.rules.iter().any(|rt| rt.rule.id() == id && rt.stopped)
    }

    /// Registers a listener for one event kind.
    pub fn add_listener(&mut self, kind: EventKind, listener: impl Fn(&MatchEvent) + 'static) -> ListenerId {
        self.registry.add_listener(kind, listener)
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.registry.remove_listener(id)
    }

    /// Opens a bounded event stream; an empty `kinds` slice receives everything.
    pub fn subscribe(&mut self, kinds: &[EventKind]) -> EventStream {
        self.registry.subscribe(kinds)
    }

    /// Read access to the registry.
    #[must_use]
    pub const fn registry(&self) -> &MatchRegistry {
        &self.registry
    }

    /// The host collaborators.
    #[must_use]
    pub const fn hosts(&self) -> &Hosts {
        &self.hosts
    }

    /// Effective configuration.
    #[must_use]
    pub const fn config(&self) -> &ModuleMatchesConfig {
        &self.config
    }
}

fn activate<M>(
    gate: &mut ImportGate<M>,
    dispatcher: &mut CallbackDispatcher,
    registry: &mut MatchRegistry,
    doc: &dyn DocumentHost,
    rule: &MatchRule<M>,
    event: ActivationEvent,
) {
    let id = rule.id();
    registry.emit(
        id,
        MatchEventPayload::Activated {
            element: event.element.clone(),
            trigger: event.trigger.clone(),
        },
    );

    let Some((state, started)) = gate.request(id) else {
        return;
    };
    if started {
        registry.emit(id, MatchEventPayload::ImportStarted);
    }
    if let Some(outcome) = dispatcher.notify(event, &state, rule, doc) {
        emit_outcome(registry, id, outcome);
    }
}

fn emit_outcome(registry: &mut MatchRegistry, id: RuleId, outcome: DispatchOutcome) {
    let payload = match outcome {
        DispatchOutcome::Dispatched { element } => MatchEventPayload::CallbackDispatched { element },
        DispatchOutcome::Skipped { element, reason } => MatchEventPayload::CallbackSkipped { element, reason },
        DispatchOutcome::Failed { element, error } => MatchEventPayload::DispatchFailed { element, error },
        DispatchOutcome::ImportFailed { element, error } => MatchEventPayload::ModuleLoadFailed {
            element: Some(element),
            error,
        },
    };
    registry.emit(id, payload);
}
