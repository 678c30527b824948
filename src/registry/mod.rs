//! MatchRegistry: matched-element bookkeeping and the lifecycle event channel.
//!
//! External code observes the engine through the registry; it never mutates
//! tracker or evaluator state. Delivery happens synchronously on emit:
//! per-kind listeners run first (each isolated from panics), then bounded
//! streams receive a copy without ever blocking the engine.

mod events;
mod stream;

pub use events::{EventKind, ListenerId, MatchEvent, MatchEventPayload};
pub use stream::EventStream;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{trace, warn};

use crate::dispatch::panic_message;
use crate::host::{DocumentHost, NodeId};
use crate::rule::RuleId;
use crate::tracker::MatchedElement;

use stream::{Delivery, StreamSink};

/// Event listener callback.
pub type Listener = Box<dyn Fn(&MatchEvent)>;

struct ListenerEntry {
    id: ListenerId,
    kind: EventKind,
    listener: Listener,
}

#[derive(Debug, Default)]
struct RuleEntry {
    link_id: Option<String>,
    matches: Vec<MatchedElement>,
}

/// Counters describing event delivery.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub emitted: u64,
    pub dropped_events: u64,
    pub listener_failures: u64,
}

/// Ordered matches per rule plus the publish/subscribe event channel.
pub struct MatchRegistry {
    rules: HashMap<RuleId, RuleEntry>,
    muted: HashSet<RuleId>,
    listeners: Vec<ListenerEntry>,
    streams: Vec<StreamSink>,
    stream_capacity: usize,
    stats: RegistryStats,
}

impl fmt::Debug for MatchRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchRegistry")
            .field("rules", &self.rules.len())
            .field("muted", &self.muted.len())
            .field("listeners", &self.listeners.len())
            .field("streams", &self.streams.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl MatchRegistry {
    /// Creates a registry whose streams buffer up to `stream_capacity` events.
    #[must_use]
    pub fn new(stream_capacity: usize) -> Self {
        Self {
            rules: HashMap::new(),
            muted: HashSet::new(),
            listeners: Vec::new(),
            streams: Vec::new(),
            stream_capacity: stream_capacity.max(1),
            stats: RegistryStats::default(),
        }
    }

    pub(crate) fn insert_rule(&mut self, rule: RuleId, link_id: Option<String>) {
        self.rules.insert(
            rule,
            RuleEntry {
                link_id,
                matches: Vec::new(),
            },
        );
    }

    pub(crate) fn remove_rule(&mut self, rule: RuleId) {
        self.rules.remove(&rule);
        self.muted.remove(&rule);
    }

    pub(crate) fn record_match(&mut self, element: &MatchedElement) {
        if let Some(entry) = self.rules.get_mut(&element.rule_id) {
            if !entry.matches.iter().any(|m| m.node == element.node) {
                entry.matches.push(element.clone());
            }
        }
    }

    pub(crate) fn record_unmatch(&mut self, rule: RuleId, node: NodeId) {
        if let Some(entry) = self.rules.get_mut(&rule) {
            entry.matches.retain(|m| m.node != node);
        }
    }

    pub(crate) fn clear_matches(&mut self, rule: RuleId) {
        if let Some(entry) = self.rules.get_mut(&rule) {
            entry.matches.clear();
        }
    }

    /// Suppresses all further events for a rule.
    pub(crate) fn mute(&mut self, rule: RuleId) {
        self.muted.insert(rule);
    }

    /// Returns true once the rule has been stopped.
    #[must_use]
    pub fn is_muted(&self, rule: RuleId) -> bool {
        self.muted.contains(&rule)
    }

    /// Known matches for a rule in first-observed order.
    ///
    /// Handles are not liveness-checked here; see [`MatchRegistry::live_matches`].
    #[must_use]
    pub fn matches(&self, rule: RuleId) -> &[MatchedElement] {
        self.rules.get(&rule).map_or(&[], |e| e.matches.as_slice())
    }

    /// Matches whose element is still attached under its scope.
    #[must_use]
    pub fn live_matches(&self, rule: RuleId, doc: &dyn DocumentHost) -> Vec<MatchedElement> {
        self.matches(rule)
            .iter()
            .filter(|m| m.is_alive(doc))
            .cloned()
            .collect()
    }

    /// The rule's correlation id.
    #[must_use]
    pub fn link_id(&self, rule: RuleId) -> Option<&str> {
        self.rules.get(&rule).and_then(|e| e.link_id.as_deref())
    }

    /// Registers a listener for one event kind.
    pub fn add_listener(&mut self, kind: EventKind, listener: impl Fn(&MatchEvent) + 'static) -> ListenerId {
        let id = ListenerId::new();
        self.listeners.push(ListenerEntry {
            id,
            kind,
            listener: Box::new(listener),
        });
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| l.id != id);
        self.listeners.len() != before
    }

    /// Opens a bounded stream of events whose kind is in `kinds`; an empty
    /// slice subscribes to everything.
    pub fn subscribe(&mut self, kinds: &[EventKind]) -> EventStream {
        let (sink, stream) = StreamSink::pair(kinds, self.stream_capacity);
        self.streams.push(sink);
        stream
    }

    /// Number of live listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Number of streams not yet pruned.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.iter().filter(|s| !s.is_closed()).count()
    }

    /// Delivery counters.
    #[must_use]
    pub const fn stats(&self) -> RegistryStats {
        self.stats
    }

    /// Publishes an event for `rule`. Returns `None` when the rule is muted
    /// or unknown.
    pub(crate) fn emit(&mut self, rule: RuleId, payload: MatchEventPayload) -> Option<MatchEvent> {
        if self.muted.contains(&rule) {
            return None;
        }
        let entry = self.rules.get(&rule)?;
        let event = MatchEvent::new(rule, entry.link_id.clone(), payload);
        self.stats.emitted += 1;
        trace!(rule = %rule, kind = ?event.kind(), "emit");

        let kind = event.kind();
        for entry in self.listeners.iter().filter(|l| l.kind == kind) {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (entry.listener)(&event))) {
                self.stats.listener_failures += 1;
                warn!(
                    listener = ?entry.id,
                    kind = ?kind,
                    message = %panic_message(payload.as_ref()),
                    "event listener panicked"
                );
            }
        }

        let mut dropped = 0;
        self.streams.retain(|sink| match sink.offer(&event) {
            Delivery::Sent | Delivery::Filtered => true,
            Delivery::Full => {
                dropped += 1;
                true
            }
            Delivery::Closed => false,
        });
        self.stats.dropped_events += dropped;

        Some(event)
    }
}
