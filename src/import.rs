//! Single-flight module imports.
//!
//! The `ImportGate` owns one import producer per rule and invokes it at most
//! once, no matter how many elements activate. The producer returns a
//! `PendingModule`, the receiving half of a one-shot channel that may settle
//! synchronously or from another thread. The settled value is shared with
//! every waiter and never changes afterwards.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Select, Sender, TryRecvError};
use tracing::{debug, info, warn};

use crate::dispatch::panic_message;
use crate::error::ImportError;
use crate::rule::{ImportProducer, RuleId};

/// State of a rule's import.
pub enum ImportState<M> {
    /// Producer invoked, result not yet available.
    Pending,
    /// Module available.
    Succeeded(Arc<M>),
    /// Producer failed; never retried.
    Failed(ImportError),
}

impl<M> ImportState<M> {
    /// Returns true once succeeded or failed.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// The module, if the import succeeded.
    #[must_use]
    pub fn module(&self) -> Option<&Arc<M>> {
        match self {
            Self::Succeeded(m) => Some(m),
            _ => None,
        }
    }
}

impl<M> Clone for ImportState<M> {
    fn clone(&self) -> Self {
        match self {
            Self::Pending => Self::Pending,
            Self::Succeeded(m) => Self::Succeeded(Arc::clone(m)),
            Self::Failed(e) => Self::Failed(e.clone()),
        }
    }
}

impl<M> fmt::Debug for ImportState<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("Pending"),
            Self::Succeeded(_) => f.write_str("Succeeded(..)"),
            Self::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
        }
    }
}

/// Eventual result of an import producer.
pub struct PendingModule<M> {
    rx: Receiver<Result<M, ImportError>>,
}

impl<M> PendingModule<M> {
    /// A module that is already available.
    #[must_use]
    pub fn resolved(module: M) -> Self {
        let (resolver, pending) = Self::channel();
        resolver.resolve(module);
        pending
    }

    /// An import that already failed.
    #[must_use]
    pub fn rejected(error: ImportError) -> Self {
        let (resolver, pending) = Self::channel();
        resolver.settle(Err(error));
        pending
    }

    /// A pending import settled later through the returned resolver.
    ///
    /// Dropping the resolver without settling fails the import with
    /// `ImportError::ProducerDropped`.
    #[must_use]
    pub fn channel() -> (ModuleResolver<M>, Self) {
        let (tx, rx) = bounded(1);
        (ModuleResolver { tx }, Self { rx })
    }

    fn try_settle(&self) -> Option<Result<M, ImportError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(ImportError::ProducerDropped)),
        }
    }
}

impl<M> fmt::Debug for PendingModule<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingModule").finish_non_exhaustive()
    }
}

/// Settles a `PendingModule`. Consumed on use, so it settles at most once.
pub struct ModuleResolver<M> {
    tx: Sender<Result<M, ImportError>>,
}

impl<M> ModuleResolver<M> {
    /// Resolve with a module.
    pub fn resolve(self, module: M) {
        self.settle(Ok(module));
    }

    /// Reject with a reason.
    pub fn reject(self, reason: impl Into<String>) {
        self.settle(Err(ImportError::rejected(reason)));
    }

    /// Settle with an explicit result.
    pub fn settle(self, result: Result<M, ImportError>) {
        // The gate may already be gone after a teardown.
        let _ = self.tx.try_send(result);
    }
}

impl<M> fmt::Debug for ModuleResolver<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleResolver").finish_non_exhaustive()
    }
}

struct Slot<M> {
    producer: Option<ImportProducer<M>>,
    pending: Option<PendingModule<M>>,
    state: Option<ImportState<M>>,
}

/// Per-rule single-flight import cells.
pub struct ImportGate<M> {
    slots: HashMap<RuleId, Slot<M>>,
    settled: Vec<(RuleId, ImportState<M>)>,
}

impl<M> Default for ImportGate<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for ImportGate<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportGate")
            .field("rules", &self.slots.len())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl<M> ImportGate<M> {
    /// Creates an empty gate.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
            settled: Vec::new(),
        }
    }

    /// Registers the producer for a rule. The producer is not invoked yet.
    pub fn insert(&mut self, rule: RuleId, producer: ImportProducer<M>) {
        self.slots.insert(
            rule,
            Slot {
                producer: Some(producer),
                pending: None,
                state: None,
            },
        );
    }

    /// Forgets a rule. An in-flight import is abandoned.
    pub fn remove(&mut self, rule: RuleId) {
        self.slots.remove(&rule);
        self.settled.retain(|(id, _)| *id != rule);
    }

    /// Requests the rule's module.
    ///
    /// The first call invokes the producer and returns `(Pending, true)`;
    /// every later call returns the current state and `false`. Returns `None`
    /// for unknown rules. A panicking producer settles the import as failed
    /// on the next poll.
    pub fn request(&mut self, rule: RuleId) -> Option<(ImportState<M>, bool)> {
        let slot = self.slots.get_mut(&rule)?;
        if let Some(state) = &slot.state {
            return Some((state.clone(), false));
        }

        let producer = slot.producer.take()?;
        info!(rule = %rule, "starting module import");
        let pending = catch_unwind(AssertUnwindSafe(producer)).unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            warn!(rule = %rule, %message, "import producer panicked");
            PendingModule::rejected(ImportError::Panicked { message })
        });
        slot.pending = Some(pending);
        slot.state = Some(ImportState::Pending);
        Some((ImportState::Pending, true))
    }

    /// Current state; `None` if the import was never requested.
    #[must_use]
    pub fn state(&self, rule: RuleId) -> Option<ImportState<M>> {
        self.slots.get(&rule).and_then(|s| s.state.clone())
    }

    /// Number of imports started but not settled.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.slots.values().filter(|s| s.pending.is_some()).count()
    }

    /// Collects imports that settled since the last call.
    pub fn poll(&mut self) -> Vec<(RuleId, ImportState<M>)> {
        let mut ready = Vec::new();
        for (rule, slot) in &mut self.slots {
            if let Some(result) = slot.pending.as_ref().and_then(PendingModule::try_settle) {
                ready.push((*rule, result));
            }
        }
        for (rule, result) in ready {
            self.settle(rule, result);
        }
        std::mem::take(&mut self.settled)
    }

    /// Blocks until at least one pending import settles or `timeout` elapses.
    ///
    /// Returns false on timeout or when nothing is pending.
    pub fn wait(&mut self, timeout: Duration) -> bool {
        let receivers: Vec<(RuleId, Receiver<Result<M, ImportError>>)> = self
            .slots
            .iter()
            .filter_map(|(rule, slot)| slot.pending.as_ref().map(|p| (*rule, p.rx.clone())))
            .collect();
        if receivers.is_empty() {
            return false;
        }

        let mut select = Select::new();
        for (_, rx) in &receivers {
            select.recv(rx);
        }
        let Ok(op) = select.select_timeout(timeout) else {
            return false;
        };
        let (rule, rx) = &receivers[op.index()];
        let result = op.recv(rx).unwrap_or(Err(ImportError::ProducerDropped));
        self.settle(*rule, result);
        true
    }

    fn settle(&mut self, rule: RuleId, result: Result<M, ImportError>) {
        let Some(slot) = self.slots.get_mut(&rule) else {
            return;
        };
        if slot.pending.take().is_none() {
            return;
        }
        let state = match result {
            Ok(module) => {
                debug!(rule = %rule, "module import succeeded");
                ImportState::Succeeded(Arc::new(module))
            }
            Err(err) => {
                warn!(rule = %rule, error = %err, "module import failed");
                ImportState::Failed(err)
            }
        };
        slot.state = Some(state.clone());
        self.settled.push((rule, state));
    }
}
