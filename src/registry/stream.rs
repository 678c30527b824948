use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::error::{MatchError, MatchResult};

use super::events::{EventKind, MatchEvent};

/// A bounded subscription to registry events.
///
/// Dropping this stream unsubscribes it; the registry prunes it on the next
/// emit. Events that arrive while the buffer is full are dropped and counted
/// by the registry.
#[derive(Debug)]
pub struct EventStream {
    rx: Receiver<MatchEvent>,
    closed: Arc<AtomicBool>,
}

impl EventStream {
    pub(crate) fn new(rx: Receiver<MatchEvent>, closed: Arc<AtomicBool>) -> Self {
        Self { rx, closed }
    }

    /// Stops delivery. Idempotent; events already buffered stay readable.
    pub fn unsubscribe(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Receive the next event (blocking).
    ///
    /// # Errors
    ///
    /// Returns `MatchError::Disconnected` once the registry is gone and the
    /// buffer is empty.
    pub fn recv(&self) -> MatchResult<MatchEvent> {
        self.rx.recv().map_err(|_| disconnected())
    }

    /// Receive the next event with a timeout.
    ///
    /// # Errors
    ///
    /// Returns `MatchError::Timeout` when nothing arrives in time and
    /// `MatchError::Disconnected` once the registry is gone.
    pub fn recv_timeout(&self, timeout: Duration) -> MatchResult<MatchEvent> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => MatchError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
            RecvTimeoutError::Disconnected => disconnected(),
        })
    }

    /// Next buffered event, if any.
    #[must_use]
    pub fn try_recv(&self) -> Option<MatchEvent> {
        self.rx.try_recv().ok()
    }

    /// All buffered events, oldest first.
    #[must_use]
    pub fn drain(&self) -> Vec<MatchEvent> {
        self.rx.try_iter().collect()
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

fn disconnected() -> MatchError {
    MatchError::Disconnected {
        path: "event_stream".to_string(),
    }
}

/// Registry side of an `EventStream`.
#[derive(Debug)]
pub(crate) struct StreamSink {
    kinds: Vec<EventKind>,
    tx: Sender<MatchEvent>,
    closed: Arc<AtomicBool>,
}

/// Outcome of offering an event to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Sent,
    Filtered,
    Full,
    Closed,
}

impl StreamSink {
    pub(crate) fn pair(kinds: &[EventKind], capacity: usize) -> (Self, EventStream) {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        let closed = Arc::new(AtomicBool::new(false));
        let sink = Self {
            kinds: kinds.to_vec(),
            tx,
            closed: Arc::clone(&closed),
        };
        (sink, EventStream::new(rx, closed))
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn offer(&self, event: &MatchEvent) -> Delivery {
        if self.is_closed() {
            return Delivery::Closed;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind()) {
            return Delivery::Filtered;
        }
        match self.tx.try_send(event.clone()) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Disconnected(_)) => Delivery::Closed,
        }
    }
}
