//! Owner-side draining of handed-off events.
//!
//! The [`Dispatcher`] never spawns a thread: the host calls
//! [`Dispatcher::tick`] from its own main loop at roughly the lease renewal
//! interval.

use std::fmt;
use std::sync::Arc;

use crate::core::{Clock, Result};
use crate::ownership::OwnershipManager;
use crate::store::CoordinationStore;

/// Handles one payload. The return value says whether the handler accepted
/// it; it is logged but never changes the event's state.
pub type Handler = Box<dyn FnMut(&[u8]) -> bool + Send>;

/// Selects the payloads a handler receives.
pub enum Matcher {
    /// Payload starts with these bytes, e.g. a URI scheme such as `tox:`.
    Prefix(Vec<u8>),
    Predicate(Box<dyn Fn(&[u8]) -> bool + Send + Sync>),
}

impl Matcher {
    pub fn prefix(prefix: impl AsRef<[u8]>) -> Self {
        Matcher::Prefix(prefix.as_ref().to_vec())
    }

    pub fn predicate(f: impl Fn(&[u8]) -> bool + Send + Sync + 'static) -> Self {
        Matcher::Predicate(Box::new(f))
    }

    pub fn matches(&self, payload: &[u8]) -> bool {
        match self {
            Matcher::Prefix(prefix) => payload.starts_with(prefix),
            Matcher::Predicate(f) => f(payload),
        }
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Prefix(prefix) => f
                .debug_tuple("Prefix")
                .field(&String::from_utf8_lossy(prefix))
                .finish(),
            Matcher::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Ordered `(matcher, handler)` pairs; the first match wins.
#[derive(Default)]
pub struct HandlerTable {
    entries: Vec<(Matcher, Handler)>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, matcher: Matcher, handler: impl FnMut(&[u8]) -> bool + Send + 'static) {
        log::debug!("registered handler for {matcher:?}");
        self.entries.push((matcher, Box::new(handler)));
    }

    /// Runs the first matching handler. `None` when nothing matched.
    pub fn dispatch(&mut self, payload: &[u8]) -> Option<bool> {
        self.entries
            .iter_mut()
            .find(|(matcher, _)| matcher.matches(payload))
            .map(|(_, handler)| handler(payload))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What one tick did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Whether this instance held the lease for the tick.
    pub owner: bool,
    /// Events handed to a handler.
    pub dispatched: usize,
    /// Events with no matching handler, marked processed anyway.
    pub unroutable: usize,
    /// Events expired or dropped by pruning.
    pub pruned: usize,
}

pub struct Dispatcher<S> {
    ownership: OwnershipManager<S>,
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    handlers: HandlerTable,
    max_event_age_ms: u64,
}

impl<S: CoordinationStore> Dispatcher<S> {
    pub fn new(
        ownership: OwnershipManager<S>,
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        handlers: HandlerTable,
        max_event_age_ms: u64,
    ) -> Self {
        Self {
            ownership,
            store,
            clock,
            handlers,
            max_event_age_ms,
        }
    }

    pub fn ownership(&self) -> &OwnershipManager<S> {
        &self.ownership
    }

    pub fn ownership_mut(&mut self) -> &mut OwnershipManager<S> {
        &mut self.ownership
    }

    pub fn handlers_mut(&mut self) -> &mut HandlerTable {
        &mut self.handlers
    }

    /// One pass of the owner loop: renew the lease, run every pending event
    /// through the handler table in arrival order, mark them processed and
    /// prune old events. Does nothing unless this instance owns the lease.
    ///
    /// Handlers run outside the store lock, so delivery is at-least-once: an
    /// owner that loses its lease mid-tick may overlap with its successor.
    pub fn tick(&mut self) -> Result<TickReport> {
        let mut report = TickReport::default();
        if !self.ownership.renew_lease()? {
            return Ok(report);
        }
        report.owner = true;

        let pending = self.store.with_exclusive_access(|state| Ok(state.pending()))?;
        let mut done = Vec::with_capacity(pending.len());
        for event in &pending {
            match self.handlers.dispatch(&event.payload) {
                Some(accepted) => {
                    report.dispatched += 1;
                    log::debug!("dispatched event {} (accepted: {accepted})", event.id);
                }
                None => {
                    report.unroutable += 1;
                    log::debug!("no handler for event {}, dropping", event.id);
                }
            }
            done.push(event.id);
        }

        let now = self.clock.now_ms();
        let max_age = self.max_event_age_ms;
        report.pruned = self.store.with_exclusive_access(|state| {
            for id in &done {
                state.mark_processed(*id, now);
            }
            Ok(state.prune_expired(now, max_age))
        })?;
        if !done.is_empty() || report.pruned > 0 {
            self.store.notify_change()?;
        }
        Ok(report)
    }
}
