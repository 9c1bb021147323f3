//! Posting events to the owner and waiting for them to be handled.

use std::sync::Arc;
use std::time::Duration;

use crate::core::clock::Deadline;
use crate::core::process::InstanceId;
use crate::core::{Clock, Result};
use crate::ownership::lease_alive;
use crate::store::{CoordinationStore, EventState};

/// How a wait on a posted event ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The owner dispatched the event.
    Processed,
    /// The timeout elapsed while the event was still pending.
    TimedOut,
    /// An owner seen alive during the wait let its lease lapse or released
    /// it. The caller should try to become owner and handle the payload.
    OwnerLost,
    /// The event expired or was evicted from a full queue before dispatch.
    Expired,
}

pub struct EventChannel<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl<S: CoordinationStore> EventChannel<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, poll_interval: Duration) -> Self {
        Self {
            store,
            clock,
            poll_interval,
        }
    }

    /// Queues `payload` for the owner and returns its id without waiting.
    pub fn post_event(&self, payload: &[u8]) -> Result<u64> {
        let id = self.store.append_event(payload, self.clock.now_ms())?;
        log::debug!("posted event {id} ({} bytes)", payload.len());
        Ok(id)
    }

    /// Blocks until event `id` is processed, `timeout` elapses, the owner
    /// disappears, or the event is dropped.
    ///
    /// The store is re-read at least every poll interval and whenever its
    /// change signal fires. A wait that never sees a live owner ends in
    /// [`WaitOutcome::TimedOut`]; handing over to another live owner
    /// mid-wait is not a loss, because the new owner drains the same queue.
    pub fn wait_until_processed(&self, id: u64, timeout: Duration) -> Result<WaitOutcome> {
        let deadline = Deadline::after(timeout);
        let mut watched: Option<InstanceId> = None;
        loop {
            let seen = self.store.change_seq();
            let now = self.clock.now_ms();
            let (state, lease) = self
                .store
                .with_exclusive_access(|state| Ok((state.event(id).map(|event| event.state), state.lease)))?;

            match state {
                Some(EventState::Processed) => return Ok(WaitOutcome::Processed),
                Some(EventState::Expired) | None => {
                    log::debug!("event {id} dropped before dispatch");
                    return Ok(WaitOutcome::Expired);
                }
                Some(EventState::Pending) => {}
            }

            match lease {
                Some(lease) if lease_alive(&lease, now) => {
                    if watched.is_some_and(|owner| owner != lease.owner) {
                        log::debug!("event {id} now waits on owner {}", lease.owner);
                    }
                    watched = Some(lease.owner);
                }
                _ => {
                    if let Some(owner) = watched {
                        log::info!("owner {owner} went away while event {id} was pending");
                        return Ok(WaitOutcome::OwnerLost);
                    }
                }
            }

            if deadline.expired() {
                return Ok(WaitOutcome::TimedOut);
            }
            self.store
                .wait_for_change(seen, deadline.remaining().min(self.poll_interval))?;
        }
    }
}
