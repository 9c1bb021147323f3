//! Shared coordination store: the owner lease plus a bounded FIFO of
//! handed-off events.
//!
//! [`CoordinationStore`] is the single serialization point between
//! processes. Every read or write of [`StoreState`] happens inside
//! [`CoordinationStore::with_exclusive_access`]; the convenience methods on
//! the trait are thin wrappers around it.
//!
//! Two implementations exist:
//!
//! - [`FileStore`]: a memory-mapped file guarded by `flock`, shared by every
//!   process of the application.
//! - [`MemoryStore`]: an in-process fake with the same contract, used by
//!   tests and by the standalone fallback when the file cannot be opened.

use std::collections::VecDeque;
use std::time::Duration;

use crate::core::process::InstanceId;
use crate::core::{Error, Result};

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Default number of event slots.
pub const DEFAULT_CAPACITY: usize = 32;
/// Default maximum payload size in bytes.
pub const DEFAULT_MAX_PAYLOAD: usize = 512;

/// The current owner's claim on the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseRecord {
    pub owner: InstanceId,
    /// Owner pid, 0 when unknown.
    pub owner_pid: u32,
    /// Owner process start time in clock ticks since boot, 0 when unknown.
    pub owner_start_time: u64,
    pub acquired_at_ms: u64,
    pub heartbeat_at_ms: u64,
    pub lease_duration_ms: u64,
}

impl LeaseRecord {
    /// A lease is fresh while `now - heartbeat_at < lease_duration`.
    pub fn is_fresh(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.heartbeat_at_ms) < self.lease_duration_ms
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventState {
    Pending,
    Processed,
    Expired,
}

impl EventState {
    pub fn is_settled(self) -> bool {
        !matches!(self, EventState::Pending)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub id: u64,
    pub payload: Vec<u8>,
    pub state: EventState,
    pub posted_at_ms: u64,
    /// Set when the event leaves `Pending`; 0 until then.
    pub completed_at_ms: u64,
}

/// Decoded contents of a store, handed to the closure passed to
/// [`CoordinationStore::with_exclusive_access`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreState {
    pub lease: Option<LeaseRecord>,
    events: VecDeque<Event>,
    last_event_id: u64,
    capacity: usize,
    max_payload: usize,
}

impl StoreState {
    pub fn new(capacity: usize, max_payload: usize) -> Self {
        Self {
            lease: None,
            events: VecDeque::with_capacity(capacity),
            last_event_id: 0,
            capacity,
            max_payload,
        }
    }

    pub(crate) fn from_parts(
        lease: Option<LeaseRecord>,
        events: VecDeque<Event>,
        last_event_id: u64,
        capacity: usize,
        max_payload: usize,
    ) -> Self {
        Self {
            lease,
            events,
            last_event_id,
            capacity,
            max_payload,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn last_event_id(&self) -> u64 {
        self.last_event_id
    }

    /// Events in arrival order.
    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    pub fn event(&self, id: u64) -> Option<&Event> {
        self.events.iter().find(|event| event.id == id)
    }

    /// Pending events in arrival order.
    pub fn pending(&self) -> Vec<Event> {
        self.events
            .iter()
            .filter(|event| event.state == EventState::Pending)
            .cloned()
            .collect()
    }

    /// Appends `payload` at the tail and returns its id.
    ///
    /// The id starts at `now_ms` and is bumped one tick at a time until it
    /// is unused and greater than every id handed out before, so ids stay
    /// strictly increasing across pruning. A full queue evicts its oldest
    /// settled event, or its oldest pending event if nothing is settled.
    pub fn append_event(&mut self, payload: &[u8], now_ms: u64) -> Result<u64> {
        if payload.len() > self.max_payload {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max: self.max_payload,
            });
        }
        let mut id = now_ms.max(1);
        while id <= self.last_event_id || self.event(id).is_some() {
            id += 1;
        }
        if self.events.len() >= self.capacity {
            self.evict_one();
        }
        self.events.push_back(Event {
            id,
            payload: payload.to_vec(),
            state: EventState::Pending,
            posted_at_ms: now_ms,
            completed_at_ms: 0,
        });
        self.last_event_id = id;
        Ok(id)
    }

    /// Moves a pending event to `Processed`. Returns false (not an error)
    /// when the event is absent or already settled.
    pub fn mark_processed(&mut self, id: u64, now_ms: u64) -> bool {
        match self.events.iter_mut().find(|event| event.id == id) {
            Some(event) if event.state == EventState::Pending => {
                event.state = EventState::Processed;
                event.completed_at_ms = now_ms;
                true
            }
            _ => false,
        }
    }

    /// Expires pending events older than `max_age_ms` and drops settled
    /// events that settled more than `max_age_ms` ago. Returns how many
    /// events were touched.
    pub fn prune_expired(&mut self, now_ms: u64, max_age_ms: u64) -> usize {
        let mut touched = 0;
        for event in self.events.iter_mut() {
            if event.state == EventState::Pending
                && now_ms.saturating_sub(event.posted_at_ms) >= max_age_ms
            {
                event.state = EventState::Expired;
                event.completed_at_ms = now_ms;
                touched += 1;
            }
        }
        let before = self.events.len();
        self.events.retain(|event| {
            !(event.state.is_settled() && now_ms.saturating_sub(event.completed_at_ms) >= max_age_ms)
        });
        touched + (before - self.events.len())
    }

    fn evict_one(&mut self) {
        if let Some(pos) = self.events.iter().position(|event| event.state.is_settled()) {
            self.events.remove(pos);
            return;
        }
        if let Some(event) = self.events.pop_front() {
            log::warn!(
                "event queue full ({} slots), dropping pending event {}",
                self.capacity,
                event.id
            );
        }
    }
}

/// Cross-process exclusive access to a [`StoreState`].
pub trait CoordinationStore: Send + Sync {
    /// Runs `f` while holding the store's exclusive lock.
    ///
    /// The lock is released on every exit path. Changes made by `f` are
    /// persisted only when it returns `Ok`.
    fn with_exclusive_access<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut StoreState) -> Result<R>;

    /// Current value of the change sequence, read without the lock.
    fn change_seq(&self) -> u32;

    /// Bumps the change sequence and wakes anyone in [`wait_for_change`].
    ///
    /// [`wait_for_change`]: CoordinationStore::wait_for_change
    fn notify_change(&self) -> Result<()>;

    /// Blocks until the change sequence differs from `seen` or `timeout`
    /// elapses. Spurious wakeups are allowed.
    fn wait_for_change(&self, seen: u32, timeout: Duration) -> Result<()>;

    fn read_lease(&self) -> Result<Option<LeaseRecord>> {
        self.with_exclusive_access(|state| Ok(state.lease))
    }

    fn append_event(&self, payload: &[u8], now_ms: u64) -> Result<u64> {
        self.with_exclusive_access(|state| state.append_event(payload, now_ms))
    }

    fn mark_processed(&self, id: u64, now_ms: u64) -> Result<()> {
        self.with_exclusive_access(|state| {
            state.mark_processed(id, now_ms);
            Ok(())
        })
    }

    fn prune_expired(&self, now_ms: u64, max_age_ms: u64) -> Result<usize> {
        self.with_exclusive_access(|state| Ok(state.prune_expired(now_ms, max_age_ms)))
    }

    fn event_state(&self, id: u64) -> Result<Option<EventState>> {
        self.with_exclusive_access(|state| Ok(state.event(id).map(|event| event.state)))
    }
}

/// Either store, chosen at runtime by the host facade.
pub enum AnyStore {
    File(FileStore),
    Memory(MemoryStore),
}

impl CoordinationStore for AnyStore {
    fn with_exclusive_access<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut StoreState) -> Result<R>,
    {
        match self {
            AnyStore::File(store) => store.with_exclusive_access(f),
            AnyStore::Memory(store) => store.with_exclusive_access(f),
        }
    }

    fn change_seq(&self) -> u32 {
        match self {
            AnyStore::File(store) => store.change_seq(),
            AnyStore::Memory(store) => store.change_seq(),
        }
    }

    fn notify_change(&self) -> Result<()> {
        match self {
            AnyStore::File(store) => store.notify_change(),
            AnyStore::Memory(store) => store.notify_change(),
        }
    }

    fn wait_for_change(&self, seen: u32, timeout: Duration) -> Result<()> {
        match self {
            AnyStore::File(store) => store.wait_for_change(seen, timeout),
            AnyStore::Memory(store) => store.wait_for_change(seen, timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> StoreState {
        StoreState::new(4, 16)
    }

    #[test]
    fn colliding_timestamps_get_distinct_ids() -> Result<()> {
        let mut state = state();
        let a = state.append_event(b"a", 1_000)?;
        let b = state.append_event(b"b", 1_000)?;
        let c = state.append_event(b"c", 999)?;
        assert_eq!((a, b, c), (1_000, 1_001, 1_002));
        Ok(())
    }

    #[test]
    fn ids_keep_increasing_after_prune() -> Result<()> {
        let mut state = state();
        let first = state.append_event(b"a", 50)?;
        state.mark_processed(first, 60);
        assert_eq!(state.prune_expired(10_000, 100), 1);
        assert!(state.event(first).is_none());
        let next = state.append_event(b"b", 10)?;
        assert!(next > first);
        Ok(())
    }

    #[test]
    fn mark_processed_is_idempotent() -> Result<()> {
        let mut state = state();
        let id = state.append_event(b"tox:abc", 10)?;
        assert!(state.mark_processed(id, 20));
        assert!(!state.mark_processed(id, 30));
        let event = state.event(id).expect("event");
        assert_eq!(event.state, EventState::Processed);
        assert_eq!(event.completed_at_ms, 20);
        assert!(!state.mark_processed(12345, 30));
        Ok(())
    }

    #[test]
    fn rejects_oversized_payload() {
        let mut state = state();
        let err = state.append_event(&[0u8; 17], 1).unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { len: 17, max: 16 }));
        assert_eq!(state.events().count(), 0);
    }

    #[test]
    fn prune_expires_stale_pending_events() -> Result<()> {
        let mut state = state();
        let old = state.append_event(b"old", 100)?;
        let fresh = state.append_event(b"fresh", 900)?;
        assert_eq!(state.prune_expired(1_100, 500), 1);
        assert_eq!(state.event(old).map(|e| e.state), Some(EventState::Expired));
        assert_eq!(state.event(fresh).map(|e| e.state), Some(EventState::Pending));
        // The expired event lingers one more window so waiters can see it.
        assert_eq!(state.prune_expired(1_599, 500), 1);
        assert!(state.event(old).is_some());
        assert_eq!(state.prune_expired(1_600, 500), 1);
        assert!(state.event(old).is_none());
        Ok(())
    }

    #[test]
    fn full_queue_evicts_settled_before_pending() -> Result<()> {
        let mut state = state();
        let ids = (0..4)
            .map(|i| state.append_event(b"x", 10 + i))
            .collect::<Result<Vec<_>>>()?;
        state.mark_processed(ids[2], 20);
        let newest = state.append_event(b"y", 30)?;
        assert!(state.event(ids[2]).is_none());
        assert!(state.event(ids[0]).is_some());

        let overflow = state.append_event(b"z", 40)?;
        assert!(state.event(ids[0]).is_none());
        let order: Vec<u64> = state.events().map(|e| e.id).collect();
        assert_eq!(order, vec![ids[1], ids[3], newest, overflow]);
        Ok(())
    }

    #[test]
    fn lease_freshness_boundary() {
        let lease = LeaseRecord {
            owner: InstanceId::from_raw(7),
            owner_pid: 0,
            owner_start_time: 0,
            acquired_at_ms: 1_000,
            heartbeat_at_ms: 1_000,
            lease_duration_ms: 500,
        };
        assert!(lease.is_fresh(1_499));
        assert!(!lease.is_fresh(1_500));
        assert!(lease.is_fresh(900));
    }
}
