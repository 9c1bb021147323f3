use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::core::layout::Geometry;
use crate::core::Result;
use crate::store::{CoordinationStore, StoreState};

/// In-process store with the same contract as [`FileStore`].
///
/// Nothing outside the current process can see it, so a host running on a
/// `MemoryStore` is always its own owner.
///
/// [`FileStore`]: crate::store::FileStore
pub struct MemoryStore {
    inner: Mutex<Inner>,
    changed: Condvar,
}

struct Inner {
    state: StoreState,
    seq: u32,
}

impl MemoryStore {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: StoreState::new(geometry.capacity, geometry.max_payload),
                seq: 0,
            }),
            changed: Condvar::new(),
        }
    }

    // State is only replaced after a closure succeeds, so a panic inside one
    // cannot leave it half-written and poisoning carries no information.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CoordinationStore for MemoryStore {
    fn with_exclusive_access<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut StoreState) -> Result<R>,
    {
        let mut inner = self.lock();
        let mut scratch = inner.state.clone();
        let out = f(&mut scratch)?;
        inner.state = scratch;
        Ok(out)
    }

    fn change_seq(&self) -> u32 {
        self.lock().seq
    }

    fn notify_change(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.seq = inner.seq.wrapping_add(1);
        self.changed.notify_all();
        Ok(())
    }

    fn wait_for_change(&self, seen: u32, timeout: Duration) -> Result<()> {
        let inner = self.lock();
        let _ = self
            .changed
            .wait_timeout_while(inner, timeout, |inner| inner.seq == seen)
            .unwrap_or_else(PoisonError::into_inner);
        Ok(())
    }
}
