//! Lease-based election of the single owner.

use std::sync::Arc;

use crate::core::process::{process_alive, InstanceId, ProcessIdentity};
use crate::core::{Clock, Result};
use crate::store::{CoordinationStore, LeaseRecord};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Unelected,
    Owner,
    Client,
}

/// Whether `lease` still entitles its holder to ownership at `now_ms`.
///
/// A fresh heartbeat is not enough when the holder's process can be probed
/// and is gone; a stale heartbeat always loses.
pub fn lease_alive(lease: &LeaseRecord, now_ms: u64) -> bool {
    if !lease.is_fresh(now_ms) {
        return false;
    }
    let holder = ProcessIdentity {
        pid: lease.owner_pid,
        start_time: lease.owner_start_time,
    };
    process_alive(holder) != Some(false)
}

pub struct OwnershipManager<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    id: InstanceId,
    process: ProcessIdentity,
    lease_duration_ms: u64,
    role: Role,
}

impl<S: CoordinationStore> OwnershipManager<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, lease_duration_ms: u64) -> Self {
        Self::with_identity(
            store,
            clock,
            lease_duration_ms,
            InstanceId::generate(),
            ProcessIdentity::current(),
        )
    }

    /// Builds a manager with an explicit identity. Tests use this to stand
    /// in for several processes inside one.
    pub fn with_identity(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        lease_duration_ms: u64,
        id: InstanceId,
        process: ProcessIdentity,
    ) -> Self {
        Self {
            store,
            clock,
            id,
            process,
            lease_duration_ms,
            role: Role::Unelected,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Role decided by the most recent election, renewal or ownership check.
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn lease_duration_ms(&self) -> u64 {
        self.lease_duration_ms
    }

    /// Claims the lease if it is absent, expired, held by a dead process or
    /// already ours. Returns false when another live instance holds it.
    pub fn try_become_owner(&mut self) -> Result<bool> {
        let now = self.clock.now_ms();
        let me = self.id;
        let process = self.process;
        let lease_duration_ms = self.lease_duration_ms;
        let previous = self.store.with_exclusive_access(|state| match state.lease {
            Some(lease) if lease.owner != me && lease_alive(&lease, now) => Ok(Err(lease)),
            previous => {
                let acquired_at_ms = match previous {
                    Some(lease) if lease.owner == me => lease.acquired_at_ms,
                    _ => now,
                };
                state.lease = Some(LeaseRecord {
                    owner: me,
                    owner_pid: process.pid,
                    owner_start_time: process.start_time,
                    acquired_at_ms,
                    heartbeat_at_ms: now,
                    lease_duration_ms,
                });
                Ok(Ok(previous))
            }
        })?;

        match previous {
            Ok(previous) => {
                match previous {
                    Some(lease) if lease.owner != me => log::warn!(
                        "instance {me} took over lease from {} (last heartbeat {}ms ago)",
                        lease.owner,
                        now.saturating_sub(lease.heartbeat_at_ms)
                    ),
                    Some(_) => log::debug!("instance {me} re-claimed its own lease"),
                    None => log::info!("instance {me} is now owner"),
                }
                self.role = Role::Owner;
                Ok(true)
            }
            Err(holder) => {
                log::debug!("instance {me} is client of owner {}", holder.owner);
                self.role = Role::Client;
                Ok(false)
            }
        }
    }

    /// Refreshes the heartbeat. Returns false, and becomes a client, if the
    /// lease now belongs to someone else or was released.
    pub fn renew_lease(&mut self) -> Result<bool> {
        let now = self.clock.now_ms();
        let me = self.id;
        let renewed = self.store.with_exclusive_access(|state| match state.lease.as_mut() {
            Some(lease) if lease.owner == me => {
                lease.heartbeat_at_ms = now;
                Ok(true)
            }
            _ => Ok(false),
        })?;
        if renewed {
            self.role = Role::Owner;
        } else if self.role == Role::Owner {
            log::warn!("instance {me} lost ownership");
            self.role = Role::Client;
        }
        Ok(renewed)
    }

    /// True when the stored lease names this instance and has not expired.
    pub fn is_current_owner(&mut self) -> Result<bool> {
        let now = self.clock.now_ms();
        let owner = self
            .store
            .read_lease()?
            .is_some_and(|lease| lease.owner == self.id && lease.is_fresh(now));
        self.role = match (owner, self.role) {
            (true, _) => Role::Owner,
            (false, Role::Unelected) => Role::Unelected,
            (false, _) => Role::Client,
        };
        Ok(owner)
    }

    /// True when the stored lease names this instance, fresh or not. Nobody
    /// else has claimed it since, so [`try_become_owner`] will succeed.
    ///
    /// [`try_become_owner`]: OwnershipManager::try_become_owner
    pub fn holds_lease(&self) -> Result<bool> {
        Ok(self.store.read_lease()?.is_some_and(|lease| lease.owner == self.id))
    }

    /// Gives the lease up so the next launch need not wait for expiry.
    pub fn release(&mut self) -> Result<()> {
        let me = self.id;
        let released = self.store.with_exclusive_access(|state| {
            if state.lease.is_some_and(|lease| lease.owner == me) {
                state.lease = None;
                return Ok(true);
            }
            Ok(false)
        })?;
        if released {
            log::info!("instance {me} released ownership");
        }
        self.role = Role::Unelected;
        Ok(())
    }
}
