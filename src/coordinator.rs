//! The API a host application consumes at launch.
//!
//! ```no_run
//! use handoff::{Coordinator, Handoff, HandoffConfig, Matcher};
//!
//! let mut coordinator = Coordinator::open_or_standalone(HandoffConfig::new("qtox"))?;
//! coordinator.register_event_handler(Matcher::prefix("tox:"), |uri| {
//!     println!("opening {}", String::from_utf8_lossy(uri));
//!     true
//! });
//! if let Some(uri) = std::env::args().nth(1) {
//!     if coordinator.handoff(uri.as_bytes())? != Handoff::HandledLocally {
//!         return Ok(()); // another instance has it
//!     }
//! }
//! loop {
//!     coordinator.tick()?;
//!     std::thread::sleep(coordinator.config().lease.renew_interval());
//! }
//! # Ok::<(), handoff::Error>(())
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::channel::{EventChannel, WaitOutcome};
use crate::config::HandoffConfig;
use crate::core::clock::Deadline;
use crate::core::{Clock, Result, SystemClock};
use crate::dispatch::{Dispatcher, HandlerTable, Matcher, TickReport};
use crate::ownership::{OwnershipManager, Role};
use crate::store::{AnyStore, CoordinationStore, FileStore, MemoryStore};

/// Where a handed-off payload ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handoff {
    /// This instance is (or just became) the owner and ran the handler.
    /// The caller should keep running.
    HandledLocally,
    /// The owner processed it. The caller can exit.
    HandledRemotely,
    /// A live owner exists but did not process the payload in time. The
    /// caller should exit; the event may still be processed later.
    Undelivered,
}

pub struct Coordinator<S: CoordinationStore = AnyStore> {
    config: HandoffConfig,
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    channel: EventChannel<S>,
    dispatcher: Dispatcher<S>,
}

impl Coordinator<AnyStore> {
    /// Opens the shared store named by `config` and runs the first election.
    pub fn open(config: HandoffConfig) -> Result<Self> {
        config.validate()?;
        let path = config.store_path();
        let store = FileStore::open(&path, config.geometry())?;
        log::debug!("using store {}", path.display());
        Self::with_store(config, Arc::new(AnyStore::File(store)), Arc::new(SystemClock))
    }

    /// Like [`Coordinator::open`], but when the shared store is unusable the
    /// instance runs standalone as its own owner on a private in-memory
    /// store. Single-instance behaviour is lost in that case.
    pub fn open_or_standalone(config: HandoffConfig) -> Result<Self> {
        config.validate()?;
        match Self::open(config.clone()) {
            Ok(coordinator) => Ok(coordinator),
            Err(err) if err.is_store_unavailable() => {
                log::warn!("shared store unavailable ({err}), running standalone");
                let store = AnyStore::Memory(MemoryStore::new(config.geometry()));
                Self::with_store(config, Arc::new(store), Arc::new(SystemClock))
            }
            Err(err) => Err(err),
        }
    }
}

impl<S: CoordinationStore> Coordinator<S> {
    pub fn with_store(config: HandoffConfig, store: Arc<S>, clock: Arc<dyn Clock>) -> Result<Self> {
        let ownership = OwnershipManager::new(Arc::clone(&store), Arc::clone(&clock), config.lease.duration_ms);
        Self::with_ownership(config, store, clock, ownership)
    }

    /// Assembles a coordinator around an existing ownership manager, which
    /// must share `store` and `clock`.
    pub fn with_ownership(
        config: HandoffConfig,
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        ownership: OwnershipManager<S>,
    ) -> Result<Self> {
        config.validate()?;
        let channel = EventChannel::new(Arc::clone(&store), Arc::clone(&clock), config.channel.poll_interval());
        let dispatcher = Dispatcher::new(
            ownership,
            Arc::clone(&store),
            Arc::clone(&clock),
            HandlerTable::new(),
            config.store.max_event_age_ms,
        );
        let mut coordinator = Self {
            config,
            store,
            clock,
            channel,
            dispatcher,
        };
        coordinator.try_become_owner()?;
        Ok(coordinator)
    }

    pub fn config(&self) -> &HandoffConfig {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.dispatcher.ownership().role()
    }

    pub fn register_event_handler(&mut self, matcher: Matcher, handler: impl FnMut(&[u8]) -> bool + Send + 'static) {
        self.dispatcher.handlers_mut().register(matcher, handler);
    }

    pub fn try_become_owner(&mut self) -> Result<bool> {
        self.dispatcher.ownership_mut().try_become_owner()
    }

    pub fn is_current_owner(&mut self) -> Result<bool> {
        self.dispatcher.ownership_mut().is_current_owner()
    }

    pub fn post_event(&self, payload: &[u8]) -> Result<u64> {
        self.channel.post_event(payload)
    }

    pub fn wait_until_processed(&self, id: u64, timeout: Duration) -> Result<WaitOutcome> {
        self.channel.wait_until_processed(id, timeout)
    }

    /// One iteration of the host's main loop. A client re-runs the election
    /// first, so a surviving instance takes over from a dead owner; the
    /// owner then drains pending events.
    pub fn tick(&mut self) -> Result<TickReport> {
        if self.role() != Role::Owner {
            self.try_become_owner()?;
        }
        self.dispatcher.tick()
    }

    /// Routes a startup payload to whoever owns the application.
    ///
    /// The owner runs its handler directly. A client posts the payload and
    /// waits up to the configured timeout; if the owner vanishes, or never
    /// answers and can be replaced, the client takes ownership and runs the
    /// handler itself.
    pub fn handoff(&mut self, payload: &[u8]) -> Result<Handoff> {
        if self.is_current_owner()? || self.reclaim_stale_lease()? {
            self.run_local(payload);
            return Ok(Handoff::HandledLocally);
        }

        let id = self.post_event(payload)?;
        let deadline = Deadline::after(self.config.channel.wait_timeout());
        loop {
            let outcome = self.wait_until_processed(id, deadline.remaining())?;
            if outcome == WaitOutcome::Processed {
                return Ok(Handoff::HandledRemotely);
            }
            if self.try_become_owner()? {
                // Withdraw the queued copy before our own loop sees it.
                self.store.mark_processed(id, self.clock.now_ms())?;
                log::info!("handling event {id} locally after {outcome:?}");
                self.run_local(payload);
                return Ok(Handoff::HandledLocally);
            }
            if outcome != WaitOutcome::OwnerLost || deadline.expired() {
                log::warn!("event {id} undelivered after {outcome:?}");
                return Ok(Handoff::Undelivered);
            }
            log::debug!("event {id} passed to a new owner, waiting again");
        }
    }

    // An owner that went longer than one lease without ticking still holds
    // the record; posting to itself would only wait out the timeout.
    fn reclaim_stale_lease(&mut self) -> Result<bool> {
        if !self.dispatcher.ownership().holds_lease()? {
            return Ok(false);
        }
        log::debug!("own lease went stale before handoff, re-claiming");
        self.try_become_owner()
    }

    fn run_local(&mut self, payload: &[u8]) {
        if self.dispatcher.handlers_mut().dispatch(payload).is_none() {
            log::debug!("no handler for local payload ({} bytes)", payload.len());
        }
    }
}

impl<S: CoordinationStore> Drop for Coordinator<S> {
    fn drop(&mut self) {
        if self.role() == Role::Owner {
            if let Err(err) = self.dispatcher.ownership_mut().release() {
                log::warn!("failed to release ownership: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::process::{InstanceId, ProcessIdentity};
    use crate::core::ManualClock;
    use std::sync::Mutex;

    fn config() -> HandoffConfig {
        let mut config = HandoffConfig::new("test");
        config.lease.duration_ms = 400;
        config.lease.renew_interval_ms = 100;
        config.channel.poll_interval_ms = 10;
        config.channel.wait_timeout_ms = 300;
        config
    }

    fn memory() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new(config().geometry()))
    }

    fn recorder(coordinator: &mut Coordinator<MemoryStore>) -> Arc<Mutex<Vec<Vec<u8>>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        coordinator.register_event_handler(Matcher::prefix("tox:"), move |payload| {
            sink.lock().expect("sink").push(payload.to_vec());
            true
        });
        seen
    }

    #[test]
    fn first_instance_is_owner_and_handles_locally() -> Result<()> {
        let mut owner = Coordinator::with_store(config(), memory(), Arc::new(SystemClock))?;
        let seen = recorder(&mut owner);
        assert_eq!(owner.role(), Role::Owner);
        assert_eq!(owner.handoff(b"tox:abc")?, Handoff::HandledLocally);
        assert_eq!(*seen.lock().expect("seen"), vec![b"tox:abc".to_vec()]);
        // Handled directly: nothing went through the queue.
        assert_eq!(owner.tick()?.dispatched, 0);
        Ok(())
    }

    #[test]
    fn owner_with_stale_lease_handles_locally_without_waiting() -> Result<()> {
        let clock = ManualClock::new(5_000);
        let mut config = config();
        config.channel.wait_timeout_ms = 5_000;
        let mut owner = Coordinator::with_store(config, memory(), Arc::new(clock.clone()))?;
        let seen = recorder(&mut owner);
        assert_eq!(owner.role(), Role::Owner);

        clock.advance(Duration::from_millis(500));
        let start = std::time::Instant::now();
        assert_eq!(owner.handoff(b"tox:abc")?, Handoff::HandledLocally);
        assert!(start.elapsed() < Duration::from_secs(1), "waited on its own event");
        assert_eq!(*seen.lock().expect("seen"), vec![b"tox:abc".to_vec()]);
        assert!(owner.is_current_owner()?);
        assert_eq!(owner.tick()?.dispatched, 0);
        Ok(())
    }

    #[test]
    fn client_takes_over_when_owner_never_answers() -> Result<()> {
        let store = memory();
        let clock = ManualClock::new(5_000);
        let stale = OwnershipManager::with_identity(
            Arc::clone(&store),
            Arc::new(clock.clone()),
            400,
            InstanceId::from_raw(1),
            ProcessIdentity::unknown(),
        );
        let mut silent = Coordinator::with_ownership(config(), Arc::clone(&store), Arc::new(clock.clone()), stale)?;
        assert_eq!(silent.role(), Role::Owner);

        let mut client = Coordinator::with_store(config(), Arc::clone(&store), Arc::new(clock.clone()))?;
        let seen = recorder(&mut client);
        assert_eq!(client.role(), Role::Client);

        // The owner never ticks; once its lease lapses the client wins.
        let ticker = clock.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            ticker.advance(Duration::from_millis(500));
        });
        assert_eq!(client.handoff(b"tox:abc")?, Handoff::HandledLocally);
        handle.join().expect("clock thread");
        assert_eq!(client.role(), Role::Owner);
        assert_eq!(*seen.lock().expect("seen"), vec![b"tox:abc".to_vec()]);

        // The queued copy was withdrawn, so the new owner does not run it twice.
        assert_eq!(client.tick()?.dispatched, 0);
        assert!(!silent.is_current_owner()?);
        Ok(())
    }

    #[test]
    fn live_but_silent_owner_leaves_payload_undelivered() -> Result<()> {
        let store = memory();
        let clock = ManualClock::new(5_000);
        let _owner = Coordinator::with_store(config(), Arc::clone(&store), Arc::new(clock.clone()))?;
        let mut client = Coordinator::with_store(config(), Arc::clone(&store), Arc::new(clock.clone()))?;
        assert_eq!(client.handoff(b"tox:abc")?, Handoff::Undelivered);
        assert_eq!(client.role(), Role::Client);
        Ok(())
    }

    #[test]
    fn client_tick_takes_over_dead_owner() -> Result<()> {
        let store = memory();
        let clock = ManualClock::new(5_000);
        let owner = Coordinator::with_store(config(), Arc::clone(&store), Arc::new(clock.clone()))?;
        let mut client = Coordinator::with_store(config(), Arc::clone(&store), Arc::new(clock.clone()))?;
        assert!(!client.tick()?.owner);
        std::mem::forget(owner);
        clock.advance(Duration::from_millis(400));
        assert!(client.tick()?.owner);
        Ok(())
    }

    #[test]
    fn drop_releases_lease() -> Result<()> {
        let store = memory();
        let owner = Coordinator::with_store(config(), Arc::clone(&store), Arc::new(SystemClock))?;
        assert_eq!(owner.role(), Role::Owner);
        drop(owner);
        assert!(store.read_lease()?.is_none());
        let next = Coordinator::with_store(config(), Arc::clone(&store), Arc::new(SystemClock))?;
        assert_eq!(next.role(), Role::Owner);
        Ok(())
    }

    #[test]
    fn standalone_when_store_path_is_unusable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"")?;
        let mut config = config();
        config.store_path = Some(blocker.join("app.handoff"));

        assert!(Coordinator::open(config.clone()).is_err());
        let mut coordinator = Coordinator::open_or_standalone(config)?;
        assert_eq!(coordinator.role(), Role::Owner);
        assert!(coordinator.is_current_owner()?);
        Ok(())
    }

    #[test]
    fn invalid_config_is_not_masked_by_fallback() {
        let mut config = config();
        config.channel.poll_interval_ms = 0;
        assert!(Coordinator::open_or_standalone(config).is_err());
    }
}
