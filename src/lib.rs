//! Single-instance launch coordination.
//!
//! Every launch of an application opens the same shared store. One instance
//! holds a lease on it and is the owner; later launches hand their startup
//! payload (typically a URI) to the owner through a bounded event queue and
//! learn whether it was processed, or take over if the owner is gone.

pub mod channel;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod dispatch;
pub mod ownership;
pub mod store;

pub use channel::{EventChannel, WaitOutcome};
pub use config::HandoffConfig;
pub use coordinator::{Coordinator, Handoff};
pub use crate::core::{Clock, Error, InstanceId, ManualClock, Result, SystemClock};
pub use dispatch::{Dispatcher, HandlerTable, Matcher, TickReport};
pub use ownership::{OwnershipManager, Role};
pub use store::{AnyStore, CoordinationStore, Event, EventState, FileStore, LeaseRecord, MemoryStore};
