//! Platform primitives the coordination layer is built from: the file
//! lock, the shared mapping and its byte layout, process identity, clocks
//! and the cross-process wake word.

pub mod clock;
pub mod error;
pub mod layout;
pub mod lock;
pub mod mmap;
pub mod process;
pub mod wait;

pub use clock::{Clock, Deadline, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use process::{InstanceId, ProcessIdentity};
