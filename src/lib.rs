//! Cooperative, event-driven state machines for small targets.
//!
//! Machines are hierarchical state machines ([`Machine`]) or protothreads
//! ([`Pt`]) registered with a [`Kernel`]. Interrupt handlers talk to them only
//! through the lock-free [`Mailbox`]; the main loop calls [`Kernel::poll`] and
//! sleeps while nothing is pending. Counting [`sync`] objects and
//! flow-controlled byte [`stream`]s connect machines to each other and to
//! drivers.

#![no_std]

#[cfg(any(test, feature = "std"))]
extern crate std;

#[macro_use]
mod fmt;

pub mod config;
pub mod error;
pub mod event;
pub mod fifo;
pub mod kernel;
pub mod machine;
pub mod mailbox;
pub mod pt;
pub mod state;
pub mod stats;
pub mod stream;
pub mod sync;
pub mod timer;

#[cfg(all(feature = "std", target_os = "linux"))]
pub mod host;

pub use error::{SmError, SmResult};
pub use event::{Event, EventFlags};
pub use kernel::{Context, DispatchPolicy, Kernel, KernelConfig, Parent};
pub use machine::{Dispatch, Machine, Outcome, SmId};
pub use mailbox::Mailbox;
pub use pt::{Pt, PtStatus, ThreadFn};
pub use state::{State, StateKey, Transition};
pub use stats::StatsSnapshot;
pub use stream::{EventNotify, SharedStream, Stream, StreamListener};
pub use sync::{Acquire, SyncId, SyncObject};
pub use timer::{TimerId, TimerService};
