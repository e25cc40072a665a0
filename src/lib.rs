//! musim: a deterministic discrete-event simulation kernel
//!
//! A cooperative, single-threaded scheduler driven by virtual time. Tasks
//! are ordinary futures; every suspension point parks the task on a
//! *notification* (an observable Boolean predicate) and the kernel wakes
//! subscribers in a strictly deterministic order: FIFO within an instant,
//! earliest-timestamp-first across instants, subscription order when a
//! notification fires. Two runs with the same roots produce the same event
//! sequence.
//!
//! On top of the kernel sit structured concurrency ([`scope`], [`until`]),
//! cancellation with error-shaped propagation, and coordination primitives:
//! [`Flag`], [`Tracked`], [`Lock`], broadcast [`Channel`], anycast
//! [`Queue`], and [`Resources`]/[`Capacities`] counters.
//!
//! ```rust,no_run
//! use musim::{time, SimResult, SimTime};
//!
//! fn main() -> SimResult<()> {
//!     musim::run(Some(SimTime::new(5.0)), |scope| async move {
//!         scope.spawn(async {
//!             let mut tick = time::delay(1.0);
//!             for _ in 0..5 {
//!                 let now = tick.next().await?;
//!                 println!("tick at {now}");
//!             }
//!             Ok(())
//!         });
//!         Ok(())
//!     })
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod error;
pub mod kernel;
pub mod notify;
pub mod sync;
pub mod task;
pub mod time;

pub use error::{
    CancelTask, CapacityExceeded, Concurrent, Fault, FaultSet, Fatal, LockReentry,
    ResourcesUnavailable, SimResult, StreamClosed, TaskCancelled, TaskClosed, TaskFailed,
    VolatileTaskClosed,
};
pub use kernel::{run, SimTime};
pub use notify::{Flag, Notification, Tracked};
pub use sync::{Capacities, Channel, Lock, LockGuard, Queue, ResourceClaim, Resources};
pub use task::{scope, until, ScopeHandle, TaskHandle, TaskId, TaskState};
