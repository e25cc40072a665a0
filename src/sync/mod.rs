//! Coordination primitives layered on the notification graph

mod channel;
mod lock;
mod queue;
mod resources;
pub(crate) mod waitq;

pub use channel::Channel;
pub use lock::{Lock, LockGuard};
pub use queue::Queue;
pub use resources::{Capacities, ResourceClaim, Resources};
