//! Exclusive FIFO lock
//!
//! Waiters are served strictly in request order: release hands the lock
//! directly to the head waiter before it resumes, so a task acquiring later
//! can never barge past one already parked. The guard releases on every
//! exit path, including cancellation unwind.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::warn;

use crate::error::{Fault, LockReentry, SimResult};
use crate::kernel::context;
use crate::sync::waitq::WaitQueue;
use crate::task::TaskId;

struct LockState {
    holder: Option<TaskId>,
    waiters: WaitQueue<()>,
}

/// Exclusive lock with FIFO handoff.
///
/// # Usage
///
/// ```rust,no_run
/// use musim::{time, Lock, SimResult};
///
/// async fn worker(lock: Lock) -> SimResult<()> {
///     let _guard = lock.acquire().await?;
///     time::after(10.0).await?;
///     Ok(())
/// } // guard drops: next waiter in line gets the lock
/// ```
#[derive(Clone)]
pub struct Lock {
    state: Rc<RefCell<LockState>>,
}

impl Lock {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(LockState {
                holder: None,
                waiters: WaitQueue::new(),
            })),
        }
    }

    /// Acquire the lock, suspending behind earlier requesters.
    ///
    /// Re-acquisition by the current holder is a self-deadlock and is
    /// diagnosed as [`LockReentry`] instead of hanging.
    pub async fn acquire(&self) -> SimResult<LockGuard> {
        let core = context::current();
        let me = core.current_task();
        let slot = {
            let mut state = self.state.borrow_mut();
            if state.holder == Some(me) {
                warn!("lock re-acquired by its holder");
                return Err(Fault::new(LockReentry));
            }
            if state.holder.is_none() && state.waiters.is_empty() {
                state.holder = Some(me);
                return Ok(LockGuard { lock: self.clone() });
            }
            state.waiters.enqueue(me)
        };
        match slot.wait().await {
            Ok(()) => Ok(LockGuard { lock: self.clone() }),
            Err(fault) => {
                if slot.granted() {
                    // Handed the lock between grant and resumption; pass it on.
                    self.release();
                } else {
                    self.state.borrow_mut().waiters.forget(&slot);
                }
                Err(fault)
            }
        }
    }

    /// True while some task holds the lock.
    pub fn is_held(&self) -> bool {
        self.state.borrow().holder.is_some()
    }

    fn release(&self) {
        let next = {
            let mut state = self.state.borrow_mut();
            state.holder = None;
            let next = state.waiters.pop();
            if let Some(slot) = &next {
                state.holder = Some(slot.task);
            }
            next
        };
        if let Some(slot) = next {
            slot.grant(());
        }
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped ownership of a [`Lock`]; releases on drop.
pub struct LockGuard {
    lock: Lock,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.lock.release();
    }
}
