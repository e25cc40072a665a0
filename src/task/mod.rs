//! Tasks: identities, state machine, handles, spawning
//!
//! A task is a suspended future owned by the kernel's arena and referenced
//! everywhere else by [`TaskId`]. Its lifecycle is
//! `Created → Running → (Waiting ↔ Running) → {Success, Failed, Cancelled}`;
//! terminal states are sticky and the payload stays readable through the
//! [`TaskHandle`].

mod scope;

pub use scope::{scope, until};

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::{Rc, Weak};

use anyhow::anyhow;

use crate::error::{self, CancelTask, Fault, SharedFault, SimResult};
use crate::kernel::core::{Core, ScopeId};
use crate::notify::Notification;

/// Opaque task identifier into the kernel's task arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub(crate) fn as_raw(self) -> u64 {
        self.0
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Spawned but not yet resumed once.
    Created,
    /// Currently executing its body.
    Running,
    /// Subscribed to a notification (or parked in the turn queue).
    Waiting,
    /// Terminated by a delivered cancellation.
    Cancelled,
    /// Terminated with a non-cancellation fault.
    Failed,
    /// Completed normally.
    Success,
}

impl TaskState {
    /// True for `Cancelled`, `Failed`, and `Success`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Cancelled | TaskState::Failed | TaskState::Success
        )
    }
}

/// Spawning handle for a structured-concurrency scope.
///
/// Obtained inside [`scope`] / [`until`] bodies (and from
/// [`run`](crate::run) for the root scope). Tasks it spawns become children
/// of that scope and cannot outlive it.
#[derive(Clone)]
pub struct ScopeHandle {
    core: Weak<Core>,
    scope: ScopeId,
}

impl ScopeHandle {
    pub(crate) fn new(core: Weak<Core>, scope: ScopeId) -> Self {
        Self { core, scope }
    }

    /// Spawn a child task, runnable this instant.
    pub fn spawn<T, Fut>(&self, body: Fut) -> TaskHandle<T>
    where
        T: 'static,
        Fut: Future<Output = SimResult<T>> + 'static,
    {
        self.spawn_inner(body, 0.0, false)
    }

    /// Spawn a child task whose first resumption happens `delay` time units
    /// from now. Non-positive delays count as immediate.
    pub fn spawn_after<T, Fut>(&self, delay: f64, body: Fut) -> TaskHandle<T>
    where
        T: 'static,
        Fut: Future<Output = SimResult<T>> + 'static,
    {
        self.spawn_inner(body, delay, false)
    }

    /// Spawn a volatile child: it never blocks scope exit and is
    /// force-closed at teardown.
    pub fn spawn_volatile<T, Fut>(&self, body: Fut) -> TaskHandle<T>
    where
        T: 'static,
        Fut: Future<Output = SimResult<T>> + 'static,
    {
        self.spawn_inner(body, 0.0, true)
    }

    fn spawn_inner<T, Fut>(&self, body: Fut, after: f64, volatile: bool) -> TaskHandle<T>
    where
        T: 'static,
        Fut: Future<Output = SimResult<T>> + 'static,
    {
        let Some(core) = self.core.upgrade() else {
            panic!("scope handle used after its simulation ended");
        };
        let value = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&value);
        let wrapped = async move {
            let output = body.await?;
            *slot.borrow_mut() = Some(output);
            Ok(())
        };
        let record = core.spawn_task(self.scope, Box::pin(wrapped), volatile, after);
        if core.scope_is_closing(self.scope) {
            // Late spawn into a closing scope: stillborn.
            let reason: Fault = if volatile {
                Fault::new(error::VolatileTaskClosed)
            } else {
                Fault::new(error::TaskClosed)
            };
            core.cancel(record.id, reason);
        }
        TaskHandle {
            id: record.id,
            state: record.state,
            outcome: record.outcome,
            done: record.done,
            value,
            core: self.core.clone(),
        }
    }
}

/// Handle to a spawned task.
///
/// Dropping the handle does not affect the task; the owning scope still
/// awaits it.
pub struct TaskHandle<T> {
    id: TaskId,
    state: Rc<Cell<TaskState>>,
    outcome: Rc<RefCell<Option<SharedFault>>>,
    done: Notification,
    value: Rc<RefCell<Option<T>>>,
    core: Weak<Core>,
}

impl<T: 'static> TaskHandle<T> {
    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    /// Completion sentinel: true once the task is terminal.
    pub fn done(&self) -> Notification {
        self.done.clone()
    }

    /// Request cancellation with the default [`CancelTask`] reason.
    /// Idempotent; a no-op once the task is terminal.
    pub fn cancel(&self) {
        self.cancel_with(Fault::new(CancelTask));
    }

    /// Request cancellation with an explicit reason.
    pub fn cancel_with(&self, reason: Fault) {
        if let Some(core) = self.core.upgrade() {
            core.cancel(self.id, reason);
        }
    }

    /// Suspend until the task is terminal and yield its outcome.
    ///
    /// A `Failed` or `Cancelled` task surfaces as
    /// [`TaskFailed`](crate::error::TaskFailed) wrapping the shared fault;
    /// the joiner's own cancellation propagates unwrapped.
    pub async fn join(self) -> SimResult<T> {
        self.done.wait().await?;
        match self.state.get() {
            TaskState::Success => self
                .value
                .borrow_mut()
                .take()
                .ok_or_else(|| anyhow!("task result already taken")),
            _ => {
                let shared = self
                    .outcome
                    .borrow()
                    .clone()
                    .unwrap_or_else(|| std::sync::Arc::new(anyhow!("task terminated")));
                Err(error::reraise(shared))
            }
        }
    }
}

impl<T: 'static> std::future::IntoFuture for TaskHandle<T> {
    type Output = SimResult<T>;
    type IntoFuture = futures::future::LocalBoxFuture<'static, SimResult<T>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.join())
    }
}
