//! The simulation loop
//!
//! [`run`] is the only entry point: it owns a fresh kernel, drives the
//! two-level time-then-turn loop, and returns the root scope's outcome.
//! Within an instant, tasks resume in strict turn-queue FIFO order; time
//! advances only once the turn queue is drained, to the earliest timer key
//! not past `till`.

use std::collections::VecDeque;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::task::ArcWake;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::SimResult;
use crate::kernel::clock::SimTime;
use crate::kernel::context;
use crate::kernel::core::Core;
use crate::task::{ScopeHandle, TaskId};

/// Waker handed to task polls; wakes feed the kernel's inbox.
struct TaskWaker {
    task: TaskId,
    inbox: Arc<Mutex<VecDeque<TaskId>>>,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.inbox.lock().push_back(arc_self.task);
    }
}

/// Run a simulation to completion.
///
/// `root` receives the root scope's handle and runs as the root task; tasks
/// it spawns become root-scope children. `till` is an inclusive upper bound
/// on virtual time: the loop halts once both queues are drained or the next
/// event lies past the bound. Leftover tasks at the bound are discarded with
/// the kernel.
///
/// Child failures surface exactly as from any scope: a body error propagates
/// unwrapped, child-only failures arrive as one
/// [`Concurrent`](crate::error::Concurrent).
///
/// Re-entering a running kernel panics; calling `run` again after completion
/// starts from fresh state.
///
/// # Usage
///
/// ```rust,no_run
/// use musim::{time, SimResult, SimTime};
///
/// fn main() -> SimResult<()> {
///     musim::run(Some(SimTime::new(100.0)), |scope| async move {
///         scope.spawn(async {
///             time::after(3.0).await?;
///             Ok(())
///         });
///         Ok(())
///     })
/// }
/// ```
pub fn run<F, Fut>(till: Option<SimTime>, root: F) -> SimResult<()>
where
    F: FnOnce(ScopeHandle) -> Fut + 'static,
    Fut: Future<Output = SimResult<()>> + 'static,
{
    let core = Rc::new(Core::new());
    let _guard = context::install(Rc::clone(&core));

    let root_future = Box::pin(async move { crate::task::scope(root).await });
    let root_id = core.register_root(root_future);

    loop {
        core.drain_inbox();
        while let Some(task) = core.next_turn() {
            poll_task(&core, task);
            core.drain_inbox();
        }
        match core.next_due() {
            Some(due) if till.map_or(true, |limit| due <= limit) => core.advance(),
            _ => break,
        }
    }
    trace!(t = %core.now(), "simulation halted");

    let result = core.root_outcome(root_id);
    core.teardown();
    result
}

fn poll_task(core: &Rc<Core>, task: TaskId) {
    let Some(mut future) = core.begin_poll(task) else {
        return;
    };
    core.set_current(Some(task));
    trace!(task = task.as_raw(), "resuming task");
    let waker = futures::task::waker(Arc::new(TaskWaker {
        task,
        inbox: core.inbox(),
    }));
    let mut cx = Context::from_waker(&waker);
    let poll = future.as_mut().poll(&mut cx);
    core.set_current(None);
    match poll {
        Poll::Pending => core.end_poll_pending(task, future),
        Poll::Ready(result) => core.finish_task(task, result),
    }
}
