//! Kernel state: task and scope arenas, turn queue, timers
//!
//! The core owns every task and scope by id, which breaks the reference
//! cycles between tasks, scopes, and notifications: scopes hold child ids,
//! notifications hold subscriber ids, and task entries refer back to their
//! scope by id. All state is single-threaded (`Rc`/`RefCell`); the only
//! `Send` boundary is the waker inbox, fed by [`ArcWake`] wakers and drained
//! into the turn queue between polls.
//!
//! [`ArcWake`]: futures::task::ArcWake

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use futures::future::LocalBoxFuture;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{
    self, Fault, SharedFault, SimResult, TaskCancelled, TaskClosed, VolatileTaskClosed,
};
use crate::kernel::clock::{SimTime, TimeQueue, WakeRecord};
use crate::notify::{Notification, NotifyNode};
use crate::task::{TaskId, TaskState};

/// Opaque scope identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ScopeId(u64);

impl ScopeId {
    pub(crate) fn as_raw(self) -> u64 {
        self.0
    }
}

type TaskFuture = LocalBoxFuture<'static, SimResult<()>>;

struct TaskEntry {
    future: Option<TaskFuture>,
    state: Rc<Cell<TaskState>>,
    scope: Option<ScopeId>,
    volatile: bool,
    /// In the turn queue right now.
    queued: bool,
    /// Polled at least once; a never-started task cancels without running.
    started: bool,
    cancel_requested: bool,
    cancel_note: Option<String>,
    /// Faults to deliver at upcoming suspension points, front first. A
    /// cancellation jumps the queue; scope interrupts line up behind it.
    pending: VecDeque<Fault>,
    waiting_on: Option<Notification>,
    /// Completion sentinel; fires when the task goes terminal.
    done: Notification,
    /// Terminal fault as seen through the task's handle.
    outcome: Rc<RefCell<Option<SharedFault>>>,
    /// Root task only: the unshared fault returned from `run`.
    root_failure: Option<Fault>,
}

struct ScopeEntry {
    owner: TaskId,
    children: Vec<TaskId>,
    closing: bool,
    failures: Vec<SharedFault>,
    /// Fires whenever a child goes terminal.
    stir: Notification,
}

/// Everything a freshly spawned task hands back to its handle.
pub(crate) struct SpawnRecord {
    pub id: TaskId,
    pub state: Rc<Cell<TaskState>>,
    pub outcome: Rc<RefCell<Option<SharedFault>>>,
    pub done: Notification,
}

/// Single-threaded kernel state.
pub(crate) struct Core {
    now: Cell<SimTime>,
    turn: RefCell<VecDeque<TaskId>>,
    timers: RefCell<TimeQueue>,
    tasks: RefCell<HashMap<TaskId, TaskEntry>>,
    scopes: RefCell<HashMap<ScopeId, ScopeEntry>>,
    next_task: Cell<u64>,
    next_scope: Cell<u64>,
    current: Cell<Option<TaskId>>,
    inbox: Arc<Mutex<VecDeque<TaskId>>>,
}

impl Core {
    pub(crate) fn new() -> Self {
        Self {
            now: Cell::new(SimTime::ZERO),
            turn: RefCell::new(VecDeque::new()),
            timers: RefCell::new(TimeQueue::new()),
            tasks: RefCell::new(HashMap::new()),
            scopes: RefCell::new(HashMap::new()),
            next_task: Cell::new(0),
            next_scope: Cell::new(0),
            current: Cell::new(None),
            inbox: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    // ── clock ───────────────────────────────────────────────────────────

    pub(crate) fn now(&self) -> SimTime {
        self.now.get()
    }

    pub(crate) fn arm_timer(&self, due: SimTime, node: std::rc::Weak<NotifyNode>) {
        self.timers.borrow_mut().push(due, WakeRecord::Fire(node));
    }

    pub(crate) fn next_due(&self) -> Option<SimTime> {
        self.timers.borrow().next_due()
    }

    /// Advance the clock to the earliest timer key and dispatch its bucket
    /// in insertion order.
    pub(crate) fn advance(self: &Rc<Self>) {
        let Some((at, records)) = self.timers.borrow_mut().pop_due() else {
            return;
        };
        debug_assert!(at >= self.now.get(), "time went backwards");
        self.now.set(at);
        trace!(t = %at, records = records.len(), "advancing virtual time");
        for record in records {
            match record {
                WakeRecord::Resume(task) => self.schedule(task),
                WakeRecord::Fire(weak) => {
                    if let Some(node) = weak.upgrade() {
                        node.changed(self);
                    }
                }
            }
        }
    }

    // ── turn queue & waker inbox ────────────────────────────────────────

    /// Enqueue a runnable task at the turn-queue tail, at most once.
    pub(crate) fn schedule(&self, task: TaskId) {
        let mut tasks = self.tasks.borrow_mut();
        let Some(entry) = tasks.get_mut(&task) else {
            return;
        };
        if entry.queued || entry.state.get().is_terminal() {
            return;
        }
        entry.queued = true;
        drop(tasks);
        self.turn.borrow_mut().push_back(task);
    }

    pub(crate) fn next_turn(&self) -> Option<TaskId> {
        self.turn.borrow_mut().pop_front()
    }

    pub(crate) fn inbox(&self) -> Arc<Mutex<VecDeque<TaskId>>> {
        Arc::clone(&self.inbox)
    }

    /// Move waker-driven wakeups into the turn queue.
    pub(crate) fn drain_inbox(&self) {
        loop {
            let Some(task) = self.inbox.lock().pop_front() else {
                return;
            };
            self.schedule(task);
        }
    }

    // ── polling protocol ────────────────────────────────────────────────

    /// Check out a task's future for polling. `None` for tasks that went
    /// terminal while queued (stale turn entries).
    pub(crate) fn begin_poll(&self, task: TaskId) -> Option<TaskFuture> {
        let mut tasks = self.tasks.borrow_mut();
        let entry = tasks.get_mut(&task)?;
        entry.queued = false;
        if entry.state.get().is_terminal() {
            return None;
        }
        let future = entry.future.take()?;
        entry.started = true;
        entry.state.set(TaskState::Running);
        Some(future)
    }

    pub(crate) fn end_poll_pending(&self, task: TaskId, future: TaskFuture) {
        let mut tasks = self.tasks.borrow_mut();
        let Some(entry) = tasks.get_mut(&task) else {
            return;
        };
        entry.future = Some(future);
        entry.state.set(TaskState::Waiting);
    }

    pub(crate) fn current_task(&self) -> TaskId {
        match self.current.get() {
            Some(task) => task,
            None => panic!("suspension primitive used outside a simulation task"),
        }
    }

    pub(crate) fn set_current(&self, task: Option<TaskId>) {
        self.current.set(task);
    }

    // ── suspension bookkeeping ──────────────────────────────────────────

    pub(crate) fn take_pending(&self, task: TaskId) -> Option<Fault> {
        self.tasks.borrow_mut().get_mut(&task)?.pending.pop_front()
    }

    pub(crate) fn set_wait(&self, task: TaskId, notification: Notification) {
        if let Some(entry) = self.tasks.borrow_mut().get_mut(&task) {
            entry.waiting_on = Some(notification);
        }
    }

    /// Clear a task's wait slot if it still points at `node`.
    pub(crate) fn clear_wait(&self, task: TaskId, node: &Rc<NotifyNode>) {
        if let Some(entry) = self.tasks.borrow_mut().get_mut(&task) {
            let matches = entry
                .waiting_on
                .as_ref()
                .is_some_and(|n| Rc::ptr_eq(&n.node, node));
            if matches {
                entry.waiting_on = None;
            }
        }
    }

    /// A notification the task was subscribed to fired: unpark it.
    pub(crate) fn notify_fired(&self, task: TaskId, node: &Rc<NotifyNode>) {
        self.clear_wait(task, node);
        self.schedule(task);
    }

    // ── spawning ────────────────────────────────────────────────────────

    fn new_task_entry(&self, future: TaskFuture, scope: Option<ScopeId>, volatile: bool) -> TaskId {
        let id = TaskId::from_raw(self.next_task.get());
        self.next_task.set(id.as_raw() + 1);
        let entry = TaskEntry {
            future: Some(future),
            state: Rc::new(Cell::new(TaskState::Created)),
            scope,
            volatile,
            queued: false,
            started: false,
            cancel_requested: false,
            cancel_note: None,
            pending: VecDeque::new(),
            waiting_on: None,
            done: Notification::flag(false),
            outcome: Rc::new(RefCell::new(None)),
            root_failure: None,
        };
        self.tasks.borrow_mut().insert(id, entry);
        id
    }

    pub(crate) fn register_root(&self, future: TaskFuture) -> TaskId {
        let id = self.new_task_entry(future, None, false);
        self.schedule(id);
        id
    }

    pub(crate) fn spawn_task(
        &self,
        scope: ScopeId,
        future: TaskFuture,
        volatile: bool,
        after: f64,
    ) -> SpawnRecord {
        let id = self.new_task_entry(future, Some(scope), volatile);
        if let Some(entry) = self.scopes.borrow_mut().get_mut(&scope) {
            entry.children.push(id);
        }
        if after > 0.0 {
            self.timers
                .borrow_mut()
                .push(self.now() + after, WakeRecord::Resume(id));
        } else {
            // Negative delays count as immediate.
            self.schedule(id);
        }
        let tasks = self.tasks.borrow();
        let entry = &tasks[&id];
        SpawnRecord {
            id,
            state: Rc::clone(&entry.state),
            outcome: Rc::clone(&entry.outcome),
            done: entry.done.clone(),
        }
    }

    // ── completion ──────────────────────────────────────────────────────

    /// Record a task's terminal state, fire its completion sentinel, and
    /// inform its owning scope.
    pub(crate) fn finish_task(self: &Rc<Self>, task: TaskId, result: SimResult<()>) {
        let (done, waiting, scope, failed_shared) = {
            let mut tasks = self.tasks.borrow_mut();
            let Some(entry) = tasks.get_mut(&task) else {
                return;
            };
            if entry.state.get().is_terminal() {
                return;
            }
            entry.future = None;
            let waiting = entry.waiting_on.take();

            let mut failed_shared = None;
            match result {
                Ok(()) if !entry.cancel_requested => {
                    entry.state.set(TaskState::Success);
                    trace!(task = task.as_raw(), "task succeeded");
                }
                Err(fault) if !entry.cancel_requested && !error::is_cancellation(&fault) => {
                    entry.state.set(TaskState::Failed);
                    debug!(task = task.as_raw(), %fault, "task failed");
                    if entry.scope.is_some() {
                        let shared: SharedFault = Arc::new(fault);
                        *entry.outcome.borrow_mut() = Some(Arc::clone(&shared));
                        failed_shared = Some(shared);
                    } else {
                        entry.root_failure = Some(fault);
                    }
                }
                other => {
                    // Completed under a delivered cancellation, or returned a
                    // cancellation sentinel itself.
                    let note = match (&other, entry.cancel_note.clone()) {
                        (_, Some(note)) => note,
                        (Err(fault), None) => fault.to_string(),
                        (Ok(()), None) => error::CancelTask.to_string(),
                    };
                    entry.state.set(TaskState::Cancelled);
                    trace!(task = task.as_raw(), reason = %note, "task cancelled");
                    *entry.outcome.borrow_mut() =
                        Some(Arc::new(Fault::new(TaskCancelled::new(note))));
                }
            }
            (entry.done.clone(), waiting, entry.scope, failed_shared)
        };

        if let Some(notification) = waiting {
            notification.node.unsubscribe_task(task);
        }
        done.node.set_flag(true);
        if let Some(scope) = scope {
            self.on_child_done(scope, failed_shared);
        }
    }

    fn on_child_done(self: &Rc<Self>, scope: ScopeId, failure: Option<SharedFault>) {
        let stir = {
            let mut scopes = self.scopes.borrow_mut();
            let Some(entry) = scopes.get_mut(&scope) else {
                return;
            };
            if let Some(fault) = failure {
                let duplicate = entry.failures.iter().any(|f| Arc::ptr_eq(f, &fault));
                if !duplicate {
                    entry.failures.push(fault);
                }
            }
            entry.stir.clone()
        };
        stir.node.set_flag(true);
    }

    // ── cancellation ────────────────────────────────────────────────────

    /// Request cancellation. Idempotent; a no-op on terminal tasks. A task
    /// that was never polled finishes `Cancelled` without running its body.
    pub(crate) fn cancel(self: &Rc<Self>, task: TaskId, reason: Fault) {
        let action = {
            let mut tasks = self.tasks.borrow_mut();
            let Some(entry) = tasks.get_mut(&task) else {
                return;
            };
            if entry.state.get().is_terminal() || entry.cancel_requested {
                return;
            }
            entry.cancel_requested = true;
            entry.cancel_note = Some(reason.to_string());
            if !entry.started {
                CancelAction::Stillborn(reason)
            } else {
                entry.pending.push_front(reason);
                CancelAction::Deliver(entry.waiting_on.take())
            }
        };
        match action {
            CancelAction::Stillborn(reason) => self.finish_task(task, Err(reason)),
            CancelAction::Deliver(waiting) => {
                if let Some(notification) = waiting {
                    notification.node.unsubscribe_task(task);
                    self.schedule(task);
                }
                // A running task observes the fault at its next suspension.
            }
        }
    }

    /// Deliver a fault without cancelling the task. Suppressed once the
    /// task's own cancellation is underway: a pending cancellation always
    /// wins over a scope interrupt. Interrupts from distinct scopes queue
    /// up and surface at consecutive suspension points.
    pub(crate) fn interrupt(self: &Rc<Self>, task: TaskId, fault: Fault) {
        let waiting = {
            let mut tasks = self.tasks.borrow_mut();
            let Some(entry) = tasks.get_mut(&task) else {
                return;
            };
            if entry.state.get().is_terminal() || entry.cancel_requested {
                return;
            }
            entry.pending.push_back(fault);
            entry.waiting_on.take()
        };
        if let Some(notification) = waiting {
            notification.node.unsubscribe_task(task);
            self.schedule(task);
        }
    }

    // ── scopes ──────────────────────────────────────────────────────────

    pub(crate) fn create_scope(&self, owner: TaskId) -> (ScopeId, Notification) {
        let id = ScopeId(self.next_scope.get());
        self.next_scope.set(id.0 + 1);
        let stir = Notification::flag(false);
        self.scopes.borrow_mut().insert(
            id,
            ScopeEntry {
                owner,
                children: Vec::new(),
                closing: false,
                failures: Vec::new(),
                stir: stir.clone(),
            },
        );
        (id, stir)
    }

    pub(crate) fn scope_owner(&self, scope: ScopeId) -> Option<TaskId> {
        self.scopes.borrow().get(&scope).map(|e| e.owner)
    }

    pub(crate) fn scope_failure_count(&self, scope: ScopeId) -> usize {
        self.scopes
            .borrow()
            .get(&scope)
            .map_or(0, |e| e.failures.len())
    }

    pub(crate) fn scope_is_closing(&self, scope: ScopeId) -> bool {
        self.scopes.borrow().get(&scope).is_some_and(|e| e.closing)
    }

    /// Live (non-terminal) children of the given volatility.
    pub(crate) fn live_children(&self, scope: ScopeId, volatile: bool) -> usize {
        let scopes = self.scopes.borrow();
        let Some(entry) = scopes.get(&scope) else {
            return 0;
        };
        let tasks = self.tasks.borrow();
        entry
            .children
            .iter()
            .filter(|id| {
                tasks
                    .get(*id)
                    .is_some_and(|t| t.volatile == volatile && !t.state.get().is_terminal())
            })
            .count()
    }

    /// Mark the scope closing and cancel its live children: `TaskClosed`
    /// for regular children, `VolatileTaskClosed` for volatile ones. With
    /// `interrupt_owner`, the owner task's current wait is broken with an
    /// [`Interrupt`](crate::error::Interrupt) so its body unwinds into scope
    /// teardown.
    pub(crate) fn close_scope(self: &Rc<Self>, scope: ScopeId, interrupt_owner: bool) {
        self.close_children(scope, true);
        if interrupt_owner {
            if let Some(owner) = self.scope_owner(scope) {
                self.interrupt(
                    owner,
                    Fault::new(crate::error::Interrupt {
                        scope: scope.as_raw(),
                    }),
                );
            }
        }
    }

    /// Cancel live children; with `include_regular` false only volatile
    /// children are closed (the end-of-teardown sweep).
    pub(crate) fn close_children(self: &Rc<Self>, scope: ScopeId, include_regular: bool) {
        let targets: Vec<(TaskId, bool)> = {
            let mut scopes = self.scopes.borrow_mut();
            let Some(entry) = scopes.get_mut(&scope) else {
                return;
            };
            entry.closing = true;
            let tasks = self.tasks.borrow();
            entry
                .children
                .iter()
                .filter_map(|id| {
                    let task = tasks.get(id)?;
                    if task.state.get().is_terminal() {
                        return None;
                    }
                    if !include_regular && !task.volatile {
                        return None;
                    }
                    Some((*id, task.volatile))
                })
                .collect()
        };
        let current = self.current.get();
        for (id, volatile) in targets {
            if Some(id) == current {
                // The closer is itself a child (an `until` watchdog about to
                // finish); it does not need cancelling.
                continue;
            }
            let reason = if volatile {
                Fault::new(VolatileTaskClosed)
            } else {
                Fault::new(TaskClosed)
            };
            self.cancel(id, reason);
        }
    }

    /// Drop any queued interrupts this scope addressed to `task`; they are
    /// meaningless once the scope has torn down.
    pub(crate) fn discard_scope_interrupts(&self, task: TaskId, scope: ScopeId) {
        if let Some(entry) = self.tasks.borrow_mut().get_mut(&task) {
            entry
                .pending
                .retain(|f| !error::is_interrupt_for(f, scope.as_raw()));
        }
    }

    /// Drop the scope and its (terminal) children; returns the collected
    /// unique child failures in observation order.
    pub(crate) fn reap_scope(&self, scope: ScopeId) -> Vec<SharedFault> {
        let Some(entry) = self.scopes.borrow_mut().remove(&scope) else {
            return Vec::new();
        };
        let reaped: Vec<TaskEntry> = {
            let mut tasks = self.tasks.borrow_mut();
            entry
                .children
                .iter()
                .filter_map(|child| tasks.remove(child))
                .collect()
        };
        // Entries drop outside the arena borrow: destructors may call back
        // into the kernel.
        drop(reaped);
        entry.failures
    }

    // ── run boundary ────────────────────────────────────────────────────

    pub(crate) fn root_outcome(&self, task: TaskId) -> SimResult<()> {
        let mut tasks = self.tasks.borrow_mut();
        let Some(entry) = tasks.get_mut(&task) else {
            return Ok(());
        };
        match entry.state.get() {
            TaskState::Failed => match entry.root_failure.take() {
                Some(fault) => Err(fault),
                None => Ok(()),
            },
            TaskState::Cancelled => Err(Fault::new(TaskCancelled::new(
                entry.cancel_note.clone().unwrap_or_default(),
            ))),
            // Success, or truncated by `till`.
            _ => Ok(()),
        }
    }

    /// Drop all remaining state so task futures (and their guards) release.
    pub(crate) fn teardown(&self) {
        self.turn.borrow_mut().clear();
        self.timers.borrow_mut().clear();
        self.scopes.borrow_mut().clear();
        let entries: Vec<TaskEntry> = {
            let mut tasks = self.tasks.borrow_mut();
            tasks.drain().map(|(_, entry)| entry).collect()
        };
        // Futures are dropped outside the arena borrow: their destructors may
        // call back into the kernel.
        drop(entries);
        self.inbox.lock().clear();
    }
}

enum CancelAction {
    Stillborn(Fault),
    Deliver(Option<Notification>),
}
