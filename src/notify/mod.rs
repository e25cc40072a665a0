//! Notification graph: observable predicates with subscription semantics
//!
//! A [`Notification`] is a Boolean-valued observable. Tasks await one; when
//! its value turns true every currently subscribed task is scheduled exactly
//! once, in subscription order, and unsubscribed. Composites (`all`, `any`,
//! `!`) subscribe to their operands lazily, so an unobserved composite costs
//! nothing, and re-evaluate whenever an operand changes, cascading upward.
//!
//! Truth values are computed on demand from the leaves (stored Booleans,
//! clock comparisons, tracked-value probes), so a composite observed after
//! an unpropagated change still reads the correct post-state.
//!
//! Awaiting a notification always costs a turn, even when it is already
//! true: the awaiting task re-enters the turn queue tail and resumes within
//! the same instant.

mod flag;
mod tracked;

pub use flag::Flag;
pub use tracked::Tracked;

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use crate::error::SimResult;
use crate::kernel::clock::SimTime;
use crate::kernel::context;
use crate::kernel::core::Core;
use crate::task::TaskId;

/// How a timer leaf compares the clock against its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerMode {
    /// True once `now >= due` (also `time + d` views).
    Reach,
    /// True only during the instant `now == due`.
    At,
    /// True while `now < due`; never true again afterwards.
    Before,
}

enum Kind {
    Flag(Cell<bool>),
    Timer { due: SimTime, mode: TimerMode },
    Watch(Box<dyn Fn() -> bool>),
    All(Vec<Notification>),
    AnyOf(Vec<Notification>),
    Not(Notification),
}

#[derive(Clone)]
enum Subscriber {
    Task(TaskId),
    Cond(Weak<NotifyNode>),
}

/// One node of the notification graph.
pub(crate) struct NotifyNode {
    kind: Kind,
    subs: RefCell<Vec<Subscriber>>,
    /// Composites: attached to operands. Timers: armed in the time queue.
    attached: Cell<bool>,
}

impl NotifyNode {
    fn new(kind: Kind) -> Rc<Self> {
        Rc::new(Self {
            kind,
            subs: RefCell::new(Vec::new()),
            attached: Cell::new(false),
        })
    }

    /// Current truth value, computed from the leaves.
    pub(crate) fn value(&self, core: &Rc<Core>) -> bool {
        match &self.kind {
            Kind::Flag(v) => v.get(),
            Kind::Timer { due, mode } => {
                let now = core.now();
                match mode {
                    TimerMode::Reach => now >= *due,
                    TimerMode::At => now == *due,
                    TimerMode::Before => now < *due,
                }
            }
            Kind::Watch(probe) => probe(),
            Kind::All(ops) => ops.iter().all(|n| n.node.value(core)),
            Kind::AnyOf(ops) => ops.iter().any(|n| n.node.value(core)),
            Kind::Not(op) => !op.node.value(core),
        }
    }

    /// Subscribe a task. Caller has checked the value is currently false.
    pub(crate) fn subscribe_task(self: &Rc<Self>, core: &Rc<Core>, task: TaskId) {
        self.subs.borrow_mut().push(Subscriber::Task(task));
        self.ensure_attached(core);
    }

    pub(crate) fn unsubscribe_task(self: &Rc<Self>, task: TaskId) {
        let mut subs = self.subs.borrow_mut();
        if let Some(pos) = subs
            .iter()
            .position(|s| matches!(s, Subscriber::Task(t) if *t == task))
        {
            subs.remove(pos);
        }
        let empty = subs.is_empty();
        drop(subs);
        if empty {
            self.maybe_detach();
        }
    }

    pub(crate) fn has_task(&self, task: TaskId) -> bool {
        self.subs
            .borrow()
            .iter()
            .any(|s| matches!(s, Subscriber::Task(t) if *t == task))
    }

    fn subscribe_cond(self: &Rc<Self>, core: &Rc<Core>, cond: Weak<NotifyNode>) {
        self.subs.borrow_mut().push(Subscriber::Cond(cond));
        self.ensure_attached(core);
    }

    fn unsubscribe_cond(self: &Rc<Self>, cond: &Rc<NotifyNode>) {
        let mut subs = self.subs.borrow_mut();
        if let Some(pos) = subs.iter().position(|s| {
            matches!(s, Subscriber::Cond(w) if w.upgrade().is_some_and(|n| Rc::ptr_eq(&n, cond)))
        }) {
            subs.remove(pos);
        }
        let empty = subs.is_empty();
        drop(subs);
        if empty {
            self.maybe_detach();
        }
    }

    /// First-subscriber hook: arm timers, attach composites to operands.
    fn ensure_attached(self: &Rc<Self>, core: &Rc<Core>) {
        if self.attached.get() {
            return;
        }
        match &self.kind {
            Kind::Timer { due, mode: _ } => {
                if due.is_finite() && *due > core.now() {
                    core.arm_timer(*due, Rc::downgrade(self));
                }
                self.attached.set(true);
            }
            Kind::All(ops) | Kind::AnyOf(ops) => {
                self.attached.set(true);
                for op in ops {
                    op.node.subscribe_cond(core, Rc::downgrade(self));
                }
            }
            Kind::Not(op) => {
                self.attached.set(true);
                op.node.subscribe_cond(core, Rc::downgrade(self));
            }
            // Flags are their own source; Watch leaves register with their
            // tracked cells at construction.
            Kind::Flag(_) | Kind::Watch(_) => {}
        }
    }

    /// Last-subscriber hook: composites detach from operands. Armed timers
    /// stay in the time queue; a fire with no subscribers is a no-op.
    fn maybe_detach(self: &Rc<Self>) {
        if !self.attached.get() || !self.subs.borrow().is_empty() {
            return;
        }
        match &self.kind {
            Kind::All(ops) | Kind::AnyOf(ops) => {
                self.attached.set(false);
                for op in ops {
                    op.node.unsubscribe_cond(self);
                }
            }
            Kind::Not(op) => {
                self.attached.set(false);
                op.node.unsubscribe_cond(self);
            }
            Kind::Flag(_) | Kind::Timer { .. } | Kind::Watch(_) => {}
        }
    }

    /// Propagate a source transition.
    ///
    /// Walks a snapshot of the subscribers: tasks are woken (and removed)
    /// only when the observed value is true; composite subscribers
    /// re-evaluate either way, so falling edges reach negations. Subscribers
    /// added during the walk see the post-state on their own subscribe path.
    pub(crate) fn changed(self: &Rc<Self>, core: &Rc<Core>) {
        self.subs.borrow_mut().retain(|s| match s {
            Subscriber::Cond(weak) => weak.strong_count() > 0,
            Subscriber::Task(_) => true,
        });
        let snapshot: Vec<Subscriber> = self.subs.borrow().clone();
        if snapshot.is_empty() {
            return;
        }
        let is_true = self.value(core);
        if is_true {
            let mut woken: Vec<TaskId> = Vec::new();
            {
                let mut subs = self.subs.borrow_mut();
                subs.retain(|s| match s {
                    Subscriber::Task(t) => {
                        let fired = snapshot
                            .iter()
                            .any(|snap| matches!(snap, Subscriber::Task(x) if x == t));
                        if fired {
                            woken.push(*t);
                        }
                        !fired
                    }
                    Subscriber::Cond(_) => true,
                });
            }
            for task in woken {
                core.notify_fired(task, self);
            }
        }
        for sub in &snapshot {
            if let Subscriber::Cond(weak) = sub {
                if let Some(cond) = weak.upgrade() {
                    cond.changed(core);
                }
            }
        }
        self.maybe_detach();
    }

    /// Flip a flag leaf; a same-value set is a no-op.
    pub(crate) fn set_flag(self: &Rc<Self>, value: bool) {
        let Kind::Flag(cell) = &self.kind else {
            debug_assert!(false, "set_flag on a non-flag notification");
            return;
        };
        if cell.get() == value {
            return;
        }
        cell.set(value);
        match context::try_current() {
            Some(core) => self.changed(&core),
            // No kernel running: legal only while nothing is subscribed.
            None => debug_assert!(self.subs.borrow().is_empty()),
        }
    }

    pub(crate) fn flag_value(&self) -> bool {
        match &self.kind {
            Kind::Flag(cell) => cell.get(),
            _ => {
                debug_assert!(false, "flag_value on a non-flag notification");
                false
            }
        }
    }
}

/// Shared handle to a node of the notification graph.
///
/// Composes with [`and`](Notification::and) / [`or`](Notification::or) /
/// [`invert`](Notification::invert) (also the `&`, `|`, `!` operators) and
/// is awaited directly: `time::after(3.0).await?`.
#[derive(Clone)]
pub struct Notification {
    pub(crate) node: Rc<NotifyNode>,
}

impl Notification {
    pub(crate) fn flag(initial: bool) -> Self {
        Self {
            node: NotifyNode::new(Kind::Flag(Cell::new(initial))),
        }
    }

    pub(crate) fn timer(mode: TimerMode, due: SimTime) -> Self {
        Self {
            node: NotifyNode::new(Kind::Timer { due, mode }),
        }
    }

    pub(crate) fn watch(probe: Box<dyn Fn() -> bool>) -> Self {
        Self {
            node: NotifyNode::new(Kind::Watch(probe)),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<NotifyNode> {
        Rc::downgrade(&self.node)
    }

    /// Current truth value. Requires a running simulation.
    pub fn value(&self) -> bool {
        self.node.value(&context::current())
    }

    /// Conjunction: true when both operands are true.
    pub fn and(self, other: Notification) -> Notification {
        Notification {
            node: NotifyNode::new(Kind::All(vec![self, other])),
        }
    }

    /// Disjunction: true when either operand is true.
    pub fn or(self, other: Notification) -> Notification {
        Notification {
            node: NotifyNode::new(Kind::AnyOf(vec![self, other])),
        }
    }

    /// Total inversion. `!(a & b)` and `!a | !b` are distinct objects with
    /// equal truth values.
    pub fn invert(self) -> Notification {
        Notification {
            node: NotifyNode::new(Kind::Not(self)),
        }
    }

    /// Conjunction over any number of operands.
    pub fn all(ops: impl IntoIterator<Item = Notification>) -> Notification {
        Notification {
            node: NotifyNode::new(Kind::All(ops.into_iter().collect())),
        }
    }

    /// Disjunction over any number of operands.
    pub fn any(ops: impl IntoIterator<Item = Notification>) -> Notification {
        Notification {
            node: NotifyNode::new(Kind::AnyOf(ops.into_iter().collect())),
        }
    }

    /// Future resolving when the notification is true.
    pub fn wait(&self) -> Wait {
        Wait {
            notification: self.clone(),
            state: WaitState::Init,
            subscriber: None,
        }
    }
}

impl std::ops::BitAnd for Notification {
    type Output = Notification;

    fn bitand(self, rhs: Notification) -> Notification {
        self.and(rhs)
    }
}

impl std::ops::BitOr for Notification {
    type Output = Notification;

    fn bitor(self, rhs: Notification) -> Notification {
        self.or(rhs)
    }
}

impl std::ops::Not for Notification {
    type Output = Notification;

    fn not(self) -> Notification {
        self.invert()
    }
}

impl std::future::IntoFuture for Notification {
    type Output = SimResult<()>;
    type IntoFuture = Wait;

    fn into_future(self) -> Wait {
        self.wait()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WaitState {
    Init,
    SelfYield,
    Subscribed,
}

/// Suspension point: parks the current task on a notification.
///
/// Resolves `Err` when a cancellation is pending for the task, which is how
/// cancellation reaches task bodies.
pub struct Wait {
    notification: Notification,
    state: WaitState,
    subscriber: Option<TaskId>,
}

impl Future for Wait {
    type Output = SimResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let core = context::current();
        let task = core.current_task();

        if let Some(fault) = core.take_pending(task) {
            if self.state == WaitState::Subscribed {
                self.notification.node.unsubscribe_task(task);
                core.clear_wait(task, &self.notification.node);
            }
            self.state = WaitState::Init;
            self.subscriber = None;
            return Poll::Ready(Err(fault));
        }

        match self.state {
            WaitState::Init => {
                if self.notification.node.value(&core) {
                    // Already true: still costs a turn.
                    cx.waker().wake_by_ref();
                    self.state = WaitState::SelfYield;
                } else {
                    self.notification.node.subscribe_task(&core, task);
                    core.set_wait(task, self.notification.clone());
                    self.state = WaitState::Subscribed;
                    self.subscriber = Some(task);
                }
                Poll::Pending
            }
            WaitState::SelfYield => {
                if self.notification.node.value(&core) {
                    self.state = WaitState::Init;
                    Poll::Ready(Ok(()))
                } else {
                    // Went false again within the instant; park properly.
                    self.notification.node.subscribe_task(&core, task);
                    core.set_wait(task, self.notification.clone());
                    self.state = WaitState::Subscribed;
                    self.subscriber = Some(task);
                    Poll::Pending
                }
            }
            WaitState::Subscribed => {
                if self.notification.node.has_task(task) {
                    // Spurious poll (sibling branch of a combinator).
                    Poll::Pending
                } else {
                    self.state = WaitState::Init;
                    self.subscriber = None;
                    Poll::Ready(Ok(()))
                }
            }
        }
    }
}

impl Drop for Wait {
    fn drop(&mut self) {
        // A dropped in-flight wait (select / scope interrupt / task teardown)
        // must not leave a stale subscription behind.
        if self.state == WaitState::Subscribed {
            if let Some(task) = self.subscriber {
                self.notification.node.unsubscribe_task(task);
                if let Some(core) = context::try_current() {
                    core.clear_wait(task, &self.notification.node);
                }
            }
        }
    }
}
