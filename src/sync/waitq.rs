//! Ordered wait queue: FIFO of one-shot wake slots
//!
//! The shared waiting discipline under [`Lock`](crate::sync::Lock),
//! [`Channel`](crate::sync::Channel), [`Queue`](crate::sync::Queue), and the
//! resource claim queue. Each waiter parks on a private one-shot flag; the
//! granter pops slots strictly in FIFO order, optionally handing over a
//! payload, and fires the flag. A waiter that gives up (cancellation) either
//! forgets its slot or, if already granted, returns the payload itself.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::notify::Notification;
use crate::task::TaskId;

/// One parked waiter: a wake flag plus a payload handoff cell.
pub(crate) struct WaitSlot<T> {
    pub task: TaskId,
    flag: Notification,
    cell: Rc<RefCell<Option<T>>>,
}

impl<T> WaitSlot<T> {
    pub fn new(task: TaskId) -> Self {
        Self {
            task,
            flag: Notification::flag(false),
            cell: Rc::new(RefCell::new(None)),
        }
    }

    /// Hand over the payload and wake the waiter.
    pub fn grant(&self, payload: T) {
        *self.cell.borrow_mut() = Some(payload);
        self.flag.node.set_flag(true);
    }

    /// True once the slot has been granted.
    pub fn granted(&self) -> bool {
        self.flag.node.flag_value()
    }

    /// The waiter's side: suspend until granted.
    pub fn wait(&self) -> crate::notify::Wait {
        self.flag.wait()
    }

    /// Take the handed-over payload.
    pub fn take(&self) -> Option<T> {
        self.cell.borrow_mut().take()
    }

    fn shares_cell(&self, other: &WaitSlot<T>) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }
}

impl<T> Clone for WaitSlot<T> {
    fn clone(&self) -> Self {
        Self {
            task: self.task,
            flag: self.flag.clone(),
            cell: Rc::clone(&self.cell),
        }
    }
}

/// FIFO of parked waiters.
pub(crate) struct WaitQueue<T> {
    slots: VecDeque<WaitSlot<T>>,
}

impl<T> WaitQueue<T> {
    pub fn new() -> Self {
        Self {
            slots: VecDeque::new(),
        }
    }

    /// Park the given task at the queue tail.
    pub fn enqueue(&mut self, task: TaskId) -> WaitSlot<T> {
        let slot = WaitSlot::new(task);
        self.slots.push_back(slot.clone());
        slot
    }

    /// Remove and return the head waiter, if any.
    pub fn pop(&mut self) -> Option<WaitSlot<T>> {
        self.slots.pop_front()
    }

    /// Drop a waiter that gave up before being granted.
    pub fn forget(&mut self, slot: &WaitSlot<T>) {
        if let Some(pos) = self.slots.iter().position(|s| s.shares_cell(slot)) {
            self.slots.remove(pos);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<T> Default for WaitQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
