//! Anycast stream: each message reaches exactly one receiver
//!
//! `put` hands the message straight to the longest-waiting receiver, or
//! buffers it when none is parked; `get` takes the buffered head or
//! suspends. After [`close`](Queue::close), parked receivers fail with
//! [`StreamClosed`](crate::error::StreamClosed); buffered messages still
//! drain to later `get`s before the closure is reported.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use anyhow::anyhow;

use crate::error::{Fault, SimResult, StreamClosed};
use crate::kernel::context;
use crate::sync::waitq::WaitQueue;

struct QueueState<T> {
    buffer: VecDeque<T>,
    waiters: WaitQueue<Result<T, StreamClosed>>,
    closed: bool,
}

/// FIFO anycast stream.
#[derive(Clone)]
pub struct Queue<T> {
    state: Rc<RefCell<QueueState<T>>>,
}

impl<T: 'static> Queue<T> {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(QueueState {
                buffer: VecDeque::new(),
                waiters: WaitQueue::new(),
                closed: false,
            })),
        }
    }

    /// Enqueue a message, waking at most one parked receiver. Never
    /// suspends.
    pub fn put(&self, message: T) -> SimResult<()> {
        let slot = {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return Err(Fault::new(StreamClosed));
            }
            match state.waiters.pop() {
                Some(slot) => Some((slot, message)),
                None => {
                    state.buffer.push_back(message);
                    None
                }
            }
        };
        if let Some((slot, message)) = slot {
            slot.grant(Ok(message));
        }
        Ok(())
    }

    /// Dequeue the head message, suspending when the queue is empty.
    pub async fn get(&self) -> SimResult<T> {
        let me = context::current().current_task();
        let slot = {
            let mut state = self.state.borrow_mut();
            if let Some(message) = state.buffer.pop_front() {
                return Ok(message);
            }
            if state.closed {
                return Err(Fault::new(StreamClosed));
            }
            state.waiters.enqueue(me)
        };
        match slot.wait().await {
            Ok(()) => match slot.take() {
                Some(Ok(message)) => Ok(message),
                Some(Err(closed)) => Err(Fault::new(closed)),
                None => Err(anyhow!("queue slot fired without a payload")),
            },
            Err(fault) => {
                // A message handed to a dying receiver goes to the next in
                // line, or back to the buffer head; otherwise just step out
                // of the queue.
                if slot.granted() {
                    if let Some(Ok(message)) = slot.take() {
                        let handoff = {
                            let mut state = self.state.borrow_mut();
                            match state.waiters.pop() {
                                Some(next) => Some((next, message)),
                                None => {
                                    state.buffer.push_front(message);
                                    None
                                }
                            }
                        };
                        if let Some((next, message)) = handoff {
                            next.grant(Ok(message));
                        }
                    }
                } else {
                    self.state.borrow_mut().waiters.forget(&slot);
                }
                Err(fault)
            }
        }
    }

    /// Number of buffered messages.
    pub fn len(&self) -> usize {
        self.state.borrow().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().buffer.is_empty()
    }

    /// Close the stream: parked receivers fail now; the buffer drains to
    /// later `get`s before they see `StreamClosed`.
    pub fn close(&self) {
        let was_closed = {
            let mut state = self.state.borrow_mut();
            std::mem::replace(&mut state.closed, true)
        };
        if was_closed {
            return;
        }
        loop {
            let slot = self.state.borrow_mut().waiters.pop();
            match slot {
                Some(slot) => slot.grant(Err(StreamClosed)),
                None => return,
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }
}

impl<T: 'static> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}
