//! Broadcast stream: every pending receiver gets each message
//!
//! Messages are not buffered: a `put` reaches exactly the receivers parked
//! at that moment, each with its own clone, woken in the order they began
//! receiving. Senders never block. After [`close`](Channel::close), pending
//! and subsequent operations fail with
//! [`StreamClosed`](crate::error::StreamClosed).

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::anyhow;

use crate::error::{Fault, SimResult, StreamClosed};
use crate::kernel::context;
use crate::sync::waitq::WaitQueue;

struct ChannelState<T> {
    waiters: WaitQueue<Result<T, StreamClosed>>,
    closed: bool,
}

/// One-shot broadcast stream.
#[derive(Clone)]
pub struct Channel<T> {
    state: Rc<RefCell<ChannelState<T>>>,
}

impl<T: Clone + 'static> Channel<T> {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(ChannelState {
                waiters: WaitQueue::new(),
                closed: false,
            })),
        }
    }

    /// Deliver `message` to every pending receiver. Never suspends.
    pub fn put(&self, message: T) -> SimResult<()> {
        if self.state.borrow().closed {
            return Err(Fault::new(StreamClosed));
        }
        loop {
            let slot = self.state.borrow_mut().waiters.pop();
            match slot {
                Some(slot) => slot.grant(Ok(message.clone())),
                None => return Ok(()),
            }
        }
    }

    /// Suspend until the next message is broadcast.
    pub async fn recv(&self) -> SimResult<T> {
        let me = context::current().current_task();
        let slot = {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return Err(Fault::new(StreamClosed));
            }
            state.waiters.enqueue(me)
        };
        match slot.wait().await {
            Ok(()) => match slot.take() {
                Some(Ok(message)) => Ok(message),
                Some(Err(closed)) => Err(Fault::new(closed)),
                None => Err(anyhow!("broadcast slot fired without a payload")),
            },
            Err(fault) => {
                self.state.borrow_mut().waiters.forget(&slot);
                Err(fault)
            }
        }
    }

    /// Close the stream: pending receivers fail with `StreamClosed`, as do
    /// all later puts and receives.
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

impl<T: Clone + 'static> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}
