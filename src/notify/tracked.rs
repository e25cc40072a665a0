//! Tracked values: mutable cells whose comparisons are notifications
//!
//! A [`Tracked<T>`] holds a value; relational views built from it
//! ([`at_least`], [`below`], …) are notifications that re-evaluate on every
//! update of the cell, so `capacity.at_least(4.0).await?` parks a task until
//! the cell crosses the bound. Updates through [`set`] / [`modify`] / the
//! arithmetic helpers notify all live views; dead views are pruned as they
//! are encountered.
//!
//! [`at_least`]: Tracked::at_least
//! [`below`]: Tracked::below
//! [`set`]: Tracked::set
//! [`modify`]: Tracked::modify

use std::cell::RefCell;
use std::ops::{Add, Div, Mul, Sub};
use std::rc::{Rc, Weak};

use crate::kernel::context;
use crate::notify::{Notification, NotifyNode};

struct TrackedCell<T> {
    value: RefCell<T>,
    watchers: RefCell<Vec<Weak<NotifyNode>>>,
}

/// A mutable value with relational notification views.
pub struct Tracked<T> {
    cell: Rc<TrackedCell<T>>,
}

impl<T> Clone for Tracked<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Rc::clone(&self.cell),
        }
    }
}

impl<T: 'static> Tracked<T> {
    pub fn new(value: T) -> Self {
        Self {
            cell: Rc::new(TrackedCell {
                value: RefCell::new(value),
                watchers: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Snapshot of the current value. Does not suspend.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.cell.value.borrow().clone()
    }

    /// Replace the value and notify all views.
    pub fn set(&self, value: T) {
        *self.cell.value.borrow_mut() = value;
        self.touch();
    }

    /// Update the value in place and notify all views.
    pub fn modify(&self, update: impl FnOnce(&mut T)) {
        update(&mut self.cell.value.borrow_mut());
        self.touch();
    }

    /// Relational view from an arbitrary predicate over the value.
    pub fn watch(&self, probe: impl Fn(&T) -> bool + 'static) -> Notification {
        let cell = Rc::clone(&self.cell);
        let notification = Notification::watch(Box::new(move || probe(&cell.value.borrow())));
        self.cell
            .watchers
            .borrow_mut()
            .push(notification.downgrade());
        notification
    }

    /// Relational view over this and another tracked cell; re-evaluates when
    /// either side updates.
    pub fn watch_with(
        &self,
        other: &Tracked<T>,
        probe: impl Fn(&T, &T) -> bool + 'static,
    ) -> Notification {
        let lhs = Rc::clone(&self.cell);
        let rhs = Rc::clone(&other.cell);
        let notification =
            Notification::watch(Box::new(move || probe(&lhs.value.borrow(), &rhs.value.borrow())));
        self.cell
            .watchers
            .borrow_mut()
            .push(notification.downgrade());
        other
            .cell
            .watchers
            .borrow_mut()
            .push(notification.downgrade());
        notification
    }

    fn touch(&self) {
        let live: Vec<Rc<NotifyNode>> = {
            let mut watchers = self.cell.watchers.borrow_mut();
            watchers.retain(|w| w.strong_count() > 0);
            watchers.iter().filter_map(Weak::upgrade).collect()
        };
        if live.is_empty() {
            return;
        }
        // No kernel means no subscribers; nothing to propagate to.
        if let Some(core) = context::try_current() {
            for node in live {
                node.changed(&core);
            }
        }
    }
}

impl<T: PartialOrd + 'static> Tracked<T> {
    /// True while `value >= bound`.
    pub fn at_least(&self, bound: T) -> Notification {
        self.watch(move |v| *v >= bound)
    }

    /// True while `value > bound`.
    pub fn above(&self, bound: T) -> Notification {
        self.watch(move |v| *v > bound)
    }

    /// True while `value <= bound`.
    pub fn at_most(&self, bound: T) -> Notification {
        self.watch(move |v| *v <= bound)
    }

    /// True while `value < bound`.
    pub fn below(&self, bound: T) -> Notification {
        self.watch(move |v| *v < bound)
    }
}

impl<T: PartialEq + 'static> Tracked<T> {
    /// True while `value == bound`.
    pub fn equals(&self, bound: T) -> Notification {
        self.watch(move |v| *v == bound)
    }

    /// True while `value != bound`.
    pub fn differs(&self, bound: T) -> Notification {
        self.watch(move |v| *v != bound)
    }
}

impl<T: Copy + Add<Output = T> + 'static> Tracked<T> {
    /// Increase the value by `delta` and notify.
    pub fn add(&self, delta: T) {
        self.modify(|v| *v = *v + delta);
    }
}

impl<T: Copy + Sub<Output = T> + 'static> Tracked<T> {
    /// Decrease the value by `delta` and notify.
    pub fn sub(&self, delta: T) {
        self.modify(|v| *v = *v - delta);
    }
}

impl<T: Copy + Mul<Output = T> + 'static> Tracked<T> {
    /// Scale the value by `factor` and notify.
    pub fn mul(&self, factor: T) {
        self.modify(|v| *v = *v * factor);
    }
}

impl<T: Copy + Div<Output = T> + 'static> Tracked<T> {
    /// Divide the value by `divisor` and notify.
    pub fn div(&self, divisor: T) {
        self.modify(|v| *v = *v / divisor);
    }
}
