//! Virtual-time façade
//!
//! Reading the clock ([`now`]) never suspends. Waiting is spelled through
//! timer notifications: [`after`] (a relative offset, fixed at creation
//! time), [`reach`] / [`at`] / [`before`] (absolute comparisons), and the
//! distinguished constants [`eternity`] (never fires) and [`instant`] (a
//! pure one-turn yield within the current instant).
//!
//! [`delay`] and [`interval`] are the repeating forms: `delay(d)` fires `d`
//! after each resumption, `interval(d)` at `t₀+d, t₀+2d, …` regardless of
//! how long each iteration worked.

use crate::error::SimResult;
use crate::kernel::clock::SimTime;
use crate::kernel::context;
use crate::notify::{Notification, TimerMode};

/// Current virtual time. Never suspends.
pub fn now() -> SimTime {
    context::current().now()
}

/// Fires when virtual time reaches `now + offset`.
pub fn after(offset: f64) -> Notification {
    Notification::timer(TimerMode::Reach, now() + offset)
}

/// Fires once virtual time reaches `t`; already true if past it.
pub fn reach(t: impl Into<SimTime>) -> Notification {
    Notification::timer(TimerMode::Reach, t.into())
}

/// True only during the instant `t`; never fires after it has passed.
pub fn at(t: impl Into<SimTime>) -> Notification {
    Notification::timer(TimerMode::At, t.into())
}

/// True while virtual time is still before `t`: immediate if awaited early
/// enough, otherwise never.
pub fn before(t: impl Into<SimTime>) -> Notification {
    Notification::timer(TimerMode::Before, t.into())
}

/// Never fires.
pub fn eternity() -> Notification {
    Notification::timer(TimerMode::Reach, SimTime::ETERNITY)
}

/// Always true: awaiting it yields exactly one turn at the current instant.
pub fn instant() -> Notification {
    Notification::timer(TimerMode::Reach, SimTime::INSTANT)
}

/// Repeating wait measured from each resumption.
pub fn delay(period: f64) -> Delay {
    Delay { period }
}

/// Repeating wait on a fixed grid anchored at creation time.
///
/// Requires a running simulation (the anchor is `now`).
pub fn interval(period: f64) -> Interval {
    Interval {
        period,
        next_due: now() + period,
    }
}

/// See [`delay`].
pub struct Delay {
    period: f64,
}

impl Delay {
    /// Suspend for one period and yield the new `now`.
    pub async fn next(&mut self) -> SimResult<SimTime> {
        after(self.period).await?;
        Ok(now())
    }
}

/// See [`interval`].
pub struct Interval {
    period: f64,
    next_due: SimTime,
}

impl Interval {
    /// Suspend until the next grid point and yield the new `now`.
    ///
    /// A grid point already in the past fires after a single yield.
    pub async fn next(&mut self) -> SimResult<SimTime> {
        let due = self.next_due;
        self.next_due = due + self.period;
        reach(due).await?;
        Ok(now())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_after_fires_at_offset() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        crate::run(None, |scope| async move {
            scope.spawn(async move {
                after(2.5).await?;
                log.borrow_mut().push(now());
                Ok(())
            });
            Ok(())
        })
        .unwrap();
        assert_eq!(*seen.borrow(), vec![SimTime::new(2.5)]);
    }

    #[test]
    fn test_instant_yields_within_same_time() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        crate::run(None, |scope| async move {
            scope.spawn(async move {
                let before = now();
                instant().await?;
                log.borrow_mut().push((before, now()));
                Ok(())
            });
            Ok(())
        })
        .unwrap();
        assert_eq!(*seen.borrow(), vec![(SimTime::ZERO, SimTime::ZERO)]);
    }

    #[test]
    fn test_delay_measures_from_resumption() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        crate::run(Some(SimTime::new(10.0)), |scope| async move {
            scope.spawn::<(), _>(async move {
                let mut ticks = delay(3.0);
                loop {
                    let t = ticks.next().await?;
                    // A full unit of in-block work before the next wait.
                    after(1.0).await?;
                    log.borrow_mut().push(t);
                }
            });
            Ok(())
        })
        .unwrap();
        // Resumptions at 3, then 3+1+3=7; the next would be at 11 > till.
        assert_eq!(
            *seen.borrow(),
            vec![SimTime::new(3.0), SimTime::new(7.0)]
        );
    }

    #[test]
    fn test_interval_ignores_in_block_work() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        crate::run(Some(SimTime::new(10.0)), |scope| async move {
            scope.spawn::<(), _>(async move {
                let mut grid = interval(3.0);
                loop {
                    let t = grid.next().await?;
                    log.borrow_mut().push(t);
                    after(1.0).await?;
                }
            });
            Ok(())
        })
        .unwrap();
        assert_eq!(
            *seen.borrow(),
            vec![SimTime::new(3.0), SimTime::new(6.0), SimTime::new(9.0)]
        );
    }

    #[test]
    fn test_before_is_immediate_or_never() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        crate::run(Some(SimTime::new(5.0)), |scope| async move {
            let early = Rc::clone(&log);
            scope.spawn(async move {
                before(1.0).await?;
                early.borrow_mut().push(("early", now()));
                Ok(())
            });
            let late = Rc::clone(&log);
            scope.spawn(async move {
                after(2.0).await?;
                // Already past 1.0: this never fires.
                before(1.0).await?;
                late.borrow_mut().push(("late", now()));
                Ok(())
            });
            Ok(())
        })
        .unwrap();
        assert_eq!(*seen.borrow(), vec![("early", SimTime::ZERO)]);
    }
}
