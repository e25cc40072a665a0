//! Condition algebra and stream primitives

use std::cell::RefCell;
use std::rc::Rc;

use musim::{
    time, Capacities, Channel, Flag, Lock, LockReentry, Queue, Resources, ResourcesUnavailable,
    StreamClosed, Tracked,
};

type Log = Rc<RefCell<Vec<(String, f64)>>>;

fn fresh_log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

fn emit(log: &Log, label: impl Into<String>) {
    log.borrow_mut()
        .push((label.into(), time::now().as_f64()));
}

#[test]
fn setting_a_flag_to_its_value_wakes_nobody() {
    let log = fresh_log();
    let outer = Rc::clone(&log);
    musim::run(None, |root| async move {
        let flag = Flag::new();
        let waiter_flag = flag.clone();
        let waiter_log = Rc::clone(&outer);
        root.spawn(async move {
            waiter_flag.wait().await?;
            emit(&waiter_log, "woken");
            Ok(())
        });
        root.spawn(async move {
            time::after(1.0).await?;
            flag.set(false); // no-op
            time::after(1.0).await?;
            flag.set(true);
            Ok(())
        });
        Ok(())
    })
    .unwrap();

    assert_eq!(*log.borrow(), vec![("woken".to_string(), 2.0)]);
}

#[test]
fn conjunction_fires_when_both_sides_hold() {
    let log = fresh_log();
    let outer = Rc::clone(&log);
    musim::run(None, |root| async move {
        let a = Flag::new();
        let b = Flag::new();
        let both = a.notification() & b.notification();
        let waiter_log = Rc::clone(&outer);
        root.spawn(async move {
            both.await?;
            emit(&waiter_log, "both");
            Ok(())
        });
        root.spawn(async move {
            time::after(1.0).await?;
            a.set(true);
            time::after(1.0).await?;
            b.set(true);
            Ok(())
        });
        Ok(())
    })
    .unwrap();

    assert_eq!(*log.borrow(), vec![("both".to_string(), 2.0)]);
}

#[test]
fn disjunction_fires_on_the_first_side() {
    let log = fresh_log();
    let outer = Rc::clone(&log);
    musim::run(None, |root| async move {
        let a = Flag::new();
        let b = Flag::new();
        let either = a.notification() | b.notification();
        let waiter_log = Rc::clone(&outer);
        root.spawn(async move {
            either.await?;
            emit(&waiter_log, "either");
            Ok(())
        });
        root.spawn(async move {
            time::after(1.0).await?;
            b.set(true);
            Ok(())
        });
        Ok(())
    })
    .unwrap();

    assert_eq!(*log.borrow(), vec![("either".to_string(), 1.0)]);
}

#[test]
fn negation_fires_on_the_falling_edge() {
    let log = fresh_log();
    let outer = Rc::clone(&log);
    musim::run(None, |root| async move {
        let busy = Flag::new();
        busy.set(true);
        let idle = !busy.notification();
        let waiter_log = Rc::clone(&outer);
        root.spawn(async move {
            idle.await?;
            emit(&waiter_log, "idle");
            Ok(())
        });
        root.spawn(async move {
            time::after(2.0).await?;
            busy.set(false);
            Ok(())
        });
        Ok(())
    })
    .unwrap();

    assert_eq!(*log.borrow(), vec![("idle".to_string(), 2.0)]);
}

#[test]
fn tracked_comparison_fires_on_crossing_the_bound() {
    let log = fresh_log();
    let outer = Rc::clone(&log);
    musim::run(None, |root| async move {
        let level = Tracked::new(0.0);
        let reached = level.at_least(3.0);
        let waiter_log = Rc::clone(&outer);
        root.spawn(async move {
            reached.await?;
            emit(&waiter_log, "threshold");
            Ok(())
        });
        root.spawn(async move {
            let mut beat = time::delay(1.0);
            for _ in 0..3 {
                beat.next().await?;
                level.add(1.0);
            }
            Ok(())
        });
        Ok(())
    })
    .unwrap();

    assert_eq!(*log.borrow(), vec![("threshold".to_string(), 3.0)]);
}

#[test]
fn tracked_pair_comparison_tracks_both_cells() {
    let log = fresh_log();
    let outer = Rc::clone(&log);
    musim::run(None, |root| async move {
        let supply = Tracked::new(1.0);
        let demand = Tracked::new(4.0);
        let satisfied = supply.watch_with(&demand, |s, d| *s >= *d);
        let waiter_log = Rc::clone(&outer);
        root.spawn(async move {
            satisfied.await?;
            emit(&waiter_log, "satisfied");
            Ok(())
        });
        root.spawn(async move {
            time::after(1.0).await?;
            supply.add(2.0); // 3 < 4, still short
            time::after(1.0).await?;
            demand.sub(1.0); // 3 >= 3
            Ok(())
        });
        Ok(())
    })
    .unwrap();

    assert_eq!(*log.borrow(), vec![("satisfied".to_string(), 2.0)]);
}

#[test]
fn channel_broadcasts_to_every_pending_receiver() {
    let log = fresh_log();
    let outer = Rc::clone(&log);
    musim::run(None, |root| async move {
        let channel: Channel<&'static str> = Channel::new();
        for name in ["r1", "r2"] {
            let channel = channel.clone();
            let log = Rc::clone(&outer);
            root.spawn(async move {
                let message = channel.recv().await?;
                emit(&log, format!("{name} got {message}"));
                Ok(())
            });
        }
        root.spawn(async move {
            time::after(1.0).await?;
            channel.put("ping")?;
            Ok(())
        });
        Ok(())
    })
    .unwrap();

    assert_eq!(
        *log.borrow(),
        vec![
            ("r1 got ping".to_string(), 1.0),
            ("r2 got ping".to_string(), 1.0),
        ]
    );
}

#[test]
fn closed_channel_fails_receivers_and_senders() {
    musim::run(None, |root| async move {
        let channel: Channel<u32> = Channel::new();
        let pending = channel.clone();
        let receiver = root.spawn::<(), _>(async move {
            let err = pending.recv().await.unwrap_err();
            assert!(err.is::<StreamClosed>());
            Ok(())
        });
        time::after(1.0).await?;
        channel.close();
        assert!(channel.put(7).unwrap_err().is::<StreamClosed>());
        receiver.join().await?;
        Ok(())
    })
    .unwrap();
}

#[test]
fn queue_hands_each_message_to_one_receiver() {
    let log = fresh_log();
    let outer = Rc::clone(&log);
    musim::run(None, |root| async move {
        let queue: Queue<u32> = Queue::new();
        for name in ["g1", "g2"] {
            let queue = queue.clone();
            let log = Rc::clone(&outer);
            root.spawn(async move {
                let n = queue.get().await?;
                emit(&log, format!("{name} took {n}"));
                Ok(())
            });
        }
        root.spawn(async move {
            time::after(1.0).await?;
            queue.put(42)?;
            Ok(())
        });
        Ok(())
    })
    .unwrap();

    // Anycast: exactly one receiver got it, and it was the first in line.
    assert_eq!(*log.borrow(), vec![("g1 took 42".to_string(), 1.0)]);
}

#[test]
fn closed_queue_drains_its_buffer_first() {
    musim::run(None, |root| async move {
        let queue: Queue<u32> = Queue::new();
        queue.put(1)?;
        queue.put(2)?;
        queue.close();
        assert_eq!(queue.get().await?, 1);
        assert_eq!(queue.get().await?, 2);
        assert!(queue.get().await.unwrap_err().is::<StreamClosed>());
        assert!(queue.put(3).unwrap_err().is::<StreamClosed>());
        let _ = root;
        Ok(())
    })
    .unwrap();
}

#[test]
fn lock_reentry_is_diagnosed() {
    musim::run(None, |root| async move {
        let lock = Lock::new();
        root.spawn::<(), _>(async move {
            let _guard = lock.acquire().await?;
            let err = lock.acquire().await.unwrap_err();
            assert!(err.is::<LockReentry>());
            Ok(())
        });
        Ok(())
    })
    .unwrap();
}

#[test]
fn impossible_claims_fail_synchronously() {
    musim::run(None, |_root| async move {
        let bounded = Capacities::new([("a", 2.0)]);
        let err = bounded.borrow(&[("a", 3.0)]).await.unwrap_err();
        assert!(err.is::<ResourcesUnavailable>());

        let open = Resources::new([("a", 1.0)]);
        let err = open.borrow(&[("missing", 1.0)]).await.unwrap_err();
        assert!(err.is::<ResourcesUnavailable>());
        Ok(())
    })
    .unwrap();
}

#[test]
fn producing_past_capacity_is_an_error() {
    musim::run(None, |_root| async move {
        let bounded = Capacities::new([("a", 2.0)]);
        bounded.consume(&[("a", 1.0)]).await?;
        assert_eq!(bounded.level("a"), Some(1.0));
        bounded.produce(&[("a", 1.0)])?;
        assert_eq!(bounded.level("a"), Some(2.0));
        let err = bounded.produce(&[("a", 0.5)]).unwrap_err();
        assert!(err.is::<musim::CapacityExceeded>());
        Ok(())
    })
    .unwrap();
}
