//! Cancellation delivery and teardown discipline
//!
//! Cancellation is observed at the next suspension point, never aggregated
//! into `Concurrent`, and every scoped acquisition releases on the unwind
//! path it causes.

use std::cell::RefCell;
use std::rc::Rc;

use musim::{
    scope, time, Lock, Resources, SimResult, TaskCancelled, TaskFailed, TaskState,
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
fn never_started_task_cancels_without_running() {
    let log = fresh_log();
    let outer = Rc::clone(&log);
    musim::run(None, |root| async move {
        let log = Rc::clone(&outer);
        let late = root.spawn_after(5.0, async move {
            emit(&log, "ran anyway");
            Ok(())
        });
        time::after(1.0).await?;
        late.cancel();
        assert_eq!(late.state(), TaskState::Cancelled);
        Ok(())
    })
    .unwrap();

    assert!(log.borrow().is_empty());
}

#[test]
fn join_surfaces_the_cancellation_payload() {
    musim::run(None, |root| async move {
        let victim = root.spawn::<(), _>(async {
            time::eternity().await?;
            Ok(())
        });
        time::after(1.0).await?;
        victim.cancel();
        let err = victim.join().await.unwrap_err();
        let wrapped = err.downcast_ref::<TaskFailed>().unwrap();
        assert!(wrapped.fault().is::<TaskCancelled>());
        Ok(())
    })
    .unwrap();
}

#[test]
fn cancelled_holder_releases_its_lock() {
    let log = fresh_log();
    let outer = Rc::clone(&log);
    musim::run(None, |root| async move {
        let lock = Lock::new();
        let holder_lock = lock.clone();
        let holder = root.spawn::<(), _>(async move {
            let _guard = holder_lock.acquire().await?;
            time::after(10.0).await?;
            Ok(())
        });
        let waiter_lock = lock.clone();
        let waiter_log = Rc::clone(&outer);
        root.spawn_after(1.0, async move {
            let _guard = waiter_lock.acquire().await?;
            emit(&waiter_log, "acquired");
            Ok(())
        });
        time::after(2.0).await?;
        holder.cancel();
        Ok(())
    })
    .unwrap();

    // The unwind of the cancelled holder dropped the guard at t=2.
    assert_eq!(*log.borrow(), vec![("acquired".to_string(), 2.0)]);
}

#[test]
fn cancelled_borrower_refunds_its_claim() {
    let log = fresh_log();
    let outer = Rc::clone(&log);
    musim::run(None, |root| async move {
        let resources = Resources::new([("a", 3.0)]);
        let holder_res = resources.clone();
        let holder = root.spawn::<(), _>(async move {
            let _claim = holder_res.borrow(&[("a", 2.0)]).await?;
            time::eternity().await?;
            Ok(())
        });
        let claimant_res = resources.clone();
        let claimant_log = Rc::clone(&outer);
        root.spawn_after(1.0, async move {
            let _claim = claimant_res.borrow(&[("a", 2.0)]).await?;
            emit(&claimant_log, "granted");
            Ok(())
        });
        time::after(3.0).await?;
        holder.cancel();
        Ok(())
    })
    .unwrap();

    assert_eq!(*log.borrow(), vec![("granted".to_string(), 3.0)]);
}

#[test]
fn cancelling_a_scope_owner_drains_children_first() {
    let log = fresh_log();
    let outer = Rc::clone(&log);
    musim::run(None, |root| async move {
        let owner_log = Rc::clone(&outer);
        let owner = root.spawn::<(), _>(async move {
            scope(|s| async move {
                let log = Rc::clone(&owner_log);
                s.spawn::<(), _>(async move {
                    let slept: SimResult<()> = async {
                        time::after(10.0).await?;
                        Ok(())
                    }
                    .await;
                    if slept.is_err() {
                        emit(&log, "child unwound");
                    }
                    slept
                });
                Ok(())
            })
            .await?;
            Ok(())
        });
        time::after(3.0).await?;
        owner.cancel();
        time::after(1.0).await?;
        assert_eq!(owner.state(), TaskState::Cancelled);
        Ok(())
    })
    .unwrap();

    assert_eq!(*log.borrow(), vec![("child unwound".to_string(), 3.0)]);
}

#[test]
fn volatile_children_never_block_scope_exit() {
    let log = fresh_log();
    let outer = Rc::clone(&log);
    musim::run(None, |_root| async move {
        let inner = Rc::clone(&outer);
        scope(|s| async move {
            s.spawn_volatile::<(), _>(async {
                time::eternity().await?;
                Ok(())
            });
            let log = Rc::clone(&inner);
            s.spawn(async move {
                time::after(1.0).await?;
                emit(&log, "worker done");
                Ok(())
            });
            Ok(())
        })
        .await?;
        emit(&outer, "scope exited");
        Ok(())
    })
    .unwrap();

    assert_eq!(
        *log.borrow(),
        vec![
            ("worker done".to_string(), 1.0),
            ("scope exited".to_string(), 1.0),
        ]
    );
}

#[test]
fn cancellation_while_queued_still_wins() {
    // The task's wakeup already fired, but the cancellation is delivered at
    // the suspension point it would have resumed from.
    let log = fresh_log();
    let outer = Rc::clone(&log);
    musim::run(None, |root| async move {
        let flag = musim::Flag::new();
        let waiter_flag = flag.clone();
        let waiter_log = Rc::clone(&outer);
        let waiter = root.spawn::<(), _>(async move {
            waiter_flag.wait().await?;
            emit(&waiter_log, "resumed normally");
            Ok(())
        });
        time::after(1.0).await?;
        flag.set(true);
        waiter.cancel();
        time::after(1.0).await?;
        assert_eq!(waiter.state(), TaskState::Cancelled);
        Ok(())
    })
    .unwrap();

    assert!(log.borrow().is_empty());
}
