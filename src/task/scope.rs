//! Structured concurrency: scopes and guarded scopes
//!
//! A scope bounds the lifetime of the tasks spawned through its handle: the
//! body runs inline in the owning task, and on exit the scope awaits every
//! non-volatile child, aggregates child failures into one
//! [`Concurrent`](crate::error::Concurrent), and force-closes volatile
//! children. Exactly one error shape leaves a scope exit (fatal, the body's
//! own error, or `Concurrent`), never two.
//!
//! [`until`] is the guarded variant: an internal volatile watchdog awaits
//! the guard notification and, when it fires, gracefully shuts the scope
//! down: children are closed with `TaskClosed` and the body (if still
//! running) is interrupted. Timeouts are spelled
//! `until(time::after(d), ..)`.

use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;

use tracing::debug;

use crate::error::{self, Concurrent, Fault, SimResult};
use crate::kernel::context;
use crate::kernel::core::{Core, ScopeId};
use crate::notify::Notification;
use crate::task::ScopeHandle;

/// Run `body` inside a new structured-concurrency scope.
///
/// Returns the body's value once every non-volatile child has terminated.
/// A body error propagates unwrapped after teardown; child-only failures
/// surface as a single `Concurrent`.
pub async fn scope<T, F, Fut>(body: F) -> SimResult<T>
where
    F: FnOnce(ScopeHandle) -> Fut,
    Fut: Future<Output = SimResult<T>>,
{
    let core = context::current();
    let owner = core.current_task();
    let (scope_id, stir) = core.create_scope(owner);
    let handle = ScopeHandle::new(Rc::downgrade(&core), scope_id);

    let body_result = body(handle).await;
    match settle(&core, scope_id, stir, body_result).await? {
        Some(value) => Ok(value),
        // Only a guard watchdog interrupts a body, and plain scopes have none.
        None => unreachable!("scope body interrupted without a guard"),
    }
}

/// Run `body` inside a scope that shuts down when `guard` fires.
///
/// Returns `Ok(Some(value))` when the body completed before the guard,
/// `Ok(None)` when the guard interrupted it. Children closed by the guard
/// count as cancelled, not failed; independent child failures still surface
/// as `Concurrent`.
pub async fn until<T, F, Fut>(guard: Notification, body: F) -> SimResult<Option<T>>
where
    F: FnOnce(ScopeHandle) -> Fut,
    Fut: Future<Output = SimResult<T>>,
{
    let core = context::current();
    let owner = core.current_task();
    let (scope_id, stir) = core.create_scope(owner);
    let handle = ScopeHandle::new(Rc::downgrade(&core), scope_id);

    handle.spawn_volatile(async move {
        guard.await?;
        let core = context::current();
        debug!(scope = scope_id.as_raw(), "scope guard fired; shutting down");
        core.close_scope(scope_id, true);
        Ok(())
    });

    let body_result = body(handle).await;
    settle(&core, scope_id, stir, body_result).await
}

/// Scope teardown: drain children, classify the exit.
///
/// Runs on every exit path of the owning body, including its cancellation:
/// the owner's own pending fault is stashed while children terminate and
/// re-raised afterwards.
async fn settle<T>(
    core: &Rc<Core>,
    scope_id: ScopeId,
    stir: Notification,
    body_result: SimResult<T>,
) -> SimResult<Option<T>> {
    let raw = scope_id.as_raw();
    let mut value = None;
    let mut body_err = None;
    match body_result {
        Ok(v) => value = Some(v),
        Err(fault) if error::is_interrupt_for(&fault, raw) => {
            // Guard-driven shutdown of this scope: a clean exit.
        }
        Err(fault) => body_err = Some(fault),
    }

    let mut stash: Option<Fault> = None;
    if body_err.is_some() {
        core.close_children(scope_id, true);
    }

    // Phase 1: await non-volatile children; the first failure observed
    // closes the remainder.
    loop {
        if core.scope_failure_count(scope_id) > 0 && !core.scope_is_closing(scope_id) {
            debug!(scope = raw, "child failed; closing remaining children");
            core.close_children(scope_id, true);
        }
        if core.live_children(scope_id, false) == 0 {
            break;
        }
        stir.node.set_flag(false);
        match stir.wait().await {
            Ok(()) => {}
            Err(fault) if error::is_interrupt_for(&fault, raw) => {
                // Watchdog shut us down mid-teardown; children are already
                // being closed, keep draining.
            }
            Err(fault) => {
                // The owner itself was cancelled during teardown: finish
                // draining children first, then re-raise.
                if stash.is_none() {
                    stash = Some(fault);
                    core.close_children(scope_id, true);
                }
            }
        }
    }

    // Phase 2: volatile children never block exit; force-close them.
    core.close_children(scope_id, false);
    loop {
        if core.live_children(scope_id, true) == 0 {
            break;
        }
        stir.node.set_flag(false);
        match stir.wait().await {
            Ok(()) => {}
            Err(fault) if error::is_interrupt_for(&fault, raw) => {}
            Err(fault) => {
                if stash.is_none() {
                    stash = Some(fault);
                }
            }
        }
    }

    core.discard_scope_interrupts(core.current_task(), scope_id);
    let failures = core.reap_scope(scope_id);

    // Priority: fatal > synchronous body error > owner cancellation >
    // concurrent children. Exactly one of these leaves the scope.
    if let Some(fatal) = failures.iter().find(|f| error::is_fatal(f.as_ref())) {
        return Err(error::reraise(Arc::clone(fatal)));
    }
    if let Some(fault) = body_err {
        return Err(fault);
    }
    if let Some(fault) = stash {
        return Err(fault);
    }
    if !failures.is_empty() {
        debug!(scope = raw, count = failures.len(), "raising concurrent failure");
        return Err(Fault::new(Concurrent::new(failures)));
    }
    Ok(value)
}
