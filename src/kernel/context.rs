//! Thread-local handle to the running kernel
//!
//! Free-standing primitives (`time::now`, `Flag::set`, spawning) reach the
//! kernel through this handle, which is installed for the duration of
//! [`run`](crate::kernel::run). Using a primitive that needs the kernel
//! outside of `run` is a usage error and panics.

use std::cell::RefCell;
use std::rc::Rc;

use crate::kernel::core::Core;

thread_local! {
    static CURRENT: RefCell<Option<Rc<Core>>> = const { RefCell::new(None) };
}

/// The running kernel, or a usage-error panic.
pub(crate) fn current() -> Rc<Core> {
    match try_current() {
        Some(core) => core,
        None => panic!("no simulation is running on this thread; enter via musim::run"),
    }
}

/// The running kernel, if any.
pub(crate) fn try_current() -> Option<Rc<Core>> {
    CURRENT.with(|slot| slot.borrow().clone())
}

/// Guard keeping `core` installed as the thread's kernel.
pub(crate) struct ContextGuard;

pub(crate) fn install(core: Rc<Core>) -> ContextGuard {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_some() {
            panic!("musim::run re-entered while a simulation is already running");
        }
        *slot = Some(core);
    });
    ContextGuard
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CURRENT.with(|slot| slot.borrow_mut().take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_context_by_default() {
        assert!(try_current().is_none());
    }

    #[test]
    fn test_install_and_drop() {
        let core = Rc::new(Core::new());
        {
            let _guard = install(core.clone());
            assert!(try_current().is_some());
        }
        assert!(try_current().is_none());
    }

    #[test]
    #[should_panic(expected = "re-entered")]
    fn test_reentry_panics() {
        let core = Rc::new(Core::new());
        let _guard = install(core.clone());
        let _second = install(core);
    }
}
