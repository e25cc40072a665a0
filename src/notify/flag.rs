//! Explicitly settable Boolean notification

use crate::error::SimResult;
use crate::notify::{Notification, Wait};

/// A Boolean notification settable from task code.
///
/// Setting the value it already holds is a no-op: no subscriber wakes.
///
/// # Usage
///
/// ```rust,no_run
/// use musim::{Flag, SimResult};
///
/// async fn consumer(ready: Flag) -> SimResult<()> {
///     ready.wait().await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Flag {
    notification: Notification,
}

impl Flag {
    /// New flag, initially false.
    pub fn new() -> Self {
        Self {
            notification: Notification::flag(false),
        }
    }

    /// Current value. Does not suspend.
    pub fn get(&self) -> bool {
        self.notification.node.flag_value()
    }

    /// Set the value, waking subscribers on a false→true transition.
    pub fn set(&self, value: bool) {
        self.notification.node.set_flag(value);
    }

    /// Shorthand for `set(false)`.
    pub fn clear(&self) {
        self.set(false);
    }

    /// The flag as a composable notification.
    pub fn notification(&self) -> Notification {
        self.notification.clone()
    }

    /// Suspend until the flag is true.
    pub fn wait(&self) -> Wait {
        self.notification.wait()
    }
}

impl Default for Flag {
    fn default() -> Self {
        Self::new()
    }
}

impl std::future::IntoFuture for Flag {
    type Output = SimResult<()>;
    type IntoFuture = Wait;

    fn into_future(self) -> Wait {
        self.notification.wait()
    }
}
