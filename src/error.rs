//! Error types for the simulation kernel
//!
//! Task bodies fail with ordinary `Err` values and propagate them with `?`.
//! The dynamic currency is [`anyhow::Error`] (aliased [`Fault`]) so user code
//! can fail with any error type; the kernel's own errors are concrete
//! `thiserror` types wrapped in it.
//!
//! Two families get special treatment by the scheduler:
//!
//! - **Cancellation sentinels** ([`CancelTask`], [`TaskClosed`],
//!   [`VolatileTaskClosed`], [`TaskCancelled`], [`Interrupt`]) terminate the
//!   task they are delivered to and are never aggregated into [`Concurrent`].
//! - **Fatal faults** ([`Fatal`]) bypass aggregation entirely and supersede
//!   a pending [`Concurrent`] at scope exit.

use std::sync::Arc;

use thiserror::Error;

/// Dynamic error currency for task bodies and kernel operations.
pub type Fault = anyhow::Error;

/// Result type for simulation operations.
pub type SimResult<T> = Result<T, Fault>;

/// A task failure shared between its owning scope and its handle.
pub type SharedFault = Arc<anyhow::Error>;

/// Default cancellation reason for [`cancel`](crate::task::TaskHandle::cancel).
#[derive(Error, Debug, Clone, Copy, Default)]
#[error("task cancellation requested")]
pub struct CancelTask;

/// Delivered to non-volatile children during graceful scope shutdown.
#[derive(Error, Debug, Clone, Copy, Default)]
#[error("task closed by scope shutdown")]
pub struct TaskClosed;

/// Delivered to volatile children when their scope tears down.
#[derive(Error, Debug, Clone, Copy, Default)]
#[error("volatile task closed by scope teardown")]
pub struct VolatileTaskClosed;

/// Terminal payload of a cancelled task.
///
/// `reason` is the rendered cancellation fault that was delivered
/// ([`CancelTask`] by default).
#[derive(Error, Debug, Clone)]
#[error("task cancelled: {reason}")]
pub struct TaskCancelled {
    /// Rendered cancellation reason.
    pub reason: String,
}

impl TaskCancelled {
    pub(crate) fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Operation on a closed [`Channel`](crate::sync::Channel) or
/// [`Queue`](crate::sync::Queue).
#[derive(Error, Debug, Clone, Copy, Default)]
#[error("stream closed")]
pub struct StreamClosed;

/// A resource claim that can never be satisfied.
#[derive(Error, Debug, Clone)]
#[error("resources unavailable: {claim}")]
pub struct ResourcesUnavailable {
    /// Human-readable description of the rejected claim.
    pub claim: String,
}

/// `produce` would push a bounded commodity past its capacity.
#[derive(Error, Debug, Clone)]
#[error("capacity exceeded for '{commodity}': level {level} + {amount} > capacity {capacity}")]
pub struct CapacityExceeded {
    /// Commodity name.
    pub commodity: String,
    /// Level before the rejected produce.
    pub level: f64,
    /// Amount the produce attempted to add.
    pub amount: f64,
    /// Capacity bound.
    pub capacity: f64,
}

/// Re-acquisition of a [`Lock`](crate::sync::Lock) by its current holder.
#[derive(Error, Debug, Clone, Copy, Default)]
#[error("lock re-acquired by its holder (self-deadlock)")]
pub struct LockReentry;

/// Wrapper marking a fault as fatal.
///
/// Fatal faults are never folded into [`Concurrent`]; the first one observed
/// at scope exit propagates alone.
#[derive(Error, Debug)]
#[error("fatal: {0}")]
pub struct Fatal(pub Fault);

/// Internal shutdown signal an `until` scope delivers to its own body.
///
/// Consumed by the owning scope's teardown; user code should propagate it
/// with `?` like any other fault.
#[derive(Error, Debug, Clone, Copy)]
#[error("scope shutdown signalled")]
pub struct Interrupt {
    pub(crate) scope: u64,
}

/// Outcome of a failed or cancelled task, as observed through its handle.
#[derive(Error, Debug, Clone)]
#[error("{fault}")]
pub struct TaskFailed {
    fault: SharedFault,
}

impl TaskFailed {
    pub(crate) fn new(fault: SharedFault) -> Self {
        Self { fault }
    }

    /// The task's original fault.
    pub fn fault(&self) -> &SharedFault {
        &self.fault
    }
}

/// Rewrap a shared task failure as a fresh [`Fault`] for propagation.
pub fn reraise(fault: SharedFault) -> Fault {
    Fault::new(TaskFailed::new(fault))
}

/// True for faults that terminate a task without counting as its failure.
pub fn is_cancellation(fault: &Fault) -> bool {
    fault.is::<CancelTask>()
        || fault.is::<TaskClosed>()
        || fault.is::<VolatileTaskClosed>()
        || fault.is::<TaskCancelled>()
        || fault.is::<Interrupt>()
}

/// True for faults that bypass [`Concurrent`] aggregation.
pub fn is_fatal(fault: &Fault) -> bool {
    fault.is::<Fatal>()
}

pub(crate) fn is_interrupt_for(fault: &Fault, scope: u64) -> bool {
    fault
        .downcast_ref::<Interrupt>()
        .is_some_and(|i| i.scope == scope)
}

/// Aggregate of one or more simultaneous child-task failures.
///
/// Raised by a scope when its body succeeded but children failed. Nested
/// aggregates from nested scopes are preserved as-is; [`flattened`] strips
/// them on demand.
///
/// [`flattened`]: Concurrent::flattened
#[derive(Debug, Clone)]
pub struct Concurrent {
    faults: Vec<SharedFault>,
}

impl Concurrent {
    pub(crate) fn new(faults: Vec<SharedFault>) -> Self {
        debug_assert!(!faults.is_empty(), "empty Concurrent");
        Self { faults }
    }

    /// The inner failures, in the order they were observed.
    pub fn faults(&self) -> &[SharedFault] {
        &self.faults
    }

    /// Number of inner failures.
    pub fn len(&self) -> usize {
        self.faults.len()
    }

    /// Always false for an aggregate raised by the kernel.
    pub fn is_empty(&self) -> bool {
        self.faults.is_empty()
    }

    /// True if some inner failure is of type `E`.
    pub fn contains<E>(&self) -> bool
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.faults.iter().any(|f| f.is::<E>())
    }

    /// Exact selector: the set of inner failure types is exactly the listed
    /// tuple of types.
    ///
    /// Every inner failure must be of one of the listed types and every
    /// listed type must appear at least once.
    pub fn matches<S: FaultSet>(&self) -> bool {
        let full = S::full_mask();
        let mut seen = 0u32;
        for fault in &self.faults {
            let hits = S::hits(fault);
            if hits == 0 {
                return false;
            }
            seen |= hits;
        }
        seen == full
    }

    /// Superset selector: every listed type appears among the inner
    /// failures; extra failure types are allowed.
    pub fn matches_any<S: FaultSet>(&self) -> bool {
        let mut seen = 0u32;
        for fault in &self.faults {
            seen |= S::hits(fault);
        }
        seen == S::full_mask()
    }

    /// Copy with nested [`Concurrent`] layers expanded in place.
    pub fn flattened(&self) -> Concurrent {
        let mut flat = Vec::with_capacity(self.faults.len());
        for fault in &self.faults {
            match fault.downcast_ref::<Concurrent>() {
                Some(nested) => flat.extend(nested.flattened().faults),
                None => flat.push(fault.clone()),
            }
        }
        Concurrent { faults: flat }
    }
}

impl std::fmt::Display for Concurrent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} concurrent failure(s): ", self.faults.len())?;
        for (i, fault) in self.faults.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{fault}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Concurrent {}

/// A tuple of error types usable as a [`Concurrent`] selector.
///
/// Implemented for tuples of up to six `Error` types; `hits` reports which
/// tuple members a given fault downcasts to, as a bitmask.
pub trait FaultSet {
    /// Number of types in the set.
    const ARITY: u32;

    /// Bitmask of tuple members matching `fault`.
    fn hits(fault: &Fault) -> u32;

    /// Mask with one bit per tuple member.
    fn full_mask() -> u32 {
        (1u32 << Self::ARITY) - 1
    }
}

macro_rules! impl_fault_set {
    ($arity:expr; $($ty:ident => $bit:expr),+) => {
        impl<$($ty,)+> FaultSet for ($($ty,)+)
        where
            $($ty: std::error::Error + Send + Sync + 'static,)+
        {
            const ARITY: u32 = $arity;

            fn hits(fault: &Fault) -> u32 {
                let mut mask = 0u32;
                $(
                    if fault.is::<$ty>() {
                        mask |= 1 << $bit;
                    }
                )+
                mask
            }
        }
    };
}

impl_fault_set!(1; A => 0);
impl_fault_set!(2; A => 0, B => 1);
impl_fault_set!(3; A => 0, B => 1, C => 2);
impl_fault_set!(4; A => 0, B => 1, C => 2, D => 3);
impl_fault_set!(5; A => 0, B => 1, C => 2, D => 3, E => 4);
impl_fault_set!(6; A => 0, B => 1, C => 2, D => 3, E => 4, F => 5);

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[derive(Error, Debug)]
    #[error("index error: {0}")]
    struct IndexError(&'static str);

    #[derive(Error, Debug)]
    #[error("key error: {0}")]
    struct KeyError(&'static str);

    #[derive(Error, Debug)]
    #[error("value error")]
    struct ValueError;

    fn sample() -> Concurrent {
        Concurrent::new(vec![
            Arc::new(Fault::new(IndexError("A"))),
            Arc::new(Fault::new(KeyError("B"))),
            Arc::new(Fault::new(IndexError("C"))),
        ])
    }

    #[test]
    fn test_exact_selector_matches_exact_type_set() {
        let c = sample();
        assert!(c.matches::<(IndexError, KeyError)>());
        assert!(c.matches::<(KeyError, IndexError)>());
    }

    #[test]
    fn test_exact_selector_rejects_partial_type_set() {
        let c = sample();
        assert!(!c.matches::<(IndexError,)>());
        assert!(!c.matches::<(KeyError,)>());
    }

    #[test]
    fn test_exact_selector_rejects_unrepresented_type() {
        let c = sample();
        // ValueError is listed but not present.
        assert!(!c.matches::<(IndexError, KeyError, ValueError)>());
    }

    #[test]
    fn test_superset_selector() {
        let c = sample();
        assert!(c.matches_any::<(IndexError,)>());
        assert!(c.matches_any::<(KeyError,)>());
        assert!(c.matches_any::<(IndexError, KeyError)>());
        assert!(!c.matches_any::<(ValueError,)>());
    }

    #[test]
    fn test_contains() {
        let c = sample();
        assert!(c.contains::<IndexError>());
        assert!(!c.contains::<ValueError>());
    }

    #[test]
    fn test_flattened_expands_nested_layers() {
        let inner = sample();
        let outer = Concurrent::new(vec![
            Arc::new(Fault::new(inner)),
            Arc::new(Fault::new(ValueError)),
        ]);
        // Not auto-flattened: the nested aggregate is a single entry.
        assert_eq!(outer.len(), 2);
        assert!(outer.contains::<Concurrent>());

        let flat = outer.flattened();
        assert_eq!(flat.len(), 4);
        assert!(!flat.contains::<Concurrent>());
        assert!(flat.matches::<(IndexError, KeyError, ValueError)>());
    }

    #[test]
    fn test_cancellation_classification() {
        assert!(is_cancellation(&Fault::new(CancelTask)));
        assert!(is_cancellation(&Fault::new(TaskClosed)));
        assert!(is_cancellation(&Fault::new(VolatileTaskClosed)));
        assert!(is_cancellation(&Fault::new(TaskCancelled::new("x"))));
        assert!(!is_cancellation(&Fault::new(ValueError)));
    }

    #[test]
    fn test_fatal_classification() {
        let fatal = Fault::new(Fatal(Fault::new(ValueError)));
        assert!(is_fatal(&fatal));
        assert!(!is_fatal(&Fault::new(ValueError)));
    }
}
