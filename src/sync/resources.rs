//! Named multi-commodity resource counters
//!
//! A [`Resources`] bundle maps commodity names to non-negative levels, with
//! an optional per-commodity capacity bound ([`Capacities`] fixes the bound
//! to the initial levels). Claims that cannot be satisfied right away park
//! in an ordered queue checked strictly head-first on every level increase:
//! a large claim at the head is never skipped in favour of a smaller one
//! behind it, so arrival order is grant order.
//!
//! [`borrow`](Resources::borrow) is the scoped form: the deducted levels
//! come back when the claim guard drops, on every exit path including
//! cancellation unwind. [`produce`](Resources::produce) and
//! [`consume`](Resources::consume) transfer permanently.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use tracing::trace;

use crate::error::{CapacityExceeded, Fault, ResourcesUnavailable, SimResult};
use crate::kernel::context;
use crate::sync::waitq::WaitSlot;

type Demand = Vec<(String, f64)>;

struct PendingClaim {
    demand: Demand,
    slot: WaitSlot<()>,
}

struct ResourceState {
    levels: BTreeMap<String, f64>,
    capacity: Option<BTreeMap<String, f64>>,
    pending: VecDeque<PendingClaim>,
}

impl ResourceState {
    fn satisfiable(&self, demand: &Demand) -> bool {
        demand
            .iter()
            .all(|(name, amount)| self.levels.get(name).is_some_and(|level| *level >= *amount))
    }

    fn deduct(&mut self, demand: &Demand) {
        for (name, amount) in demand {
            if let Some(level) = self.levels.get_mut(name) {
                *level -= amount;
            }
        }
    }

    fn credit(&mut self, demand: &Demand) {
        for (name, amount) in demand {
            if let Some(level) = self.levels.get_mut(name) {
                *level += amount;
            }
        }
    }

    /// Reject claims that no sequence of releases could ever satisfy.
    fn admissible(&self, demand: &Demand) -> SimResult<()> {
        for (name, amount) in demand {
            if *amount < 0.0 {
                return Err(Fault::new(ResourcesUnavailable {
                    claim: format!("negative amount {amount} of '{name}'"),
                }));
            }
            let Some(level) = self.levels.get(name) else {
                return Err(Fault::new(ResourcesUnavailable {
                    claim: format!("unknown commodity '{name}'"),
                }));
            };
            let bound = match &self.capacity {
                Some(capacity) => capacity.get(name).copied().unwrap_or(*level),
                None => f64::INFINITY,
            };
            if *amount > bound {
                return Err(Fault::new(ResourcesUnavailable {
                    claim: format!("{amount} of '{name}' exceeds capacity {bound}"),
                }));
            }
        }
        Ok(())
    }
}

/// Multi-commodity counters with fair, ordered claims.
#[derive(Clone)]
pub struct Resources {
    state: Rc<RefCell<ResourceState>>,
}

impl Resources {
    /// New bundle with the given initial levels and no capacity bound.
    pub fn new<N: Into<String>>(levels: impl IntoIterator<Item = (N, f64)>) -> Self {
        Self::build(levels, false)
    }

    fn build<N: Into<String>>(levels: impl IntoIterator<Item = (N, f64)>, bounded: bool) -> Self {
        let levels: BTreeMap<String, f64> =
            levels.into_iter().map(|(n, v)| (n.into(), v)).collect();
        debug_assert!(
            levels.values().all(|v| *v >= 0.0),
            "negative initial resource level"
        );
        let capacity = bounded.then(|| levels.clone());
        Self {
            state: Rc::new(RefCell::new(ResourceState {
                levels,
                capacity,
                pending: VecDeque::new(),
            })),
        }
    }

    /// Current level of a commodity.
    pub fn level(&self, name: &str) -> Option<f64> {
        self.state.borrow().levels.get(name).copied()
    }

    /// Claim levels for the lifetime of the returned guard.
    ///
    /// Suspends until the claim is satisfiable (behind every earlier claim);
    /// fails synchronously with
    /// [`ResourcesUnavailable`](crate::error::ResourcesUnavailable) when no
    /// release could ever satisfy it.
    pub async fn borrow(&self, demand: &[(&str, f64)]) -> SimResult<ResourceClaim> {
        let demand = normalize(demand);
        self.claim(&demand).await?;
        Ok(ResourceClaim {
            resources: self.clone(),
            demand,
        })
    }

    /// Permanently remove levels, queueing like a borrow if short.
    pub async fn consume(&self, demand: &[(&str, f64)]) -> SimResult<()> {
        let demand = normalize(demand);
        self.claim(&demand).await
    }

    /// Permanently add levels and re-check the claim queue.
    ///
    /// Producing past a capacity bound is an error.
    pub fn produce(&self, amounts: &[(&str, f64)]) -> SimResult<()> {
        {
            let mut state = self.state.borrow_mut();
            for (name, amount) in amounts {
                if *amount < 0.0 {
                    return Err(Fault::new(ResourcesUnavailable {
                        claim: format!("negative amount {amount} of '{name}'"),
                    }));
                }
                let Some(level) = state.levels.get(*name).copied() else {
                    return Err(Fault::new(ResourcesUnavailable {
                        claim: format!("unknown commodity '{name}'"),
                    }));
                };
                if let Some(capacity) = &state.capacity {
                    let bound = capacity.get(*name).copied().unwrap_or(level);
                    if level + amount > bound {
                        return Err(Fault::new(CapacityExceeded {
                            commodity: (*name).to_string(),
                            level,
                            amount: *amount,
                            capacity: bound,
                        }));
                    }
                }
            }
            for (name, amount) in amounts {
                if let Some(level) = state.levels.get_mut(*name) {
                    *level += amount;
                }
            }
        }
        self.dispense();
        Ok(())
    }

    async fn claim(&self, demand: &Demand) -> SimResult<()> {
        let me = context::current().current_task();
        let slot = {
            let mut state = self.state.borrow_mut();
            state.admissible(demand)?;
            if state.pending.is_empty() && state.satisfiable(demand) {
                state.deduct(demand);
                return Ok(());
            }
            let slot = WaitSlot::new(me);
            state.pending.push_back(PendingClaim {
                demand: demand.clone(),
                slot: slot.clone(),
            });
            slot
        };
        trace!(task = ?me, "resource claim queued");
        match slot.wait().await {
            // Levels were deducted when the claim was granted.
            Ok(()) => Ok(()),
            Err(fault) => {
                if slot.granted() {
                    // Granted but dying: return the levels.
                    self.refund(demand);
                } else {
                    let mut state = self.state.borrow_mut();
                    if let Some(pos) = state
                        .pending
                        .iter()
                        .position(|claim| claim.slot.task == me && claim.demand == *demand)
                    {
                        state.pending.remove(pos);
                    }
                }
                Err(fault)
            }
        }
    }

    fn refund(&self, demand: &Demand) {
        self.state.borrow_mut().credit(demand);
        self.dispense();
    }

    /// Grant pending claims strictly in order while the head fits.
    fn dispense(&self) {
        loop {
            let granted = {
                let mut state = self.state.borrow_mut();
                let Some(head) = state.pending.front() else {
                    return;
                };
                if !state.satisfiable(&head.demand) {
                    return;
                }
                let claim = match state.pending.pop_front() {
                    Some(claim) => claim,
                    None => return,
                };
                state.deduct(&claim.demand);
                claim
            };
            granted.slot.grant(());
        }
    }
}

/// [`Resources`] with the capacity bound fixed at the initial levels.
#[derive(Clone)]
pub struct Capacities {
    inner: Resources,
}

impl Capacities {
    pub fn new<N: Into<String>>(levels: impl IntoIterator<Item = (N, f64)>) -> Self {
        Self {
            inner: Resources::build(levels, true),
        }
    }
}

impl std::ops::Deref for Capacities {
    type Target = Resources;

    fn deref(&self) -> &Resources {
        &self.inner
    }
}

/// Scoped grant of a resource claim; refunds the levels on drop.
pub struct ResourceClaim {
    resources: Resources,
    demand: Demand,
}

impl std::fmt::Debug for ResourceClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceClaim")
            .field("demand", &self.demand)
            .finish()
    }
}

impl ResourceClaim {
    /// The granted level vector.
    pub fn demand(&self) -> &[(String, f64)] {
        &self.demand
    }
}

impl Drop for ResourceClaim {
    fn drop(&mut self) {
        self.resources.refund(&self.demand);
    }
}

fn normalize(demand: &[(&str, f64)]) -> Demand {
    demand
        .iter()
        .map(|(name, amount)| ((*name).to_string(), *amount))
        .collect()
}
