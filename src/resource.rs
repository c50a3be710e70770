//! Per-request resource chains.
//!
//! When a request is initialized every started policy of the head may hand it one or more
//! resources (head-level, then client-level, ...). The levels of one policy form a
//! [`ResourceChain`]; a request keeps at most one chain per [`ResourceSlot`], the fallback slot
//! being always populated.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::policy::{Policy, PolicyId};

/// Opaque policy state shared between requests.
#[derive(Clone)]
pub struct Resource {
    level: u8,
    data: Arc<dyn Any + Send + Sync>,
}

impl Resource {
    pub fn new<T: Any + Send + Sync>(level: u8, data: Arc<T>) -> Self {
        Self { level, data }
    }

    /// Depth of this resource in its policy's hierarchy, 0 being the outermost.
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Recover the policy's concrete type.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.data).downcast::<T>().ok()
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

/// Outcome of asking a policy for the next resource level.
pub enum ResourceStep {
    /// More levels follow; the returned resource is the parent of the next one.
    Continue(Resource),
    /// Last level of the hierarchy.
    Done(Resource),
    /// The policy does not want this request (only allowed for primary policies).
    Refused,
}

/// All resource levels one policy granted to a request, outermost first.
pub struct ResourceChain {
    policy: PolicyId,
    ops: Arc<dyn Policy>,
    levels: SmallVec<[Resource; 2]>,
}

impl ResourceChain {
    /// Walk the policy's hierarchy for a request.
    ///
    /// Returns `None` when the policy refuses at any level; levels already obtained are handed
    /// back to the policy in reverse order.
    pub fn acquire(
        policy: PolicyId,
        ops: Arc<dyn Policy>,
        nrq: &crate::request::NrsRequest,
        moving: bool,
    ) -> Option<ResourceChain> {
        let mut levels: SmallVec<[Resource; 2]> = SmallVec::new();
        loop {
            match ops.res_get(nrq, levels.last(), moving) {
                ResourceStep::Continue(res) => levels.push(res),
                ResourceStep::Done(res) => {
                    levels.push(res);
                    return Some(ResourceChain { policy, ops, levels });
                }
                ResourceStep::Refused => {
                    while let Some(res) = levels.pop() {
                        ops.res_put(res);
                    }
                    return None;
                }
            }
        }
    }

    pub fn policy(&self) -> PolicyId {
        self.policy
    }

    /// Innermost resource, the one enqueue/dequeue operate on.
    pub fn leaf(&self) -> &Resource {
        // A chain is only built from a `Done` step, so it always holds a level.
        &self.levels[self.levels.len() - 1]
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Hand every level back to the policy, innermost first.
    pub fn release(mut self) -> PolicyId {
        while let Some(res) = self.levels.pop() {
            self.ops.res_put(res);
        }
        self.policy
    }
}

impl fmt::Debug for ResourceChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceChain")
            .field("policy", &self.policy)
            .field("levels", &self.depth())
            .finish()
    }
}

/// Position of a chain in a request's resource set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceSlot {
    Fallback,
    Primary,
}

impl ResourceSlot {
    /// Enqueue order: primary gets first refusal.
    pub const OUTERMOST_FIRST: [ResourceSlot; 2] = [ResourceSlot::Primary, ResourceSlot::Fallback];

    const fn index(self) -> usize {
        match self {
            ResourceSlot::Fallback => 0,
            ResourceSlot::Primary => 1,
        }
    }
}

/// Resource chains attached to one request for one head.
#[derive(Debug, Default)]
pub struct ResourceSet {
    slots: [Option<ResourceChain>; 2],
}

impl ResourceSet {
    pub fn get(&self, slot: ResourceSlot) -> Option<&ResourceChain> {
        self.slots[slot.index()].as_ref()
    }

    pub fn set(&mut self, slot: ResourceSlot, chain: ResourceChain) -> Option<ResourceChain> {
        self.slots[slot.index()].replace(chain)
    }

    pub fn take(&mut self, slot: ResourceSlot) -> Option<ResourceChain> {
        self.slots[slot.index()].take()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Remove every chain, primary first. Callers release them outside their locks.
    pub fn drain(&mut self) -> SmallVec<[ResourceChain; 2]> {
        ResourceSlot::OUTERMOST_FIRST
            .into_iter()
            .filter_map(|slot| self.take(slot))
            .collect()
    }
}
