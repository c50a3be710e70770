//! NRS head: the per-queue policy container.
//!
//! A head owns every policy instance registered for one queue of a service partition, tracks
//! which of them is the fallback and which (if any) is the primary, and routes requests through
//! them. All bookkeeping sits behind one mutex; policy start/stop hooks run with that mutex
//! released, the STARTING/STOPPING states keep the window safe.
//!
//! Lock order: partition request lock, then head lock, then request state, then policy locks.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;
use tracing::{debug, error, info, warn};

use crate::error::{NrsError, Result};
use crate::policy::{
    CtlOutput, HeadInfo, NrsCtl, Policy, PolicyContext, PolicyDescriptor, PolicyEnv, PolicyFlags,
    PolicyId, PolicyInfo, PolicyState,
};
use crate::request::NrsRequest;
use crate::resource::{ResourceChain, ResourceSet, ResourceSlot};
use crate::service::WaitQueue;

/// Head-wide "a policy is waiting for its timer" flag.
///
/// Set by a rate-limiting policy when its next request is not due yet, cleared by its timer,
/// which also wakes the partition's workers.
#[derive(Clone)]
pub struct Throttle {
    flag: Arc<AtomicBool>,
    waitq: Arc<WaitQueue>,
}

impl Throttle {
    pub fn new(waitq: Arc<WaitQueue>) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            waitq,
        }
    }

    pub fn is_throttled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Clear the flag without waking anyone.
    pub fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }

    /// Timer expiry: clear the flag and wake the partition.
    pub fn release(&self) {
        self.clear();
        self.waitq.notify_all();
    }
}

impl fmt::Debug for Throttle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttle")
            .field("throttled", &self.is_throttled())
            .finish()
    }
}

struct PolicySlot {
    id: PolicyId,
    name: String,
    flags: PolicyFlags,
    ops: Arc<dyn Policy>,
    state: PolicyState,
    /// Usage references: resources handed to requests plus in-flight control calls.
    refs: u64,
    req_queued: u64,
    req_started: u64,
}

impl PolicySlot {
    fn info(&self, head: &HeadInfo) -> PolicyInfo {
        PolicyInfo {
            name: self.name.clone(),
            queue: head.queue,
            fallback: self.flags.contains(PolicyFlags::FALLBACK),
            state: self.state,
            queued: self.req_queued,
            started: self.req_started,
        }
    }
}

struct HeadInner {
    policies: Vec<PolicySlot>,
    next_id: u32,
    fallback: Option<PolicyId>,
    primary: Option<PolicyId>,
    /// Policies with queued requests, in service order.
    queued_policies: VecDeque<PolicyId>,
    req_queued: u64,
    req_started: u64,
    policy_starting: bool,
    stopping: bool,
}

impl HeadInner {
    fn slot(&self, id: PolicyId) -> Option<&PolicySlot> {
        self.policies.iter().find(|p| p.id == id)
    }

    fn slot_mut(&mut self, id: PolicyId) -> Option<&mut PolicySlot> {
        self.policies.iter_mut().find(|p| p.id == id)
    }

    fn find(&self, name: &str) -> Option<PolicyId> {
        self.policies.iter().find(|p| p.name == name).map(|p| p.id)
    }

    fn mark_queued(&mut self, id: PolicyId) {
        if !self.queued_policies.contains(&id) {
            self.queued_policies.push_back(id);
        }
    }

    fn unmark_queued(&mut self, id: PolicyId) {
        self.queued_policies.retain(|q| *q != id);
    }
}

/// Request scheduler for one queue of one service partition.
pub struct NrsHead {
    ctx: PolicyContext,
    inner: Mutex<HeadInner>,
}

impl NrsHead {
    pub fn new(info: HeadInfo, env: PolicyEnv, waitq: Arc<WaitQueue>) -> Self {
        Self {
            ctx: PolicyContext {
                head: info,
                env,
                throttle: Throttle::new(waitq),
            },
            inner: Mutex::new(HeadInner {
                policies: Vec::new(),
                next_id: 1,
                fallback: None,
                primary: None,
                queued_policies: VecDeque::new(),
                req_queued: 0,
                req_started: 0,
                policy_starting: false,
                stopping: false,
            }),
        }
    }

    pub fn info(&self) -> &HeadInfo {
        &self.ctx.head
    }

    pub fn throttle(&self) -> &Throttle {
        &self.ctx.throttle
    }

    /// Total queued requests over every policy.
    pub fn queued(&self) -> u64 {
        self.inner.lock().req_queued
    }

    /// Total requests being handled by workers.
    pub fn started(&self) -> u64 {
        self.inner.lock().req_started
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.lock().stopping
    }

    pub fn fallback_name(&self) -> Option<String> {
        let inner = self.inner.lock();
        inner
            .fallback
            .and_then(|id| inner.slot(id))
            .map(|p| p.name.clone())
    }

    pub fn primary_name(&self) -> Option<String> {
        let inner = self.inner.lock();
        inner
            .primary
            .and_then(|id| inner.slot(id))
            .map(|p| p.name.clone())
    }

    /// Status of every registered policy, in registration order.
    pub fn policy_infos(&self) -> Vec<PolicyInfo> {
        let inner = self.inner.lock();
        inner
            .policies
            .iter()
            .map(|p| p.info(&self.ctx.head))
            .collect()
    }

    /// Names of the registered policies.
    pub fn policy_names(&self) -> Vec<String> {
        self.inner
            .lock()
            .policies
            .iter()
            .map(|p| p.name.clone())
            .collect()
    }

    // ===== Policy registration =====

    /// Instantiate a policy type on this head.
    ///
    /// Instances of externally registered types start [`PolicyState::Unavailable`]; types
    /// flagged [`PolicyFlags::REG_START`] are started immediately, and a failed start undoes
    /// the registration.
    pub fn register_policy(&self, desc: &PolicyDescriptor) -> Result<()> {
        let ops = (desc.factory)(&self.ctx);
        let mut inner = self.inner.lock();

        if inner.find(&desc.name).is_some() {
            error!(head = %self.ctx.head, policy = %desc.name, "policy already registered");
            return Err(NrsError::AlreadyExists(desc.name.clone()));
        }

        let id = PolicyId(inner.next_id);
        inner.next_id += 1;
        let state = if desc.flags.contains(PolicyFlags::REG_EXTERN) {
            PolicyState::Unavailable
        } else {
            PolicyState::Stopped
        };
        inner.policies.push(PolicySlot {
            id,
            name: desc.name.clone(),
            flags: desc.flags,
            ops,
            state,
            refs: 0,
            req_queued: 0,
            req_started: 0,
        });
        debug!(head = %self.ctx.head, policy = %desc.name, %state, "policy registered");

        if !desc.flags.contains(PolicyFlags::REG_START) {
            return Ok(());
        }

        Self::get_locked(&mut inner, id);
        let started = self.start_locked(&mut inner, id);
        self.put_locked(&mut inner, id);
        drop(inner);

        if let Err(err) = started {
            error!(head = %self.ctx.head, policy = %desc.name, %err, "failed to start policy on registration");
            if let Err(undo) = self.unregister_policy(&desc.name) {
                warn!(head = %self.ctx.head, policy = %desc.name, %undo, "failed to undo registration");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Whether the named instance could be unregistered right now.
    pub fn check_unregister(&self, name: &str) -> Result<()> {
        let inner = self.inner.lock();
        self.idle_policy(&inner, name).map(|_| ())
    }

    fn idle_policy(&self, inner: &HeadInner, name: &str) -> Result<(PolicyId, PolicyState)> {
        let (id, refs, state) = inner
            .find(name)
            .and_then(|id| inner.slot(id))
            .map(|slot| (slot.id, slot.refs, slot.state))
            .ok_or_else(|| NrsError::NoDevice(name.to_owned()))?;
        if refs > 0 {
            error!(head = %self.ctx.head, policy = name, refs, "policy is busy");
            return Err(NrsError::Busy {
                name: name.to_owned(),
                refs,
            });
        }
        Ok((id, state))
    }

    /// Remove a policy instance. It must hold no references; it is stopped first if needed.
    pub fn unregister_policy(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let (id, state) = self.idle_policy(&inner, name)?;

        if !matches!(state, PolicyState::Stopped | PolicyState::Unavailable) {
            self.stop_locked(&mut inner, id)?;
        }

        inner.policies.retain(|p| p.id != id);
        inner.unmark_queued(id);
        debug!(head = %self.ctx.head, policy = name, "policy unregistered");
        Ok(())
    }

    /// Promote an unavailable instance so administrators may start it.
    pub fn make_available(&self, name: &str) {
        let mut inner = self.inner.lock();
        if let Some(id) = inner.find(name) {
            if let Some(slot) = inner.slot_mut(id) {
                if slot.state == PolicyState::Unavailable {
                    slot.state = PolicyState::Stopped;
                }
            }
        }
    }

    /// Enter shutdown: from now on the fallback policy may be stopped.
    pub fn set_stopping(&self) {
        self.inner.lock().stopping = true;
    }

    // ===== Lifecycle =====

    fn get_locked(inner: &mut HeadInner, id: PolicyId) {
        if let Some(slot) = inner.slot_mut(id) {
            slot.refs += 1;
        }
    }

    fn put_locked(&self, inner: &mut MutexGuard<'_, HeadInner>, id: PolicyId) {
        if let Some(slot) = inner.slot_mut(id) {
            debug_assert!(slot.refs > 0, "policy reference underflow");
            slot.refs = slot.refs.saturating_sub(1);
        }
        self.maybe_stop0(inner, id);
    }

    fn maybe_stop0(&self, inner: &mut MutexGuard<'_, HeadInner>, id: PolicyId) {
        let idle = inner
            .slot(id)
            .map(|s| s.refs == 0 && s.state == PolicyState::Stopping)
            .unwrap_or(false);
        if idle {
            self.stop0(inner, id);
        }
    }

    /// Final transition to STOPPED; the stop hook runs with the head lock released.
    fn stop0(&self, inner: &mut MutexGuard<'_, HeadInner>, id: PolicyId) {
        let Some(slot) = inner.slot(id) else {
            return;
        };
        debug_assert_eq!(slot.req_queued, 0);
        debug_assert_eq!(slot.req_started, 0);
        let ops = Arc::clone(&slot.ops);
        let name = slot.name.clone();
        inner.unmark_queued(id);

        MutexGuard::unlocked(inner, || ops.stop());

        if let Some(slot) = inner.slot_mut(id) {
            slot.state = PolicyState::Stopped;
        }
        info!(head = %self.ctx.head, policy = %name, "policy stopped");
    }

    /// Start a policy, swapping it in as the primary if it is not the fallback.
    ///
    /// Starting the fallback while it already is the fallback stops the primary instead.
    fn start_locked(&self, inner: &mut MutexGuard<'_, HeadInner>, id: PolicyId) -> Result<()> {
        // ===== STEP 1: reject conflicting states =====
        if inner.policy_starting {
            return Err(NrsError::TryAgain("another policy is starting".into()));
        }
        let (name, flags, state, ops) = match inner.slot(id) {
            Some(s) => (s.name.clone(), s.flags, s.state, Arc::clone(&s.ops)),
            None => return Err(NrsError::NoDevice(format!("policy {id:?}"))),
        };
        if matches!(state, PolicyState::Stopping | PolicyState::Unavailable) {
            return Err(NrsError::TryAgain(format!("policy {name} is {state}")));
        }

        if flags.contains(PolicyFlags::FALLBACK) {
            if inner.fallback == Some(id) {
                self.stop_primary(inner);
                return Ok(());
            }
            if inner.fallback.is_some() {
                return Err(NrsError::AlreadyExists(format!(
                    "head {} already has a fallback policy",
                    self.ctx.head
                )));
            }
        } else {
            if inner.fallback.is_none() {
                return Err(NrsError::PermissionDenied(format!(
                    "cannot start {name} without a fallback policy"
                )));
            }
            if state == PolicyState::Started {
                return Ok(());
            }
        }

        // ===== STEP 2: run the start hook unlocked =====
        inner.policy_starting = true;
        if let Some(slot) = inner.slot_mut(id) {
            slot.state = PolicyState::Starting;
        }

        let started = MutexGuard::unlocked(inner, || ops.start(&self.ctx));

        // ===== STEP 3: publish =====
        inner.policy_starting = false;
        if let Err(err) = started {
            if let Some(slot) = inner.slot_mut(id) {
                slot.state = PolicyState::Stopped;
            }
            warn!(head = %self.ctx.head, policy = %name, %err, "policy start failed");
            return Err(err);
        }
        if let Some(slot) = inner.slot_mut(id) {
            slot.state = PolicyState::Started;
        }

        if flags.contains(PolicyFlags::FALLBACK) {
            inner.fallback = Some(id);
        } else {
            self.stop_primary(inner);
            inner.primary = Some(id);
        }
        info!(head = %self.ctx.head, policy = %name, "policy started");
        Ok(())
    }

    fn stop_primary(&self, inner: &mut MutexGuard<'_, HeadInner>) {
        let Some(id) = inner.primary.take() else {
            return;
        };
        if let Some(slot) = inner.slot_mut(id) {
            slot.state = PolicyState::Stopping;
        }
        self.drain_to_fallback(inner, id);
        self.maybe_stop0(inner, id);
    }

    fn stop_locked(&self, inner: &mut MutexGuard<'_, HeadInner>, id: PolicyId) -> Result<()> {
        let Some(slot) = inner.slot(id) else {
            return Err(NrsError::NoDevice(format!("policy {id:?}")));
        };
        if inner.fallback == Some(id) && !inner.stopping {
            return Err(NrsError::PermissionDenied(format!(
                "{} is the fallback policy",
                slot.name
            )));
        }
        match slot.state {
            PolicyState::Starting => {
                return Err(NrsError::TryAgain(format!("{} is starting", slot.name)))
            }
            PolicyState::Started => {}
            _ => return Ok(()),
        }

        if let Some(slot) = inner.slot_mut(id) {
            slot.state = PolicyState::Stopping;
        }
        if inner.primary == Some(id) {
            inner.primary = None;
            self.drain_to_fallback(inner, id);
        } else if inner.fallback == Some(id) {
            inner.fallback = None;
        }
        self.maybe_stop0(inner, id);
        Ok(())
    }

    /// Move every request still queued on a stopping policy onto the fallback.
    ///
    /// The requests give up their resources on the stopping policy, so once the ones already
    /// handed to workers finish, the policy can reach STOPPED.
    fn drain_to_fallback(&self, inner: &mut MutexGuard<'_, HeadInner>, id: PolicyId) {
        let Some(fallback) = inner.fallback else {
            return;
        };
        let (ops, mut budget) = match inner.slot(id) {
            Some(s) => (Arc::clone(&s.ops), s.req_queued),
            None => return,
        };
        let Some(fallback_ops) = inner.slot(fallback).map(|s| Arc::clone(&s.ops)) else {
            return;
        };

        let mut released: SmallVec<[ResourceChain; 8]> = SmallVec::new();
        while budget > 0 {
            budget -= 1;
            let Some(nrq) = ops.req_poll(true) else {
                break;
            };
            let mut st = nrq.state();
            let Some((_, slot)) = st.owner else {
                break;
            };
            let (Some(leaf), Some(fallback_leaf)) = (
                st.resources.get(slot).map(|c| c.leaf().clone()),
                st.resources
                    .get(ResourceSlot::Fallback)
                    .map(|c| c.leaf().clone()),
            ) else {
                break;
            };

            ops.req_dequeue(&nrq, &leaf);
            if let Err(err) = fallback_ops.req_enqueue(&nrq, &fallback_leaf) {
                error!(head = %self.ctx.head, xid = nrq.xid(), %err, "fallback refused drained request");
                if ops.req_enqueue(&nrq, &leaf).is_err() {
                    error!(head = %self.ctx.head, xid = nrq.xid(), "request could not be re-queued");
                }
                break;
            }
            st.owner = Some((fallback, ResourceSlot::Fallback));
            if let Some(chain) = st.resources.take(ResourceSlot::Primary) {
                released.push(chain);
            }
            drop(st);

            if let Some(s) = inner.slot_mut(id) {
                s.req_queued -= 1;
            }
            if let Some(s) = inner.slot_mut(fallback) {
                s.req_queued += 1;
            }
            inner.mark_queued(fallback);
        }

        if inner.slot(id).map(|s| s.req_queued == 0).unwrap_or(true) {
            inner.unmark_queued(id);
        }
        if !released.is_empty() {
            debug!(head = %self.ctx.head, moved = released.len(), "drained stopping policy");
        }
        for chain in released {
            let owner = chain.release();
            if let Some(s) = inner.slot_mut(owner) {
                s.refs = s.refs.saturating_sub(1);
            }
        }
    }

    // ===== Control =====

    /// Run a control operation against the named policy.
    pub fn policy_control(&self, name: &str, ctl: &NrsCtl) -> Result<CtlOutput> {
        let mut inner = self.inner.lock();
        let id = inner
            .find(name)
            .ok_or_else(|| NrsError::NoDevice(format!("{name} on {}", self.ctx.head)))?;

        Self::get_locked(&mut inner, id);
        let result = match ctl {
            NrsCtl::GetInfo => Ok(inner
                .slot(id)
                .map(|s| CtlOutput::Info(s.info(&self.ctx.head)))
                .unwrap_or(CtlOutput::None)),
            NrsCtl::Start => self.start_locked(&mut inner, id).map(|_| CtlOutput::None),
            NrsCtl::Stop => self.stop_locked(&mut inner, id).map(|_| CtlOutput::None),
            NrsCtl::Shrink => Err(NrsError::NotSupported("shrink".into())),
            other => match inner.slot(id) {
                Some(slot) if slot.state == PolicyState::Started => slot.ops.ctl(other),
                Some(slot) => Err(NrsError::NoDevice(format!(
                    "{} is {}",
                    slot.name, slot.state
                ))),
                None => Err(NrsError::NoDevice(name.to_owned())),
            },
        };
        self.put_locked(&mut inner, id);
        result
    }

    /// Start the named policy.
    pub fn start_policy(&self, name: &str) -> Result<()> {
        self.policy_control(name, &NrsCtl::Start).map(|_| ())
    }

    /// Stop the named policy. Stopping is deferred until the policy's requests are gone.
    pub fn stop_policy(&self, name: &str) -> Result<()> {
        self.policy_control(name, &NrsCtl::Stop).map(|_| ())
    }

    // ===== Resources =====

    /// Build the resource set of a request: fallback chain plus, if accepted, a primary chain.
    pub fn acquire_resources(&self, nrq: &NrsRequest, moving: bool) -> ResourceSet {
        let targets: SmallVec<[(ResourceSlot, PolicyId, Arc<dyn Policy>); 2]> = {
            let mut inner = self.inner.lock();
            let mut targets = SmallVec::new();
            for (slot, id) in [
                (ResourceSlot::Fallback, inner.fallback),
                (ResourceSlot::Primary, inner.primary),
            ] {
                let Some(id) = id else { continue };
                Self::get_locked(&mut inner, id);
                if let Some(s) = inner.slot(id) {
                    targets.push((slot, id, Arc::clone(&s.ops)));
                }
            }
            targets
        };

        let mut set = ResourceSet::default();
        let mut refused: SmallVec<[PolicyId; 2]> = SmallVec::new();
        for (slot, id, ops) in targets {
            match ResourceChain::acquire(id, ops, nrq, moving) {
                Some(chain) => {
                    set.set(slot, chain);
                }
                None => refused.push(id),
            }
        }

        if !refused.is_empty() {
            let mut inner = self.inner.lock();
            for id in refused {
                self.put_locked(&mut inner, id);
            }
        }
        set
    }

    /// Give back every chain of a resource set and drop the policy references they held.
    pub fn release_resources(&self, mut set: ResourceSet) {
        if set.is_empty() {
            return;
        }
        let owners: SmallVec<[PolicyId; 2]> =
            set.drain().into_iter().map(ResourceChain::release).collect();
        let mut inner = self.inner.lock();
        for id in owners {
            self.put_locked(&mut inner, id);
        }
    }

    // ===== Request path =====

    /// Queue a request on the outermost started policy that accepts it.
    pub fn enqueue(&self, nrq: &Arc<NrsRequest>) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut st = nrq.state();
        if st.enqueued || st.started || st.finalized || !st.initialized {
            return Err(NrsError::InvalidArgument(format!(
                "request {} cannot be queued (enqueued {}, started {}, finalized {})",
                nrq.xid(),
                st.enqueued,
                st.started,
                st.finalized
            )));
        }
        // Policy ids are local to a head: resources of another head must not be used here.
        if st.queue != self.ctx.head.queue {
            return Err(NrsError::InvalidArgument(format!(
                "request {} holds {} resources, not {}",
                nrq.xid(),
                st.queue,
                self.ctx.head.queue
            )));
        }

        for slot in ResourceSlot::OUTERMOST_FIRST {
            let Some(chain) = st.resources.get(slot) else {
                continue;
            };
            let id = chain.policy();
            let leaf = chain.leaf().clone();
            let ops = match inner.slot(id) {
                Some(p) if p.state == PolicyState::Started => Arc::clone(&p.ops),
                _ => continue,
            };
            match ops.req_enqueue(nrq, &leaf) {
                Ok(()) => {
                    st.enqueued = true;
                    st.owner = Some((id, slot));
                    drop(st);
                    if let Some(p) = inner.slot_mut(id) {
                        p.req_queued += 1;
                    }
                    inner.req_queued += 1;
                    inner.mark_queued(id);
                    return Ok(());
                }
                Err(err) => {
                    debug!(head = %self.ctx.head, xid = nrq.xid(), %err, "policy declined request");
                }
            }
        }
        Err(NrsError::NoDevice(format!(
            "no policy on {} accepted request {}",
            self.ctx.head,
            nrq.xid()
        )))
    }

    /// Ask each policy with queued work, in service order, for its next request.
    ///
    /// Without `peek` the returned request is marked started and must then be dequeued.
    pub fn poll(&self, peek: bool) -> Option<Arc<NrsRequest>> {
        let mut inner = self.inner.lock();
        self.poll_locked(&mut inner, peek)
    }

    fn poll_locked(&self, inner: &mut HeadInner, peek: bool) -> Option<Arc<NrsRequest>> {
        let candidates: SmallVec<[(PolicyId, Arc<dyn Policy>); 4]> = inner
            .queued_policies
            .iter()
            .filter_map(|id| inner.slot(*id).map(|p| (*id, Arc::clone(&p.ops))))
            .collect();

        for (id, ops) in candidates {
            if let Some(nrq) = ops.req_poll(peek) {
                if !peek {
                    Self::start_locked_request(inner, id, &ops, &nrq);
                }
                return Some(nrq);
            }
        }
        None
    }

    fn start_locked_request(
        inner: &mut HeadInner,
        id: PolicyId,
        ops: &Arc<dyn Policy>,
        nrq: &NrsRequest,
    ) {
        nrq.state().started = true;
        if let Some(p) = inner.slot_mut(id) {
            p.req_started += 1;
        }
        inner.req_started += 1;
        ops.req_start(nrq);
    }

    /// Remove a queued request from its policy. A request that is not queued is left alone.
    pub fn dequeue(&self, nrq: &Arc<NrsRequest>) {
        let mut inner = self.inner.lock();
        Self::dequeue_locked(&mut inner, nrq);
    }

    fn dequeue_locked(inner: &mut HeadInner, nrq: &Arc<NrsRequest>) {
        let mut st = nrq.state();
        if !st.enqueued {
            return;
        }
        let Some((id, slot)) = st.owner else {
            return;
        };
        let Some(leaf) = st.resources.get(slot).map(|c| c.leaf().clone()) else {
            return;
        };
        let Some(ops) = inner.slot(id).map(|p| Arc::clone(&p.ops)) else {
            return;
        };
        ops.req_dequeue(nrq, &leaf);
        st.enqueued = false;
        drop(st);

        inner.req_queued -= 1;
        let remaining = match inner.slot_mut(id) {
            Some(p) => {
                p.req_queued -= 1;
                p.req_queued
            }
            None => 0,
        };
        if remaining == 0 {
            inner.unmark_queued(id);
        } else if remaining != inner.req_queued {
            // Other policies have work too: yield to them.
            inner.unmark_queued(id);
            inner.queued_policies.push_back(id);
        }
    }

    /// Poll, dequeue and start the next request under one lock.
    pub fn take(&self) -> Option<Arc<NrsRequest>> {
        let mut inner = self.inner.lock();
        let nrq = self.poll_locked(&mut inner, false)?;
        Self::dequeue_locked(&mut inner, &nrq);
        Some(nrq)
    }

    /// A worker finished handling the request.
    pub fn stop_request(&self, nrq: &NrsRequest) {
        let mut inner = self.inner.lock();
        let mut st = nrq.state();
        if !st.started {
            return;
        }
        st.started = false;
        let Some((id, _)) = st.owner else {
            return;
        };
        drop(st);
        if let Some(p) = inner.slot_mut(id) {
            p.req_started -= 1;
            p.ops.req_stop(nrq);
        }
        inner.req_started -= 1;
    }
}

impl fmt::Debug for NrsHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NrsHead")
            .field("head", &self.ctx.head)
            .finish_non_exhaustive()
    }
}
