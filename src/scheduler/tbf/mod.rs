//! Token bucket filter policy.
//!
//! Requests are classified into clients (by NID or job id). Each client owns a token bucket
//! whose rate and depth come from the newest rule matching it; backlogged clients sit in a
//! min-heap ordered by the time their next token is due. When the head of the heap has no token
//! the policy throttles the NRS head and arms a timer for the deadline.
//!
//! Resource hierarchy: level 0 is the started instance state, level 1 the client.

pub mod client;
pub mod command;
pub mod heap;
pub mod rule;
pub mod selector;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::TbfConfig;
use crate::error::{NrsError, Result};
use crate::head::Throttle;
use crate::policy::{CtlOutput, HeadInfo, NrsCtl, Policy, PolicyContext};
use crate::request::NrsRequest;
use crate::resource::{Resource, ResourceStep};
use crate::timer::PolicyTimer;

pub use client::{ClientKey, TbfClient};
pub use command::{RuleCommand, TbfCommand};
pub use rule::{validate_rule_name, RuleInfo, RuleSet, TbfRule, DEFAULT_RULE, RULE_NAME_MAX};
pub use selector::{NidPattern, SelectorList};

use client::ClientBucket;
use heap::ClientHeap;

/// Scheduling state guarded by one lock: buckets, backlog heap, timer deadline.
#[derive(Default)]
struct TbfSched {
    buckets: HashMap<u64, ClientBucket>,
    heap: ClientHeap,
    sequence: u64,
    deadline: Option<u64>,
}

/// Everything a started instance owns.
struct TbfState {
    head: HeadInfo,
    config: TbfConfig,
    clock: Arc<dyn Clock>,
    throttle: Throttle,
    timer: Box<dyn PolicyTimer>,
    rules: RwLock<RuleSet>,
    /// Bumped on every rule list change; clients re-match lazily.
    rule_sequence: AtomicU64,
    clients: DashMap<ClientKey, Arc<TbfClient>>,
    next_client: AtomicU64,
    sched: Mutex<TbfSched>,
}

impl TbfState {
    fn client(&self, key: ClientKey) -> Arc<TbfClient> {
        let entry = self.clients.entry(key.clone()).or_insert_with(|| {
            Arc::new(TbfClient {
                key,
                id: self.next_client.fetch_add(1, Ordering::Relaxed),
            })
        });
        Arc::clone(entry.value())
    }

    /// Create the client's bucket, or bring an existing one up to date with the rule list.
    fn bind(&self, client: &TbfClient) {
        let now = self.clock.now_ns();
        let rules = self.rules.read();
        let sequence = self.rule_sequence.load(Ordering::Acquire);
        let mut guard = self.sched.lock();
        let sched = &mut *guard;

        let Some(bucket) = sched.buckets.get_mut(&client.id) else {
            let rule = rules.matching(&client.key);
            debug!(head = %self.head, client = %client.key, rule = rule.name(), "new tbf client");
            sched
                .buckets
                .insert(client.id, ClientBucket::bind(rule, sequence, now));
            return;
        };

        if bucket.rule_sequence != sequence || bucket.rule.is_stopping() {
            let rule = rules.matching(&client.key);
            if Arc::ptr_eq(&rule, &bucket.rule) {
                bucket.rule_sequence = sequence;
            } else {
                debug!(
                    head = %self.head,
                    client = %client.key,
                    from = bucket.rule.name(),
                    to = rule.name(),
                    "tbf client rebound"
                );
                bucket.rebind(rule, sequence, now);
            }
        }
        if bucket.rule_generation != bucket.rule.generation() {
            bucket.refresh_rate(now);
        }
        if sched.heap.contains(client.id) {
            sched.heap.update(bucket.heap_key(client.id));
        }
    }

    /// Drop a client nobody references any more.
    fn forget(&self, key: &ClientKey, id: u64) {
        let removed = self
            .clients
            .remove_if(key, |_, c| c.id == id && Arc::strong_count(c) == 1);
        if removed.is_none() {
            return;
        }
        let mut sched = self.sched.lock();
        sched.heap.remove(id);
        if let Some(bucket) = sched.buckets.remove(&id) {
            debug_assert!(bucket.pending.is_empty());
            bucket.release();
        }
    }

    fn arm(&self, sched: &mut TbfSched, deadline: u64) {
        self.throttle.set();
        sched.deadline = Some(deadline);
        self.timer.arm(deadline);
    }

    fn check_rate(&self, rate: u64) -> Result<()> {
        if rate == 0 || rate >= self.config.rate_ceiling {
            return Err(NrsError::InvalidArgument(format!(
                "rate {rate} must be in 1..{}",
                self.config.rate_ceiling
            )));
        }
        Ok(())
    }

    fn write_rule(&self, command: &RuleCommand) -> Result<()> {
        let mut rules = self.rules.write();
        match command {
            RuleCommand::Start {
                name,
                selectors,
                rate,
            } => {
                validate_rule_name(name)?;
                let rate = rate.unwrap_or(self.config.default_rate);
                self.check_rate(rate)?;
                let selectors = SelectorList::parse(self.config.classifier, selectors)?;
                rules.add(TbfRule::new(
                    name.as_str(),
                    selectors,
                    rate,
                    self.config.depth,
                ))?;
            }
            RuleCommand::Change { name, rate } => {
                self.check_rate(*rate)?;
                rules.change(name, *rate)?;
            }
            RuleCommand::Stop { name } => {
                rules.stop(name)?;
            }
        }
        self.rule_sequence.fetch_add(1, Ordering::AcqRel);
        info!(head = %self.head, rule = command.name(), ?command, "tbf rule updated");
        Ok(())
    }
}

/// Token bucket filter instance for one NRS head.
pub struct TbfPolicy {
    name: String,
    state: RwLock<Option<Arc<TbfState>>>,
}

impl TbfPolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(None),
        }
    }

    fn state(&self) -> Option<Arc<TbfState>> {
        self.state.read().clone()
    }

    fn started(&self) -> Result<Arc<TbfState>> {
        self.state()
            .ok_or_else(|| NrsError::NoDevice(format!("{} is not started", self.name)))
    }

    /// Rules newest first, the default rule last.
    pub fn rules(&self) -> Result<Vec<RuleInfo>> {
        Ok(self.started()?.rules.read().infos())
    }

    /// Clients currently holding resources.
    pub fn client_count(&self) -> usize {
        self.state().map(|s| s.clients.len()).unwrap_or(0)
    }

    /// Requests queued over every client.
    pub fn queued(&self) -> usize {
        let Some(state) = self.state() else {
            return 0;
        };
        let sched = state.sched.lock();
        sched.buckets.values().map(|b| b.pending.len()).sum()
    }
}

impl Policy for TbfPolicy {
    fn start(&self, ctx: &PolicyContext) -> Result<()> {
        let wake = ctx.throttle.clone();
        let timer_name = format!("{}-{}-{}", self.name, ctx.head.partition, ctx.head.queue.index());
        let timer = ctx
            .env
            .timers
            .create(&timer_name, Arc::new(move || wake.release()))?;

        let config = ctx.env.tbf.clone();
        let state = TbfState {
            head: ctx.head.clone(),
            rules: RwLock::new(RuleSet::new(config.default_rate, config.depth)),
            config,
            clock: Arc::clone(&ctx.env.clock),
            throttle: ctx.throttle.clone(),
            timer,
            rule_sequence: AtomicU64::new(0),
            clients: DashMap::new(),
            next_client: AtomicU64::new(0),
            sched: Mutex::new(TbfSched::default()),
        };
        debug!(
            head = %state.head,
            classifier = ?state.config.classifier,
            rate = state.config.default_rate,
            depth = state.config.depth,
            "tbf state allocated"
        );
        *self.state.write() = Some(Arc::new(state));
        Ok(())
    }

    fn stop(&self) {
        let state = self.state.write().take();
        if let Some(state) = state {
            state.timer.cancel();
            state.throttle.clear();
            debug!(head = %state.head, "tbf state released");
        }
    }

    fn ctl(&self, ctl: &NrsCtl) -> Result<CtlOutput> {
        let state = self.started()?;
        match ctl {
            NrsCtl::ReadRules => Ok(CtlOutput::Rules(state.rules.read().infos())),
            NrsCtl::WriteRule(command) => {
                state.write_rule(command)?;
                Ok(CtlOutput::None)
            }
            other => Err(NrsError::NotSupported(format!("{}: {other:?}", self.name))),
        }
    }

    fn res_get(
        &self,
        nrq: &NrsRequest,
        parent: Option<&Resource>,
        _moving: bool,
    ) -> ResourceStep {
        let Some(parent) = parent else {
            return match self.state() {
                Some(state) => ResourceStep::Continue(Resource::new(0, state)),
                None => ResourceStep::Refused,
            };
        };
        let Some(state) = parent.downcast::<TbfState>() else {
            return ResourceStep::Refused;
        };

        let key = ClientKey::classify(state.config.classifier, nrq.identity());
        let client = state.client(key);
        state.bind(&client);
        ResourceStep::Done(Resource::new(1, client))
    }

    fn res_put(&self, res: Resource) {
        if res.level() == 0 {
            return;
        }
        let Some(client) = res.downcast::<TbfClient>() else {
            return;
        };
        let (key, id) = (client.key.clone(), client.id);
        drop(client);
        drop(res);
        if let Some(state) = self.state() {
            state.forget(&key, id);
        }
    }

    fn req_enqueue(&self, nrq: &Arc<NrsRequest>, res: &Resource) -> Result<()> {
        let state = self.started()?;
        let client = res
            .downcast::<TbfClient>()
            .ok_or_else(|| NrsError::InvalidArgument(format!("{}: foreign resource", self.name)))?;
        let now = state.clock.now_ns();

        let mut guard = state.sched.lock();
        let sched = &mut *guard;
        let bucket = sched
            .buckets
            .get_mut(&client.id)
            .ok_or_else(|| NrsError::NoDevice(format!("tbf client {}", client.key)))?;

        let seq = sched.sequence;
        sched.sequence += 1;
        nrq.set_sequence(seq);
        let first = bucket.pending.is_empty();
        bucket.pending.insert(seq, Arc::clone(nrq));
        if !first {
            return Ok(());
        }

        bucket.refill(now);
        let key = bucket.heap_key(client.id);
        sched.heap.insert(key);
        if state.throttle.is_throttled() {
            if key.next_token_ns <= now {
                state.timer.cancel();
                sched.deadline = None;
                state.throttle.clear();
            } else if sched.deadline.map_or(true, |d| key.next_token_ns < d) {
                state.arm(sched, key.next_token_ns);
            }
        }
        Ok(())
    }

    fn req_poll(&self, peek: bool) -> Option<Arc<NrsRequest>> {
        let state = self.state()?;
        if peek {
            let sched = state.sched.lock();
            let top = sched.heap.peek()?;
            return sched.buckets.get(&top.client)?.pending.values().next().cloned();
        }
        if state.throttle.is_throttled() {
            return None;
        }

        let now = state.clock.now_ns();
        let mut guard = state.sched.lock();
        let sched = &mut *guard;
        let top = sched.heap.peek()?;
        let bucket = sched.buckets.get_mut(&top.client)?;
        if bucket.rule_generation != bucket.rule.generation() {
            bucket.refresh_rate(now);
        }
        bucket.refill(now);

        if bucket.ntoken > 0 {
            bucket.ntoken -= 1;
            let (_, nrq) = bucket.pending.pop_first()?;
            if bucket.pending.is_empty() {
                sched.heap.remove(top.client);
            } else {
                sched.heap.update(bucket.heap_key(top.client));
            }
            sched.deadline = None;
            return Some(nrq);
        }

        sched.heap.update(bucket.heap_key(top.client));
        let deadline = sched.heap.peek().map_or(now, |k| k.next_token_ns);
        debug!(head = %state.head, deadline, "tbf throttled");
        state.arm(sched, deadline);
        None
    }

    fn req_dequeue(&self, nrq: &Arc<NrsRequest>, res: &Resource) {
        let (Some(state), Some(client)) = (self.state(), res.downcast::<TbfClient>()) else {
            return;
        };
        let mut guard = state.sched.lock();
        let sched = &mut *guard;
        let Some(bucket) = sched.buckets.get_mut(&client.id) else {
            return;
        };
        let seq = nrq.sequence();
        // A polled request has already left its client.
        if !matches!(bucket.pending.get(&seq), Some(queued) if Arc::ptr_eq(queued, nrq)) {
            return;
        }
        bucket.pending.remove(&seq);
        if bucket.pending.is_empty() {
            sched.heap.remove(client.id);
        }
    }

    fn req_start(&self, nrq: &NrsRequest) {
        debug!(policy = %self.name, nid = %nrq.identity().nid, seq = nrq.sequence(), "start request");
    }

    fn req_stop(&self, nrq: &NrsRequest) {
        debug!(policy = %self.name, nid = %nrq.identity().nid, seq = nrq.sequence(), "stop request");
    }
}
