//! Shared harness: a service driven by a manual clock and manual timers.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rpc_nrs::clock::{Clock, ManualClock};
use rpc_nrs::config::NrsConfig;
use rpc_nrs::policy::{CtlOutput, NrsCtl, PolicyEnv, PolicyInfo};
use rpc_nrs::queue::{QueueSelector, QueueType};
use rpc_nrs::registry::PolicyRegistry;
use rpc_nrs::request::{NrsRequest, Request, RequestIdentity};
use rpc_nrs::scheduler::tbf::RuleInfo;
use rpc_nrs::service::{Service, ServicePartition};
use rpc_nrs::timer::ManualTimerFactory;

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub timers: ManualTimerFactory,
    pub service: Service,
}

impl Harness {
    /// One partition, both heads.
    pub fn new() -> Self {
        let mut config = NrsConfig::default();
        config.service.partitions = 1;
        Self::with_config(config)
    }

    pub fn with_config(config: NrsConfig) -> Self {
        Self::with_registry(config, Arc::new(PolicyRegistry::new()))
    }

    pub fn with_registry(config: NrsConfig, registry: Arc<PolicyRegistry>) -> Self {
        let clock = Arc::new(ManualClock::new(0));
        let timers = ManualTimerFactory::new();
        let env = PolicyEnv::new(
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::new(timers.clone()),
            config.tbf.clone(),
        );
        let service = Service::new(&config, registry, env).expect("service setup");
        Self {
            clock,
            timers,
            service,
        }
    }

    pub fn part(&self) -> &ServicePartition {
        &self.service.partitions()[0]
    }

    pub fn start_tbf(&self, selector: QueueSelector) {
        self.service
            .policy_control(selector, "tbf", &NrsCtl::Start)
            .expect("start tbf");
    }

    pub fn rule(&self, command: &str) {
        self.service.write_rule("tbf", command).expect(command);
    }

    /// Initialize and queue a regular request from `nid`.
    pub fn submit(&self, nid: &str) -> Arc<NrsRequest> {
        self.submit_identity(RequestIdentity::from_nid(nid.parse().unwrap()), false)
    }

    pub fn submit_identity(&self, identity: RequestIdentity, hp: bool) -> Arc<NrsRequest> {
        let nrq = self.part().initialize(Request::new(identity)).unwrap();
        self.part().add(&nrq, hp).unwrap();
        nrq
    }

    /// Dispatch and finish one request.
    pub fn serve(&self) -> Option<Arc<NrsRequest>> {
        let nrq = self.part().next_request()?;
        self.part().finish(&nrq);
        Some(nrq)
    }

    /// Serve until nothing is dispatchable right now.
    pub fn serve_all(&self) -> Vec<Arc<NrsRequest>> {
        std::iter::from_fn(|| self.serve()).collect()
    }

    /// Move time forward and fire the timers that came due.
    pub fn advance(&self, by: Duration) -> usize {
        self.clock.advance(by);
        self.timers.fire_due(self.clock.now_ns())
    }

    pub fn info(&self, queue: QueueType, policy: &str) -> PolicyInfo {
        match self
            .part()
            .policy_control(queue.into(), policy, &NrsCtl::GetInfo)
            .unwrap()
            .remove(0)
            .output
        {
            CtlOutput::Info(info) => info,
            other => panic!("unexpected output {other:?}"),
        }
    }

    pub fn rules(&self, queue: QueueType) -> Vec<RuleInfo> {
        match self
            .part()
            .policy_control(queue.into(), "tbf", &NrsCtl::ReadRules)
            .unwrap()
            .remove(0)
            .output
        {
            CtlOutput::Rules(rules) => rules,
            other => panic!("unexpected output {other:?}"),
        }
    }
}

pub const MS: u64 = 1_000_000;
