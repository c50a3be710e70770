//! Service partitions: the request lifecycle around the NRS heads.
//!
//! A [`Service`] owns one [`ServicePartition`] per CPU partition. Each partition has a regular
//! head and, when configured, a high-priority head, plus the request lock every scheduling
//! operation on the partition is serialized by and the wait queue its workers sleep on.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::NrsConfig;
use crate::error::{NrsError, Result};
use crate::head::NrsHead;
use crate::metrics::{DispatchRecorder, HeadSnapshot, PartitionSnapshot, ServiceSnapshot};
use crate::policy::{CtlOutput, HeadInfo, NrsCtl, PolicyEnv};
use crate::queue::{HeadTable, QueueSelector, QueueType};
use crate::registry::PolicyRegistry;
use crate::request::{NrsRequest, Request};
use crate::scheduler::tbf::TbfCommand;

/// Wake-up point for the workers of one partition.
///
/// Every notification bumps an epoch, so a worker that read the epoch before checking for
/// work cannot miss a wake-up that races with its check.
#[derive(Debug, Default)]
pub struct WaitQueue {
    epoch: Mutex<u64>,
    cond: Condvar,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    pub fn notify_one(&self) {
        *self.epoch.lock() += 1;
        self.cond.notify_one();
    }

    pub fn notify_all(&self) {
        *self.epoch.lock() += 1;
        self.cond.notify_all();
    }

    /// Block until the epoch moves past `seen` or `timeout` elapses.
    ///
    /// Returns whether a notification arrived.
    pub fn wait_since(&self, seen: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut epoch = self.epoch.lock();
        while *epoch == seen {
            if self.cond.wait_until(&mut epoch, deadline).timed_out() {
                return *epoch != seen;
            }
        }
        true
    }
}

/// Result of a control operation on one head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadOutput {
    pub partition: usize,
    pub queue: QueueType,
    pub output: CtlOutput,
}

/// One scheduling partition of a service.
pub struct ServicePartition {
    id: usize,
    heads: HeadTable<Option<Arc<NrsHead>>>,
    /// Serializes enqueue, dispatch, promotion and control on this partition.
    req_lock: Mutex<()>,
    waitq: Arc<WaitQueue>,
    recorder: Arc<DispatchRecorder>,
}

impl ServicePartition {
    fn new(
        service: &str,
        id: usize,
        high_priority: bool,
        env: &PolicyEnv,
        recorder: Arc<DispatchRecorder>,
    ) -> Self {
        let waitq = Arc::new(WaitQueue::new());
        let heads = HeadTable::from_fn(|queue| {
            if queue.is_hp() && !high_priority {
                return None;
            }
            let info = HeadInfo {
                service: service.to_owned(),
                partition: id,
                queue,
            };
            Some(Arc::new(NrsHead::new(info, env.clone(), Arc::clone(&waitq))))
        });
        Self {
            id,
            heads,
            req_lock: Mutex::new(()),
            waitq,
            recorder,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// The head serving `queue`, if the partition has one.
    pub fn head(&self, queue: QueueType) -> Option<&Arc<NrsHead>> {
        self.heads[queue].as_ref()
    }

    pub fn has_hp(&self) -> bool {
        self.head(QueueType::HighPriority).is_some()
    }

    fn require(&self, queue: QueueType) -> Result<&Arc<NrsHead>> {
        self.head(queue)
            .ok_or_else(|| NrsError::NoDevice(format!("partition {} has no {queue} head", self.id)))
    }

    fn heads(&self) -> impl Iterator<Item = &Arc<NrsHead>> {
        self.heads.iter().filter_map(|(_, head)| head.as_ref())
    }

    fn attach(&self, registry: &PolicyRegistry) -> Result<()> {
        for head in self.heads() {
            registry.attach_head(head)?;
        }
        Ok(())
    }

    fn teardown(&self, registry: &PolicyRegistry) {
        for head in self.heads() {
            head.set_stopping();
            registry.detach_head(head);
            for name in head.policy_names().iter().rev() {
                if let Err(err) = head.unregister_policy(name) {
                    warn!(head = %head.info(), policy = %name, %err, "failed to unregister policy on shutdown");
                }
            }
        }
    }

    // ===== Request lifecycle =====

    /// Wrap an incoming request and give it resources on the regular head.
    pub fn initialize(&self, request: Request) -> Result<Arc<NrsRequest>> {
        let head = self.require(QueueType::Regular)?;
        let nrq = Arc::new(NrsRequest::new(request));
        let set = head.acquire_resources(&nrq, false);
        let mut st = nrq.state();
        st.resources = set;
        st.queue = QueueType::Regular;
        st.initialized = true;
        drop(st);
        Ok(nrq)
    }

    /// Queue an initialized request, on the high-priority head if `hp` is set.
    pub fn add(&self, nrq: &Arc<NrsRequest>, hp: bool) -> Result<()> {
        let queue = if hp {
            QueueType::HighPriority
        } else {
            QueueType::Regular
        };
        let head = self.require(queue)?;

        let _guard = self.req_lock.lock();
        let held = {
            let st = nrq.state();
            if !st.initialized || st.enqueued || st.started || st.finalized {
                return Err(NrsError::InvalidArgument(format!(
                    "request {} cannot be queued (enqueued {}, started {}, finalized {})",
                    nrq.xid(),
                    st.enqueued,
                    st.started,
                    st.finalized
                )));
            }
            st.queue
        };
        if held != queue {
            self.swap_resources(nrq, held, head)?;
        }
        if let Err(err) = head.enqueue(nrq) {
            if held != queue {
                let home = self.require(held)?;
                self.swap_resources(nrq, queue, home)?;
            }
            return Err(err);
        }
        drop(_guard);

        self.waitq.notify_one();
        Ok(())
    }

    /// Re-home the resources of `nrq` from the `from` head onto `to`.
    fn swap_resources(&self, nrq: &NrsRequest, from: QueueType, to: &NrsHead) -> Result<()> {
        let fresh = to.acquire_resources(nrq, true);
        let old = {
            let mut st = nrq.state();
            st.queue = to.info().queue;
            st.owner = None;
            std::mem::replace(&mut st.resources, fresh)
        };
        self.require(from)?.release_resources(old);
        Ok(())
    }

    /// Dispatch the next request of one head. The request comes back started.
    pub fn take_request(&self, hp: bool) -> Option<Arc<NrsRequest>> {
        let queue = if hp {
            QueueType::HighPriority
        } else {
            QueueType::Regular
        };
        let head = self.head(queue)?;
        let nrq = {
            let _guard = self.req_lock.lock();
            head.take()?
        };
        self.recorder
            .record(queue, nrq.request().arrived.elapsed());
        Some(nrq)
    }

    /// Next request for a worker, high-priority work first.
    pub fn next_request(&self) -> Option<Arc<NrsRequest>> {
        self.take_request(true).or_else(|| self.take_request(false))
    }

    /// The worker is done with `nrq`: stop it and give back its resources.
    pub fn finish(&self, nrq: &Arc<NrsRequest>) {
        let Some(head) = self.head(nrq.queue()) else {
            return;
        };
        let _guard = self.req_lock.lock();
        head.stop_request(nrq);
        head.dequeue(nrq);
        let set = {
            let mut st = nrq.state();
            if st.finalized {
                return;
            }
            st.finalized = true;
            st.owner = None;
            std::mem::take(&mut st.resources)
        };
        head.release_resources(set);
    }

    /// Promote a queued regular request to the high-priority head.
    ///
    /// Requests already dispatched or already promoted are left alone.
    pub fn hp_move(&self, nrq: &Arc<NrsRequest>) -> Result<()> {
        let hp = self.require(QueueType::HighPriority)?;
        let reg = self.require(QueueType::Regular)?;

        let _guard = self.req_lock.lock();
        {
            let st = nrq.state();
            if st.queue == QueueType::HighPriority || !st.enqueued {
                return Ok(());
            }
        }

        reg.dequeue(nrq);
        self.swap_resources(nrq, QueueType::Regular, hp)?;
        if let Err(err) = hp.enqueue(nrq) {
            warn!(partition = self.id, xid = nrq.xid(), %err, "promotion failed, requeueing on regular head");
            self.swap_resources(nrq, QueueType::HighPriority, reg)?;
            reg.enqueue(nrq)?;
            return Err(err);
        }
        drop(_guard);

        debug!(partition = self.id, xid = nrq.xid(), "request moved to high-priority head");
        self.waitq.notify_one();
        Ok(())
    }

    /// Whether the selected head has queued requests.
    pub fn pending(&self, hp: bool) -> bool {
        let queue = if hp {
            QueueType::HighPriority
        } else {
            QueueType::Regular
        };
        self.head(queue).is_some_and(|h| h.queued() > 0)
    }

    /// Epoch to pass to [`ServicePartition::wait_for_work`].
    pub fn work_epoch(&self) -> u64 {
        self.waitq.epoch()
    }

    /// Sleep until an enqueue or a rate-limit timer wakes the partition.
    pub fn wait_for_work(&self, epoch: u64, timeout: Duration) -> bool {
        self.waitq.wait_since(epoch, timeout)
    }

    // ===== Control =====

    fn resolve(&self, selector: QueueSelector) -> Result<&'static [QueueType]> {
        match selector {
            QueueSelector::Both if !self.has_hp() => Ok(QueueSelector::Regular.queues()),
            QueueSelector::HighPriority if !self.has_hp() => Err(NrsError::NoDevice(format!(
                "partition {} has no high-priority head",
                self.id
            ))),
            other => Ok(other.queues()),
        }
    }

    /// Run `ctl` against the named policy on the selected heads, regular first.
    pub fn policy_control(
        &self,
        selector: QueueSelector,
        name: &str,
        ctl: &NrsCtl,
    ) -> Result<Vec<HeadOutput>> {
        let queues = self.resolve(selector)?;
        let _guard = self.req_lock.lock();
        let mut outputs = Vec::with_capacity(queues.len());
        for &queue in queues {
            let head = self.require(queue)?;
            let output = head.policy_control(name, ctl)?;
            outputs.push(HeadOutput {
                partition: self.id,
                queue,
                output,
            });
        }
        Ok(outputs)
    }

    pub fn snapshot(&self) -> PartitionSnapshot {
        PartitionSnapshot {
            partition: self.id,
            heads: self.heads().map(|h| HeadSnapshot::capture(h.as_ref())).collect(),
        }
    }
}

/// A partitioned RPC service and its schedulers.
pub struct Service {
    name: String,
    config: NrsConfig,
    registry: Arc<PolicyRegistry>,
    partitions: Vec<ServicePartition>,
    recorder: Arc<DispatchRecorder>,
}

impl Service {
    /// Build every partition's heads and instantiate the registered policies on them.
    ///
    /// The TBF settings of `config` replace those carried by `env`.
    pub fn new(config: &NrsConfig, registry: Arc<PolicyRegistry>, env: PolicyEnv) -> Result<Self> {
        let env = PolicyEnv {
            tbf: config.tbf.clone(),
            ..env
        };
        let name = config.service.name.clone();
        let recorder = Arc::new(DispatchRecorder::new());
        let mut partitions: Vec<ServicePartition> =
            Vec::with_capacity(config.service.partitions);

        for id in 0..config.service.partitions {
            let partition = ServicePartition::new(
                &name,
                id,
                config.service.high_priority,
                &env,
                Arc::clone(&recorder),
            );
            if let Err(err) = partition.attach(&registry) {
                error!(service = %name, partition = id, %err, "failed to set up partition");
                partition.teardown(&registry);
                for done in partitions.iter().rev() {
                    done.teardown(&registry);
                }
                return Err(err);
            }
            partitions.push(partition);
        }

        info!(
            service = %name,
            partitions = partitions.len(),
            high_priority = config.service.high_priority,
            "service ready"
        );
        Ok(Self {
            name,
            config: config.clone(),
            registry,
            partitions,
            recorder,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &NrsConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    pub fn partitions(&self) -> &[ServicePartition] {
        &self.partitions
    }

    pub fn partition(&self, id: usize) -> Option<&ServicePartition> {
        self.partitions.get(id)
    }

    /// Run `ctl` on every partition. Stops at the first failing head.
    pub fn policy_control(
        &self,
        selector: QueueSelector,
        name: &str,
        ctl: &NrsCtl,
    ) -> Result<Vec<HeadOutput>> {
        let mut outputs = Vec::new();
        for partition in &self.partitions {
            outputs.extend(partition.policy_control(selector, name, ctl)?);
        }
        Ok(outputs)
    }

    /// Text dump of the rules of `policy`, grouped by queue then partition.
    ///
    /// Heads where the policy is not running are skipped.
    pub fn dump_rules(&self, policy: &str) -> Result<String> {
        let mut out = String::new();
        for queue in QueueType::ALL {
            let mut section = String::new();
            for partition in &self.partitions {
                if partition.head(queue).is_none() {
                    continue;
                }
                let outputs =
                    match partition.policy_control(queue.into(), policy, &NrsCtl::ReadRules) {
                        Ok(outputs) => outputs,
                        Err(NrsError::NoDevice(_)) => continue,
                        Err(err) => return Err(err),
                    };
                for HeadOutput { output, .. } in outputs {
                    if let CtlOutput::Rules(rules) = output {
                        let _ = writeln!(section, "CPT {}:", partition.id());
                        for rule in rules {
                            let _ = writeln!(section, "{rule}");
                        }
                    }
                }
            }
            if !section.is_empty() {
                let _ = writeln!(out, "{queue}:");
                out.push_str(&section);
            }
        }
        Ok(out)
    }

    /// Parse and apply a TBF rule command on every partition.
    pub fn write_rule(&self, policy: &str, text: &str) -> Result<()> {
        let command = TbfCommand::parse_with_ceiling(text, self.config.tbf.rate_ceiling)?;
        self.policy_control(command.queue, policy, &NrsCtl::WriteRule(command.rule))?;
        Ok(())
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        ServiceSnapshot {
            service: self.name.clone(),
            partitions: self.partitions.iter().map(ServicePartition::snapshot).collect(),
            dispatch: self.recorder.snapshot(),
        }
    }

    /// Stop every head and release its policies. Queued requests should be drained first.
    pub fn shutdown(&self) {
        for partition in &self.partitions {
            partition.teardown(&self.registry);
            partition.waitq.notify_all();
        }
        info!(service = %self.name, "service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::request::RequestIdentity;
    use crate::timer::ManualTimerFactory;

    fn service(high_priority: bool) -> Service {
        let mut config = NrsConfig::default();
        config.service.partitions = 2;
        config.service.high_priority = high_priority;
        let env = PolicyEnv::new(
            Arc::new(ManualClock::new(0)),
            Arc::new(ManualTimerFactory::new()),
            config.tbf.clone(),
        );
        Service::new(&config, Arc::new(PolicyRegistry::new()), env).unwrap()
    }

    fn request(nid: &str) -> Request {
        Request::new(RequestIdentity::from_nid(nid.parse().unwrap()))
    }

    #[test]
    fn wait_queue_reports_notifications() {
        let waitq = WaitQueue::new();
        let seen = waitq.epoch();
        assert!(!waitq.wait_since(seen, Duration::from_millis(1)));
        waitq.notify_one();
        assert!(waitq.wait_since(seen, Duration::from_millis(1)));
    }

    #[test]
    fn partitions_get_both_heads() {
        let svc = service(true);
        assert_eq!(svc.partitions().len(), 2);
        assert!(svc.partitions().iter().all(ServicePartition::has_hp));
        assert_eq!(svc.registry().head_count(), 4);

        let svc = service(false);
        assert!(!svc.partitions()[0].has_hp());
    }

    #[test]
    fn request_lifecycle_on_regular_head() {
        let svc = service(false);
        let part = &svc.partitions()[0];
        let nrq = part.initialize(request("10.0.0.1@tcp")).unwrap();
        assert!(nrq.is_initialized());
        part.add(&nrq, false).unwrap();
        assert!(part.pending(false));

        let taken = part.next_request().unwrap();
        assert!(Arc::ptr_eq(&taken, &nrq));
        assert!(taken.is_started());
        assert!(!part.pending(false));

        part.finish(&taken);
        assert!(taken.is_finalized());
        assert!(!taken.is_started());
        let head = part.head(QueueType::Regular).unwrap();
        assert_eq!(head.queued(), 0);
        assert_eq!(head.started(), 0);
    }

    #[test]
    fn high_priority_add_and_dispatch_first() {
        let svc = service(true);
        let part = &svc.partitions()[1];
        let reg = part.initialize(request("10.0.0.1@tcp")).unwrap();
        let hp = part.initialize(request("10.0.0.2@tcp")).unwrap();
        part.add(&reg, false).unwrap();
        part.add(&hp, true).unwrap();
        assert_eq!(hp.queue(), QueueType::HighPriority);

        let first = part.next_request().unwrap();
        assert!(Arc::ptr_eq(&first, &hp));
        part.finish(&first);
        let second = part.next_request().unwrap();
        assert!(Arc::ptr_eq(&second, &reg));
        part.finish(&second);
    }

    #[test]
    fn queued_request_cannot_be_added_again() {
        let svc = service(true);
        let part = &svc.partitions()[0];
        let nrq = part.initialize(request("10.0.0.1@tcp")).unwrap();
        part.add(&nrq, false).unwrap();

        assert_eq!(part.add(&nrq, true).unwrap_err().errno(), -libc::EINVAL);
        assert_eq!(part.add(&nrq, false).unwrap_err().errno(), -libc::EINVAL);
        assert_eq!(nrq.queue(), QueueType::Regular);
        assert!(!part.pending(true));

        let reg = part.head(QueueType::Regular).unwrap();
        assert_eq!(reg.queued(), 1);
        let taken = part.next_request().unwrap();
        assert!(Arc::ptr_eq(&taken, &nrq));
        part.finish(&taken);
        assert!(part.next_request().is_none());
        assert_eq!(reg.queued(), 0);
        assert_eq!(reg.started(), 0);
    }

    #[test]
    fn dispatched_request_cannot_be_requeued() {
        let svc = service(true);
        let part = &svc.partitions()[0];
        let nrq = part.initialize(request("10.0.0.1@tcp")).unwrap();
        part.add(&nrq, true).unwrap();
        let taken = part.take_request(true).unwrap();

        assert_eq!(part.add(&taken, false).unwrap_err().errno(), -libc::EINVAL);
        assert_eq!(part.add(&taken, true).unwrap_err().errno(), -libc::EINVAL);
        assert_eq!(taken.queue(), QueueType::HighPriority);
        assert!(!part.pending(false));
        assert!(!part.pending(true));

        part.finish(&taken);
        assert!(taken.is_finalized());
        assert_eq!(part.add(&taken, false).unwrap_err().errno(), -libc::EINVAL);
        let hp = part.head(QueueType::HighPriority).unwrap();
        assert_eq!(hp.started(), 0);
        assert_eq!(part.head(QueueType::Regular).unwrap().queued(), 0);
    }

    #[test]
    fn hp_move_promotes_queued_requests_only() {
        let svc = service(true);
        let part = &svc.partitions()[0];
        let nrq = part.initialize(request("10.0.0.1@tcp")).unwrap();
        part.add(&nrq, false).unwrap();

        part.hp_move(&nrq).unwrap();
        assert_eq!(nrq.queue(), QueueType::HighPriority);
        assert!(!part.pending(false));
        assert!(part.pending(true));

        // already promoted
        part.hp_move(&nrq).unwrap();
        let taken = part.take_request(true).unwrap();
        // already dispatched
        part.hp_move(&taken).unwrap();
        part.finish(&taken);

        let svc = service(false);
        let part = &svc.partitions()[0];
        let nrq = part.initialize(request("10.0.0.1@tcp")).unwrap();
        assert_eq!(part.hp_move(&nrq).unwrap_err().errno(), -libc::ENODEV);
    }

    #[test]
    fn control_selects_heads() {
        let svc = service(true);
        let outputs = svc
            .policy_control(QueueSelector::Both, "tbf", &NrsCtl::Start)
            .unwrap();
        assert_eq!(outputs.len(), 4);
        assert_eq!(outputs[0].queue, QueueType::Regular);
        assert_eq!(outputs[1].queue, QueueType::HighPriority);

        let svc = service(false);
        let outputs = svc
            .policy_control(QueueSelector::Both, "tbf", &NrsCtl::GetInfo)
            .unwrap();
        assert_eq!(outputs.len(), 2);
        let err = svc
            .policy_control(QueueSelector::HighPriority, "tbf", &NrsCtl::GetInfo)
            .unwrap_err();
        assert_eq!(err.errno(), -libc::ENODEV);
    }

    #[test]
    fn rule_writes_and_dumps() {
        let svc = service(true);
        assert_eq!(svc.dump_rules("tbf").unwrap(), "");

        svc.policy_control(QueueSelector::Regular, "tbf", &NrsCtl::Start)
            .unwrap();
        svc.write_rule("tbf", "reg start lan {192.168.1.*@tcp} 100")
            .unwrap();
        let dump = svc.dump_rules("tbf").unwrap();
        assert!(dump.starts_with("regular_requests:\nCPT 0:\n"));
        assert!(dump.contains("lan {192.168.1.*@tcp} 100, ref 0, active"));
        assert!(dump.contains("CPT 1:"));
        assert!(!dump.contains("high_priority_requests"));

        let err = svc.write_rule("tbf", "hp start lan {*} 100").unwrap_err();
        assert_eq!(err.errno(), -libc::ENODEV);
        let err = svc.write_rule("tbf", "reg start bad {*} 70000").unwrap_err();
        assert_eq!(err.errno(), -libc::EINVAL);
    }

    #[test]
    fn snapshot_counts_queued_requests() {
        let svc = service(true);
        let part = &svc.partitions()[0];
        for i in 1..=3 {
            let nrq = part.initialize(request(&format!("10.0.0.{i}@tcp"))).unwrap();
            part.add(&nrq, false).unwrap();
        }
        let snapshot = svc.snapshot();
        assert_eq!(snapshot.queued(), 3);
        assert_eq!(snapshot.partitions[0].heads.len(), 2);
        assert_eq!(snapshot.partitions[0].heads[0].primary, None);
        let json = snapshot.to_json().unwrap();
        assert!(json.contains("\"service\":\"ost_io\""));
    }

    #[test]
    fn shutdown_releases_every_policy() {
        let svc = service(true);
        svc.policy_control(QueueSelector::Both, "tbf", &NrsCtl::Start)
            .unwrap();
        svc.shutdown();
        assert_eq!(svc.registry().head_count(), 0);
        for partition in svc.partitions() {
            for (_, head) in partition.heads.iter() {
                let head = head.as_ref().unwrap();
                assert!(head.is_stopping());
                assert!(head.policy_names().is_empty());
            }
        }
    }
}
