mod common;

use std::sync::Arc;

use common::Harness;
use rpc_nrs::config::NrsConfig;
use rpc_nrs::policy::{
    NrsCtl, Policy, PolicyCompat, PolicyDescriptor, PolicyFlags, PolicyState,
};
use rpc_nrs::queue::{QueueSelector, QueueType};
use rpc_nrs::registry::PolicyRegistry;
use rpc_nrs::request::RequestIdentity;
use rpc_nrs::scheduler::FifoPolicy;

#[test]
fn fifo_serves_in_arrival_order() {
    let h = Harness::new();
    let submitted: Vec<u64> = (1..=5)
        .map(|i| h.submit(&format!("10.0.0.{i}@tcp")).xid())
        .collect();
    let served: Vec<u64> = h.serve_all().iter().map(|r| r.xid()).collect();
    assert_eq!(served, submitted);
}

#[test]
fn counts_return_to_zero_after_service() {
    let h = Harness::new();
    h.start_tbf(QueueSelector::Regular);
    for i in 0..4 {
        h.submit(&format!("10.0.1.{i}@tcp"));
    }
    let held = h.part().next_request().unwrap();
    let head = h.part().head(QueueType::Regular).unwrap();
    assert_eq!(head.queued(), 3);
    assert_eq!(head.started(), 1);

    h.part().finish(&held);
    h.serve_all();
    let snapshot = h.service.snapshot();
    assert_eq!(snapshot.queued(), 0);
    for head in &snapshot.partitions[0].heads {
        assert_eq!(head.started, 0);
        assert!(head.policies.iter().all(|p| p.queued == 0 && p.started == 0));
    }
    assert_eq!(snapshot.dispatch[0].dispatched, 4);
}

#[test]
fn stopping_tbf_leaves_it_empty() {
    let h = Harness::new();
    h.start_tbf(QueueSelector::Regular);
    h.rule("reg start slow {10.0.0.1@tcp} 1");
    for _ in 0..6 {
        h.submit("10.0.0.1@tcp");
    }
    // burst of three, then throttled
    assert_eq!(h.serve_all().len(), 3);
    assert_eq!(h.info(QueueType::Regular, "tbf").queued, 3);

    h.service
        .policy_control(QueueSelector::Regular, "tbf", &NrsCtl::Stop)
        .unwrap();
    let tbf = h.info(QueueType::Regular, "tbf");
    assert_eq!(tbf.state, PolicyState::Stopped);
    assert_eq!((tbf.queued, tbf.started), (0, 0));
    assert_eq!(h.info(QueueType::Regular, "fifo").queued, 3);

    assert_eq!(h.serve_all().len(), 3);
    assert_eq!(h.part().head(QueueType::Regular).unwrap().queued(), 0);
}

#[test]
fn high_priority_requests_jump_the_queue() {
    let h = Harness::new();
    let regular = h.submit("10.0.0.1@tcp");
    let urgent = h.submit_identity(RequestIdentity::from_nid("10.0.0.2@tcp".parse().unwrap()), true);
    let moved = h.submit("10.0.0.3@tcp");
    h.part().hp_move(&moved).unwrap();

    let order: Vec<u64> = h.serve_all().iter().map(|r| r.xid()).collect();
    assert_eq!(order, vec![urgent.xid(), moved.xid(), regular.xid()]);
    assert!(moved.is_finalized());
}

#[test]
fn external_policy_on_a_running_service() {
    let registry = Arc::new(PolicyRegistry::new());
    let mut config = NrsConfig::default();
    config.service.partitions = 1;
    config.service.high_priority = false;
    let h = Harness::with_registry(config, Arc::clone(&registry));

    registry
        .register(PolicyDescriptor::new(
            "fifo2",
            PolicyFlags::NONE,
            PolicyCompat::Service("ost_io".into()),
            |_ctx| Arc::new(FifoPolicy::new("fifo2")) as Arc<dyn Policy>,
        ))
        .unwrap();
    assert_eq!(h.info(QueueType::Regular, "fifo2").state, PolicyState::Stopped);

    h.service
        .policy_control(QueueSelector::Regular, "fifo2", &NrsCtl::Start)
        .unwrap();
    let nrq = h.submit("10.0.0.1@tcp");
    assert_eq!(h.info(QueueType::Regular, "fifo2").queued, 1);
    assert_eq!(registry.unregister("fifo2").unwrap_err().errno(), -libc::EBUSY);

    let served = h.serve().unwrap();
    assert!(Arc::ptr_eq(&served, &nrq));
    registry.unregister("fifo2").unwrap();
    assert_eq!(
        h.part().head(QueueType::Regular).unwrap().policy_names(),
        vec!["fifo", "tbf"]
    );
}

#[test]
fn policies_of_other_services_are_not_instantiated() {
    let registry = Arc::new(PolicyRegistry::new());
    registry
        .register(PolicyDescriptor::new(
            "mdtonly",
            PolicyFlags::NONE,
            PolicyCompat::Service("mdt".into()),
            |_ctx| Arc::new(FifoPolicy::new("mdtonly")) as Arc<dyn Policy>,
        ))
        .unwrap();
    let h = Harness::with_registry(NrsConfig::default(), registry);
    let err = h
        .service
        .policy_control(QueueSelector::Both, "mdtonly", &NrsCtl::GetInfo)
        .unwrap_err();
    assert_eq!(err.errno(), -libc::ENODEV);
}

#[test]
fn shutdown_detaches_heads() {
    let registry = Arc::new(PolicyRegistry::new());
    let h = Harness::with_registry(NrsConfig::default(), Arc::clone(&registry));
    assert_eq!(registry.head_count(), 4);
    h.start_tbf(QueueSelector::Both);
    h.service.shutdown();
    assert_eq!(registry.head_count(), 0);
    let snapshot = h.service.snapshot();
    assert!(snapshot.partitions[0]
        .heads
        .iter()
        .all(|head| head.stopping && head.policies.is_empty()));
}
