mod common;

use std::time::Duration;

use common::{Harness, MS};
use rpc_nrs::config::{NrsConfig, TbfClassifier};
use rpc_nrs::queue::{QueueSelector, QueueType};
use rpc_nrs::request::RequestIdentity;
use rpc_nrs::scheduler::tbf::DEFAULT_RULE;

#[test]
fn burst_then_one_request_per_interval() {
    let h = Harness::new();
    h.start_tbf(QueueSelector::Regular);
    h.rule("reg change default 10");
    for _ in 0..5 {
        h.submit("10.0.0.1@tcp");
    }

    assert_eq!(h.serve_all().len(), 3);
    assert_eq!(h.timers.armed(), vec![("tbf-0-0".to_string(), 100 * MS)]);
    assert!(h.part().head(QueueType::Regular).unwrap().throttle().is_throttled());

    // not yet due
    assert_eq!(h.advance(Duration::from_millis(99)), 0);
    assert!(h.serve().is_none());

    assert_eq!(h.advance(Duration::from_millis(1)), 1);
    assert_eq!(h.serve_all().len(), 1);
    assert_eq!(h.timers.armed(), vec![("tbf-0-0".to_string(), 200 * MS)]);

    assert_eq!(h.advance(Duration::from_millis(100)), 1);
    assert_eq!(h.serve_all().len(), 1);
    assert_eq!(h.part().head(QueueType::Regular).unwrap().queued(), 0);
}

#[test]
fn timer_expiry_wakes_the_partition() {
    let h = Harness::new();
    h.start_tbf(QueueSelector::Regular);
    h.rule("reg change default 10");
    for _ in 0..4 {
        h.submit("10.0.0.1@tcp");
    }
    h.serve_all();

    let epoch = h.part().work_epoch();
    assert!(!h.part().wait_for_work(epoch, Duration::from_millis(1)));
    h.advance(Duration::from_millis(100));
    assert!(h.part().wait_for_work(epoch, Duration::from_millis(1)));
    assert!(h.serve().is_some());
}

#[test]
fn newest_rule_decides_the_rate() {
    let h = Harness::new();
    h.start_tbf(QueueSelector::Regular);
    h.rule("reg start a {10.0.0.1@tcp} 5");
    h.rule("reg start b {10.0.0.1@tcp} 50");
    for _ in 0..20 {
        h.submit("10.0.0.1@tcp");
    }
    assert_eq!(h.serve_all().len(), 3);

    // 50/s: one request every 20ms
    let mut served = 0;
    for _ in 0..10 {
        h.advance(Duration::from_millis(20));
        served += h.serve_all().len();
    }
    assert_eq!(served, 10);

    let rules = h.rules(QueueType::Regular);
    let b = rules.iter().find(|r| r.name == "b").unwrap();
    assert_eq!(b.refs, 1);
    let a = rules.iter().find(|r| r.name == "a").unwrap();
    assert_eq!(a.refs, 0);
}

#[test]
fn default_rule_cannot_be_stopped() {
    let h = Harness::new();
    h.start_tbf(QueueSelector::Both);
    let before = h.rules(QueueType::Regular);
    let err = h.service.write_rule("tbf", "stop default").unwrap_err();
    assert_eq!(err.errno(), -libc::EPERM);
    assert_eq!(h.rules(QueueType::Regular), before);
}

#[test]
fn malformed_commands_change_nothing() {
    let h = Harness::new();
    h.start_tbf(QueueSelector::Both);
    for bad in [
        "start lan 100",
        "start lan {} 100",
        "start lan {10.0.0.300@tcp} 100",
        "start lan {*} 0",
        "start lan {*} 65535",
        "change lan 10",
        "change default",
        "rename default 10",
        "start this_name_is_too_long {*} 10",
    ] {
        assert!(h.service.write_rule("tbf", bad).is_err(), "{bad} was accepted");
    }
    assert_eq!(h.rules(QueueType::Regular).len(), 1);
    assert_eq!(h.rules(QueueType::HighPriority).len(), 1);
}

#[test]
fn rules_round_trip_through_a_dump() {
    let h = Harness::new();
    h.start_tbf(QueueSelector::Regular);
    h.rule("reg start lan {192.168.1.[2-10,20]@tcp 192.168.2.*@tcp} 200");
    h.rule("reg start ib {*@o2ib1} 40");
    h.rule("reg start one {10.0.0.1@tcp}");
    h.rule("reg change default 500");
    let dumped = h.rules(QueueType::Regular);
    let text = h.service.dump_rules("tbf").unwrap();
    assert!(text.contains("lan {192.168.1.[2-10,20]@tcp 192.168.2.*@tcp} 200, ref 0, active"));

    let fresh = Harness::new();
    fresh.start_tbf(QueueSelector::Regular);
    for rule in dumped.iter().rev() {
        if rule.name == DEFAULT_RULE {
            fresh.rule(&format!("reg change default {}", rule.rate));
        } else {
            fresh.rule(&format!("reg {}", rule.to_command()));
        }
    }
    assert_eq!(fresh.rules(QueueType::Regular), dumped);
}

#[test]
fn queues_keep_separate_rule_sets() {
    let h = Harness::new();
    h.start_tbf(QueueSelector::Both);
    h.rule("hp start urgent {10.0.0.*@tcp} 1000");
    h.rule("reg start bulk {10.0.0.*@tcp} 10");
    let reg: Vec<String> = h.rules(QueueType::Regular).into_iter().map(|r| r.name).collect();
    let hp: Vec<String> = h.rules(QueueType::HighPriority).into_iter().map(|r| r.name).collect();
    assert_eq!(reg, vec!["bulk", "default"]);
    assert_eq!(hp, vec!["urgent", "default"]);

    let dump = h.service.dump_rules("tbf").unwrap();
    let hp_section = dump.split("high_priority_requests:").nth(1).unwrap();
    assert!(hp_section.contains("urgent"));
    assert!(!hp_section.contains("bulk"));
}

#[test]
fn job_id_classification_shares_a_bucket_across_nodes() {
    let mut config = NrsConfig::default();
    config.service.partitions = 1;
    config.tbf.classifier = TbfClassifier::JobId;
    let h = Harness::with_config(config);
    h.start_tbf(QueueSelector::Regular);
    h.rule("reg start dd {dd.*} 10");

    for node in 1..=4 {
        let nid = format!("10.0.0.{node}@tcp").parse().unwrap();
        h.submit_identity(RequestIdentity::with_job(nid, "dd.1"), false);
    }
    let other = h.submit_identity(
        RequestIdentity::with_job("10.0.0.9@tcp".parse().unwrap(), "cp.7"),
        false,
    );

    let served = h.serve_all();
    assert_eq!(served.len(), 4);
    assert!(served.iter().any(|r| r.xid() == other.xid()));
    assert_eq!(h.info(QueueType::Regular, "tbf").queued, 1);
}

#[test]
fn throttled_head_still_admits_a_fresh_client() {
    let h = Harness::new();
    h.start_tbf(QueueSelector::Regular);
    h.rule("reg start slow {10.0.0.1@tcp} 1");
    for _ in 0..4 {
        h.submit("10.0.0.1@tcp");
    }
    assert_eq!(h.serve_all().len(), 3);
    assert!(h.serve().is_none());

    let fresh = h.submit("10.0.0.2@tcp");
    let served = h.serve().unwrap();
    assert_eq!(served.xid(), fresh.xid());
    assert!(h.serve().is_none());
}
