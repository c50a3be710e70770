//! Introspection snapshots and dispatch wait statistics.
//!
//! Snapshots are plain serde structs captured from the heads on demand. Wait times are recorded
//! on the dispatch hot path through a bounded channel and only aggregated when a snapshot is
//! taken, so workers never contend on the statistics lock.

use std::collections::VecDeque;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::head::NrsHead;
use crate::policy::PolicyInfo;
use crate::queue::{HeadTable, QueueType};

/// Pending wait events kept before new ones are dropped.
const EVENT_CAPACITY: usize = 10_000;
/// Samples kept per queue for percentile computation.
const SAMPLE_WINDOW: usize = 4_096;

/// State of one NRS head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadSnapshot {
    pub queue: QueueType,
    pub queued: u64,
    pub started: u64,
    pub throttled: bool,
    pub stopping: bool,
    pub fallback: Option<String>,
    pub primary: Option<String>,
    pub policies: Vec<PolicyInfo>,
}

impl HeadSnapshot {
    pub fn capture(head: &NrsHead) -> Self {
        Self {
            queue: head.info().queue,
            queued: head.queued(),
            started: head.started(),
            throttled: head.throttle().is_throttled(),
            stopping: head.is_stopping(),
            fallback: head.fallback_name(),
            primary: head.primary_name(),
            policies: head.policy_infos(),
        }
    }
}

/// Heads of one service partition, regular first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSnapshot {
    pub partition: usize,
    pub heads: Vec<HeadSnapshot>,
}

impl PartitionSnapshot {
    pub fn queued(&self) -> u64 {
        self.heads.iter().map(|h| h.queued).sum()
    }
}

/// Whole-service view emitted by the binary and used by tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub service: String,
    pub partitions: Vec<PartitionSnapshot>,
    pub dispatch: Vec<WaitSnapshot>,
}

impl ServiceSnapshot {
    pub fn queued(&self) -> u64 {
        self.partitions.iter().map(PartitionSnapshot::queued).sum()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Time requests of one queue spent waiting for a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitSnapshot {
    pub queue: QueueType,
    pub dispatched: u64,
    #[serde(with = "duration_micros")]
    pub avg_wait: Duration,
    #[serde(with = "duration_micros_option")]
    pub p50: Option<Duration>,
    #[serde(with = "duration_micros_option")]
    pub p99: Option<Duration>,
    #[serde(with = "duration_micros_option")]
    pub max: Option<Duration>,
}

#[derive(Debug, Default)]
struct WaitStats {
    dispatched: u64,
    total: Duration,
    samples: VecDeque<Duration>,
}

impl WaitStats {
    fn record(&mut self, wait: Duration) {
        self.dispatched += 1;
        self.total += wait;
        if self.samples.len() == SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(wait);
    }

    fn snapshot(&self, queue: QueueType) -> WaitSnapshot {
        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let percentile = |p: f64| -> Option<Duration> {
            if sorted.is_empty() {
                return None;
            }
            let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
            sorted.get(idx).copied()
        };
        let avg_wait = if self.dispatched == 0 {
            Duration::ZERO
        } else {
            self.total / self.dispatched as u32
        };
        WaitSnapshot {
            queue,
            dispatched: self.dispatched,
            avg_wait,
            p50: percentile(0.50),
            p99: percentile(0.99),
            max: sorted.last().copied(),
        }
    }
}

struct WaitEvent {
    queue: QueueType,
    wait: Duration,
}

/// Records how long dispatched requests waited in their queue.
///
/// `record` never blocks: events go through a bounded channel and are dropped when it is full.
pub struct DispatchRecorder {
    events_tx: Sender<WaitEvent>,
    events_rx: Receiver<WaitEvent>,
    stats: Mutex<HeadTable<WaitStats>>,
}

impl DispatchRecorder {
    pub fn new() -> Self {
        let (events_tx, events_rx) = bounded(EVENT_CAPACITY);
        Self {
            events_tx,
            events_rx,
            stats: Mutex::new(HeadTable::from_fn(|_| WaitStats::default())),
        }
    }

    pub fn record(&self, queue: QueueType, wait: Duration) {
        let _ = self.events_tx.try_send(WaitEvent { queue, wait });
    }

    /// Fold pending events into the statistics and report both queues.
    pub fn snapshot(&self) -> Vec<WaitSnapshot> {
        let mut stats = self.stats.lock();
        for event in self.events_rx.try_iter() {
            stats[event.queue].record(event.wait);
        }
        stats.iter().map(|(queue, s)| s.snapshot(queue)).collect()
    }
}

impl Default for DispatchRecorder {
    fn default() -> Self {
        Self::new()
    }
}

mod duration_micros {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64() * 1_000_000.0)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let micros = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(micros / 1_000_000.0))
    }
}

mod duration_micros_option {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_secs_f64() * 1_000_000.0)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<f64> = Option::deserialize(deserializer)?;
        Ok(opt.map(|micros| Duration::from_secs_f64(micros / 1_000_000.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorder_aggregates_per_queue() {
        let recorder = DispatchRecorder::new();
        for ms in [10, 20, 30] {
            recorder.record(QueueType::Regular, Duration::from_millis(ms));
        }
        recorder.record(QueueType::HighPriority, Duration::from_millis(1));

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.len(), 2);
        let reg = &snapshot[0];
        assert_eq!(reg.queue, QueueType::Regular);
        assert_eq!(reg.dispatched, 3);
        assert_eq!(reg.avg_wait, Duration::from_millis(20));
        assert_eq!(reg.p50, Some(Duration::from_millis(20)));
        assert_eq!(reg.max, Some(Duration::from_millis(30)));
        assert_eq!(snapshot[1].dispatched, 1);

        // events are consumed once
        assert_eq!(recorder.snapshot()[0].dispatched, 3);
    }

    #[test]
    fn empty_queue_has_no_percentiles() {
        let snapshot = DispatchRecorder::new().snapshot();
        assert_eq!(snapshot[1].p99, None);
        assert_eq!(snapshot[1].avg_wait, Duration::ZERO);
    }

    #[test]
    fn wait_snapshot_serializes_micros() {
        let recorder = DispatchRecorder::new();
        recorder.record(QueueType::Regular, Duration::from_micros(1500));
        let json = serde_json::to_value(&recorder.snapshot()[0]).unwrap();
        assert_eq!(json["queue"], "regular");
        assert_eq!(json["avg_wait"].as_f64().unwrap().round(), 1500.0);
        assert_eq!(json["max"].as_f64().unwrap().round(), 1500.0);
    }

    #[test]
    fn sample_window_is_bounded() {
        let mut stats = WaitStats::default();
        for i in 0..(SAMPLE_WINDOW as u64 + 10) {
            stats.record(Duration::from_nanos(i));
        }
        assert_eq!(stats.samples.len(), SAMPLE_WINDOW);
        assert_eq!(stats.dispatched, SAMPLE_WINDOW as u64 + 10);
    }
}
