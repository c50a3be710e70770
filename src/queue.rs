//! Queue identifiers shared by the heads, the control surface and the command parser.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Index, IndexMut};

/// The two request queues a service partition can own.
///
/// Every partition has a regular queue; the high-priority queue only exists for services that
/// handle high-priority RPCs. Each queue is served by its own [`crate::head::NrsHead`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    Regular,
    HighPriority,
}

impl QueueType {
    /// Ordered list of queue types (regular first) for iteration utilities.
    pub const ALL: [QueueType; 2] = [QueueType::Regular, QueueType::HighPriority];

    /// Stable index for per-queue arrays.
    pub const fn index(self) -> usize {
        match self {
            QueueType::Regular => 0,
            QueueType::HighPriority => 1,
        }
    }

    /// Whether this is the high-priority queue.
    pub const fn is_hp(self) -> bool {
        matches!(self, QueueType::HighPriority)
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            QueueType::Regular => "regular_requests",
            QueueType::HighPriority => "high_priority_requests",
        };
        write!(f, "{label}")
    }
}

/// Which head(s) of a partition a control operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueSelector {
    Regular,
    HighPriority,
    Both,
}

impl QueueSelector {
    /// Parse the optional leading queue token of a control command (`reg` or `hp`).
    pub fn from_token(token: &str) -> Option<QueueSelector> {
        match token {
            "reg" => Some(QueueSelector::Regular),
            "hp" => Some(QueueSelector::HighPriority),
            _ => None,
        }
    }

    /// Queue types covered by the selector, regular first.
    pub fn queues(self) -> &'static [QueueType] {
        match self {
            QueueSelector::Regular => &[QueueType::Regular],
            QueueSelector::HighPriority => &[QueueType::HighPriority],
            QueueSelector::Both => &QueueType::ALL,
        }
    }
}

impl From<QueueType> for QueueSelector {
    fn from(queue: QueueType) -> Self {
        match queue {
            QueueType::Regular => QueueSelector::Regular,
            QueueType::HighPriority => QueueSelector::HighPriority,
        }
    }
}

/// One value per [`QueueType`], indexed by queue.
///
/// Partitions keep their heads in a `HeadTable<Option<..>>` so code that walks both queues
/// never branches on the queue label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadTable<T> {
    values: Vec<T>,
}

impl<T> HeadTable<T> {
    /// Build a table by executing a closure for each queue type in [`QueueType::ALL`] order.
    pub fn from_fn(mut f: impl FnMut(QueueType) -> T) -> Self {
        let mut values = Vec::with_capacity(QueueType::ALL.len());
        for queue in QueueType::ALL {
            values.push(f(queue));
        }
        HeadTable { values }
    }

    /// Borrow the value for a given queue.
    pub fn get(&self, queue: QueueType) -> &T {
        &self.values[queue.index()]
    }

    /// Mutably borrow the value for a given queue.
    pub fn get_mut(&mut self, queue: QueueType) -> &mut T {
        &mut self.values[queue.index()]
    }

    /// Iterate `(queue, value)` pairs, regular first.
    pub fn iter(&self) -> impl Iterator<Item = (QueueType, &T)> {
        QueueType::ALL.iter().copied().zip(self.values.iter())
    }
}

impl<T> Index<QueueType> for HeadTable<T> {
    type Output = T;

    fn index(&self, index: QueueType) -> &Self::Output {
        self.get(index)
    }
}

impl<T> IndexMut<QueueType> for HeadTable<T> {
    fn index_mut(&mut self, index: QueueType) -> &mut Self::Output {
        self.get_mut(index)
    }
}
