//! Indexed binary min-heap of backlogged TBF clients.
//!
//! Entries are keyed by [`HeapKey`]; each client appears at most once and can be removed or
//! re-keyed in O(log n) through its position index.

use std::collections::HashMap;

/// Ordering key of a client: earliest usable token first, then the client that has waited
/// longest since its last accounting, then the lower client id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeapKey {
    pub next_token_ns: u64,
    pub check_time_ns: u64,
    pub client: u64,
}

#[derive(Debug, Default)]
pub struct ClientHeap {
    nodes: Vec<HeapKey>,
    positions: HashMap<u64, usize>,
}

impl ClientHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, client: u64) -> bool {
        self.positions.contains_key(&client)
    }

    pub fn peek(&self) -> Option<HeapKey> {
        self.nodes.first().copied()
    }

    /// Insert a client, or re-key it if already present.
    pub fn insert(&mut self, key: HeapKey) {
        if self.contains(key.client) {
            self.update(key);
            return;
        }
        let pos = self.nodes.len();
        self.nodes.push(key);
        self.positions.insert(key.client, pos);
        self.sift_up(pos);
    }

    /// Change the key of a present client. Absent clients are ignored.
    pub fn update(&mut self, key: HeapKey) {
        let Some(&pos) = self.positions.get(&key.client) else {
            return;
        };
        let old = self.nodes[pos];
        self.nodes[pos] = key;
        if key < old {
            self.sift_up(pos);
        } else {
            self.sift_down(pos);
        }
    }

    pub fn remove(&mut self, client: u64) -> Option<HeapKey> {
        let pos = self.positions.remove(&client)?;
        let last = self.nodes.len() - 1;
        self.nodes.swap(pos, last);
        let removed = self.nodes.pop();
        if pos < self.nodes.len() {
            self.positions.insert(self.nodes[pos].client, pos);
            self.sift_down(pos);
            self.sift_up(pos);
        }
        removed
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.nodes.swap(a, b);
        self.positions.insert(self.nodes[a].client, a);
        self.positions.insert(self.nodes[b].client, b);
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.nodes[pos] >= self.nodes[parent] {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.nodes.len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut smallest = pos;
            if left < len && self.nodes[left] < self.nodes[smallest] {
                smallest = left;
            }
            if right < len && self.nodes[right] < self.nodes[smallest] {
                smallest = right;
            }
            if smallest == pos {
                break;
            }
            self.swap(pos, smallest);
            pos = smallest;
        }
    }
}
