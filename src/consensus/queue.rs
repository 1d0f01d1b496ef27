use std::collections::HashMap;

use super::{message::MessageId, peers::PeerId};
use crate::common::error::QueueError;

/*
    Hold-back queue for the sequencer. Entries are ordered by
    (sequence number, tie-break id). The key lives in the entry itself and
    is only changed through update_key, so comparisons never have to look
    at the record table.

    The index map makes delete/update O(log n). The queue does no locking
    of its own; it is only touched while the replica state lock is held.
*/

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct OrderKey {
    pub seq: u64,
    pub tie_break: PeerId,
}

impl OrderKey {
    pub fn new(seq: u64, tie_break: impl Into<PeerId>) -> Self {
        OrderKey {
            seq,
            tie_break: tie_break.into(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    id: MessageId,
    key: OrderKey,
}

#[derive(Debug, Default)]
pub struct DelayQueue {
    heap: Vec<Entry>,
    index: HashMap<MessageId, usize>,
}

impl DelayQueue {
    pub fn new() -> Self {
        DelayQueue::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.index.contains_key(id)
    }

    pub fn key(&self, id: &MessageId) -> Option<&OrderKey> {
        self.index.get(id).map(|&i| &self.heap[i].key)
    }

    /// Returns false without touching the queue if `id` is already queued.
    pub fn insert(&mut self, id: MessageId, key: OrderKey) -> bool {
        if self.index.contains_key(&id) {
            return false;
        }
        let at = self.heap.len();
        self.index.insert(id.clone(), at);
        self.heap.push(Entry { id, key });
        self.sift_up(at);
        true
    }

    pub fn peek_min(&self) -> Result<&MessageId, QueueError> {
        self.heap.first().map(|e| &e.id).ok_or(QueueError::Empty)
    }

    pub fn pop_min(&mut self) -> Result<MessageId, QueueError> {
        self.remove_at(0).map(|e| e.id).ok_or(QueueError::Empty)
    }

    pub fn update_key(&mut self, id: &MessageId, key: OrderKey) -> bool {
        let Some(&at) = self.index.get(id) else {
            return false;
        };
        self.heap[at].key = key;
        self.fix(at);
        true
    }

    pub fn delete(&mut self, id: &MessageId) -> bool {
        match self.index.get(id) {
            Some(&at) => self.remove_at(at).is_some(),
            None => false,
        }
    }

    fn remove_at(&mut self, at: usize) -> Option<Entry> {
        let last = self.heap.len().checked_sub(1)?;
        self.swap(at, last);
        let entry = self.heap.pop()?;
        self.index.remove(&entry.id);
        if at < self.heap.len() {
            self.fix(at);
        }
        Some(entry)
    }

    fn fix(&mut self, at: usize) {
        if !self.sift_down(at) {
            self.sift_up(at);
        }
    }

    fn sift_up(&mut self, mut at: usize) {
        while at > 0 {
            let parent = (at - 1) / 2;
            if self.heap[at].key >= self.heap[parent].key {
                break;
            }
            self.swap(at, parent);
            at = parent;
        }
    }

    // Returns whether the entry moved.
    fn sift_down(&mut self, start: usize) -> bool {
        let mut at = start;
        let n = self.heap.len();
        loop {
            let left = 2 * at + 1;
            if left >= n {
                break;
            }
            let right = left + 1;
            let child = if right < n && self.heap[right].key < self.heap[left].key {
                right
            } else {
                left
            };
            if self.heap[child].key >= self.heap[at].key {
                break;
            }
            self.swap(at, child);
            at = child;
        }
        at != start
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.heap.swap(a, b);
        self.index.insert(self.heap[a].id.clone(), a);
        self.index.insert(self.heap[b].id.clone(), b);
    }
}
