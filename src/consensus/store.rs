use std::collections::{BTreeSet, HashMap};

use super::{message::{MessageId, Transaction}, peers::PeerId};

/// In-flight state of one transaction between first sight and delivery.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Record {
    pub transaction: Transaction,
    pub finalized: bool,
    pub origin: PeerId,
    pub tie_break: PeerId,
}

impl Record {
    pub fn pending(transaction: Transaction, origin: PeerId, local: PeerId) -> Self {
        Record {
            transaction,
            finalized: false,
            origin,
            tie_break: local,
        }
    }
}

/// Counters taken in from one originator. Everything at or below `floor`
/// has been seen; `above` holds the out-of-order ones past the first gap.
#[derive(Debug, Default)]
struct Seen {
    floor: u64,
    above: BTreeSet<u64>,
}

impl Seen {
    fn contains(&self, counter: u64) -> bool {
        counter <= self.floor || self.above.contains(&counter)
    }

    fn insert(&mut self, counter: u64) {
        if counter <= self.floor {
            return;
        }
        self.above.insert(counter);
        while self.above.remove(&(self.floor + 1)) {
            self.floor += 1;
        }
    }
}

#[derive(Debug, Default)]
pub struct Store {
    pub records: HashMap<MessageId, Record>,
    seen: HashMap<PeerId, Seen>,
}

impl Store {
    pub fn new() -> Self {
        Store::default()
    }

    /// Whether `id` has ever been recorded, including already delivered ones.
    pub fn has_seen(&self, id: &MessageId) -> bool {
        self.seen
            .get(&id.origin)
            .is_some_and(|seen| seen.contains(id.counter))
    }

    pub fn add_record(&mut self, id: MessageId, record: Record) {
        self.seen.entry(id.origin.clone()).or_default().insert(id.counter);
        self.records.insert(id, record);
    }

    pub fn get(&self, id: &MessageId) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &MessageId) -> Option<&mut Record> {
        self.records.get_mut(id)
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<Record> {
        self.records.remove(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Unfinalized records whose originator is `origin`.
    pub fn orphans_of(&self, origin: &str) -> Vec<MessageId> {
        self.records
            .iter()
            .filter(|(_, r)| r.origin == origin && !r.finalized)
            .map(|(id, _)| id.clone())
            .collect()
    }
}
