use std::collections::HashMap;

use tracing::{debug, info, warn};

use super::{
    message::{Envelope, MessageId, Transaction},
    peers::{PeerId, PeerLink, Peers},
    queue::{DelayQueue, OrderKey},
    store::{Record, Store},
};
use crate::bank::{Balances, Ledger, Outcome};

/*
    ISIS-style agreement, as run by every replica:

    1. The originator multicasts the transaction. Each replica bumps its
       counter, holds the transaction back under (counter, own id) and
       replies with that tentative number.
    2. Once every active replica (originator included) has answered, the
       originator takes the highest proposal, ties going to the largest
       proposer id, and multicasts it as final.
    3. A replica that learns the final key re-keys the held-back entry and
       delivers from the head of the queue for as long as the head is final.
       A pending head blocks everything behind it, since its key can still
       only grow.

    The counter never moves backwards and is lifted to every agreed number
    seen, so later proposals always sort after earlier agreements.
*/

/// Sends decided under the state lock, performed after it is released.
#[derive(Debug)]
pub struct Outbound {
    pub peer: PeerId,
    pub link: PeerLink,
    pub envelope: Envelope,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub id: MessageId,
    pub outcome: Outcome,
    pub balances: Balances,
}

#[derive(Debug, Default)]
pub struct Effects {
    pub outbound: Vec<Outbound>,
    pub delivered: Vec<Delivery>,
}

/// Agreed key over the proposals of `voters`, or None while any voter is
/// still missing. Highest number wins; among equal numbers the largest
/// proposer id wins.
pub fn agreed_key<'a>(
    proposals: &HashMap<PeerId, u64>,
    voters: impl IntoIterator<Item = &'a PeerId>,
) -> Option<OrderKey> {
    let mut best: Option<(u64, &PeerId)> = None;
    for voter in voters {
        let seq = *proposals.get(voter)?;
        if best.map_or(true, |current| (seq, voter) > current) {
            best = Some((seq, voter));
        }
    }
    best.map(|(seq, voter)| OrderKey::new(seq, voter.clone()))
}

#[derive(Debug)]
pub struct ReplicaState {
    pub id: PeerId,
    seq: u64,
    submitted: u64,
    pub peers: Peers,
    pub store: Store,
    pub queue: DelayQueue,
    proposals: HashMap<MessageId, HashMap<PeerId, u64>>,
    pub ledger: Ledger,
}

impl ReplicaState {
    pub fn new(id: impl Into<PeerId>, peers: impl IntoIterator<Item = PeerId>) -> Self {
        let id = id.into();
        ReplicaState {
            peers: Peers::new(peers.into_iter().filter(|p| *p != id)),
            id,
            seq: 0,
            submitted: 0,
            store: Store::new(),
            queue: DelayQueue::new(),
            proposals: HashMap::new(),
            ledger: Ledger::new(),
        }
    }

    pub fn submit(&mut self, transaction: Transaction) -> (MessageId, Effects) {
        let mut effects = Effects::default();
        self.submitted += 1;
        let id = MessageId::new(self.id.clone(), self.submitted);

        self.store.add_record(
            id.clone(),
            Record::pending(transaction.clone(), self.id.clone(), self.id.clone()),
        );
        let seq = self.next_seq();
        self.queue.insert(id.clone(), OrderKey::new(seq, self.id.clone()));
        self.proposals
            .insert(id.clone(), HashMap::from([(self.id.clone(), seq)]));
        debug!(%id, seq, "submitted");

        self.multicast(
            Envelope::Transaction {
                sender: self.id.clone(),
                id: id.clone(),
                transaction,
            },
            &mut effects,
        );
        // with no active peers this finalizes on the spot
        self.try_finalize(&id, &mut effects);
        (id, effects)
    }

    pub fn handle(&mut self, from: &str, envelope: Envelope) -> Effects {
        let mut effects = Effects::default();
        if !self.peers.is_active(from) {
            debug!(peer = from, kind = envelope.kind(), "dropping envelope from inactive peer");
            return effects;
        }
        match envelope {
            Envelope::Transaction {
                id, transaction, ..
            } => self.on_transaction(from, id, transaction, &mut effects),
            Envelope::Proposed { id, seq, .. } => self.on_proposed(from, id, seq, &mut effects),
            Envelope::Final {
                id, seq, tie_break, ..
            } => self.on_final(id, OrderKey::new(seq, tie_break), &mut effects),
            Envelope::Hello { node_id } => {
                warn!(peer = from, %node_id, "unexpected handshake on established connection");
            }
        }
        effects
    }

    fn on_transaction(
        &mut self,
        from: &str,
        id: MessageId,
        transaction: Transaction,
        effects: &mut Effects,
    ) {
        if self.store.has_seen(&id) {
            // repeat the proposal we already made, if it still matters
            let tentative = match (self.store.get(&id), self.queue.key(&id)) {
                (Some(record), Some(key)) if !record.finalized => Some(key.seq),
                _ => None,
            };
            debug!(%id, peer = from, "duplicate transaction");
            if let Some(seq) = tentative {
                self.reply(from, self.proposed(&id, seq), effects);
            }
            return;
        }

        self.store.add_record(
            id.clone(),
            Record::pending(transaction, id.origin.clone(), self.id.clone()),
        );
        let seq = self.next_seq();
        self.queue.insert(id.clone(), OrderKey::new(seq, self.id.clone()));
        debug!(%id, seq, peer = from, "proposing");
        self.reply(from, self.proposed(&id, seq), effects);
    }

    fn on_proposed(&mut self, from: &str, id: MessageId, seq: u64, effects: &mut Effects) {
        let Some(table) = self.proposals.get_mut(&id) else {
            debug!(%id, peer = from, "proposal for settled or foreign identifier");
            return;
        };
        table.insert(from.to_string(), seq);
        self.try_finalize(&id, effects);
    }

    fn on_final(&mut self, id: MessageId, key: OrderKey, effects: &mut Effects) {
        match self.store.get(&id) {
            Some(record) if !record.finalized => {}
            _ => {
                debug!(%id, "final for unknown or finalized identifier");
                return;
            }
        }
        self.settle(&id, key.clone(), effects);
        // relay so replicas that missed the originator's copy still converge
        self.multicast(self.final_envelope(&id, &key), effects);
    }

    fn try_finalize(&mut self, id: &MessageId, effects: &mut Effects) {
        let Some(table) = self.proposals.get(id) else {
            return;
        };
        let voters = std::iter::once(&self.id).chain(self.peers.active().map(|(p, _)| p));
        let Some(key) = agreed_key(table, voters) else {
            return;
        };
        self.proposals.remove(id);

        if !matches!(self.store.get(id), Some(record) if !record.finalized) {
            warn!(%id, "agreement reached for a record that is gone");
            return;
        }
        info!(%id, seq = key.seq, tie_break = %key.tie_break, "agreed");
        self.settle(id, key.clone(), effects);
        self.multicast(self.final_envelope(id, &key), effects);
    }

    fn settle(&mut self, id: &MessageId, key: OrderKey, effects: &mut Effects) {
        self.seq = self.seq.max(key.seq);
        if let Some(record) = self.store.get_mut(id) {
            record.finalized = true;
            record.tie_break = key.tie_break.clone();
        }
        self.queue.update_key(id, key);
        self.deliver(effects);
    }

    fn deliver(&mut self, effects: &mut Effects) {
        while let Ok(head) = self.queue.peek_min() {
            match self.store.get(head) {
                Some(record) if record.finalized => {}
                Some(_) => break,
                None => {
                    warn!(id = %head, "queued identifier has no record, discarding");
                    let _ = self.queue.pop_min();
                    continue;
                }
            }
            let Ok(id) = self.queue.pop_min() else {
                break;
            };
            let Some(record) = self.store.remove(&id) else {
                continue;
            };
            let outcome = self.ledger.apply(&record.transaction);
            if outcome == Outcome::Skipped {
                debug!(%id, "transaction skipped");
            }
            effects.delivered.push(Delivery {
                id,
                outcome,
                balances: self.ledger.snapshot(),
            });
        }
    }

    /// Demotes an active peer and re-runs every open agreement over the
    /// smaller active set. None if the peer was not active.
    pub fn fail_peer(&mut self, peer: &str) -> Option<Effects> {
        let link = self.peers.fail(peer)?;
        link.close();
        warn!(peer, open = self.proposals.len(), "peer failed");

        let mut effects = Effects::default();
        let open: Vec<MessageId> = self.proposals.keys().cloned().collect();
        for id in open {
            self.try_finalize(&id, &mut effects);
        }
        Some(effects)
    }

    /// Drops every unfinalized record originated by `peer`. Delivery is
    /// retried because an orphan may have been the head of the queue.
    pub fn collect_orphans(&mut self, peer: &str) -> (Vec<MessageId>, Effects) {
        let orphans = self.store.orphans_of(peer);
        for id in &orphans {
            self.store.remove(id);
            self.queue.delete(id);
        }
        if !orphans.is_empty() {
            info!(peer, count = orphans.len(), "collected orphaned records");
        }
        let mut effects = Effects::default();
        self.deliver(&mut effects);
        (orphans, effects)
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn proposed(&self, id: &MessageId, seq: u64) -> Envelope {
        Envelope::Proposed {
            sender: self.id.clone(),
            id: id.clone(),
            seq,
        }
    }

    fn final_envelope(&self, id: &MessageId, key: &OrderKey) -> Envelope {
        Envelope::Final {
            sender: self.id.clone(),
            id: id.clone(),
            seq: key.seq,
            tie_break: key.tie_break.clone(),
        }
    }

    fn reply(&self, peer: &str, envelope: Envelope, effects: &mut Effects) {
        if let Some(link) = self.peers.link(peer) {
            effects.outbound.push(Outbound {
                peer: peer.to_string(),
                link: link.clone(),
                envelope,
            });
        }
    }

    fn multicast(&self, envelope: Envelope, effects: &mut Effects) {
        for (peer, link) in self.peers.active() {
            effects.outbound.push(Outbound {
                peer: peer.clone(),
                link: link.clone(),
                envelope: envelope.clone(),
            });
        }
    }
}
