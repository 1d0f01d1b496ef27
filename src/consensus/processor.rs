use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    message::{Envelope, MessageId, Transaction},
    peers::{PeerId, PeerLink, PeerStatus},
    state::{Delivery, Effects, Outbound, ReplicaState},
};
use crate::common::{
    digest::{short_hex, Hashable},
    error::CodecError,
    instrument::Instrument,
};

pub const DEFAULT_CLEANUP_AFTER: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct ProcessorSettings {
    /// How long records originated by a failed peer survive before collection.
    pub cleanup_after: Duration,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        ProcessorSettings {
            cleanup_after: DEFAULT_CLEANUP_AFTER,
        }
    }
}

/// Shared handle onto one replica. Every state transition runs under the
/// single state lock. Deliveries are reported before the lock is dropped so
/// the report order is the ledger's apply order; peer sends happen after.
#[derive(Clone)]
pub struct ConsensusProcessor {
    state: Arc<Mutex<ReplicaState>>,
    settings: ProcessorSettings,
    deliveries: UnboundedSender<Delivery>,
    instrument: Instrument,
}

impl ConsensusProcessor {
    pub fn new(
        state: ReplicaState,
        settings: ProcessorSettings,
        deliveries: UnboundedSender<Delivery>,
        instrument: Instrument,
    ) -> Self {
        ConsensusProcessor {
            state: Arc::new(Mutex::new(state)),
            settings,
            deliveries,
            instrument,
        }
    }

    pub fn id(&self) -> PeerId {
        self.with_state(|s| s.id.clone())
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut ReplicaState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    pub fn attach(&self, peer: &str, link: PeerLink) -> bool {
        let refused = self.with_state(|s| {
            if s.peers.attach(peer, link) {
                return None;
            }
            Some(match s.peers.status(peer) {
                None => "not a configured peer",
                Some(PeerStatus::Active(_)) => "already connected",
                Some(_) => "peer has failed",
            })
        });
        match refused {
            None => {
                info!(peer, "peer connected");
                true
            }
            Some(reason) => {
                warn!(peer, reason, "refusing connection");
                false
            }
        }
    }

    pub fn submit(&self, transaction: Transaction) -> MessageId {
        self.transition(|s| s.submit(transaction))
    }

    pub fn handle(&self, from: &str, envelope: Envelope) {
        self.transition(|s| ((), s.handle(from, envelope)))
    }

    /// Idempotent. Schedules orphan collection for the peer's submissions.
    pub fn fail_peer(&self, peer: &str) {
        let failed = self.transition(|s| match s.fail_peer(peer) {
            Some(effects) => (true, effects),
            None => (false, Effects::default()),
        });
        if !failed {
            return;
        }

        let processor = self.clone();
        let peer = peer.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(processor.settings.cleanup_after).await;
            let orphans = processor.transition(|s| s.collect_orphans(&peer));
            debug!(%peer, ?orphans, "cleanup done");
        });
    }

    fn transition<R>(&self, f: impl FnOnce(&mut ReplicaState) -> (R, Effects)) -> R {
        let (result, outbound) = self.with_state(|s| {
            let (result, effects) = f(s);
            self.report(effects.delivered);
            (result, effects.outbound)
        });
        self.send_all(outbound);
        result
    }

    // Unbounded channel sends only: never blocks while the lock is held.
    fn report(&self, delivered: Vec<Delivery>) {
        for delivery in delivered {
            self.instrument.delivered(&delivery.id);
            debug!(
                id = %delivery.id,
                outcome = ?delivery.outcome,
                ledger = %short_hex(&delivery.balances.hash()),
                "delivered"
            );
            let _ = self.deliveries.send(delivery);
        }
    }

    fn send_all(&self, outbound: Vec<Outbound>) {
        for out in outbound {
            if !out.link.send(out.envelope) {
                self.fail_peer(&out.peer);
            }
        }
    }

    /// Registers the peer and spawns its reader and writer tasks.
    pub fn connect<R, W>(&self, peer: &str, frames: R, sink: W) -> bool
    where
        R: Stream<Item = Result<Envelope, CodecError>> + Unpin + Send + 'static,
        W: Sink<Envelope, Error = CodecError> + Unpin + Send + 'static,
    {
        let (link, outbound) = PeerLink::channel();
        let closed = link.closed();
        if !self.attach(peer, link) {
            return false;
        }
        tokio::spawn(self.clone().run_writer(peer.to_string(), outbound, closed, sink));
        tokio::spawn(self.clone().run_peer(peer.to_string(), frames));
        true
    }

    /// Inbound dispatch loop for one peer. Any decode error or EOF fails the peer.
    pub async fn run_peer<R>(self, peer: PeerId, mut frames: R)
    where
        R: Stream<Item = Result<Envelope, CodecError>> + Unpin,
    {
        let Some(closed) = self.with_state(|s| s.peers.link(&peer).map(PeerLink::closed)) else {
            return;
        };
        loop {
            let frame = tokio::select! {
                _ = closed.cancelled() => break,
                frame = frames.next() => frame,
            };
            match frame {
                Some(Ok(envelope)) => {
                    self.instrument.traffic(envelope.wire_len());
                    self.handle(&peer, envelope);
                }
                Some(Err(e)) => {
                    warn!(%peer, error = %e, "read failed");
                    break;
                }
                None => {
                    info!(%peer, "connection closed by peer");
                    break;
                }
            }
        }
        self.fail_peer(&peer);
    }

    pub async fn run_writer<W>(
        self,
        peer: PeerId,
        mut outbound: UnboundedReceiver<Envelope>,
        closed: CancellationToken,
        mut sink: W,
    ) where
        W: Sink<Envelope, Error = CodecError> + Unpin,
    {
        loop {
            let envelope = tokio::select! {
                _ = closed.cancelled() => break,
                envelope = outbound.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            let size = envelope.wire_len();
            if let Err(e) = sink.send(envelope).await {
                warn!(%peer, error = %e, "write failed");
                break;
            }
            self.instrument.traffic(size);
        }
        let _ = sink.close().await;
        self.fail_peer(&peer);
    }
}
