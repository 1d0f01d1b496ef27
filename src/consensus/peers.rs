use std::collections::BTreeMap;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use super::message::Envelope;

pub type PeerId = String;

/// Outbound half of an established connection: a queue drained by the
/// peer's writer task, and a token that tears down both directions.
#[derive(Clone, Debug)]
pub struct PeerLink {
    outbound: UnboundedSender<Envelope>,
    closed: CancellationToken,
}

impl PeerLink {
    pub fn channel() -> (PeerLink, UnboundedReceiver<Envelope>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let link = PeerLink {
            outbound,
            closed: CancellationToken::new(),
        };
        (link, rx)
    }

    /// False once the writer side is gone.
    pub fn send(&self, envelope: Envelope) -> bool {
        !self.closed.is_cancelled() && self.outbound.send(envelope).is_ok()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

#[derive(Debug)]
pub enum PeerStatus {
    /// Configured but not yet connected.
    Pending,
    Active(PeerLink),
    /// Terminal. There is no reconnection path.
    Failed,
}

#[derive(Debug, Default)]
pub struct Peers {
    members: BTreeMap<PeerId, PeerStatus>,
}

impl Peers {
    pub fn new(ids: impl IntoIterator<Item = PeerId>) -> Self {
        Peers {
            members: ids.into_iter().map(|id| (id, PeerStatus::Pending)).collect(),
        }
    }

    pub fn is_active(&self, id: &str) -> bool {
        matches!(self.members.get(id), Some(PeerStatus::Active(_)))
    }

    pub fn status(&self, id: &str) -> Option<&PeerStatus> {
        self.members.get(id)
    }

    /// Only a pending peer can be attached; a failed peer stays failed.
    pub fn attach(&mut self, id: &str, link: PeerLink) -> bool {
        match self.members.get_mut(id) {
            Some(status) if matches!(status, PeerStatus::Pending) => {
                *status = PeerStatus::Active(link);
                true
            }
            _ => false,
        }
    }

    /// Marks an active peer failed and hands back its link for closing.
    pub fn fail(&mut self, id: &str) -> Option<PeerLink> {
        let status = self.members.get_mut(id)?;
        match std::mem::replace(status, PeerStatus::Failed) {
            PeerStatus::Active(link) => Some(link),
            previous => {
                *status = previous;
                None
            }
        }
    }

    pub fn active(&self) -> impl Iterator<Item = (&PeerId, &PeerLink)> {
        self.members.iter().filter_map(|(id, status)| match status {
            PeerStatus::Active(link) => Some((id, link)),
            _ => None,
        })
    }

    pub fn link(&self, id: &str) -> Option<&PeerLink> {
        match self.members.get(id) {
            Some(PeerStatus::Active(link)) => Some(link),
            _ => None,
        }
    }
}
