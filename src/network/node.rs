use std::collections::HashSet;
use std::time::Duration;

use futures::{future::join_all, SinkExt, StreamExt};
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use super::codec::EnvelopeCodec;
use crate::common::{
    config::{ClusterConfig, PeerAddr},
    error::{Error, Result},
};
use crate::consensus::{ConsensusProcessor, Envelope, PeerId};

/*
    Exactly one connection per pair of nodes: a node accepts from every
    peer whose id sorts below its own and dials every peer whose id sorts
    above. The dialer names itself in a Hello frame; the acceptor uses that
    to decide which configured peer the socket belongs to.
*/

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct DialSettings {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for DialSettings {
    fn default() -> Self {
        DialSettings {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

pub struct Node {
    pub id: PeerId,
    pub config: ClusterConfig,
    pub processor: ConsensusProcessor,
    pub dial: DialSettings,
}

impl Node {
    pub fn new(config: ClusterConfig, processor: ConsensusProcessor, dial: DialSettings) -> Self {
        Node {
            id: processor.id(),
            config,
            processor,
            dial,
        }
    }

    /// Returns once every configured peer has been dialed or has dialed in.
    pub async fn establish(&self, listener: TcpListener) -> Result<()> {
        let expected: HashSet<PeerId> = self
            .config
            .smaller_than(&self.id)
            .map(|p| p.id.clone())
            .collect();
        let accepting = tokio::spawn(accept_peers(
            listener,
            self.id.clone(),
            expected,
            self.processor.clone(),
        ));

        let dials = self
            .config
            .larger_than(&self.id)
            .map(|peer| self.dial_peer(peer));
        join_all(dials).await;

        accepting.await.map_err(std::io::Error::other)??;
        info!(node = %self.id, peers = self.config.peers.len(), "mesh established");
        Ok(())
    }

    async fn dial_peer(&self, peer: &PeerAddr) {
        let endpoint = peer.endpoint();
        let mut backoff = self.dial.initial_backoff;
        loop {
            match self.try_dial(peer, &endpoint).await {
                Ok(()) => return,
                Err(e) => debug!(peer = %peer.id, %endpoint, error = %e, "dial failed, retrying"),
            }
            let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
            tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
            backoff = (backoff * 2).min(self.dial.max_backoff);
        }
    }

    async fn try_dial(&self, peer: &PeerAddr, endpoint: &str) -> Result<()> {
        let stream = TcpStream::connect(endpoint).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        let frames = FramedRead::new(read, EnvelopeCodec::new());
        let mut sink = FramedWrite::new(write, EnvelopeCodec::new());

        sink.send(Envelope::Hello {
            node_id: self.id.clone(),
        })
        .await?;
        if !self.processor.connect(&peer.id, frames, sink) {
            warn!(peer = %peer.id, "dialed peer could not be attached");
        }
        Ok(())
    }
}

async fn accept_peers(
    listener: TcpListener,
    local: PeerId,
    mut expected: HashSet<PeerId>,
    processor: ConsensusProcessor,
) -> Result<()> {
    while !expected.is_empty() {
        let (stream, addr) = listener.accept().await?;
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(stream, &local, &expected, &processor)).await {
            Ok(Ok(peer)) => {
                info!(%peer, %addr, "accepted peer");
                expected.remove(&peer);
            }
            Ok(Err(e)) => warn!(%addr, error = %e, "handshake rejected"),
            Err(_) => warn!(%addr, "handshake timed out"),
        }
    }
    Ok(())
}

async fn handshake(
    stream: TcpStream,
    local: &str,
    expected: &HashSet<PeerId>,
    processor: &ConsensusProcessor,
) -> Result<PeerId> {
    stream.set_nodelay(true)?;
    let (read, write) = stream.into_split();
    let mut frames = FramedRead::new(read, EnvelopeCodec::new());

    let peer = match frames.next().await {
        Some(Ok(Envelope::Hello { node_id })) => node_id,
        Some(Ok(other)) => return Err(Error::HandshakeExpected(other.kind())),
        Some(Err(e)) => return Err(e.into()),
        None => return Err(Error::HandshakeClosed),
    };
    if !expected.contains(&peer) || peer.as_str() >= local {
        return Err(Error::UnexpectedPeer(peer));
    }
    if !processor.connect(&peer, frames, FramedWrite::new(write, EnvelopeCodec::new())) {
        return Err(Error::UnexpectedPeer(peer));
    }
    Ok(peer)
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::common::instrument::Instrument;
    use crate::consensus::{Delivery, PeerStatus, ProcessorSettings, ReplicaState, Transaction};

    async fn cluster(ids: &[&str]) -> Vec<(Node, TcpListener, mpsc::UnboundedReceiver<Delivery>)> {
        let mut listeners = Vec::new();
        for _ in ids {
            listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
        }
        let addrs: Vec<PeerAddr> = ids
            .iter()
            .zip(&listeners)
            .map(|(id, l)| PeerAddr {
                id: id.to_string(),
                host: "127.0.0.1".into(),
                port: l.local_addr().unwrap().port(),
            })
            .collect();

        ids.iter()
            .zip(listeners)
            .map(|(id, listener)| {
                let config = ClusterConfig {
                    peers: addrs.iter().filter(|p| p.id != *id).cloned().collect(),
                };
                let (tx, rx) = mpsc::unbounded_channel();
                let state = ReplicaState::new(*id, config.ids().cloned());
                let processor = ConsensusProcessor::new(
                    state,
                    ProcessorSettings::default(),
                    tx,
                    Instrument::disabled(),
                );
                let dial = DialSettings {
                    initial_backoff: Duration::from_millis(10),
                    max_backoff: Duration::from_millis(50),
                };
                (Node::new(config, processor, dial), listener, rx)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_mesh_over_tcp_delivers_everywhere() {
        let nodes = cluster(&["node1", "node2", "node3"]).await;

        let mut handles = Vec::new();
        let mut receivers = Vec::new();
        let mut processors = Vec::new();
        for (node, listener, rx) in nodes {
            processors.push(node.processor.clone());
            receivers.push(rx);
            handles.push(tokio::spawn(async move { node.establish(listener).await }));
        }
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .expect("mesh took too long")
                .unwrap()
                .unwrap();
        }
        for processor in &processors {
            processor.with_state(|s| assert_eq!(s.peers.active().count(), 2));
        }

        processors[1].submit(Transaction::deposit("alice", 100));
        processors[2].submit(Transaction::transfer("alice", "bob", 40));

        let mut orders = Vec::new();
        for rx in receivers.iter_mut() {
            let mut order = Vec::new();
            for _ in 0..2 {
                let delivery = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                    .await
                    .unwrap()
                    .unwrap();
                order.push((delivery.id, delivery.outcome));
            }
            orders.push(order);
        }
        assert!(orders.windows(2).all(|w| w[0] == w[1]));
    }

    // Connects, names itself, and expects the acceptor to hang up.
    async fn assert_hello_refused(addr: std::net::SocketAddr, node_id: &str) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = tokio_util::codec::Framed::new(stream, EnvelopeCodec::new());
        framed.send(Envelope::Hello { node_id: node_id.into() }).await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), framed.next())
            .await
            .expect("acceptor kept the connection open");
        assert!(!matches!(reply, Some(Ok(_))), "unexpected frame {reply:?}");
    }

    type Accepting = tokio::task::JoinHandle<Result<()>>;

    // Splits off a as dialer and starts b accepting from a only.
    fn accept_on_b(
        nodes: &mut Vec<(Node, TcpListener, mpsc::UnboundedReceiver<Delivery>)>,
    ) -> (Node, ConsensusProcessor, std::net::SocketAddr, Accepting) {
        let (node_a, _, _) = nodes.remove(0);
        let (node_b, listener_b, _) = nodes.remove(0);
        let addr = listener_b.local_addr().unwrap();
        let processor_b = node_b.processor.clone();
        let accepting = tokio::spawn(accept_peers(
            listener_b,
            node_b.id.clone(),
            HashSet::from(["a".to_string()]),
            processor_b.clone(),
        ));
        (node_a, processor_b, addr, accepting)
    }

    #[tokio::test]
    async fn test_unknown_hello_is_rejected() {
        let mut nodes = cluster(&["a", "b"]).await;
        let (node_a, processor_b, addr, accepting) = accept_on_b(&mut nodes);

        assert_hello_refused(addr, "z").await;
        processor_b.with_state(|s| assert!(s.peers.status("z").is_none()));

        // the acceptor keeps waiting for the real peer
        node_a.dial_peer(&node_a.config.peers[0]).await;
        tokio::time::timeout(Duration::from_secs(5), accepting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(processor_b.with_state(|s| s.peers.is_active("a")));
        assert!(node_a.processor.with_state(|s| s.peers.is_active("b")));
    }

    #[tokio::test]
    async fn test_hello_from_larger_configured_peer_is_rejected() {
        let mut nodes = cluster(&["a", "b", "c"]).await;
        let (node_a, processor_b, addr, accepting) = accept_on_b(&mut nodes);

        // c is configured on b, but b dials c rather than accepting from it
        assert_hello_refused(addr, "c").await;
        processor_b.with_state(|s| {
            assert!(!s.peers.is_active("c"));
            assert!(matches!(s.peers.status("c"), Some(PeerStatus::Pending)));
        });

        let to_b = node_a.config.peers.iter().find(|p| p.id == "b").unwrap();
        node_a.dial_peer(to_b).await;
        tokio::time::timeout(Duration::from_secs(5), accepting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(processor_b.with_state(|s| s.peers.is_active("a")));
    }
}
