pub mod message;
pub mod peers;
pub mod processor;
pub mod queue;
pub mod state;
pub mod store;

pub use message::*;
pub use peers::*;
pub use processor::*;
pub use queue::*;
pub use state::*;
pub use store::*;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::{channel::mpsc as fmpsc, SinkExt, StreamExt};
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use super::*;
    use crate::common::{error::CodecError, instrument::Instrument};

    fn replica(id: &str, all: &[&str]) -> (ConsensusProcessor, UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = ReplicaState::new(id, all.iter().map(|p| p.to_string()));
        let settings = ProcessorSettings {
            cleanup_after: Duration::from_millis(50),
        };
        (ConsensusProcessor::new(state, settings, tx, Instrument::disabled()), rx)
    }

    // In-memory duplex connection between two replicas.
    fn wire(a: &ConsensusProcessor, b: &ConsensusProcessor) {
        let (a_to_b, b_from_a) = fmpsc::unbounded::<Envelope>();
        let (b_to_a, a_from_b) = fmpsc::unbounded::<Envelope>();
        let broken = |_| CodecError::Io(std::io::ErrorKind::BrokenPipe.into());

        assert!(a.connect(
            &b.id(),
            a_from_b.map(Ok::<_, CodecError>),
            a_to_b.sink_map_err(broken)
        ));
        assert!(b.connect(
            &a.id(),
            b_from_a.map(Ok::<_, CodecError>),
            b_to_a.sink_map_err(broken)
        ));
    }

    fn mesh(ids: &[&str]) -> Vec<(ConsensusProcessor, UnboundedReceiver<Delivery>)> {
        let nodes: Vec<_> = ids.iter().map(|id| replica(id, ids)).collect();
        for i in 0..nodes.len() {
            for j in (i + 1)..nodes.len() {
                wire(&nodes[i].0, &nodes[j].0);
            }
        }
        nodes
    }

    async fn collect(rx: &mut UnboundedReceiver<Delivery>, n: usize) -> Vec<Delivery> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let next = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for delivery")
                .expect("delivery channel closed");
            out.push(next);
        }
        out
    }

    #[tokio::test]
    async fn test_two_nodes_agree_on_deposit() {
        let mut nodes = mesh(&["A", "B"]);
        nodes[0].0.submit(Transaction::deposit("alice", 50));

        for (_, rx) in nodes.iter_mut() {
            let delivered = collect(rx, 1).await;
            assert_eq!(delivered[0].balances.to_string(), "BALANCES alice:50");
        }
    }

    #[tokio::test]
    async fn test_invalid_transfer_skipped_everywhere() {
        let mut nodes = mesh(&["A", "B"]);
        nodes[0].0.submit(Transaction::transfer("alice", "bob", 30));

        for (_, rx) in nodes.iter_mut() {
            let delivered = collect(rx, 1).await;
            assert_eq!(delivered[0].outcome, crate::bank::Outcome::Skipped);
            assert_eq!(delivered[0].balances.to_string(), "BALANCES");
        }
    }

    // order-sensitive mix: transfers only succeed after the right deposits
    fn workload(node: usize, round: usize) -> Transaction {
        let account = format!("acct{}", (node + round) % 3);
        if round % 2 == 0 {
            Transaction::deposit(account, 10 + round as u64)
        } else {
            Transaction::transfer(account, format!("acct{node}"), 7)
        }
    }

    async fn assert_same_history(nodes: &mut [(ConsensusProcessor, UnboundedReceiver<Delivery>)], total: usize) {
        let mut orders = Vec::new();
        let mut histories = Vec::new();
        for (_, rx) in nodes.iter_mut() {
            let delivered = collect(rx, total).await;
            orders.push(delivered.iter().map(|d| d.id.clone()).collect::<Vec<_>>());
            histories.push(delivered.into_iter().map(|d| d.balances).collect::<Vec<_>>());
        }

        assert!(orders.windows(2).all(|w| w[0] == w[1]), "orders diverged: {orders:?}");
        // every printed snapshot matches, not just the last one
        assert!(histories.windows(2).all(|w| w[0] == w[1]));
        for (processor, _) in nodes.iter() {
            processor.with_state(|s| {
                assert!(s.queue.is_empty());
                assert!(s.store.is_empty());
                assert_eq!(Some(&s.ledger.snapshot()), histories[0].last());
            });
        }
    }

    #[tokio::test]
    async fn test_concurrent_submissions_total_order() {
        let ids = ["A", "B", "C"];
        let mut nodes = mesh(&ids);

        let per_node = 6;
        for round in 0..per_node {
            for (n, (processor, _)) in nodes.iter().enumerate() {
                processor.submit(workload(n, round));
            }
        }
        assert_same_history(&mut nodes, per_node * ids.len()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_submissions_total_order_multi_thread() {
        let ids = ["A", "B", "C", "D"];
        let mut nodes = mesh(&ids);

        let per_node = 150;
        let submitters: Vec<_> = nodes
            .iter()
            .enumerate()
            .map(|(n, (processor, _))| {
                let processor = processor.clone();
                tokio::spawn(async move {
                    for round in 0..per_node {
                        processor.submit(workload(n, round));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for submitter in submitters {
            submitter.await.unwrap();
        }
        assert_same_history(&mut nodes, per_node * ids.len()).await;
    }

    #[tokio::test]
    async fn test_survivors_progress_after_crash() {
        let mut nodes = mesh(&["A", "B", "C"]);

        // B crashes: its links go down, A and C see EOF
        nodes[1].0.fail_peer("A");
        nodes[1].0.fail_peer("C");

        for _ in 0..100 {
            let down = nodes[0].0.with_state(|s| !s.peers.is_active("B"))
                && nodes[2].0.with_state(|s| !s.peers.is_active("B"));
            if down {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        nodes[2].0.submit(Transaction::deposit("carol", 5));
        for i in [0, 2] {
            let delivered = collect(&mut nodes[i].1, 1).await;
            assert_eq!(delivered[0].balances.to_string(), "BALANCES carol:5");
        }
    }
}
