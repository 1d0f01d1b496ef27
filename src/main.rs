/*
    Every replica holds the same fixed set of peers and applies the same bank
    transactions in the same order, without a leader. A transaction is
    multicast by the node that received it; every replica answers with a
    tentative sequence number; the originator picks the largest and announces
    it as final; replicas deliver held-back transactions in final order.

    Usage: isis-bank <NODE_ID> <PORT> <CONFIG>
    Submissions on stdin, balances on stdout, logs on stderr.
*/

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use isis_bank::bank::parse_command;
use isis_bank::common::{ClusterConfig, Instrument};
use isis_bank::consensus::{ConsensusProcessor, Delivery, ProcessorSettings, ReplicaState};
use isis_bank::network::{DialSettings, Node};

#[derive(Parser, Debug)]
#[command(name = "isis-bank", about = "Totally ordered replicated bank ledger")]
struct Args {
    /// Identifier of this node; must match its entry in the peer list.
    node_id: String,

    /// TCP port to accept peer connections on.
    port: u16,

    /// Peer list: a count line followed by `<id> <host> <port>` lines.
    config: PathBuf,

    /// Seconds before unfinalized records of a failed peer are dropped.
    #[arg(long, env = "ISIS_CLEANUP_TIMEOUT_SECS", default_value_t = 10)]
    cleanup_timeout_secs: u64,

    /// Directory for bandwidth/processing timing logs. Disabled when unset.
    #[arg(long, env = "ISIS_INSTRUMENT_DIR")]
    instrument_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 100)]
    dial_backoff_ms: u64,

    #[arg(long, default_value_t = 2000)]
    dial_backoff_max_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = ClusterConfig::load(&args.config, &args.node_id)
        .with_context(|| format!("loading peer list {}", args.config.display()))?;
    let listener = TcpListener::bind(("0.0.0.0", args.port))
        .await
        .with_context(|| format!("binding port {}", args.port))?;

    let instrument = match &args.instrument_dir {
        Some(dir) => Instrument::spawn(dir, &args.node_id)
            .await
            .with_context(|| format!("creating instrumentation files in {}", dir.display()))?,
        None => Instrument::disabled(),
    };

    let (deliveries_tx, mut deliveries) = mpsc::unbounded_channel::<Delivery>();
    tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            println!("{}", delivery.balances);
        }
    });

    let state = ReplicaState::new(args.node_id.clone(), config.ids().cloned());
    let settings = ProcessorSettings {
        cleanup_after: Duration::from_secs(args.cleanup_timeout_secs),
    };
    let processor = ConsensusProcessor::new(state, settings, deliveries_tx, instrument);
    let dial = DialSettings {
        initial_backoff: Duration::from_millis(args.dial_backoff_ms),
        max_backoff: Duration::from_millis(args.dial_backoff_max_ms.max(args.dial_backoff_ms)),
    };

    info!(node = %args.node_id, port = args.port, peers = config.peers.len(), "starting");
    let node = Node::new(config, processor.clone(), dial);
    node.establish(listener).await.context("establishing peer mesh")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading submissions")? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Ok(transaction) => {
                let id = processor.submit(transaction);
                info!(%id, "submitted");
            }
            Err(e) => warn!(%line, error = %e, "ignoring submission"),
        }
    }

    info!("input closed, still serving peers until interrupted");
    tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
    Ok(())
}
