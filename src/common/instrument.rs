use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::warn;

use crate::consensus::MessageId;

/*
    Purely observational timing logs. Two files per node:
      <id>_bandwidth.txt   "<bytes> <unix-seconds>" per envelope sent or received
      <id>_processing.txt  "<identifier> <unix-seconds>" per delivery
    Nothing here feeds back into the protocol.
*/

#[derive(Debug)]
enum Sample {
    Traffic(usize),
    Delivered(MessageId),
}

#[derive(Clone, Debug, Default)]
pub struct Instrument {
    tx: Option<UnboundedSender<Sample>>,
}

impl Instrument {
    pub fn disabled() -> Self {
        Instrument { tx: None }
    }

    pub async fn spawn(dir: impl AsRef<Path>, node_id: &str) -> std::io::Result<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let bandwidth = File::create(dir.join(format!("{node_id}_bandwidth.txt"))).await?;
        let processing = File::create(dir.join(format!("{node_id}_processing.txt"))).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_samples(rx, BufWriter::new(bandwidth), BufWriter::new(processing)));
        Ok(Instrument { tx: Some(tx) })
    }

    pub fn traffic(&self, bytes: usize) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Sample::Traffic(bytes));
        }
    }

    pub fn delivered(&self, id: &MessageId) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Sample::Delivered(id.clone()));
        }
    }
}

async fn write_samples(
    mut rx: UnboundedReceiver<Sample>,
    mut bandwidth: BufWriter<File>,
    mut processing: BufWriter<File>,
) {
    while let Some(sample) = rx.recv().await {
        let result = match sample {
            Sample::Traffic(bytes) => {
                let line = format!("{bytes} {}\n", unix_seconds());
                write_line(&mut bandwidth, &line).await
            }
            Sample::Delivered(id) => {
                let line = format!("{id} {}\n", unix_seconds());
                write_line(&mut processing, &line).await
            }
        };
        if let Err(e) = result {
            warn!(error = %e, "instrumentation write failed, disabling");
            return;
        }
    }
}

async fn write_line(out: &mut BufWriter<File>, line: &str) -> std::io::Result<()> {
    out.write_all(line.as_bytes()).await?;
    out.flush().await
}

fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
