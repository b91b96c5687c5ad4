//! JSON-lines event sink.
//!
//! Records flow from the pool's all-shards channel through a bounded buffer
//! into a single writer task. A full buffer drops records instead of
//! blocking the shards.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, ShardError};
use crate::pool::PoolEvent;

/// Address that selects standard output.
pub const STDOUT_ADDRESS: &str = "-";

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// A bounded, drop-when-full JSON-lines writer.
#[derive(Debug)]
pub struct EventSink {
    tx: mpsc::Sender<PoolEvent>,
    dropped: Arc<AtomicU64>,
    writer: JoinHandle<Result<u64>>,
}

impl EventSink {
    /// Open the sink at `address`.
    ///
    /// # Errors
    ///
    /// Returns an error if the output file cannot be opened.
    pub async fn open(address: &str, buffer: usize) -> Result<Self> {
        let out: Writer = if address == STDOUT_ADDRESS {
            Box::new(tokio::io::stdout())
        } else {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(address)
                .await
                .map_err(|e| ShardError::Sink(format!("failed to open '{address}': {e}")))?;
            Box::new(file)
        };

        info!(address, buffer, "event sink open");
        let (tx, rx) = mpsc::channel(buffer.max(1));
        Ok(Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            writer: tokio::spawn(write_lines(out, rx)),
        })
    }

    /// Queue a record. Returns `false` if it was dropped.
    pub fn push(&self, event: PoolEvent) -> bool {
        offer(&self.tx, &self.dropped, event)
    }

    /// Records dropped so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Feed every record from `events` into the sink until the channel
    /// closes.
    pub fn attach(&self, mut events: broadcast::Receiver<PoolEvent>) -> JoinHandle<()> {
        let tx = self.tx.clone();
        let dropped = Arc::clone(&self.dropped);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        offer(&tx, &dropped, event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        dropped.fetch_add(skipped, Ordering::Relaxed);
                        warn!(skipped, "sink fell behind the event stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Flush and release the writer once every attached stream has ended.
    /// Returns the number of records written.
    ///
    /// # Errors
    ///
    /// Returns an error if writing or flushing failed.
    pub async fn close(self) -> Result<u64> {
        drop(self.tx);
        let written = self
            .writer
            .await
            .map_err(|e| ShardError::Sink(format!("writer task failed: {e}")))??;
        let dropped = self.dropped.load(Ordering::Relaxed);
        info!(written, dropped, "event sink closed");
        Ok(written)
    }
}

fn offer(tx: &mpsc::Sender<PoolEvent>, dropped: &AtomicU64, event: PoolEvent) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(event)) => {
            let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(shard = event.shard, total, "sink buffer full, dropping record");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

async fn write_lines(out: Writer, mut rx: mpsc::Receiver<PoolEvent>) -> Result<u64> {
    let mut out = BufWriter::new(out);
    let mut written = 0u64;

    while let Some(event) = rx.recv().await {
        let mut line = match serde_json::to_vec(&event) {
            Ok(line) => line,
            Err(e) => {
                warn!(shard = event.shard, error = %e, "failed to serialize record");
                continue;
            }
        };
        line.push(b'\n');
        out.write_all(&line).await?;
        written += 1;
        if rx.is_empty() {
            out.flush().await?;
        }
    }

    out.flush().await?;
    Ok(written)
}
