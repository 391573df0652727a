use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

pub const LATENCY_STEP: i64 = 100;
pub const LATENCY_LENGTH: i64 = 10;

/// Counter key for a round-trip latency, bucketed into ten fixed-width
/// buckets plus an overflow bucket: `lt:100 .. lt:1000, ge:1000`.
pub fn latency_bucket(prefix: &str, latency_ms: i64) -> String {
    let index = (latency_ms / LATENCY_STEP).max(0);
    if index >= LATENCY_LENGTH {
        format!("{}:ge:{}", prefix, LATENCY_LENGTH * LATENCY_STEP)
    } else {
        format!("{}:lt:{}", prefix, (index + 1) * LATENCY_STEP)
    }
}

struct CountRecord {
    name: String,
    value: i64,
}

enum ControlRecord {
    Snapshot(oneshot::Sender<HashMap<String, i64>>),
    Clear(String),
    Stop,
}

/// Thread-safe multiple-producer single-consumer counter.
///
/// A single worker task owns the map; producers hand deltas over a bounded
/// channel. Control records (snapshot, clear, stop) take a priority path
/// and are never starved by a flood of data records.
pub struct Counter {
    data_tx: mpsc::Sender<CountRecord>,
    control_tx: mpsc::Sender<ControlRecord>,
    stopped: AtomicBool,
}

impl Counter {
    pub fn new() -> Self {
        let (data_tx, data_rx) = mpsc::channel(4096);
        let (control_tx, control_rx) = mpsc::channel(16);
        tokio::spawn(run_worker(data_rx, control_rx));
        Self {
            data_tx,
            control_tx,
            stopped: AtomicBool::new(false),
        }
    }

    /// Adds a delta to the named counter. Producers may call this from any
    /// task; after `stop` it becomes a no-op and never blocks.
    pub async fn stat(&self, name: impl Into<String>, value: i64) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let _ = self
            .data_tx
            .send(CountRecord {
                name: name.into(),
                value,
            })
            .await;
    }

    /// Takes an immutable snapshot of the current counts.
    pub async fn snapshot(&self) -> HashMap<String, i64> {
        if self.stopped.load(Ordering::Acquire) {
            return HashMap::new();
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .control_tx
            .send(ControlRecord::Snapshot(reply_tx))
            .await
            .is_err()
        {
            return HashMap::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Drops all counts whose name starts with `prefix`; an empty prefix
    /// clears everything.
    pub async fn clear(&self, prefix: impl Into<String>) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let _ = self
            .control_tx
            .send(ControlRecord::Clear(prefix.into()))
            .await;
    }

    /// Stops the worker; future `stat` calls are ignored.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let _ = self.control_tx.send(ControlRecord::Stop).await;
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_worker(
    mut data_rx: mpsc::Receiver<CountRecord>,
    mut control_rx: mpsc::Receiver<ControlRecord>,
) {
    let mut stats: HashMap<String, i64> = HashMap::new();
    loop {
        tokio::select! {
            biased;
            control = control_rx.recv() => {
                // Data records enqueued before this control record must be
                // visible to it.
                while let Ok(record) = data_rx.try_recv() {
                    *stats.entry(record.name).or_insert(0) += record.value;
                }
                match control {
                    Some(ControlRecord::Snapshot(reply)) => {
                        let _ = reply.send(stats.clone());
                    }
                    Some(ControlRecord::Clear(prefix)) => {
                        if prefix.is_empty() {
                            stats.clear();
                        } else {
                            stats.retain(|name, _| !name.starts_with(&prefix));
                        }
                    }
                    Some(ControlRecord::Stop) | None => return,
                }
            },
            record = data_rx.recv() => match record {
                Some(record) => {
                    *stats.entry(record.name).or_insert(0) += record.value;
                }
                None => {
                    warn!("counter data channel closed before stop");
                    return;
                }
            },
        }
    }
}
