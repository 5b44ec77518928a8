use crate::record::{ConnectionState, IngestRecord};
use crate::sink::Sink;
use anyhow::Result;
use chrono::Utc;
use std::sync::{
    atomic::{AtomicU64, AtomicU8, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug)]
pub enum BatchCommand {
    Record(IngestRecord),
    Flush(oneshot::Sender<()>),
}

/// Cheap clonable front of the accumulator task.
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<BatchCommand>,
    stats: Arc<IngestStats>,
}

impl PipelineHandle {
    pub fn new(tx: mpsc::Sender<BatchCommand>, stats: Arc<IngestStats>) -> Self {
        Self { tx, stats }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub async fn enqueue(&self, record: IngestRecord) -> Result<()> {
        let queue_depth = self.stats.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(queue_depth, sequence = record.sequence, "queued record");
        if let Err(err) = self.tx.send(BatchCommand::Record(record)).await {
            self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
            return Err(err.into());
        }
        Ok(())
    }

    /// Forces a flush of whatever is buffered and waits for the swap.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(BatchCommand::Flush(tx)).await;
        let _ = rx.await;
        Ok(())
    }
}

/// Shared pipeline counters. `arrivals` is monotonic and only ever read by
/// external collaborators.
#[derive(Debug)]
pub struct IngestStats {
    pub arrivals: AtomicU64,
    pub malformed_dropped: AtomicU64,
    pub journal_dropped: AtomicU64,
    pub sink_dropped: AtomicU64,
    pub queue_depth: AtomicU64,
    pub flushed_batches: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub last_flush_unix_ms: AtomicU64,
    pub inflight_flushes: AtomicU64,
    connection_state: AtomicU8,
    last_error: Mutex<Option<String>>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            arrivals: AtomicU64::new(0),
            malformed_dropped: AtomicU64::new(0),
            journal_dropped: AtomicU64::new(0),
            sink_dropped: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            flushed_batches: AtomicU64::new(0),
            last_batch_len: AtomicU64::new(0),
            last_flush_unix_ms: AtomicU64::new(0),
            inflight_flushes: AtomicU64::new(0),
            connection_state: AtomicU8::new(ConnectionState::Disconnected as u8),
            last_error: Mutex::new(None),
        }
    }

    pub fn record_arrival(&self) -> u64 {
        self.arrivals.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn arrivals(&self) -> u64 {
        self.arrivals.load(Ordering::Relaxed)
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        self.connection_state.store(state as u8, Ordering::Relaxed);
    }

    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.connection_state.load(Ordering::Relaxed))
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }
}

/// Owns the working batch. Size and latency triggers both funnel into the
/// same flush path: detach the buffer, install an empty one, hand the batch
/// to the sink worker queue. Awaiting the bounded queue send is the
/// backpressure that keeps memory bounded when the sink lags; the buffer
/// itself is never touched by any other task, so appends can never
/// interleave with the swap.
pub fn spawn_accumulator(
    mut rx: mpsc::Receiver<BatchCommand>,
    flush_tx: mpsc::Sender<Vec<IngestRecord>>,
    stats: Arc<IngestStats>,
    max_batch_size: usize,
    max_latency: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer: Vec<IngestRecord> = Vec::with_capacity(max_batch_size);
        let mut first_at: Option<Instant> = None;
        let latency_timer = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(latency_timer);

        loop {
            tokio::select! {
                _ = latency_timer.as_mut(), if first_at.is_some() => {
                    let age_ms = first_at.map(|at| at.elapsed().as_millis() as u64);
                    tracing::trace!(len = buffer.len(), age_ms, "batch latency reached");
                    flush_buffer(&mut buffer, &mut first_at, &flush_tx, &stats).await;
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(BatchCommand::Record(record)) => {
                            stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                            if buffer.is_empty() {
                                first_at = Some(Instant::now());
                                latency_timer.as_mut().reset(tokio::time::Instant::now() + max_latency);
                            }
                            buffer.push(record);
                            if buffer.len() >= max_batch_size {
                                flush_buffer(&mut buffer, &mut first_at, &flush_tx, &stats).await;
                            }
                        }
                        Some(BatchCommand::Flush(done)) => {
                            flush_buffer(&mut buffer, &mut first_at, &flush_tx, &stats).await;
                            let _ = done.send(());
                        }
                        None => {
                            flush_buffer(&mut buffer, &mut first_at, &flush_tx, &stats).await;
                            break;
                        }
                    }
                }
            }
        }
    })
}

async fn flush_buffer(
    buffer: &mut Vec<IngestRecord>,
    first_at: &mut Option<Instant>,
    flush_tx: &mpsc::Sender<Vec<IngestRecord>>,
    stats: &IngestStats,
) {
    *first_at = None;
    if buffer.is_empty() {
        return;
    }

    let batch = std::mem::take(buffer);
    let len = batch.len() as u64;
    stats.last_batch_len.store(len, Ordering::Relaxed);
    stats
        .last_flush_unix_ms
        .store(Utc::now().timestamp_millis() as u64, Ordering::Relaxed);
    stats.flushed_batches.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(len, "flushed batch");

    if flush_tx.send(batch).await.is_err() {
        tracing::warn!(len, "sink worker stopped; dropping flushed batch");
    }
}

/// Drains flushed batches in flush order and persists each with bounded
/// retries. A batch that exhausts its attempts is dropped from memory; it is
/// still recoverable from the journal.
pub fn spawn_sink_worker(
    mut rx: mpsc::Receiver<Vec<IngestRecord>>,
    sink: Arc<dyn Sink>,
    stats: Arc<IngestStats>,
    max_attempts: u32,
    retry_min: Duration,
    retry_max: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(batch) = rx.recv().await {
            persist_batch(&*sink, batch, &stats, max_attempts, retry_min, retry_max).await;
        }
    })
}

async fn persist_batch(
    sink: &dyn Sink,
    batch: Vec<IngestRecord>,
    stats: &IngestStats,
    max_attempts: u32,
    retry_min: Duration,
    retry_max: Duration,
) {
    let len = batch.len();
    stats.inflight_flushes.fetch_add(1, Ordering::Relaxed);
    let mut delay = retry_min;

    for attempt in 1..=max_attempts {
        match sink.save_batch(&batch).await {
            Ok(()) => {
                stats.clear_error();
                stats.inflight_flushes.fetch_sub(1, Ordering::Relaxed);
                tracing::debug!(len, attempt, "persisted batch");
                return;
            }
            Err(err) => {
                stats.record_error(err.to_string());
                tracing::warn!(error=%err, attempt, len, "sink write failed");
                if attempt < max_attempts {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(retry_max);
                }
            }
        }
    }

    stats.inflight_flushes.fetch_sub(1, Ordering::Relaxed);
    stats.sink_dropped.fetch_add(len as u64, Ordering::Relaxed);
    tracing::error!(
        len,
        "sink retries exhausted; dropping batch (recoverable from journal)"
    );
}
