//! Bounded-size batching for bulk load destinations
//!
//! Producers enqueue from anywhere without blocking. A single consumer drains
//! the queue, splits the snapshot into chunks of at most `batch_size` and
//! sends them in order. Failed batches are dropped, never re-queued.

use crate::error::ClientError;
use crate::metering::SystemStatus;
use crate::observability::EtlMetrics;
use crate::shutdown::ShutdownSequence;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Default maximum items per batch
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default cadence of the background flush
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Destination that accepts whole batches
#[async_trait]
pub trait BatchSink<T>: Send + Sync {
    async fn authenticate(&self) -> Result<(), ClientError>;

    async fn send_batch(&self, batch: &[T]) -> Result<(), ClientError>;
}

/// Configuration for a load batcher
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Maximum items per batch, never zero
    pub batch_size: usize,
    /// Period of the background flush
    pub flush_interval: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

/// Outcome of one drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchRunReport {
    pub items_drained: usize,
    pub batches_sent: usize,
    pub batches_failed: usize,
}

impl BatchRunReport {
    pub fn is_success(&self) -> bool {
        self.batches_failed == 0
    }
}

/// Queue plus single consumer pushing bounded batches into a sink
pub struct LoadBatcher<T> {
    /// Process name used for metering, e.g. `load.bulk-1`
    name: String,
    config: BatcherConfig,
    sender: mpsc::UnboundedSender<T>,
    receiver: Mutex<mpsc::UnboundedReceiver<T>>,
    queued: AtomicUsize,
    sink: Arc<dyn BatchSink<T>>,
    status: Arc<SystemStatus>,
    shutdown: ShutdownSequence,
    metrics: EtlMetrics,
}

impl<T: Send + 'static> LoadBatcher<T> {
    pub fn new(
        name: impl Into<String>,
        config: BatcherConfig,
        sink: Arc<dyn BatchSink<T>>,
        status: Arc<SystemStatus>,
        shutdown: ShutdownSequence,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            config: BatcherConfig {
                batch_size: config.batch_size.max(1),
                ..config
            },
            sender,
            receiver: Mutex::new(receiver),
            queued: AtomicUsize::new(0),
            sink,
            status,
            shutdown,
            metrics: EtlMetrics::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Items waiting for the next drain
    pub fn pending(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Append items to the queue, returning how many were accepted
    pub fn enqueue(&self, items: impl IntoIterator<Item = T>) -> usize {
        let mut accepted = 0;
        for item in items {
            // Counted before the send so a concurrent drain cannot underflow
            self.queued.fetch_add(1, Ordering::SeqCst);
            if self.sender.send(item).is_ok() {
                accepted += 1;
            } else {
                self.queued.fetch_sub(1, Ordering::SeqCst);
            }
        }
        self.metrics
            .set_batcher_queued(&self.name, self.pending() as i64);
        accepted
    }

    /// Drain the queue and send everything in bounded batches
    ///
    /// Concurrent callers are serialized; each drain sees the items queued
    /// before it took the receiver.
    pub async fn run(&self) -> BatchRunReport {
        if self.shutdown.is_shutting_down() {
            debug!(batcher = %self.name, "Shutting down, skipping drain");
            return BatchRunReport::default();
        }

        let mut receiver = self.receiver.lock().await;
        let mut drained = Vec::new();
        while let Ok(item) = receiver.try_recv() {
            drained.push(item);
        }
        drop(receiver);

        let items_drained = drained.len();
        let queued = self.queued.fetch_sub(items_drained, Ordering::SeqCst) - items_drained;
        self.metrics.set_batcher_queued(&self.name, queued as i64);

        let mut report = BatchRunReport {
            items_drained,
            ..Default::default()
        };
        if drained.is_empty() {
            return report;
        }

        let batch_count = items_drained.div_ceil(self.config.batch_size);

        if let Err(e) = self.sink.authenticate().await {
            warn!(
                batcher = %self.name,
                error = %e,
                items = items_drained,
                "Authentication failed, dropping drained items"
            );
            if e.is_unauthorized() {
                self.status.authentication_failure(&self.name);
            } else {
                self.status.failed(&self.name);
            }
            report.batches_failed = batch_count;
            return report;
        }

        for (index, batch) in drained.chunks(self.config.batch_size).enumerate() {
            let start = Instant::now();
            match self.sink.send_batch(batch).await {
                Ok(()) => {
                    self.status.succeeded(&self.name);
                    report.batches_sent += 1;
                    debug!(batcher = %self.name, batch = index, size = batch.len(), "Batch sent");
                }
                Err(e) => {
                    warn!(
                        batcher = %self.name,
                        batch = index,
                        size = batch.len(),
                        error = %e,
                        "Batch send failed"
                    );
                    if e.is_unauthorized() {
                        self.status.authentication_failure(&self.name);
                    } else {
                        self.status.failed(&self.name);
                    }
                    report.batches_failed += 1;
                }
            }
            self.status.record_latency(&self.name, start.elapsed());
        }

        info!(
            batcher = %self.name,
            items = items_drained,
            batches_sent = report.batches_sent,
            batches_failed = report.batches_failed,
            "Drained load batcher"
        );
        report
    }

    /// Drain on a fixed cadence until shutdown
    pub async fn run_periodically(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.shutdown.is_shutting_down() {
                        break;
                    }
                    if self.pending() > 0 {
                        self.run().await;
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        debug!(batcher = %self.name, "Flush loop stopped");
    }
}
