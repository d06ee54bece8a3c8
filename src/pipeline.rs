use crate::config::SinkConfig;
use crate::mqtt::LinkState;
use crate::store::PointStore;
use crate::telemetry::Measurement;
use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::sync::{
    atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub enum SinkCommand {
    Measurement {
        measurement: Measurement,
        enqueued_at: Instant,
    },
    #[cfg_attr(not(test), allow(dead_code))]
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink writer is closed")]
    Closed,
}

/// Reported on the optional event channel so batch loss is never silent.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    BatchFailed {
        points: usize,
        attempts: u32,
        error: String,
    },
}

#[derive(Clone)]
pub struct SinkHandle {
    tx: mpsc::Sender<SinkCommand>,
    /// Set when `close()` is called, before the worker stops receiving.
    closing: Arc<AtomicBool>,
    stats: Arc<IngestStats>,
}

impl SinkHandle {
    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Waits for queue capacity; fails once the writer has started closing.
    pub async fn enqueue(&self, measurement: Measurement) -> Result<(), SinkError> {
        if self.is_closing() {
            return Err(SinkError::Closed);
        }
        tracing::trace!(
            device = %measurement.device_name(),
            sensor = %measurement.sensor_id(),
            "queueing measurement"
        );
        let command = SinkCommand::Measurement {
            measurement,
            enqueued_at: Instant::now(),
        };
        self.tx
            .send(command)
            .await
            .map_err(|_| SinkError::Closed)?;
        // Counted only once the queue has taken it; a producer parked on a
        // full queue is not part of the depth.
        self.stats.queue_depth.fetch_add(1, Ordering::Relaxed);
        self.stats
            .measurements_enqueued
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes everything enqueued before this call and waits for the write to finish.
    #[cfg_attr(not(test), allow(dead_code))]
    pub async fn flush(&self) -> Result<(), SinkError> {
        if self.is_closing() {
            return Err(SinkError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SinkCommand::Flush(tx))
            .await
            .map_err(|_| SinkError::Closed)?;
        rx.await.map_err(|_| SinkError::Closed)
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct IngestStats {
    /// Signed: the worker may take a command before its producer counts it.
    pub queue_depth: AtomicI64,
    pub last_flush_unix_ms: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub average_flush_micros: AtomicU64,
    pub inflight_flushes: AtomicU64,
    pub envelopes_received: AtomicU64,
    pub envelopes_skipped: AtomicU64,
    pub envelopes_malformed: AtomicU64,
    pub measurements_enqueued: AtomicU64,
    pub points_written: AtomicU64,
    pub batches_written: AtomicU64,
    pub flush_retries: AtomicU64,
    pub batches_failed: AtomicU64,
    pub points_dropped: AtomicU64,
    pub link_state: AtomicU8,
    pub last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub envelopes_received: u64,
    pub envelopes_skipped: u64,
    pub envelopes_malformed: u64,
    pub measurements_enqueued: u64,
    pub points_written: u64,
    pub batches_written: u64,
    pub flush_retries: u64,
    pub batches_failed: u64,
    pub points_dropped: u64,
    pub queue_depth: u64,
    pub inflight_flushes: u64,
    pub last_flush_unix_ms: u64,
    pub last_batch_len: u64,
    pub average_flush_micros: u64,
    pub link_state: LinkState,
    pub last_error: Option<String>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            queue_depth: AtomicI64::new(0),
            last_flush_unix_ms: AtomicU64::new(0),
            last_batch_len: AtomicU64::new(0),
            average_flush_micros: AtomicU64::new(0),
            inflight_flushes: AtomicU64::new(0),
            envelopes_received: AtomicU64::new(0),
            envelopes_skipped: AtomicU64::new(0),
            envelopes_malformed: AtomicU64::new(0),
            measurements_enqueued: AtomicU64::new(0),
            points_written: AtomicU64::new(0),
            batches_written: AtomicU64::new(0),
            flush_retries: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            points_dropped: AtomicU64::new(0),
            link_state: AtomicU8::new(LinkState::Disconnected as u8),
            last_error: Mutex::new(None),
        }
    }

    pub fn set_link_state(&self, state: LinkState) {
        self.link_state.store(state as u8, Ordering::Relaxed);
    }

    pub fn link_state(&self) -> LinkState {
        LinkState::from_u8(self.link_state.load(Ordering::Relaxed))
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

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            envelopes_received: load(&self.envelopes_received),
            envelopes_skipped: load(&self.envelopes_skipped),
            envelopes_malformed: load(&self.envelopes_malformed),
            measurements_enqueued: load(&self.measurements_enqueued),
            points_written: load(&self.points_written),
            batches_written: load(&self.batches_written),
            flush_retries: load(&self.flush_retries),
            batches_failed: load(&self.batches_failed),
            points_dropped: load(&self.points_dropped),
            queue_depth: self.queue_depth.load(Ordering::Relaxed).max(0) as u64,
            inflight_flushes: load(&self.inflight_flushes),
            last_flush_unix_ms: load(&self.last_flush_unix_ms),
            last_batch_len: load(&self.last_batch_len),
            average_flush_micros: load(&self.average_flush_micros),
            link_state: self.link_state(),
            last_error: self.last_error.lock().ok().and_then(|e| e.clone()),
        }
    }
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SinkSummary {
    pub points_written: u64,
    pub batches_written: u64,
    pub batches_failed: u64,
    pub points_dropped: u64,
}

#[derive(Debug, Clone)]
struct FlushPolicy {
    batch_size: usize,
    flush_interval: Duration,
    max_attempts: u32,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
}

impl FlushPolicy {
    fn from_config(config: &SinkConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval(),
            max_attempts: config.max_attempts.max(1),
            retry_base_delay: config.retry_base_delay(),
            retry_max_delay: config.retry_max_delay(),
        }
    }

    /// Delay before retry number `attempt` (1-based): base, 2x base, 4x base, ... capped.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.retry_base_delay
            .saturating_mul(factor)
            .min(self.retry_max_delay)
    }
}

/// Owns the flush task. Producers talk to it through cloned [`SinkHandle`]s.
pub struct SinkWriter {
    handle: SinkHandle,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

impl SinkWriter {
    pub fn spawn(
        store: Arc<dyn PointStore>,
        config: &SinkConfig,
        stats: Arc<IngestStats>,
        events: Option<mpsc::UnboundedSender<SinkEvent>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<SinkCommand>(config.max_queue.max(1));
        let cancel = CancellationToken::new();
        let policy = FlushPolicy::from_config(config);
        let worker = BatchWorker {
            store,
            stats: stats.clone(),
            events,
            batch: Vec::with_capacity(policy.batch_size),
            deadline: None,
            policy,
        };
        let worker = tokio::spawn(worker.run(rx, cancel.clone()));

        Self {
            handle: SinkHandle {
                tx,
                closing: Arc::new(AtomicBool::new(false)),
                stats,
            },
            cancel,
            worker,
        }
    }

    pub fn handle(&self) -> SinkHandle {
        self.handle.clone()
    }

    /// Stops accepting measurements as soon as it is called, then drains what
    /// was already accepted, performs the final flush and releases the store.
    /// An in-flight write is allowed to finish; dropping the returned future
    /// before it resolves leaves the drain running.
    pub fn close(self) -> impl Future<Output = SinkSummary> {
        tracing::info!("closing sink writer");
        let SinkWriter {
            handle,
            cancel,
            worker,
        } = self;
        handle.closing.store(true, Ordering::Release);
        cancel.cancel();
        Self::finish(handle, worker)
    }

    async fn finish(handle: SinkHandle, worker: JoinHandle<()>) -> SinkSummary {
        if let Err(err) = worker.await {
            tracing::error!(error=%err, "sink worker terminated abnormally");
        }

        let stats = &handle.stats;
        let summary = SinkSummary {
            points_written: stats.points_written.load(Ordering::Relaxed),
            batches_written: stats.batches_written.load(Ordering::Relaxed),
            batches_failed: stats.batches_failed.load(Ordering::Relaxed),
            points_dropped: stats.points_dropped.load(Ordering::Relaxed),
        };
        tracing::info!(
            points_written = summary.points_written,
            points_dropped = summary.points_dropped,
            batches_failed = summary.batches_failed,
            "sink writer closed"
        );
        summary
    }
}

struct BatchWorker {
    store: Arc<dyn PointStore>,
    stats: Arc<IngestStats>,
    events: Option<mpsc::UnboundedSender<SinkEvent>>,
    policy: FlushPolicy,
    batch: Vec<Measurement>,
    /// Flush deadline of the oldest buffered measurement.
    deadline: Option<Instant>,
}

impl BatchWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<SinkCommand>, cancel: CancellationToken) {
        loop {
            let deadline = self.deadline;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush("interval").await;
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(cmd) => self.apply(cmd).await,
                        None => break,
                    }
                }
            }
        }

        // Refuse new commands but keep everything already accepted.
        rx.close();
        while let Some(cmd) = rx.recv().await {
            self.apply(cmd).await;
        }
        self.flush("shutdown").await;

        if let Err(err) = self.store.close().await {
            tracing::warn!(error=%err, "failed to release point store");
        }
    }

    async fn apply(&mut self, cmd: SinkCommand) {
        match cmd {
            SinkCommand::Measurement {
                measurement,
                enqueued_at,
            } => {
                self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                if self.batch.is_empty() {
                    self.deadline = Some(enqueued_at + self.policy.flush_interval);
                }
                self.batch.push(measurement);
                if self.batch.len() >= self.policy.batch_size {
                    self.flush("batch size").await;
                }
            }
            SinkCommand::Flush(done) => {
                self.flush("on demand").await;
                let _ = done.send(());
            }
        }
    }

    async fn flush(&mut self, trigger: &'static str) {
        self.deadline = None;
        if self.batch.is_empty() {
            return;
        }

        let items = std::mem::replace(
            &mut self.batch,
            Vec::with_capacity(self.policy.batch_size),
        );
        let len = items.len();
        let started = std::time::Instant::now();
        self.stats.inflight_flushes.fetch_add(1, Ordering::Relaxed);

        let mut attempts = 0u32;
        let result = loop {
            attempts += 1;
            match self.store.write_batch(&items).await {
                Ok(()) => break Ok(()),
                Err(err) if err.is_transient() && attempts < self.policy.max_attempts => {
                    let delay = self.policy.backoff(attempts);
                    self.stats.flush_retries.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        error=%err,
                        attempt = attempts,
                        len,
                        delay_ms = delay.as_millis() as u64,
                        "batch write failed; retrying"
                    );
                    sleep(delay).await;
                }
                Err(err) => break Err(err),
            }
        };
        self.stats.inflight_flushes.fetch_sub(1, Ordering::Relaxed);

        match result {
            Ok(()) => {
                self.stats
                    .points_written
                    .fetch_add(len as u64, Ordering::Relaxed);
                self.stats.batches_written.fetch_add(1, Ordering::Relaxed);
                self.stats.last_batch_len.store(len as u64, Ordering::Relaxed);
                let now = Utc::now().timestamp_millis() as u64;
                self.stats.last_flush_unix_ms.store(now, Ordering::Relaxed);
                let micros = started.elapsed().as_micros() as u64;
                let prev = self.stats.average_flush_micros.load(Ordering::Relaxed);
                let avg = if prev == 0 {
                    micros
                } else {
                    (prev + micros) / 2
                };
                self.stats
                    .average_flush_micros
                    .store(avg, Ordering::Relaxed);
                self.stats.clear_error();
                tracing::debug!(len, micros, attempts, trigger, "flushed measurement batch");
            }
            Err(err) => {
                self.stats.record_error(err.to_string());
                self.stats.batches_failed.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .points_dropped
                    .fetch_add(len as u64, Ordering::Relaxed);
                tracing::warn!(
                    error=%err,
                    len,
                    attempts,
                    trigger,
                    "giving up on measurement batch"
                );
                if let Some(events) = &self.events {
                    let _ = events.send(SinkEvent::BatchFailed {
                        points: len,
                        attempts,
                        error: err.to_string(),
                    });
                }
            }
        }
    }
}
