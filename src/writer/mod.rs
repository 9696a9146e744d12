//! Write pipeline
//!
//! Samples flow through three stages:
//! - [`BatchAccumulator`] appends them to the open batch and closes it when a
//!   size, count or age limit is reached
//! - a bounded queue hands closed batches off; a full queue makes `add` wait
//! - [`FlushWorkerPool`] workers bulk-write batches to the write alias with
//!   retry, reporting anything that could not be written
//!
//! [`WriteService`] wires the stages together and owns the age timer and the
//! shutdown drain.

mod accumulator;
mod batch;
mod events;
mod pool;
pub(crate) mod telemetry;

pub use accumulator::BatchAccumulator;
pub use batch::Batch;
pub use events::{FailureChannel, FailureEvent};
pub use pool::{BatchOutcome, BatchWriter, DrainReport, FlushWorkerPool};

use crate::schema::Sample;
use crate::store::StoreClient;
use crate::trigger::{Thresholds, Trigger, TriggerKind, TriggerPrecedence};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Configuration for the write pipeline
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Number of concurrent flush workers
    pub workers: usize,
    /// Batch flush limits
    pub batch: Thresholds,
    /// Order in which simultaneously exceeded limits are reported
    pub precedence: TriggerPrecedence,
    /// How often the age timer inspects the open batch
    pub age_check_interval: Duration,
    /// Closed batches that may wait for a worker before `add` blocks
    pub queue_capacity: usize,
    /// Retries after the first bulk attempt
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Deadline for a single bulk request
    pub request_timeout: Duration,
    /// Time allowed for draining the queue at shutdown
    pub drain_timeout: Duration,
    pub failure_channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            batch: Thresholds {
                max_size_bytes: Some(4096),
                max_count: Some(1000),
                max_age: Some(Duration::from_secs(10)),
            },
            precedence: TriggerPrecedence::default(),
            age_check_interval: Duration::from_secs(1),
            queue_capacity: 16,
            max_retries: 3,
            backoff: Backoff::default(),
            request_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
            failure_channel_capacity: 1024,
        }
    }
}

impl WriterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("at least one flush worker is required".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue capacity must be positive".to_string()));
        }
        if self.age_check_interval.is_zero() {
            return Err(Error::Config("age check interval must be positive".to_string()));
        }
        self.batch.validate("batch")
    }
}

/// Exponential backoff between bulk attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
        }
    }
}

impl Backoff {
    /// Delay before retry number `retry` (1-based): `initial * 2^(retry-1)`, capped at `max`.
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(20);
        self.initial
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Write path counters shared by the accumulator and the workers
#[derive(Debug, Default)]
pub struct WriteStats {
    samples_accepted: AtomicU64,
    samples_rejected: AtomicU64,
    batches_flushed: AtomicU64,
    flushes_by_size: AtomicU64,
    flushes_by_count: AtomicU64,
    flushes_by_age: AtomicU64,
    flushes_on_close: AtomicU64,
    samples_written: AtomicU64,
    samples_dropped: AtomicU64,
    retries: AtomicU64,
    batches_failed: AtomicU64,
    samples_failed: AtomicU64,
    shutdown_lost_batches: AtomicU64,
    shutdown_lost_samples: AtomicU64,
}

/// Point-in-time copy of [`WriteStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteStatsSnapshot {
    pub samples_accepted: u64,
    pub samples_rejected: u64,
    pub batches_flushed: u64,
    pub flushes_by_size: u64,
    pub flushes_by_count: u64,
    pub flushes_by_age: u64,
    pub flushes_on_close: u64,
    pub samples_written: u64,
    pub samples_dropped: u64,
    pub retries: u64,
    pub batches_failed: u64,
    pub samples_failed: u64,
    pub shutdown_lost_batches: u64,
    pub shutdown_lost_samples: u64,
}

impl WriteStats {
    pub(crate) fn record_accepted(&self) {
        self.samples_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.samples_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self, trigger: Option<&Trigger>) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        let counter = match trigger.map(Trigger::kind) {
            Some(TriggerKind::Size) => &self.flushes_by_size,
            Some(TriggerKind::Count) => &self.flushes_by_count,
            Some(TriggerKind::Age) => &self.flushes_by_age,
            None => &self.flushes_on_close,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_written(&self, samples: u64) {
        self.samples_written.fetch_add(samples, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self, samples: u64) {
        self.samples_dropped.fetch_add(samples, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self, samples: u64) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
        self.samples_failed.fetch_add(samples, Ordering::Relaxed);
    }

    pub(crate) fn record_shutdown_loss(&self, batches: u64, samples: u64) {
        self.shutdown_lost_batches.fetch_add(batches, Ordering::Relaxed);
        self.shutdown_lost_samples.fetch_add(samples, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WriteStatsSnapshot {
        WriteStatsSnapshot {
            samples_accepted: self.samples_accepted.load(Ordering::Relaxed),
            samples_rejected: self.samples_rejected.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            flushes_by_size: self.flushes_by_size.load(Ordering::Relaxed),
            flushes_by_count: self.flushes_by_count.load(Ordering::Relaxed),
            flushes_by_age: self.flushes_by_age.load(Ordering::Relaxed),
            flushes_on_close: self.flushes_on_close.load(Ordering::Relaxed),
            samples_written: self.samples_written.load(Ordering::Relaxed),
            samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            samples_failed: self.samples_failed.load(Ordering::Relaxed),
            shutdown_lost_batches: self.shutdown_lost_batches.load(Ordering::Relaxed),
            shutdown_lost_samples: self.shutdown_lost_samples.load(Ordering::Relaxed),
        }
    }
}

/// Running write pipeline: accumulator, age timer and worker pool.
pub struct WriteService {
    accumulator: Arc<BatchAccumulator>,
    pool: FlushWorkerPool,
    timer: Mutex<Option<JoinHandle<()>>>,
    timer_shutdown: CancellationToken,
    stats: Arc<WriteStats>,
    failures: FailureChannel,
    drain_timeout: Duration,
}

impl WriteService {
    /// Start the pipeline writing to `target`, normally the write alias.
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: WriterConfig,
        store: Arc<dyn StoreClient>,
        target: impl Into<String>,
    ) -> Result<Self> {
        config.validate()?;
        let target = target.into();

        let stats = Arc::new(WriteStats::default());
        let failures = FailureChannel::new(config.failure_channel_capacity);
        let (sender, receiver) = mpsc::channel(config.queue_capacity);

        let accumulator = Arc::new(BatchAccumulator::new(
            config.batch,
            config.precedence,
            sender,
            stats.clone(),
        ));
        let writer = Arc::new(BatchWriter::new(
            store,
            target.clone(),
            &config,
            stats.clone(),
            failures.clone(),
        ));
        let pool = FlushWorkerPool::start(config.workers, receiver, writer);

        let timer_shutdown = CancellationToken::new();
        let timer = {
            let accumulator = accumulator.clone();
            let token = timer_shutdown.clone();
            let interval = config.age_check_interval;
            tokio::spawn(async move { accumulator.run_age_timer(interval, token).await })
        };

        info!(
            alias = %target,
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "Write service started"
        );

        Ok(Self {
            accumulator,
            pool,
            timer: Mutex::new(Some(timer)),
            timer_shutdown,
            stats,
            failures,
            drain_timeout: config.drain_timeout,
        })
    }

    /// Add samples, waiting for queue capacity when needed.
    pub async fn write(&self, samples: Vec<Sample>) -> Result<usize> {
        let count = samples.len();
        for sample in samples {
            self.accumulator.add(sample).await?;
        }
        telemetry::record_samples_accepted(count as u64);
        Ok(count)
    }

    pub fn accumulator(&self) -> &Arc<BatchAccumulator> {
        &self.accumulator
    }

    pub fn stats(&self) -> WriteStatsSnapshot {
        self.stats.snapshot()
    }

    /// Subscribe to the operator-facing failure channel
    pub fn subscribe_failures(&self) -> broadcast::Receiver<FailureEvent> {
        self.failures.subscribe()
    }

    /// Stop accepting samples, flush the open batch and drain the queue.
    ///
    /// Anything not written by the drain deadline is counted, published as a
    /// [`FailureEvent::ShutdownLoss`] and returned as [`Error::ShutdownLoss`].
    pub async fn shutdown(&self) -> Result<()> {
        let deadline = Instant::now() + self.drain_timeout;

        self.timer_shutdown.cancel();
        let timer = self.timer.lock().take();
        if let Some(timer) = timer {
            let _ = timer.await;
        }

        let mut report = DrainReport::default();
        if let Err(Error::ShutdownLoss { batches, samples }) = self.accumulator.close(deadline).await
        {
            report.lost_batches += batches;
            report.lost_samples += samples;
        }

        let drained = self
            .pool
            .drain(deadline.saturating_duration_since(Instant::now()))
            .await;
        report.lost_batches += drained.lost_batches;
        report.lost_samples += drained.lost_samples;

        if report.lost_batches == 0 {
            info!(stats = ?self.stats.snapshot(), "Write service drained");
            return Ok(());
        }

        self.stats
            .record_shutdown_loss(report.lost_batches, report.lost_samples);
        telemetry::record_shutdown_loss(report.lost_samples);
        self.failures.publish(FailureEvent::ShutdownLoss {
            batches: report.lost_batches,
            samples: report.lost_samples,
        });
        error!(
            lost_batches = report.lost_batches,
            lost_samples = report.lost_samples,
            "Shutdown deadline passed with undrained batches"
        );
        Err(Error::ShutdownLoss {
            batches: report.lost_batches,
            samples: report.lost_samples,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(500));
        assert_eq!(backoff.delay(64), Duration::from_millis(500));
    }

    #[test]
    fn test_config_validation() {
        assert!(WriterConfig::default().validate().is_ok());

        let no_workers = WriterConfig {
            workers: 0,
            ..WriterConfig::default()
        };
        assert!(no_workers.validate().is_err());

        let zero_docs = WriterConfig {
            batch: Thresholds {
                max_count: Some(0),
                ..WriterConfig::default().batch
            },
            ..WriterConfig::default()
        };
        assert!(zero_docs.validate().is_err());
    }

    #[test]
    fn test_stats_count_flush_reasons() {
        let stats = WriteStats::default();
        stats.record_flush(Some(&Trigger::CountExceeded {
            threshold: 3,
            measured: 3,
        }));
        stats.record_flush(None);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.batches_flushed, 2);
        assert_eq!(snapshot.flushes_by_count, 1);
        assert_eq!(snapshot.flushes_on_close, 1);
    }
}
