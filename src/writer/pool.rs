//! Flush workers: bulk writes with retry and partial-failure handling

use super::telemetry;
use super::{Backoff, Batch, FailureChannel, FailureEvent, WriteStats, WriterConfig};
use crate::schema::Document;
use crate::store::{with_deadline, DocumentOutcome, StoreClient};
use crate::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What happened to the samples of one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub written: u64,
    /// Permanently rejected documents
    pub dropped: u64,
    /// Samples still unwritten after the last attempt
    pub failed: u64,
    /// Bulk requests issued, including the first
    pub attempts: u32,
}

/// Writes one batch to the store, retrying transient failures.
pub struct BatchWriter {
    store: Arc<dyn StoreClient>,
    target: String,
    max_retries: u32,
    backoff: Backoff,
    request_timeout: Duration,
    stats: Arc<WriteStats>,
    failures: FailureChannel,
}

impl BatchWriter {
    pub fn new(
        store: Arc<dyn StoreClient>,
        target: String,
        config: &WriterConfig,
        stats: Arc<WriteStats>,
        failures: FailureChannel,
    ) -> Self {
        Self {
            store,
            target,
            max_retries: config.max_retries,
            backoff: config.backoff,
            request_timeout: config.request_timeout,
            stats,
            failures,
        }
    }

    /// Write `batch`. Retryable documents are resubmitted as a smaller
    /// batch; permanent rejections are dropped and reported. Whatever is
    /// left after `max_retries` retries is reported as failed.
    pub async fn write(&self, batch: Batch) -> BatchOutcome {
        let unsettled = AtomicU64::new(batch.len() as u64);
        self.write_tracked(batch, &unsettled).await
    }

    /// Like [`write`](Self::write), keeping `unsettled` at the number of
    /// documents not yet written, dropped or failed.
    pub async fn write_tracked(&self, batch: Batch, unsettled: &AtomicU64) -> BatchOutcome {
        let mut pending = batch.documents();
        let mut outcome = BatchOutcome::default();
        unsettled.store(pending.len() as u64, Ordering::Relaxed);

        loop {
            outcome.attempts += 1;
            let error = match self.attempt(&pending).await {
                Ok(results) => {
                    let retry = self.settle(pending, results, &mut outcome);
                    unsettled.store(retry.len() as u64, Ordering::Relaxed);
                    if retry.is_empty() {
                        return outcome;
                    }
                    pending = retry;
                    format!("{} documents rejected as retryable", pending.len())
                }
                Err(e) if e.is_transient() => e.to_string(),
                Err(e) => {
                    error!(alias = %self.target, error = %e, "Bulk write failed permanently");
                    self.fail(pending.len() as u64, &mut outcome, e.to_string());
                    unsettled.store(0, Ordering::Relaxed);
                    return outcome;
                }
            };

            if outcome.attempts > self.max_retries {
                self.fail(pending.len() as u64, &mut outcome, error);
                unsettled.store(0, Ordering::Relaxed);
                return outcome;
            }

            let delay = self.backoff.delay(outcome.attempts);
            debug!(
                attempt = outcome.attempts,
                documents = pending.len(),
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying bulk write"
            );
            self.stats.record_retry();
            telemetry::record_retry();
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt(&self, docs: &[Document]) -> Result<Vec<DocumentOutcome>> {
        let started = std::time::Instant::now();
        let result = with_deadline(
            "bulk",
            self.request_timeout,
            self.store.bulk(&self.target, docs),
        )
        .await
        .and_then(|response| {
            if response.items.len() == docs.len() {
                Ok(response)
            } else {
                Err(Error::Internal(format!(
                    "bulk returned {} outcomes for {} documents",
                    response.items.len(),
                    docs.len()
                )))
            }
        });

        let elapsed = started.elapsed().as_secs_f64();
        match &result {
            Ok(response) if response.has_failures() => telemetry::record_bulk("partial", elapsed),
            Ok(_) => telemetry::record_bulk("success", elapsed),
            Err(_) => telemetry::record_bulk("error", elapsed),
        }
        result.map(|response| response.items)
    }

    /// Count accepted and dropped documents; return the ones to retry.
    fn settle(
        &self,
        docs: Vec<Document>,
        results: Vec<DocumentOutcome>,
        outcome: &mut BatchOutcome,
    ) -> Vec<Document> {
        let mut written = 0u64;
        let mut dropped = 0u64;
        let mut first_reason = None;
        let mut retry = Vec::new();

        for (doc, result) in docs.into_iter().zip(results) {
            match result {
                DocumentOutcome::Accepted => written += 1,
                DocumentOutcome::RetryableFailure(_) => retry.push(doc),
                DocumentOutcome::PermanentFailure(reason) => {
                    dropped += 1;
                    if first_reason.is_none() {
                        first_reason = Some(reason);
                    }
                }
            }
        }

        outcome.written += written;
        self.stats.record_written(written);
        telemetry::record_written(written);

        if dropped > 0 {
            let reason = first_reason.unwrap_or_default();
            warn!(alias = %self.target, dropped, reason = %reason, "Store rejected documents");
            outcome.dropped += dropped;
            self.stats.record_dropped(dropped);
            telemetry::record_dropped(dropped);
            self.failures.publish(FailureEvent::DocumentsDropped {
                target: self.target.clone(),
                count: dropped,
                reason,
            });
        }

        retry
    }

    fn fail(&self, samples: u64, outcome: &mut BatchOutcome, error: String) {
        error!(
            alias = %self.target,
            samples,
            attempts = outcome.attempts,
            error = %error,
            "Batch failed"
        );
        outcome.failed += samples;
        self.stats.record_failed(samples);
        telemetry::record_batch_failed();
        self.failures.publish(FailureEvent::BatchFailed {
            target: self.target.clone(),
            samples,
            attempts: outcome.attempts,
            error,
        });
    }
}

/// Batches and samples the drain could not write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub lost_batches: u64,
    pub lost_samples: u64,
}

#[derive(Debug, Default)]
struct LossCounter {
    batches: AtomicU64,
    samples: AtomicU64,
}

impl LossCounter {
    fn record(&self, samples: u64) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.samples.fetch_add(samples, Ordering::Relaxed);
    }
}

/// Fixed set of workers consuming the intake queue.
pub struct FlushWorkerPool {
    receiver: Arc<Mutex<mpsc::Receiver<Batch>>>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    lost: Arc<LossCounter>,
}

impl FlushWorkerPool {
    /// Spawn `workers` tasks sharing `receiver`.
    pub fn start(workers: usize, receiver: mpsc::Receiver<Batch>, writer: Arc<BatchWriter>) -> Self {
        let receiver = Arc::new(Mutex::new(receiver));
        let cancel = CancellationToken::new();
        let lost = Arc::new(LossCounter::default());

        let handles = (0..workers)
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    receiver.clone(),
                    writer.clone(),
                    cancel.clone(),
                    lost.clone(),
                ))
            })
            .collect();

        Self {
            receiver,
            workers: parking_lot::Mutex::new(handles),
            cancel,
            lost,
        }
    }

    /// Wait for the workers to empty the queue once every sender is gone.
    ///
    /// After `timeout` the workers are cancelled; their in-flight batches
    /// and whatever is still queued are reported as lost.
    pub async fn drain(&self, timeout: Duration) -> DrainReport {
        let handles = std::mem::take(&mut *self.workers.lock());
        let mut joined = Box::pin(futures::future::join_all(handles));

        if tokio::time::timeout(timeout, &mut joined).await.is_err() {
            warn!(timeout_ms = timeout.as_millis() as u64, "Drain deadline passed, cancelling workers");
            self.cancel.cancel();
            for result in joined.await {
                if let Err(e) = result {
                    error!(error = %e, "Flush worker panicked");
                }
            }
        }

        let mut receiver = self.receiver.lock().await;
        receiver.close();
        while let Ok(batch) = receiver.try_recv() {
            self.lost.record(batch.len() as u64);
        }

        DrainReport {
            lost_batches: self.lost.batches.load(Ordering::Relaxed),
            lost_samples: self.lost.samples.load(Ordering::Relaxed),
        }
    }
}

async fn run_worker(
    id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Batch>>>,
    writer: Arc<BatchWriter>,
    cancel: CancellationToken,
    lost: Arc<LossCounter>,
) {
    debug!(worker = id, "Flush worker started");
    loop {
        let next = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                batch = receiver.recv() => batch,
            }
        };
        let Some(batch) = next else {
            break;
        };

        // Documents an earlier attempt stored are not lost on cancel.
        let unsettled = AtomicU64::new(batch.len() as u64);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let samples = unsettled.load(Ordering::Relaxed);
                if samples > 0 {
                    lost.record(samples);
                }
                break;
            }
            _ = writer.write_tracked(batch, &unsettled) => {}
        }
    }
    info!(worker = id, "Flush worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Labels, Sample};
    use crate::store::{CreateIndexRequest, MemoryStore};

    async fn store_with_index() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .create_index(
                "prom-metrics-000001",
                &CreateIndexRequest {
                    settings: None,
                    write_alias: Some("prom-metrics".to_string()),
                },
            )
            .await
            .unwrap();
        store
    }

    fn batch(values: &[f64]) -> Batch {
        let mut batch = Batch::new();
        for (i, value) in values.iter().enumerate() {
            batch.push(Sample::new("up", Labels::new(), i as i64, *value).unwrap());
        }
        batch
    }

    fn writer(store: Arc<MemoryStore>, max_retries: u32) -> (BatchWriter, Arc<WriteStats>) {
        let stats = Arc::new(WriteStats::default());
        let config = WriterConfig {
            max_retries,
            backoff: Backoff {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(40),
            },
            ..WriterConfig::default()
        };
        let writer = BatchWriter::new(
            store,
            "prom-metrics".to_string(),
            &config,
            stats.clone(),
            FailureChannel::new(16),
        );
        (writer, stats)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_documents_are_resubmitted() {
        let store = store_with_index().await;
        store.faults().reject_next_documents(2);
        let (writer, stats) = writer(store.clone(), 3);

        let outcome = writer.write(batch(&[1.0, 2.0, 3.0])).await;

        assert_eq!(outcome.written, 3);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(store.documents("prom-metrics-000001").len(), 3);
        assert_eq!(stats.snapshot().retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_rejections_are_dropped_not_retried() {
        let store = store_with_index().await;
        let (writer, stats) = writer(store.clone(), 3);

        let outcome = writer.write(batch(&[1.0, f64::NAN, 2.0])).await;

        assert_eq!(
            outcome,
            BatchOutcome {
                written: 2,
                dropped: 1,
                failed: 0,
                attempts: 1
            }
        );
        assert_eq!(stats.snapshot().samples_dropped, 1);
        assert_eq!(store.bulk_requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsettled_count_tracks_retry_list() {
        let store = store_with_index().await;
        store.faults().reject_next_documents(1);
        let (writer, _stats) = writer(store.clone(), 3);
        let unsettled = AtomicU64::new(0);

        let write = writer.write_tracked(batch(&[1.0, 2.0, 3.0]), &unsettled);
        tokio::pin!(write);
        // First attempt settles two documents, then sleeps in backoff.
        assert!(
            tokio::time::timeout(Duration::from_millis(5), &mut write)
                .await
                .is_err()
        );
        assert_eq!(unsettled.load(Ordering::Relaxed), 1);

        let outcome = write.await;
        assert_eq!(outcome.written, 3);
        assert_eq!(unsettled.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_error_fails_without_retry() {
        let store = Arc::new(MemoryStore::new());
        let (writer, stats) = writer(store.clone(), 3);

        // No index or alias exists, so the store answers 404.
        let outcome = writer.write(batch(&[1.0])).await;

        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(stats.snapshot().batches_failed, 1);
    }
}
