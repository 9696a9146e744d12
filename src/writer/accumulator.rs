//! Batch accumulator: the open batch and its flush triggers

use super::telemetry;
use super::{Batch, WriteStats};
use crate::schema::Sample;
use crate::trigger::{FlushTrigger, Thresholds, TriggerKind, TriggerPrecedence};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct OpenBatch {
    batch: Batch,
    closed: bool,
}

/// Collects samples into the open batch and hands closed batches to the
/// intake queue.
///
/// The lock around the open batch is only held to append and evaluate
/// triggers; queue handoff happens after it is released.
pub struct BatchAccumulator {
    thresholds: Thresholds,
    precedence: TriggerPrecedence,
    open: Mutex<OpenBatch>,
    sender: RwLock<Option<mpsc::Sender<Batch>>>,
    stats: Arc<WriteStats>,
}

impl BatchAccumulator {
    pub fn new(
        thresholds: Thresholds,
        precedence: TriggerPrecedence,
        sender: mpsc::Sender<Batch>,
        stats: Arc<WriteStats>,
    ) -> Self {
        Self {
            thresholds,
            precedence,
            open: Mutex::new(OpenBatch {
                batch: Batch::new(),
                closed: false,
            }),
            sender: RwLock::new(Some(sender)),
            stats,
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Batch>> {
        self.sender.read().clone().ok_or(Error::ShuttingDown)
    }

    /// Append a sample. If this closes the batch, waits until the intake
    /// queue has room for it and returns the trigger that fired.
    pub async fn add(&self, sample: Sample) -> Result<Option<FlushTrigger>> {
        let sender = self.sender()?;

        let closed = {
            let mut open = self.open.lock();
            if open.closed {
                return Err(Error::ShuttingDown);
            }
            open.batch.push(sample);
            let measured = open.batch.measurement(Instant::now());
            self.thresholds
                .evaluate(&measured, &self.precedence)
                .map(|trigger| (trigger, open.batch.take()))
        };
        self.stats.record_accepted();

        match closed {
            Some((trigger, batch)) => {
                self.hand_off(&sender, batch, Some(trigger)).await?;
                Ok(Some(trigger))
            }
            None => Ok(None),
        }
    }

    /// Like [`add`](Self::add) but never waits: when the sample would close
    /// the batch and the queue is full, the sample is not appended and
    /// [`Error::BufferFull`] is returned.
    pub fn try_add(&self, sample: Sample) -> Result<Option<FlushTrigger>> {
        let sender = self.sender()?;
        let mut open = self.open.lock();
        if open.closed {
            return Err(Error::ShuttingDown);
        }

        let projected = open
            .batch
            .measurement_with(sample.estimated_bytes() as u64, Instant::now());
        let Some(trigger) = self.thresholds.evaluate(&projected, &self.precedence) else {
            open.batch.push(sample);
            drop(open);
            self.stats.record_accepted();
            return Ok(None);
        };

        let permit = match sender.try_reserve() {
            Ok(permit) => permit,
            Err(TrySendError::Full(())) => {
                drop(open);
                self.stats.record_rejected();
                telemetry::record_backpressure_rejection();
                return Err(Error::BufferFull);
            }
            Err(TrySendError::Closed(())) => return Err(Error::ShuttingDown),
        };

        open.batch.push(sample);
        let batch = open.batch.take();
        drop(open);

        self.stats.record_accepted();
        self.record_flush(&batch, Some(&trigger));
        permit.send(batch);
        Ok(Some(trigger))
    }

    /// Close the open batch if it has reached its maximum age.
    pub async fn flush_expired(&self) -> Result<Option<FlushTrigger>> {
        let Ok(sender) = self.sender() else {
            return Ok(None);
        };

        let closed = {
            let mut open = self.open.lock();
            if open.closed {
                return Ok(None);
            }
            let measured = open.batch.measurement(Instant::now());
            self.thresholds
                .evaluate_only(&measured, &self.precedence, &[TriggerKind::Age])
                .map(|trigger| (trigger, open.batch.take()))
        };

        match closed {
            Some((trigger, batch)) => {
                self.hand_off(&sender, batch, Some(trigger)).await?;
                Ok(Some(trigger))
            }
            None => Ok(None),
        }
    }

    /// Background age check; returns when `shutdown` is cancelled.
    pub async fn run_age_timer(&self, period: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.flush_expired().await {
                        warn!(error = %e, "Age flush failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("Age timer stopped");
                    break;
                }
            }
        }
    }

    /// Stop accepting samples, hand off the partial batch and close the
    /// queue. A partial batch that cannot be queued before `deadline` is
    /// returned as [`Error::ShutdownLoss`].
    pub async fn close(&self, deadline: Instant) -> Result<()> {
        let sender = self.sender.write().take();
        let remainder = {
            let mut open = self.open.lock();
            open.closed = true;
            (!open.batch.is_empty()).then(|| open.batch.take())
        };

        let (Some(sender), Some(batch)) = (sender, remainder) else {
            return Ok(());
        };

        let samples = batch.len() as u64;
        match tokio::time::timeout_at(deadline, self.hand_off(&sender, batch, None)).await {
            Ok(result) => result,
            Err(_) => Err(Error::ShutdownLoss {
                batches: 1,
                samples,
            }),
        }
    }

    /// Samples in the open batch
    pub fn pending(&self) -> usize {
        self.open.lock().batch.len()
    }

    async fn hand_off(
        &self,
        sender: &mpsc::Sender<Batch>,
        batch: Batch,
        trigger: Option<FlushTrigger>,
    ) -> Result<()> {
        self.record_flush(&batch, trigger.as_ref());
        if let Err(mpsc::error::SendError(batch)) = sender.send(batch).await {
            warn!(samples = batch.len(), "Intake queue closed, batch not handed off");
            self.stats.record_shutdown_loss(1, batch.len() as u64);
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    fn record_flush(&self, batch: &Batch, trigger: Option<&FlushTrigger>) {
        let reason = trigger.map(FlushTrigger::reason).unwrap_or("shutdown");
        match trigger {
            Some(trigger) => info!(
                reason,
                samples = batch.len(),
                size_bytes = batch.size_bytes(),
                trigger = %trigger,
                "Flushing batch"
            ),
            None => info!(
                reason,
                samples = batch.len(),
                size_bytes = batch.size_bytes(),
                "Flushing partial batch"
            ),
        }
        self.stats.record_flush(trigger);
        telemetry::record_flush(reason, batch.len() as u64, batch.size_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Labels;
    use crate::trigger::Trigger;

    fn sample(ts: i64) -> Sample {
        Sample::new("up", Labels::new(), ts, 1.0).unwrap()
    }

    fn accumulator(
        max_count: u64,
        capacity: usize,
    ) -> (BatchAccumulator, mpsc::Receiver<Batch>, Arc<WriteStats>) {
        let (tx, rx) = mpsc::channel(capacity);
        let stats = Arc::new(WriteStats::default());
        let thresholds = Thresholds {
            max_size_bytes: None,
            max_count: Some(max_count),
            max_age: Some(Duration::from_secs(10)),
        };
        let acc = BatchAccumulator::new(thresholds, TriggerPrecedence::default(), tx, stats.clone());
        (acc, rx, stats)
    }

    #[tokio::test]
    async fn test_count_trigger_closes_batch() {
        let (acc, mut rx, _) = accumulator(3, 4);

        assert_eq!(acc.add(sample(1)).await.unwrap(), None);
        assert_eq!(acc.add(sample(2)).await.unwrap(), None);
        assert!(rx.try_recv().is_err());

        let trigger = acc.add(sample(3)).await.unwrap();
        assert_eq!(
            trigger,
            Some(Trigger::CountExceeded {
                threshold: 3,
                measured: 3
            })
        );
        assert_eq!(rx.try_recv().unwrap().len(), 3);
        assert_eq!(acc.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_expired_only_fires_on_age() {
        let (acc, mut rx, _) = accumulator(100, 4);

        assert_eq!(acc.flush_expired().await.unwrap(), None);

        acc.add(sample(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(acc.flush_expired().await.unwrap(), None);

        tokio::time::advance(Duration::from_secs(1)).await;
        let trigger = acc.flush_expired().await.unwrap().unwrap();
        assert_eq!(trigger.kind(), TriggerKind::Age);
        assert_eq!(rx.try_recv().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_batch_never_ages_out() {
        let (acc, mut rx, stats) = accumulator(100, 4);
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(acc.flush_expired().await.unwrap(), None);
        assert!(rx.try_recv().is_err());
        assert_eq!(stats.snapshot().batches_flushed, 0);
    }

    #[tokio::test]
    async fn test_try_add_rejects_when_queue_full() {
        let (acc, _rx, stats) = accumulator(1, 1);

        assert!(acc.try_add(sample(1)).unwrap().is_some());
        let err = acc.try_add(sample(2)).unwrap_err();
        assert!(matches!(err, Error::BufferFull));
        assert_eq!(acc.pending(), 0);
        assert_eq!(stats.snapshot().samples_rejected, 1);
        assert_eq!(stats.snapshot().samples_accepted, 1);
    }

    #[tokio::test]
    async fn test_close_flushes_partial_and_rejects_new_samples() {
        let (acc, mut rx, stats) = accumulator(10, 4);
        acc.add(sample(1)).await.unwrap();
        acc.add(sample(2)).await.unwrap();

        acc.close(Instant::now() + Duration::from_secs(1)).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().len(), 2);
        assert!(rx.recv().await.is_none());
        assert!(matches!(acc.add(sample(3)).await, Err(Error::ShuttingDown)));
        assert_eq!(stats.snapshot().flushes_on_close, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_reports_unqueued_remainder() {
        let (acc, _rx, _) = accumulator(2, 1);
        acc.add(sample(1)).await.unwrap();
        acc.add(sample(2)).await.unwrap();
        acc.add(sample(3)).await.unwrap();

        // The queue still holds the first batch, so the remainder cannot be queued.
        let err = acc
            .close(Instant::now() + Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ShutdownLoss {
                batches: 1,
                samples: 1
            }
        ));
    }
}
