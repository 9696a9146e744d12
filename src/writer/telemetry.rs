//! Write pipeline telemetry instruments and recording helpers.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

struct WriterInstruments {
    samples_accepted: Counter<u64>,
    backpressure_rejections: Counter<u64>,
    flush_triggers: Counter<u64>,
    flush_samples: Histogram<u64>,
    flush_bytes: Histogram<u64>,
    bulk_duration_seconds: Histogram<f64>,
    bulk_outcomes: Counter<u64>,
    samples_written: Counter<u64>,
    samples_dropped: Counter<u64>,
    retries: Counter<u64>,
    batches_failed: Counter<u64>,
    shutdown_lost_samples: Counter<u64>,
}

fn instruments() -> &'static WriterInstruments {
    static INSTRUMENTS: OnceLock<WriterInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("prometheus_es_adapter.writer");
        WriterInstruments {
            samples_accepted: meter
                .u64_counter("adapter.writer.samples.accepted")
                .with_description("Samples accepted into the batch accumulator")
                .init(),
            backpressure_rejections: meter
                .u64_counter("adapter.writer.backpressure.rejections")
                .with_description("Samples rejected because the intake queue was full")
                .init(),
            flush_triggers: meter
                .u64_counter("adapter.writer.flush.triggers")
                .with_description("Batch flushes by trigger reason")
                .init(),
            flush_samples: meter
                .u64_histogram("adapter.writer.flush.samples")
                .with_description("Samples per flushed batch")
                .init(),
            flush_bytes: meter
                .u64_histogram("adapter.writer.flush.bytes")
                .with_description("Estimated bytes per flushed batch")
                .with_unit("By")
                .init(),
            bulk_duration_seconds: meter
                .f64_histogram("adapter.writer.bulk.duration")
                .with_description("Bulk request duration")
                .with_unit("s")
                .init(),
            bulk_outcomes: meter
                .u64_counter("adapter.writer.bulk.outcomes")
                .with_description("Bulk request outcomes")
                .init(),
            samples_written: meter
                .u64_counter("adapter.writer.samples.written")
                .with_description("Samples accepted by the store")
                .init(),
            samples_dropped: meter
                .u64_counter("adapter.writer.samples.dropped")
                .with_description("Samples permanently rejected by the store")
                .init(),
            retries: meter
                .u64_counter("adapter.writer.bulk.retries")
                .with_description("Bulk write retries")
                .init(),
            batches_failed: meter
                .u64_counter("adapter.writer.batches.failed")
                .with_description("Batches that exhausted their retries")
                .init(),
            shutdown_lost_samples: meter
                .u64_counter("adapter.writer.shutdown.lost_samples")
                .with_description("Samples left undrained at the shutdown deadline")
                .init(),
        }
    })
}

pub fn record_samples_accepted(count: u64) {
    instruments().samples_accepted.add(count, &[]);
}

pub fn record_backpressure_rejection() {
    instruments().backpressure_rejections.add(1, &[]);
}

pub fn record_flush(reason: &'static str, samples: u64, bytes: u64) {
    let i = instruments();
    i.flush_triggers.add(1, &[KeyValue::new("reason", reason)]);
    i.flush_samples.record(samples, &[]);
    i.flush_bytes.record(bytes, &[]);
}

pub fn record_bulk(outcome: &'static str, duration_seconds: f64) {
    let i = instruments();
    i.bulk_outcomes.add(1, &[KeyValue::new("outcome", outcome)]);
    i.bulk_duration_seconds.record(duration_seconds, &[]);
}

pub fn record_written(samples: u64) {
    instruments().samples_written.add(samples, &[]);
}

pub fn record_dropped(samples: u64) {
    instruments().samples_dropped.add(samples, &[]);
}

pub fn record_retry() {
    instruments().retries.add(1, &[]);
}

pub fn record_batch_failed() {
    instruments().batches_failed.add(1, &[]);
}

pub fn record_shutdown_loss(samples: u64) {
    instruments().shutdown_lost_samples.add(samples, &[]);
}
