//! Lifecycle telemetry instruments and recording helpers.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

struct LifecycleInstruments {
    cycles: Counter<u64>,
    rollovers: Counter<u64>,
    rollover_failures: Counter<u64>,
    rollover_duration_seconds: Histogram<f64>,
    write_index_docs: Histogram<u64>,
    write_index_bytes: Histogram<u64>,
}

fn instruments() -> &'static LifecycleInstruments {
    static INSTRUMENTS: OnceLock<LifecycleInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("prometheus_es_adapter.lifecycle");
        LifecycleInstruments {
            cycles: meter
                .u64_counter("adapter.lifecycle.cycles")
                .with_description("Lifecycle evaluations by outcome")
                .init(),
            rollovers: meter
                .u64_counter("adapter.lifecycle.rollovers")
                .with_description("Completed alias switches by reason")
                .init(),
            rollover_failures: meter
                .u64_counter("adapter.lifecycle.rollover.failures")
                .with_description("Failed rollover steps by stage")
                .init(),
            rollover_duration_seconds: meter
                .f64_histogram("adapter.lifecycle.rollover.duration")
                .with_description("Time from index creation to alias switch")
                .with_unit("s")
                .init(),
            write_index_docs: meter
                .u64_histogram("adapter.lifecycle.write_index.docs")
                .with_description("Document count of the write index at each evaluation")
                .init(),
            write_index_bytes: meter
                .u64_histogram("adapter.lifecycle.write_index.size")
                .with_description("Size of the write index at each evaluation")
                .with_unit("By")
                .init(),
        }
    })
}

pub fn record_cycle(outcome: &'static str) {
    instruments()
        .cycles
        .add(1, &[KeyValue::new("outcome", outcome)]);
}

pub fn record_write_index(docs: u64, bytes: u64) {
    let i = instruments();
    i.write_index_docs.record(docs, &[]);
    i.write_index_bytes.record(bytes, &[]);
}

pub fn record_rollover(reason: &'static str, duration_seconds: f64) {
    let i = instruments();
    i.rollovers.add(1, &[KeyValue::new("reason", reason)]);
    i.rollover_duration_seconds.record(duration_seconds, &[]);
}

pub fn record_rollover_failure(stage: &'static str) {
    instruments()
        .rollover_failures
        .add(1, &[KeyValue::new("stage", stage)]);
}
