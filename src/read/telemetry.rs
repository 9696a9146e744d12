//! Read-path telemetry instruments and recording helpers.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

struct ReadInstruments {
    query_requests: Counter<u64>,
    query_duration_seconds: Histogram<f64>,
    query_docs_returned: Histogram<u64>,
}

fn instruments() -> &'static ReadInstruments {
    static INSTRUMENTS: OnceLock<ReadInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("prometheus_es_adapter.read");
        ReadInstruments {
            query_requests: meter
                .u64_counter("adapter.read.requests")
                .with_description("Read queries by outcome")
                .init(),
            query_duration_seconds: meter
                .f64_histogram("adapter.read.duration")
                .with_description("Read query latency")
                .with_unit("s")
                .init(),
            query_docs_returned: meter
                .u64_histogram("adapter.read.docs_returned")
                .with_description("Documents returned per read query")
                .init(),
        }
    })
}

pub fn record_query(outcome: &'static str, duration_seconds: f64, docs: u64) {
    let i = instruments();
    let attrs = [KeyValue::new("outcome", outcome)];
    i.query_requests.add(1, &attrs);
    i.query_duration_seconds.record(duration_seconds, &attrs);
    i.query_docs_returned.record(docs, &[]);
}
