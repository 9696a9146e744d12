//! Write throughput benchmark

use prometheus_es_adapter::clock::SystemClock;
use prometheus_es_adapter::lifecycle::{bootstrap_write_index, IndexConfig};
use prometheus_es_adapter::schema::{Document, Labels, Sample};
use prometheus_es_adapter::store::MemoryStore;
use prometheus_es_adapter::trigger::Thresholds;
use prometheus_es_adapter::writer::{WriteService, WriterConfig};

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

fn create_samples(count: usize) -> Vec<Sample> {
    (0..count)
        .map(|i| {
            let mut labels = Labels::new();
            labels.insert("instance".to_string(), format!("server-{:02}", i % 10));
            labels.insert("job".to_string(), "node".to_string());
            Sample::new("cpu_usage", labels, i as i64, (i % 100) as f64 / 100.0).unwrap()
        })
        .collect()
}

fn writer_config(max_count: u64, workers: usize) -> WriterConfig {
    WriterConfig {
        workers,
        batch: Thresholds {
            max_size_bytes: None,
            max_count: Some(max_count),
            max_age: Some(Duration::from_secs(10)),
        },
        ..WriterConfig::default()
    }
}

async fn write_all(config: WriterConfig, samples: Vec<Sample>) {
    let store = Arc::new(MemoryStore::new());
    bootstrap_write_index(store.as_ref(), &IndexConfig::default(), &SystemClock::new())
        .await
        .unwrap();
    let service = WriteService::start(config, store, "prom-metrics").unwrap();
    for chunk in samples.chunks(500) {
        service.write(chunk.to_vec()).await.unwrap();
    }
    service.shutdown().await.unwrap();
}

fn benchmark_write_pipeline(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let mut group = c.benchmark_group("write_pipeline");

    for count in [1_000, 10_000] {
        group.throughput(Throughput::Elements(count as u64));
        let samples = create_samples(count);

        for workers in [1, 4] {
            group.bench_function(format!("{}_samples_{}_workers", count, workers), |b| {
                b.to_async(&runtime).iter(|| {
                    write_all(writer_config(1000, workers), black_box(samples.clone()))
                });
            });
        }
    }

    group.finish();
}

fn benchmark_document_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("document_encoding");

    for count in [1_000, 10_000] {
        group.throughput(Throughput::Elements(count as u64));
        let samples = create_samples(count);

        group.bench_function(format!("{}_samples", count), |b| {
            b.iter(|| {
                for sample in &samples {
                    let doc = Document::from(sample);
                    black_box(serde_json::to_vec(&doc).unwrap());
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_write_pipeline, benchmark_document_encoding);

criterion_main!(benches);
