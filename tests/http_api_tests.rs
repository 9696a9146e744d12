//! HTTP surface tests: remote write/read over the API router and the admin
//! probes, driven in-process against the in-memory store.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use prometheus_es_adapter::api::prompb;
use prometheus_es_adapter::clock::{Clock, SystemClock};
use prometheus_es_adapter::store::MemoryStore;
use prometheus_es_adapter::{Adapter, Config};
use prost::Message;
use std::sync::Arc;
use tower::ServiceExt;

async fn start_adapter() -> (Adapter, Arc<MemoryStore>) {
    let mut config = Config::default();
    config.writer.batch.max_count = Some(1);
    let store = Arc::new(MemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let adapter = Adapter::start(&config, store.clone(), clock).await.unwrap();
    (adapter, store)
}

fn compress(message: &impl Message) -> Vec<u8> {
    snap::raw::Encoder::new()
        .compress_vec(&message.encode_to_vec())
        .unwrap()
}

fn label(name: &str, value: &str) -> prompb::Label {
    prompb::Label {
        name: name.to_string(),
        value: value.to_string(),
    }
}

fn post(uri: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("Content-Type", "application/x-protobuf")
        .header("Content-Encoding", "snappy")
        .body(Body::from(body))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn call(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

fn write_request() -> prompb::WriteRequest {
    prompb::WriteRequest {
        timeseries: vec![prompb::TimeSeries {
            labels: vec![label("__name__", "up"), label("job", "api")],
            samples: vec![
                prompb::Sample {
                    value: 1.0,
                    timestamp: 1_000,
                },
                prompb::Sample {
                    value: 0.0,
                    timestamp: 2_000,
                },
            ],
        }],
    }
}

#[tokio::test]
async fn test_remote_write_then_read() {
    let (adapter, store) = start_adapter().await;
    let api = adapter.api_router();

    let (status, _) = call(&api, post("/write", compress(&write_request()))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // Drain so both samples are in the store before reading.
    adapter.shutdown().await.unwrap();
    assert_eq!(store.documents("prom-metrics-000001").len(), 2);

    let read = prompb::ReadRequest {
        queries: vec![prompb::Query {
            start_timestamp_ms: 0,
            end_timestamp_ms: 10_000,
            matchers: vec![prompb::LabelMatcher {
                r#type: prompb::MatcherType::Eq as i32,
                name: "job".to_string(),
                value: "api".to_string(),
            }],
        }],
    };
    let (status, body) = call(&api, post("/read", compress(&read))).await;
    assert_eq!(status, StatusCode::OK);

    let raw = snap::raw::Decoder::new().decompress_vec(&body).unwrap();
    let response = prompb::ReadResponse::decode(raw.as_slice()).unwrap();
    assert_eq!(response.results.len(), 1);
    let series = &response.results[0].timeseries;
    assert_eq!(series.len(), 1);
    assert_eq!(
        series[0].labels,
        vec![label("__name__", "up"), label("job", "api")]
    );
    let timestamps: Vec<i64> = series[0].samples.iter().map(|s| s.timestamp).collect();
    assert_eq!(timestamps, vec![1_000, 2_000]);
}

#[tokio::test]
async fn test_malformed_write_is_bad_request() {
    let (adapter, _store) = start_adapter().await;
    let api = adapter.api_router();

    let (status, _) = call(&api, post("/write", b"definitely not snappy".to_vec())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let nameless = prompb::WriteRequest {
        timeseries: vec![prompb::TimeSeries {
            labels: vec![label("job", "api")],
            samples: vec![prompb::Sample {
                value: 1.0,
                timestamp: 1,
            }],
        }],
    };
    let (status, _) = call(&api, post("/write", compress(&nameless))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    adapter.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_write_after_shutdown_is_unavailable() {
    let (adapter, _store) = start_adapter().await;
    let api = adapter.api_router();
    adapter.shutdown().await.unwrap();

    let (status, _) = call(&api, post("/write", compress(&write_request()))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_admin_probes_and_stats() {
    let (adapter, _store) = start_adapter().await;
    let api = adapter.api_router();
    let admin = adapter.admin_router(true);

    let (status, body) = call(&admin, get("/live")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");

    let (status, body) = call(&admin, get("/ready")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"READY");

    let (status, _) = call(&api, post("/write", compress(&write_request()))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = call(&admin, get("/stats")).await;
    assert_eq!(status, StatusCode::OK);
    let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(stats["write"]["samples_accepted"], 2);
    assert!(stats["lifecycle"].is_object());

    adapter.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stats_route_can_be_disabled() {
    let (adapter, _store) = start_adapter().await;
    let admin = adapter.admin_router(false);

    let (status, _) = call(&admin, get("/stats")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    adapter.shutdown().await.unwrap();
}
