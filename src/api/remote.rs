//! Prometheus remote write and remote read endpoints
//!
//! Both bodies are snappy block-compressed protobuf.

use super::prompb::{self, MatcherType};
use super::{ApiError, ApiState};
use crate::read::{LabelMatcher, MatchOp, ReadQuery, Series};
use crate::schema::Sample;
use crate::{Error, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use prost::Message;
use tracing::debug;

/// POST /write
pub async fn handle_write(
    State(state): State<ApiState>,
    body: Bytes,
) -> std::result::Result<StatusCode, ApiError> {
    let samples = decode_write_request(&body)?;
    let accepted = state.write.write(samples).await?;
    debug!(samples = accepted, "Remote write accepted");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /read
pub async fn handle_read(
    State(state): State<ApiState>,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let queries = decode_read_request(&body)?;
    let results = state.read.read_all(&queries).await?;
    let body = encode_read_response(results)?;
    Ok((
        [
            (CONTENT_TYPE, "application/x-protobuf"),
            (CONTENT_ENCODING, "snappy"),
        ],
        body,
    )
        .into_response())
}

/// Decompress and decode a write request into samples.
pub fn decode_write_request(body: &[u8]) -> Result<Vec<Sample>> {
    let raw = snap::raw::Decoder::new().decompress_vec(body)?;
    let request = prompb::WriteRequest::decode(raw.as_slice())?;

    let total: usize = request.timeseries.iter().map(|ts| ts.samples.len()).sum();
    let mut samples = Vec::with_capacity(total);
    for series in &request.timeseries {
        for point in &series.samples {
            let pairs = series
                .labels
                .iter()
                .map(|l| (l.name.as_str(), l.value.as_str()));
            samples.push(Sample::from_label_pairs(pairs, point.timestamp, point.value)?);
        }
    }
    Ok(samples)
}

/// Decompress and decode a read request into queries.
pub fn decode_read_request(body: &[u8]) -> Result<Vec<ReadQuery>> {
    let raw = snap::raw::Decoder::new().decompress_vec(body)?;
    let request = prompb::ReadRequest::decode(raw.as_slice())?;

    request
        .queries
        .into_iter()
        .map(|query| {
            let matchers = query
                .matchers
                .into_iter()
                .map(|m| {
                    let op = match MatcherType::try_from(m.r#type) {
                        Ok(MatcherType::Eq) => MatchOp::Equal,
                        Ok(MatcherType::Neq) => MatchOp::NotEqual,
                        Ok(MatcherType::Re) => MatchOp::RegexMatch,
                        Ok(MatcherType::Nre) => MatchOp::RegexNoMatch,
                        Err(_) => {
                            return Err(Error::InvalidQuery(format!(
                                "unknown matcher type {}",
                                m.r#type
                            )))
                        }
                    };
                    Ok(LabelMatcher::new(m.name, op, m.value))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(ReadQuery {
                start_ms: query.start_timestamp_ms,
                end_ms: query.end_timestamp_ms,
                matchers,
            })
        })
        .collect()
}

/// Encode per-query results as a compressed read response.
pub fn encode_read_response(results: Vec<Vec<Series>>) -> Result<Vec<u8>> {
    let response = prompb::ReadResponse {
        results: results
            .into_iter()
            .map(|series| prompb::QueryResult {
                timeseries: series.into_iter().map(to_timeseries).collect(),
            })
            .collect(),
    };
    snap::raw::Encoder::new()
        .compress_vec(&response.encode_to_vec())
        .map_err(|e| Error::Internal(format!("snappy encode failed: {}", e)))
}

fn to_timeseries(series: Series) -> prompb::TimeSeries {
    prompb::TimeSeries {
        labels: series
            .labels
            .into_iter()
            .map(|(name, value)| prompb::Label { name, value })
            .collect(),
        samples: series
            .points
            .into_iter()
            .map(|p| prompb::Sample {
                value: p.value,
                timestamp: p.timestamp_ms,
            })
            .collect(),
    }
}
