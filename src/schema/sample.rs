//! Immutable time-series sample

use crate::{Error, Result};
use std::collections::BTreeMap;

/// Label carrying the metric name in Prometheus label sets
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Label set with unique, ordered keys
pub type Labels = BTreeMap<String, String>;

/// Fixed per-document overhead of the bulk encoding: action line, field
/// names, punctuation and the number literals.
const DOCUMENT_OVERHEAD_BYTES: usize = 96;
/// Quotes, colon and comma around each label pair
const LABEL_PAIR_OVERHEAD_BYTES: usize = 6;

/// A single sample: metric name, labels, millisecond timestamp, value.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    metric: String,
    labels: Labels,
    timestamp_ms: i64,
    value: f64,
}

impl Sample {
    /// Create a sample. `labels` must not contain `__name__`; the metric
    /// name is passed separately.
    pub fn new(
        metric: impl Into<String>,
        labels: Labels,
        timestamp_ms: i64,
        value: f64,
    ) -> Result<Self> {
        let metric = metric.into();
        if metric.is_empty() {
            return Err(Error::MissingMetricName);
        }
        if labels.contains_key(METRIC_NAME_LABEL) {
            return Err(Error::InvalidSample(format!(
                "label set for {} must not repeat {}",
                metric, METRIC_NAME_LABEL
            )));
        }
        if let Some(name) = labels.keys().find(|name| name.is_empty()) {
            return Err(Error::InvalidSample(format!(
                "empty label name {:?} on {}",
                name, metric
            )));
        }
        Ok(Self {
            metric,
            labels,
            timestamp_ms,
            value,
        })
    }

    /// Build a sample from a Prometheus-style label list that includes
    /// `__name__`. Duplicate label names are rejected.
    pub fn from_label_pairs<I, K, V>(pairs: I, timestamp_ms: i64, value: f64) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut labels = Labels::new();
        for (name, label_value) in pairs {
            let name = name.into();
            if labels.insert(name.clone(), label_value.into()).is_some() {
                return Err(Error::InvalidSample(format!("duplicate label {}", name)));
            }
        }
        let metric = labels
            .remove(METRIC_NAME_LABEL)
            .ok_or(Error::MissingMetricName)?;
        Self::new(metric, labels, timestamp_ms, value)
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// Labels without the metric name
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// Full label set including `__name__`
    pub fn label_set(&self) -> Labels {
        let mut all = self.labels.clone();
        all.insert(METRIC_NAME_LABEL.to_string(), self.metric.clone());
        all
    }

    /// Approximate size of this sample once encoded into a bulk request
    pub fn estimated_bytes(&self) -> usize {
        let labels: usize = self
            .labels
            .iter()
            .map(|(k, v)| k.len() + v.len() + LABEL_PAIR_OVERHEAD_BYTES)
            .sum();
        DOCUMENT_OVERHEAD_BYTES
            + METRIC_NAME_LABEL.len()
            + self.metric.len()
            + LABEL_PAIR_OVERHEAD_BYTES
            + labels
    }
}
