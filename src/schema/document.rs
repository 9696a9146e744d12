//! Stored document encoding

use super::sample::{Labels, Sample};
use crate::Result;
use serde::{Deserialize, Serialize};

/// A sample as stored in the document store.
///
/// ```json
/// {"label": {"__name__": "up", "job": "api"}, "value": 1.0, "timestamp": 1700000000000}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub label: Labels,
    #[serde(with = "float_value")]
    pub value: f64,
    pub timestamp: i64,
}

impl Document {
    /// Convert back into a sample, validating the label set.
    pub fn into_sample(self) -> Result<Sample> {
        Sample::from_label_pairs(self.label, self.timestamp, self.value)
    }
}

impl From<&Sample> for Document {
    fn from(sample: &Sample) -> Self {
        Self {
            label: sample.label_set(),
            value: sample.value(),
            timestamp: sample.timestamp_ms(),
        }
    }
}

/// JSON has no encoding for non-finite floats; they travel as the
/// Prometheus spellings and the store's `double` mapping rejects them.
mod float_value {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_sign_positive() {
            serializer.serialize_str("+Inf")
        } else {
            serializer.serialize_str("-Inf")
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Number(v) => Ok(v),
            Raw::Text(s) => match s.as_str() {
                "NaN" => Ok(f64::NAN),
                "+Inf" | "Inf" => Ok(f64::INFINITY),
                "-Inf" => Ok(f64::NEG_INFINITY),
                other => other.parse::<f64>().map_err(serde::de::Error::custom),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(value: f64) -> Sample {
        let mut labels = Labels::new();
        labels.insert("job".to_string(), "node".to_string());
        Sample::new("up", labels, 1_700_000_000_000, value).unwrap()
    }

    #[test]
    fn test_document_json_shape() {
        let json = serde_json::to_value(Document::from(&sample(1.5))).unwrap();
        assert_eq!(json["label"]["__name__"], "up");
        assert_eq!(json["label"]["job"], "node");
        assert_eq!(json["value"], 1.5);
        assert_eq!(json["timestamp"], 1_700_000_000_000i64);
    }

    #[test]
    fn test_non_finite_values_use_prometheus_spelling() {
        let json = serde_json::to_value(Document::from(&sample(f64::INFINITY))).unwrap();
        assert_eq!(json["value"], "+Inf");

        let doc: Document = serde_json::from_value(serde_json::json!({
            "label": {"__name__": "up"},
            "value": "NaN",
            "timestamp": 5
        }))
        .unwrap();
        assert!(doc.value.is_nan());
    }

    #[test]
    fn test_into_sample_restores_metric_name() {
        let restored = Document::from(&sample(2.0)).into_sample().unwrap();
        assert_eq!(restored, sample(2.0));
    }
}
