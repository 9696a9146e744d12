//! Sample and document definitions
//!
//! A [`Sample`] is the unit accepted on the write path. It is stored in the
//! document store as a [`Document`] whose `label` object carries every label,
//! including the metric name under `__name__`.

mod document;
mod sample;

pub use document::Document;
pub use sample::{Labels, Sample, METRIC_NAME_LABEL};

/// Standard document field names
pub const LABEL_FIELD: &str = "label";
pub const VALUE_FIELD: &str = "value";
pub const TIMESTAMP_FIELD: &str = "timestamp";
