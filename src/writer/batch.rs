//! In-memory batch of samples awaiting a bulk write

use crate::schema::{Document, Sample};
use crate::trigger::Measurement;
use tokio::time::Instant;

/// Ordered samples with a running size estimate and a creation instant.
#[derive(Debug)]
pub struct Batch {
    samples: Vec<Sample>,
    size_bytes: u64,
    created_at: Instant,
}

impl Batch {
    /// Create a new empty batch starting its age now
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
            size_bytes: 0,
            created_at: Instant::now(),
        }
    }

    pub fn push(&mut self, sample: Sample) {
        self.size_bytes += sample.estimated_bytes() as u64;
        self.samples.push(sample);
    }

    /// Hand the batch off, leaving a fresh empty one with a new creation instant
    pub fn take(&mut self) -> Batch {
        std::mem::take(self)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn measurement(&self, now: Instant) -> Measurement {
        Measurement {
            size_bytes: self.size_bytes,
            count: self.samples.len() as u64,
            age: now.saturating_duration_since(self.created_at),
        }
    }

    /// What the batch would measure with `extra` more bytes and one more sample.
    pub(crate) fn measurement_with(&self, extra: u64, now: Instant) -> Measurement {
        let current = self.measurement(now);
        Measurement {
            size_bytes: current.size_bytes + extra,
            count: current.count + 1,
            age: current.age,
        }
    }

    /// Store documents in sample order
    pub fn documents(&self) -> Vec<Document> {
        self.samples.iter().map(Document::from).collect()
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}
