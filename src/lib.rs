//! # prometheus-es-adapter
//!
//! A Prometheus remote storage adapter that persists samples into
//! Elasticsearch.
//!
//! Samples arriving on the remote write endpoint are batched and bulk-written
//! to a stable write alias. A lifecycle task rolls the physical index behind
//! that alias over when it grows too old or too large, while older indices
//! stay attached to the alias so remote reads span all of them.
//!
//! ## Components
//!
//! - **Writer**: [`writer::BatchAccumulator`] closes batches on size, count or
//!   age; [`writer::FlushWorkerPool`] bulk-writes them with retry
//! - **Lifecycle**: [`lifecycle::IndexLifecycleManager`] rolls the write index
//!   over atomically; [`lifecycle::DailyIndexScheduler`] switches daily
//! - **Read**: [`read::ReadQueryTranslator`] maps label matchers onto store
//!   queries bounded by a result cap
//! - **Store**: [`store::StoreClient`] over Elasticsearch REST, or in memory

pub mod adapter;
pub mod api;
pub mod clock;
pub mod config;
pub mod lifecycle;
pub mod read;
pub mod schema;
pub mod store;
pub mod telemetry;
pub mod trigger;
pub mod writer;

mod error;

pub use adapter::Adapter;
pub use error::{is_retryable_status, Error, ErrorKind, Result};

use std::time::Duration;

/// Adapter configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub store: StoreConfig,
    pub writer: writer::WriterConfig,
    pub index: lifecycle::IndexConfig,
    pub read: read::ReadConfig,
}

impl Config {
    /// Check every section; the read path must target the managed alias.
    pub fn validate(&self) -> Result<()> {
        self.writer.validate()?;
        self.index.validate()?;
        if self.read.alias != self.index.alias {
            return Err(Error::Config(format!(
                "read alias {} differs from index alias {}",
                self.read.alias, self.index.alias
            )));
        }
        if self.read.max_docs == 0 {
            return Err(Error::Config("search max docs must be positive".to_string()));
        }
        Ok(())
    }
}

/// Store connection configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Base URL of one cluster node
    pub url: String,
    /// Discover the remaining nodes at connect time
    pub sniff: bool,
    /// Transport-level timeout for every request
    pub request_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            sniff: false,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Prelude for common imports
pub mod prelude {
    pub use crate::lifecycle::{IndexConfig, LifecycleService, RolloverPolicy};
    pub use crate::read::{ReadConfig, ReadQuery, ReadService};
    pub use crate::schema::{Labels, Sample};
    pub use crate::store::{MemoryStore, StoreClient};
    pub use crate::writer::{WriteService, WriterConfig};
    pub use crate::{Adapter, Config, Error, Result, StoreConfig};
}
