//! Document store boundary
//!
//! The adapter needs four write-side primitives from the store (bulk write,
//! index create, atomic multi-action alias update, index template apply) and
//! a few read-side ones (alias resolution, index stats, search, ping).
//! [`StoreClient`] abstracts them so the same pipeline runs against a real
//! Elasticsearch cluster ([`HttpStoreClient`]) or the in-process
//! [`MemoryStore`].

mod http;
mod memory;
mod query;

pub use http::HttpStoreClient;
pub use memory::{FaultInjector, MemoryStore};
pub use query::{FilterOp, LabelFilter, StoreQuery};

use crate::schema::Document;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Shard and replica counts of an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSettings {
    pub number_of_shards: u32,
    pub number_of_replicas: u32,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            number_of_shards: 5,
            number_of_replicas: 1,
        }
    }
}

/// Index template applied by the store to every new index whose name
/// matches one of `index_patterns`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexTemplate {
    pub name: String,
    pub index_patterns: Vec<String>,
    pub settings: IndexSettings,
    pub mappings: serde_json::Value,
}

impl IndexTemplate {
    /// Whether `index` matches one of the template's `prefix*` patterns.
    pub fn matches(&self, index: &str) -> bool {
        self.index_patterns.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => index.starts_with(prefix),
            None => index == pattern,
        })
    }
}

/// Options for creating an index
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateIndexRequest {
    /// Explicit settings; `None` leaves them to the matching template.
    pub settings: Option<IndexSettings>,
    /// Attach this alias with the new index as its write index.
    pub write_alias: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateIndexOutcome {
    Created,
    /// The index already existed with matching settings.
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateOutcome {
    Applied,
    /// An identical template was already installed; nothing changed.
    Unchanged,
}

/// One action of an atomic alias update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasAction {
    Add {
        index: String,
        alias: String,
        is_write_index: bool,
    },
    Remove {
        index: String,
        alias: String,
    },
}

/// Approximate statistics of one physical index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexStats {
    pub index: String,
    pub doc_count: u64,
    pub size_bytes: u64,
    pub created_at_ms: i64,
}

/// Per-document result of a bulk write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentOutcome {
    Accepted,
    /// Rejected for a transient reason (queue full, shard unavailable).
    RetryableFailure(String),
    /// Rejected for its content; resubmitting cannot succeed.
    PermanentFailure(String),
}

/// Bulk response: one outcome per submitted document, in order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkResponse {
    pub items: Vec<DocumentOutcome>,
}

impl BulkResponse {
    pub fn accepted(&self) -> usize {
        self.items
            .iter()
            .filter(|item| matches!(item, DocumentOutcome::Accepted))
            .count()
    }

    pub fn has_failures(&self) -> bool {
        self.accepted() != self.items.len()
    }
}

/// Document store client interface
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Write documents to `target` (an alias or index) in one request.
    async fn bulk(&self, target: &str, docs: &[Document]) -> Result<BulkResponse>;

    /// Create an index. Creating an index that already exists with matching
    /// settings succeeds with [`CreateIndexOutcome::AlreadyExists`].
    async fn create_index(
        &self,
        index: &str,
        request: &CreateIndexRequest,
    ) -> Result<CreateIndexOutcome>;

    /// Apply all actions atomically: either every action takes effect or none.
    async fn update_aliases(&self, actions: &[AliasAction]) -> Result<()>;

    /// Install or replace an index template.
    async fn put_index_template(&self, template: &IndexTemplate) -> Result<TemplateOutcome>;

    /// Physical index currently receiving writes through `alias`.
    async fn write_index(&self, alias: &str) -> Result<Option<String>>;

    /// Document count, size and creation time of a physical index.
    async fn index_stats(&self, index: &str) -> Result<IndexStats>;

    /// Run a query; the store enforces `query.size`.
    async fn search(&self, query: &StoreQuery) -> Result<Vec<Document>>;

    /// Connectivity check
    async fn ping(&self) -> Result<()>;
}

/// Run a store operation under a deadline. Exceeding it yields the
/// retryable [`Error::Timeout`].
pub async fn with_deadline<T, F>(operation: &'static str, deadline: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout { operation }),
    }
}
