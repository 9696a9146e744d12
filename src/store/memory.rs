//! In-memory document store for development and testing
//!
//! Mirrors the store semantics the adapter relies on: aliases with exactly
//! one write index, atomic multi-action alias updates, idempotent index
//! creation and template installation, per-document bulk outcomes, and
//! rejection of non-finite values by the `double` mapping. A
//! [`FaultInjector`] lets callers script transient and permanent failures.

use super::{
    AliasAction, BulkResponse, CreateIndexOutcome, CreateIndexRequest, DocumentOutcome,
    IndexSettings, IndexStats, IndexTemplate, StoreClient, StoreQuery, TemplateOutcome,
};
use crate::clock::{Clock, SystemClock};
use crate::schema::Document;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

type DocumentRejector = Box<dyn Fn(&Document) -> Option<String> + Send + Sync>;

/// Scripted failures for [`MemoryStore`]
#[derive(Default)]
pub struct FaultInjector {
    bulk_failures: AtomicU32,
    retryable_document_failures: AtomicU32,
    create_index_failures: AtomicU32,
    alias_update_failures: AtomicU32,
    bulk_latency_ms: AtomicU64,
    rejector: RwLock<Option<DocumentRejector>>,
}

impl FaultInjector {
    /// Fail the next `n` bulk requests as a whole with `Unavailable`.
    pub fn fail_next_bulk(&self, n: u32) {
        self.bulk_failures.store(n, Ordering::SeqCst);
    }

    /// Reject the next `n` documents with a retryable outcome.
    pub fn reject_next_documents(&self, n: u32) {
        self.retryable_document_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` index creations.
    pub fn fail_next_create_index(&self, n: u32) {
        self.create_index_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` alias updates.
    pub fn fail_next_alias_update(&self, n: u32) {
        self.alias_update_failures.store(n, Ordering::SeqCst);
    }

    /// Delay every bulk request.
    pub fn set_bulk_latency(&self, latency: Duration) {
        self.bulk_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Permanently reject documents for which `rejector` returns a reason.
    pub fn reject_documents_where<F>(&self, rejector: F)
    where
        F: Fn(&Document) -> Option<String> + Send + Sync + 'static,
    {
        *self.rejector.write() = Some(Box::new(rejector));
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn bulk_latency(&self) -> Duration {
        Duration::from_millis(self.bulk_latency_ms.load(Ordering::SeqCst))
    }

    fn permanent_rejection(&self, doc: &Document) -> Option<String> {
        self.rejector.read().as_ref().and_then(|reject| reject(doc))
    }
}

#[derive(Debug, Clone)]
struct MemoryIndex {
    settings: IndexSettings,
    created_at_ms: i64,
    docs: Vec<Document>,
    size_bytes: u64,
}

#[derive(Debug, Default)]
struct StoreState {
    indices: BTreeMap<String, MemoryIndex>,
    /// alias -> (index -> is_write_index)
    aliases: BTreeMap<String, BTreeMap<String, bool>>,
    templates: BTreeMap<String, IndexTemplate>,
    template_revision: u64,
}

impl StoreState {
    fn write_index(&self, alias: &str) -> Option<String> {
        self.aliases.get(alias).and_then(|members| {
            members
                .iter()
                .find(|(_, is_write)| **is_write)
                .map(|(index, _)| index.clone())
        })
    }

    /// Concrete index a write addressed to `target` lands in.
    fn resolve_write_target(&self, target: &str) -> Result<String> {
        if self.indices.contains_key(target) {
            return Ok(target.to_string());
        }
        if self.aliases.contains_key(target) {
            return self.write_index(target).ok_or_else(|| Error::Store {
                status: 400,
                reason: format!("no write index is defined for alias [{}]", target),
            });
        }
        Err(Error::Store {
            status: 404,
            reason: format!("index_not_found_exception: no such index [{}]", target),
        })
    }

    /// Indices a read addressed to `target` spans.
    fn resolve_read_targets(&self, target: &str) -> Vec<String> {
        if let Some(members) = self.aliases.get(target) {
            return members.keys().cloned().collect();
        }
        if self.indices.contains_key(target) {
            return vec![target.to_string()];
        }
        Vec::new()
    }

    fn settings_for(&self, index: &str, request: &CreateIndexRequest) -> IndexSettings {
        request.settings.unwrap_or_else(|| {
            self.templates
                .values()
                .find(|t| t.matches(index))
                .map(|t| t.settings)
                .unwrap_or_default()
        })
    }
}

/// Local in-memory document store
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    state: RwLock<StoreState>,
    faults: FaultInjector,
    bulk_requests: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Index creation times come from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: RwLock::new(StoreState::default()),
            faults: FaultInjector::default(),
            bulk_requests: AtomicU64::new(0),
        }
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Indices currently flagged as write index of `alias`
    pub fn write_targets(&self, alias: &str) -> Vec<String> {
        self.state
            .read()
            .aliases
            .get(alias)
            .map(|members| {
                members
                    .iter()
                    .filter(|(_, is_write)| **is_write)
                    .map(|(index, _)| index.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every index `alias` points at
    pub fn alias_members(&self, alias: &str) -> Vec<String> {
        self.state.read().resolve_read_targets(alias)
    }

    pub fn index_names(&self) -> Vec<String> {
        self.state.read().indices.keys().cloned().collect()
    }

    pub fn documents(&self, index: &str) -> Vec<Document> {
        self.state
            .read()
            .indices
            .get(index)
            .map(|i| i.docs.clone())
            .unwrap_or_default()
    }

    pub fn index_settings(&self, index: &str) -> Option<IndexSettings> {
        self.state.read().indices.get(index).map(|i| i.settings)
    }

    pub fn template(&self, name: &str) -> Option<IndexTemplate> {
        self.state.read().templates.get(name).cloned()
    }

    /// Incremented whenever a template is installed or replaced
    pub fn template_revision(&self) -> u64 {
        self.state.read().template_revision
    }

    pub fn bulk_requests(&self) -> u64 {
        self.bulk_requests.load(Ordering::SeqCst)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn bulk(&self, target: &str, docs: &[Document]) -> Result<BulkResponse> {
        let latency = self.faults.bulk_latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.bulk_requests.fetch_add(1, Ordering::SeqCst);

        if FaultInjector::take(&self.faults.bulk_failures) {
            return Err(Error::Unavailable("injected bulk failure".to_string()));
        }

        let mut state = self.state.write();
        let index_name = state.resolve_write_target(target)?;
        let index = state
            .indices
            .get_mut(&index_name)
            .ok_or_else(|| Error::Internal(format!("alias points at missing index {}", index_name)))?;

        let mut items = Vec::with_capacity(docs.len());
        for doc in docs {
            if FaultInjector::take(&self.faults.retryable_document_failures) {
                items.push(DocumentOutcome::RetryableFailure(
                    "es_rejected_execution_exception: injected".to_string(),
                ));
                continue;
            }
            if !doc.value.is_finite() {
                items.push(DocumentOutcome::PermanentFailure(
                    "mapper_parsing_exception: [value] supports only finite values".to_string(),
                ));
                continue;
            }
            if let Some(reason) = self.faults.permanent_rejection(doc) {
                items.push(DocumentOutcome::PermanentFailure(reason));
                continue;
            }
            let size = serde_json::to_vec(doc)?.len() as u64;
            index.docs.push(doc.clone());
            index.size_bytes += size;
            items.push(DocumentOutcome::Accepted);
        }

        Ok(BulkResponse { items })
    }

    async fn create_index(
        &self,
        index: &str,
        request: &CreateIndexRequest,
    ) -> Result<CreateIndexOutcome> {
        if FaultInjector::take(&self.faults.create_index_failures) {
            return Err(Error::Unavailable(format!("injected create failure for {}", index)));
        }

        let mut state = self.state.write();
        let settings = state.settings_for(index, request);

        if let Some(existing) = state.indices.get(index) {
            return if existing.settings == settings {
                Ok(CreateIndexOutcome::AlreadyExists)
            } else {
                Err(Error::IndexConflict(index.to_string()))
            };
        }

        if let Some(alias) = &request.write_alias {
            if let Some(current) = state.write_index(alias) {
                return Err(Error::Store {
                    status: 400,
                    reason: format!(
                        "alias [{}] already has write index [{}]",
                        alias, current
                    ),
                });
            }
        }

        let created_at_ms = self.clock.now_millis();
        state.indices.insert(
            index.to_string(),
            MemoryIndex {
                settings,
                created_at_ms,
                docs: Vec::new(),
                size_bytes: 0,
            },
        );
        if let Some(alias) = &request.write_alias {
            state
                .aliases
                .entry(alias.clone())
                .or_default()
                .insert(index.to_string(), true);
        }

        Ok(CreateIndexOutcome::Created)
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> Result<()> {
        if FaultInjector::take(&self.faults.alias_update_failures) {
            return Err(Error::Unavailable("injected alias update failure".to_string()));
        }

        // Validate against a copy and swap it in under the same lock.
        let mut state = self.state.write();
        let mut aliases = state.aliases.clone();
        let mut touched = Vec::new();

        for action in actions {
            match action {
                AliasAction::Add {
                    index,
                    alias,
                    is_write_index,
                } => {
                    if !state.indices.contains_key(index) {
                        return Err(Error::Store {
                            status: 404,
                            reason: format!("index_not_found_exception: no such index [{}]", index),
                        });
                    }
                    aliases
                        .entry(alias.clone())
                        .or_default()
                        .insert(index.clone(), *is_write_index);
                    touched.push(alias.clone());
                }
                AliasAction::Remove { index, alias } => {
                    let removed = aliases
                        .get_mut(alias)
                        .and_then(|members| members.remove(index));
                    if removed.is_none() {
                        return Err(Error::Store {
                            status: 404,
                            reason: format!("aliases [{}] missing on index [{}]", alias, index),
                        });
                    }
                    touched.push(alias.clone());
                }
            }
        }

        for alias in &touched {
            let Some(members) = aliases.get(alias) else {
                continue;
            };
            if members.is_empty() {
                aliases.remove(alias);
                continue;
            }
            let writers = members.values().filter(|w| **w).count();
            if writers != 1 {
                return Err(Error::Store {
                    status: 400,
                    reason: format!(
                        "alias [{}] must have exactly one write index, update would leave {}",
                        alias, writers
                    ),
                });
            }
        }

        state.aliases = aliases;
        Ok(())
    }

    async fn put_index_template(&self, template: &IndexTemplate) -> Result<TemplateOutcome> {
        let mut state = self.state.write();
        if state.templates.get(&template.name) == Some(template) {
            return Ok(TemplateOutcome::Unchanged);
        }
        state
            .templates
            .insert(template.name.clone(), template.clone());
        state.template_revision += 1;
        Ok(TemplateOutcome::Applied)
    }

    async fn write_index(&self, alias: &str) -> Result<Option<String>> {
        Ok(self.state.read().write_index(alias))
    }

    async fn index_stats(&self, index: &str) -> Result<IndexStats> {
        let state = self.state.read();
        let entry = state.indices.get(index).ok_or_else(|| Error::Store {
            status: 404,
            reason: format!("index_not_found_exception: no such index [{}]", index),
        })?;
        Ok(IndexStats {
            index: index.to_string(),
            doc_count: entry.docs.len() as u64,
            size_bytes: entry.size_bytes,
            created_at_ms: entry.created_at_ms,
        })
    }

    async fn search(&self, query: &StoreQuery) -> Result<Vec<Document>> {
        let compiled = query.compile()?;
        let state = self.state.read();

        let mut hits: Vec<Document> = state
            .resolve_read_targets(&query.index)
            .iter()
            .filter_map(|name| state.indices.get(name))
            .flat_map(|index| index.docs.iter())
            .filter(|doc| compiled.matches(doc))
            .cloned()
            .collect();

        hits.sort_by_key(|doc| doc.timestamp);
        hits.truncate(query.size);
        Ok(hits)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
