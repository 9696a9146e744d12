//! Elasticsearch REST client

use super::{
    AliasAction, BulkResponse, CreateIndexOutcome, CreateIndexRequest, DocumentOutcome,
    IndexSettings, IndexStats, IndexTemplate, StoreClient, StoreQuery, TemplateOutcome,
};
use crate::error::is_retryable_status;
use crate::schema::Document;
use crate::{Error, Result, StoreConfig};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};
use url::Url;

const NDJSON: &str = "application/x-ndjson";

/// Store client speaking the Elasticsearch REST API.
///
/// Requests are spread round-robin over the known nodes. With sniffing
/// enabled the node list is discovered from `_nodes/http` at connect time.
pub struct HttpStoreClient {
    client: Client,
    nodes: RwLock<Vec<Url>>,
    next_node: AtomicUsize,
}

#[derive(Debug, Deserialize)]
struct BulkBody {
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

impl HttpStoreClient {
    /// Build the client and, if configured, sniff the cluster's nodes.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let base = normalize_base_url(&config.url)?;
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        let store = Self {
            client,
            nodes: RwLock::new(vec![base]),
            next_node: AtomicUsize::new(0),
        };

        if config.sniff {
            let discovered = store.sniff().await?;
            info!(nodes = discovered, "Sniffed store nodes");
        }

        Ok(store)
    }

    /// Replace the node list with the HTTP publish addresses of the cluster.
    /// Returns the number of nodes now in rotation.
    pub async fn sniff(&self) -> Result<usize> {
        let seed = self.node_url("_nodes/http")?;
        let scheme = seed.scheme().to_string();
        let body: Value = check(self.client.get(seed).send().await?)
            .await?
            .json()
            .await?;

        let discovered: Vec<Url> = body
            .get("nodes")
            .and_then(Value::as_object)
            .map(|nodes| {
                nodes
                    .values()
                    .filter_map(|node| node.pointer("/http/publish_address")?.as_str())
                    .filter_map(|addr| publish_address_url(&scheme, addr))
                    .collect()
            })
            .unwrap_or_default();

        if discovered.is_empty() {
            warn!("Sniffing found no HTTP nodes, keeping seed URL");
            return Ok(self.nodes.read().len());
        }

        let count = discovered.len();
        *self.nodes.write() = discovered;
        Ok(count)
    }

    fn node_url(&self, path: &str) -> Result<Url> {
        let nodes = self.nodes.read();
        if nodes.is_empty() {
            return Err(Error::Config("no store nodes configured".to_string()));
        }
        let node = &nodes[self.next_node.fetch_add(1, Ordering::Relaxed) % nodes.len()];
        node.join(path)
            .map_err(|e| Error::Config(format!("invalid store path {}: {}", path, e)))
    }

    async fn index_settings(&self, index: &str) -> Result<(IndexSettings, i64)> {
        let url = self.node_url(&format!("{}/_settings", index))?;
        let body: Value = check(self.client.get(url).send().await?)
            .await?
            .json()
            .await?;

        let settings = body
            .pointer(&format!("/{}/settings/index", index))
            .ok_or_else(|| Error::Internal(format!("settings missing for {}", index)))?;

        Ok((
            IndexSettings {
                number_of_shards: string_number(settings, "number_of_shards").unwrap_or(0) as u32,
                number_of_replicas: string_number(settings, "number_of_replicas").unwrap_or(0)
                    as u32,
            },
            string_number(settings, "creation_date").unwrap_or(0),
        ))
    }
}

#[async_trait]
impl StoreClient for HttpStoreClient {
    async fn bulk(&self, target: &str, docs: &[Document]) -> Result<BulkResponse> {
        let mut body = Vec::with_capacity(docs.len() * 128);
        let action = json!({"index": {"_index": target}});
        for doc in docs {
            serde_json::to_writer(&mut body, &action)?;
            body.push(b'\n');
            serde_json::to_writer(&mut body, doc)?;
            body.push(b'\n');
        }

        let url = self.node_url("_bulk")?;
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, NDJSON)
            .body(body)
            .send()
            .await?;
        let parsed: BulkBody = check(response).await?.json().await?;

        if parsed.items.len() != docs.len() {
            return Err(Error::Internal(format!(
                "bulk response has {} items for {} documents",
                parsed.items.len(),
                docs.len()
            )));
        }

        let items = parsed
            .items
            .into_iter()
            .map(|mut item| {
                let Some(result) = item.remove("index").or_else(|| item.into_values().next())
                else {
                    return DocumentOutcome::PermanentFailure("empty bulk item".to_string());
                };
                document_outcome(result)
            })
            .collect();

        Ok(BulkResponse { items })
    }

    async fn create_index(
        &self,
        index: &str,
        request: &CreateIndexRequest,
    ) -> Result<CreateIndexOutcome> {
        let mut body = serde_json::Map::new();
        if let Some(settings) = &request.settings {
            body.insert("settings".to_string(), serde_json::to_value(settings)?);
        }
        if let Some(alias) = &request.write_alias {
            body.insert(
                "aliases".to_string(),
                json!({ alias.as_str(): {"is_write_index": true} }),
            );
        }

        let url = self.node_url(index)?;
        let response = self.client.put(url).json(&body).send().await?;

        if response.status() == StatusCode::BAD_REQUEST {
            let text = response.text().await.unwrap_or_default();
            if error_type(&text).as_deref() == Some("resource_already_exists_exception") {
                if let Some(wanted) = request.settings {
                    let (actual, _) = self.index_settings(index).await?;
                    if actual != wanted {
                        return Err(Error::IndexConflict(index.to_string()));
                    }
                }
                debug!(index, "Index already exists");
                return Ok(CreateIndexOutcome::AlreadyExists);
            }
            return Err(Error::Store {
                status: 400,
                reason: error_reason(&text),
            });
        }

        check(response).await?;
        Ok(CreateIndexOutcome::Created)
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> Result<()> {
        let actions: Vec<Value> = actions
            .iter()
            .map(|action| match action {
                AliasAction::Add {
                    index,
                    alias,
                    is_write_index,
                } => json!({"add": {"index": index, "alias": alias, "is_write_index": is_write_index}}),
                AliasAction::Remove { index, alias } => {
                    json!({"remove": {"index": index, "alias": alias}})
                }
            })
            .collect();

        let url = self.node_url("_aliases")?;
        let response = self
            .client
            .post(url)
            .json(&json!({ "actions": actions }))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn put_index_template(&self, template: &IndexTemplate) -> Result<TemplateOutcome> {
        let path = format!("_template/{}", template.name);

        let existing = self.client.get(self.node_url(&path)?).send().await?;
        if existing.status().is_success() {
            let body: Value = existing.json().await?;
            if let Some(current) = body.get(&template.name) {
                if template_matches(current, template) {
                    return Ok(TemplateOutcome::Unchanged);
                }
            }
        }

        let body = json!({
            "index_patterns": template.index_patterns,
            "settings": template.settings,
            "mappings": template.mappings,
        });
        let response = self
            .client
            .put(self.node_url(&path)?)
            .json(&body)
            .send()
            .await?;
        check(response).await?;
        Ok(TemplateOutcome::Applied)
    }

    async fn write_index(&self, alias: &str) -> Result<Option<String>> {
        let url = self.node_url(&format!("_alias/{}", alias))?;
        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: Value = check(response).await?.json().await?;
        let Some(indices) = body.as_object() else {
            return Ok(None);
        };

        let flagged = indices.iter().find(|(_, entry)| {
            entry
                .pointer(&format!("/aliases/{}/is_write_index", alias))
                .and_then(Value::as_bool)
                .unwrap_or(false)
        });
        if let Some((index, _)) = flagged {
            return Ok(Some(index.clone()));
        }

        // A single member without an explicit flag is the implicit write index.
        if indices.len() == 1 {
            return Ok(indices.keys().next().cloned());
        }
        Ok(None)
    }

    async fn index_stats(&self, index: &str) -> Result<IndexStats> {
        let url = self.node_url(&format!("{}/_stats/docs,store", index))?;
        let body: Value = check(self.client.get(url).send().await?)
            .await?
            .json()
            .await?;

        let primaries = body
            .pointer(&format!("/indices/{}/primaries", index))
            .ok_or_else(|| Error::Internal(format!("stats missing for {}", index)))?;
        let (_, created_at_ms) = self.index_settings(index).await?;

        Ok(IndexStats {
            index: index.to_string(),
            doc_count: primaries
                .pointer("/docs/count")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            size_bytes: primaries
                .pointer("/store/size_in_bytes")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            created_at_ms,
        })
    }

    async fn search(&self, query: &StoreQuery) -> Result<Vec<Document>> {
        let url = self.node_url(&format!("{}/_search", query.index))?;
        let response = self
            .client
            .post(url)
            .json(&query.to_search_body())
            .send()
            .await?;
        let body: Value = check(response).await?.json().await?;

        let hits = body
            .pointer("/hits/hits")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        hits.into_iter()
            .filter_map(|mut hit| hit.get_mut("_source").map(Value::take))
            .map(|source| serde_json::from_value(source).map_err(Error::from))
            .collect()
    }

    async fn ping(&self) -> Result<()> {
        let url = self.node_url("")?;
        check(self.client.get(url).send().await?).await?;
        Ok(())
    }
}

/// Turn non-2xx responses into errors, retryable statuses into `Unavailable`.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let code = status.as_u16();
    let reason = error_reason(&response.text().await.unwrap_or_default());
    if is_retryable_status(code) {
        Err(Error::Unavailable(format!("{}: {}", code, reason)))
    } else {
        Err(Error::Store {
            status: code,
            reason,
        })
    }
}

fn document_outcome(item: BulkItem) -> DocumentOutcome {
    if (200..300).contains(&item.status) {
        return DocumentOutcome::Accepted;
    }
    let reason = item
        .error
        .as_ref()
        .map(describe_error)
        .unwrap_or_else(|| format!("status {}", item.status));
    if is_retryable_status(item.status) {
        DocumentOutcome::RetryableFailure(reason)
    } else {
        DocumentOutcome::PermanentFailure(reason)
    }
}

fn describe_error(error: &Value) -> String {
    let kind = error.get("type").and_then(Value::as_str).unwrap_or("error");
    match error.get("reason").and_then(Value::as_str) {
        Some(reason) => format!("{}: {}", kind, reason),
        None => kind.to_string(),
    }
}

fn error_type(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    parsed
        .pointer("/error/type")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn error_reason(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(parsed) => match parsed.get("error") {
            Some(error) if error.is_object() => describe_error(error),
            Some(Value::String(s)) => s.clone(),
            _ => body.chars().take(256).collect(),
        },
        Err(_) => body.chars().take(256).collect(),
    }
}

/// Index settings come back as strings (`"5"`), numbers elsewhere.
fn string_number(settings: &Value, key: &str) -> Option<i64> {
    match settings.get(key)? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

fn template_matches(current: &Value, wanted: &IndexTemplate) -> bool {
    let patterns: Vec<String> = current
        .get("index_patterns")
        .and_then(|p| serde_json::from_value(p.clone()).ok())
        .unwrap_or_default();
    let settings = current.pointer("/settings/index").cloned().unwrap_or(Value::Null);
    patterns == wanted.index_patterns
        && string_number(&settings, "number_of_shards")
            == Some(i64::from(wanted.settings.number_of_shards))
        && string_number(&settings, "number_of_replicas")
            == Some(i64::from(wanted.settings.number_of_replicas))
        && current.get("mappings") == Some(&wanted.mappings)
}

fn normalize_base_url(raw: &str) -> Result<Url> {
    let mut url =
        Url::parse(raw).map_err(|e| Error::Config(format!("invalid store URL {}: {}", raw, e)))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// `publish_address` is either `ip:port` or `hostname/ip:port`.
fn publish_address_url(scheme: &str, addr: &str) -> Option<Url> {
    let host_port = addr.rsplit('/').next()?;
    Url::parse(&format!("{}://{}/", scheme, host_port)).ok()
}
