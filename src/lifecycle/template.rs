//! Index template for metric indices

use super::{index_pattern, IndexConfig};
use crate::schema::{LABEL_FIELD, TIMESTAMP_FIELD, VALUE_FIELD};
use crate::store::{with_deadline, IndexTemplate, StoreClient, TemplateOutcome};
use crate::{Error, Result};
use serde_json::{json, Value};
use tracing::info;

/// Mappings for metric documents: every label is a keyword, the value a
/// double and the timestamp an epoch-millisecond date.
pub fn metric_mappings() -> Value {
    json!({
        "dynamic_templates": [{
            "labels": {
                "path_match": format!("{}.*", LABEL_FIELD),
                "match_mapping_type": "string",
                "mapping": {"type": "keyword"}
            }
        }],
        "properties": {
            LABEL_FIELD: {"type": "object"},
            VALUE_FIELD: {"type": "double"},
            TIMESTAMP_FIELD: {"type": "date", "format": "epoch_millis"}
        }
    })
}

pub fn index_template(config: &IndexConfig) -> IndexTemplate {
    IndexTemplate {
        name: config.alias.clone(),
        index_patterns: vec![index_pattern(&config.alias)],
        settings: config.settings,
        mappings: metric_mappings(),
    }
}

/// Install the template. Re-applying an identical template changes nothing.
/// Failure is fatal at startup.
pub async fn ensure_index_template(
    store: &dyn StoreClient,
    config: &IndexConfig,
) -> Result<TemplateOutcome> {
    let template = index_template(config);
    let outcome = with_deadline(
        "put_index_template",
        config.request_timeout,
        store.put_index_template(&template),
    )
    .await
    .map_err(|e| Error::Startup(format!("applying index template {}: {}", template.name, e)))?;

    info!(
        template = %template.name,
        pattern = %template.index_patterns.join(","),
        shards = template.settings.number_of_shards,
        replicas = template.settings.number_of_replicas,
        outcome = ?outcome,
        "Index template ensured"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IndexSettings, MemoryStore};

    #[test]
    fn test_template_targets_alias_indices() {
        let config = IndexConfig {
            alias: "metrics".to_string(),
            settings: IndexSettings {
                number_of_shards: 3,
                number_of_replicas: 0,
            },
            ..IndexConfig::default()
        };
        let template = index_template(&config);
        assert_eq!(template.index_patterns, vec!["metrics-*".to_string()]);
        assert!(template.matches("metrics-000001"));
        assert_eq!(template.settings.number_of_shards, 3);
        assert_eq!(
            template.mappings["properties"]["timestamp"]["format"],
            "epoch_millis"
        );
    }

    #[tokio::test]
    async fn test_reapplying_identical_template_is_a_no_op() {
        let store = MemoryStore::new();
        let config = IndexConfig::default();

        assert_eq!(
            ensure_index_template(&store, &config).await.unwrap(),
            TemplateOutcome::Applied
        );
        let revision = store.template_revision();

        assert_eq!(
            ensure_index_template(&store, &config).await.unwrap(),
            TemplateOutcome::Unchanged
        );
        assert_eq!(store.template_revision(), revision);
    }
}
