//! Store-level search query and its Elasticsearch DSL rendering

use crate::schema::{Document, Labels, LABEL_FIELD, TIMESTAMP_FIELD};
use crate::{Error, Result};
use regex::Regex;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Equal,
    NotEqual,
    Regex,
    NotRegex,
}

/// Condition on one label. A missing label behaves as the empty string, so
/// `job=""` selects documents without a `job` label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelFilter {
    pub label: String,
    pub op: FilterOp,
    pub value: String,
}

/// Time-bounded, label-filtered search against an alias or index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreQuery {
    pub index: String,
    /// Inclusive bounds, epoch milliseconds
    pub start_ms: i64,
    pub end_ms: i64,
    pub filters: Vec<LabelFilter>,
    /// Maximum number of documents the store may return
    pub size: usize,
}

impl StoreQuery {
    /// Render the `_search` request body.
    pub fn to_search_body(&self) -> Value {
        let mut filter = vec![json!({
            "range": {
                TIMESTAMP_FIELD: {
                    "gte": self.start_ms,
                    "lte": self.end_ms,
                    "format": "epoch_millis"
                }
            }
        })];
        let mut must_not = Vec::new();

        for f in &self.filters {
            let field = format!("{}.{}", LABEL_FIELD, f.label);
            match (f.op, f.value.is_empty()) {
                (FilterOp::Equal, true) => must_not.push(json!({"exists": {"field": field}})),
                (FilterOp::Equal, false) => filter.push(json!({"term": {field: f.value}})),
                (FilterOp::NotEqual, true) => filter.push(json!({"exists": {"field": field}})),
                (FilterOp::NotEqual, false) => must_not.push(json!({"term": {field: f.value}})),
                (FilterOp::Regex, _) if matches_empty(&f.value) => filter.push(json!({
                    "bool": {
                        "should": [
                            {"regexp": {&field: f.value}},
                            {"bool": {"must_not": {"exists": {"field": field}}}}
                        ],
                        "minimum_should_match": 1
                    }
                })),
                (FilterOp::Regex, _) => filter.push(json!({"regexp": {field: f.value}})),
                (FilterOp::NotRegex, _) => {
                    if matches_empty(&f.value) {
                        filter.push(json!({"exists": {"field": &field}}));
                    }
                    must_not.push(json!({"regexp": {field: f.value}}));
                }
            }
        }

        let mut bool_query = serde_json::Map::new();
        bool_query.insert("filter".to_string(), Value::Array(filter));
        if !must_not.is_empty() {
            bool_query.insert("must_not".to_string(), Value::Array(must_not));
        }

        json!({
            "size": self.size,
            "sort": [{TIMESTAMP_FIELD: {"order": "asc"}}],
            "query": {"bool": bool_query}
        })
    }

    /// Compile the filters for in-process evaluation.
    pub fn compile(&self) -> Result<CompiledQuery> {
        let filters = self
            .filters
            .iter()
            .map(CompiledFilter::new)
            .collect::<Result<Vec<_>>>()?;
        Ok(CompiledQuery {
            start_ms: self.start_ms,
            end_ms: self.end_ms,
            filters,
        })
    }
}

/// Label regexes always match the whole value.
fn anchored_regex(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})$", pattern))
}

/// Whether a missing label (the empty string) satisfies `pattern`.
fn matches_empty(pattern: &str) -> bool {
    anchored_regex(pattern).is_ok_and(|re| re.is_match(""))
}

/// Query with regexes compiled, used by the in-memory store.
#[derive(Debug)]
pub struct CompiledQuery {
    start_ms: i64,
    end_ms: i64,
    filters: Vec<CompiledFilter>,
}

impl CompiledQuery {
    pub fn matches(&self, doc: &Document) -> bool {
        doc.timestamp >= self.start_ms
            && doc.timestamp <= self.end_ms
            && self.filters.iter().all(|f| f.matches(&doc.label))
    }
}

#[derive(Debug)]
struct CompiledFilter {
    label: String,
    op: FilterOp,
    value: String,
    regex: Option<Regex>,
}

impl CompiledFilter {
    fn new(filter: &LabelFilter) -> Result<Self> {
        let regex = match filter.op {
            FilterOp::Regex | FilterOp::NotRegex => Some(
                anchored_regex(&filter.value).map_err(|e| {
                    Error::InvalidQuery(format!("bad regex for {}: {}", filter.label, e))
                })?,
            ),
            FilterOp::Equal | FilterOp::NotEqual => None,
        };
        Ok(Self {
            label: filter.label.clone(),
            op: filter.op,
            value: filter.value.clone(),
            regex,
        })
    }

    fn matches(&self, labels: &Labels) -> bool {
        let value = labels.get(&self.label).map(String::as_str).unwrap_or("");
        match self.op {
            FilterOp::Equal => value == self.value,
            FilterOp::NotEqual => value != self.value,
            FilterOp::Regex => self.regex_matches(value),
            FilterOp::NotRegex => !self.regex_matches(value),
        }
    }

    fn regex_matches(&self, value: &str) -> bool {
        self.regex.as_ref().is_some_and(|re| re.is_match(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(filters: Vec<LabelFilter>) -> StoreQuery {
        StoreQuery {
            index: "prom-metrics".to_string(),
            start_ms: 1_000,
            end_ms: 2_000,
            filters,
            size: 50,
        }
    }

    fn filter(label: &str, op: FilterOp, value: &str) -> LabelFilter {
        LabelFilter {
            label: label.to_string(),
            op,
            value: value.to_string(),
        }
    }

    #[test]
    fn test_search_body_shape() {
        let body = query(vec![
            filter("__name__", FilterOp::Equal, "up"),
            filter("env", FilterOp::NotRegex, "dev|test"),
        ])
        .to_search_body();

        assert_eq!(body["size"], 50);
        assert_eq!(body["sort"][0]["timestamp"]["order"], "asc");
        let filters = body["query"]["bool"]["filter"].as_array().unwrap();
        assert_eq!(filters[0]["range"]["timestamp"]["gte"], 1_000);
        assert_eq!(filters[0]["range"]["timestamp"]["lte"], 2_000);
        assert_eq!(filters[1]["term"]["label.__name__"], "up");
        assert_eq!(
            body["query"]["bool"]["must_not"][0]["regexp"]["label.env"],
            "dev|test"
        );
    }

    #[test]
    fn test_empty_equal_matches_missing_label() {
        let body = query(vec![filter("job", FilterOp::Equal, "")]).to_search_body();
        assert_eq!(
            body["query"]["bool"]["must_not"][0]["exists"]["field"],
            "label.job"
        );

        let compiled = query(vec![filter("job", FilterOp::Equal, "")])
            .compile()
            .unwrap();
        let mut label = Labels::new();
        label.insert("__name__".to_string(), "up".to_string());
        let doc = Document {
            label,
            value: 1.0,
            timestamp: 1_500,
        };
        assert!(compiled.matches(&doc));
    }

    #[test]
    fn test_regex_is_anchored() {
        let compiled = query(vec![filter("job", FilterOp::Regex, "api")])
            .compile()
            .unwrap();
        let mut label = Labels::new();
        label.insert("job".to_string(), "api-gateway".to_string());
        let doc = Document {
            label,
            value: 1.0,
            timestamp: 1_500,
        };
        assert!(!compiled.matches(&doc));
    }

    fn doc_with(label: &[(&str, &str)]) -> Document {
        Document {
            label: label
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            value: 1.0,
            timestamp: 1_500,
        }
    }

    #[test]
    fn test_regex_treats_missing_label_as_empty() {
        let bare = doc_with(&[("__name__", "up")]);
        let api = doc_with(&[("__name__", "up"), ("job", "api")]);

        let has_job = query(vec![filter("job", FilterOp::NotRegex, "")])
            .compile()
            .unwrap();
        assert!(!has_job.matches(&bare));
        assert!(has_job.matches(&api));

        let api_or_none = query(vec![filter("job", FilterOp::Regex, "api|")])
            .compile()
            .unwrap();
        assert!(api_or_none.matches(&bare));
        assert!(api_or_none.matches(&api));
    }

    #[test]
    fn test_empty_matching_regex_renders_exists_clauses() {
        let body = query(vec![filter("job", FilterOp::Regex, "api|")]).to_search_body();
        let should = &body["query"]["bool"]["filter"][1]["bool"]["should"];
        assert_eq!(should[0]["regexp"]["label.job"], "api|");
        assert_eq!(should[1]["bool"]["must_not"]["exists"]["field"], "label.job");
        assert_eq!(body["query"]["bool"]["filter"][1]["bool"]["minimum_should_match"], 1);

        let body = query(vec![filter("job", FilterOp::NotRegex, "")]).to_search_body();
        assert_eq!(body["query"]["bool"]["filter"][1]["exists"]["field"], "label.job");
        assert_eq!(body["query"]["bool"]["must_not"][0]["regexp"]["label.job"], "");

        // Patterns that reject "" keep the plain regexp clause.
        let body = query(vec![filter("job", FilterOp::Regex, "api")]).to_search_body();
        assert_eq!(body["query"]["bool"]["filter"][1]["regexp"]["label.job"], "api");
    }

    #[test]
    fn test_invalid_regex_is_rejected() {
        let err = query(vec![filter("job", FilterOp::Regex, "(")])
            .compile()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidQuery(_)));
    }
}
