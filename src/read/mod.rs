//! Read path: label-matcher range queries against the alias
//!
//! [`ReadQueryTranslator`] turns a time range and label matchers into a
//! store query bounded by the result cap and maps the hits back into
//! series. It only knows the alias, so queries automatically span every
//! index the alias currently covers.

mod telemetry;

use crate::schema::{Document, Labels};
use crate::store::{with_deadline, FilterOp, LabelFilter, StoreClient, StoreQuery};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Configuration for the read path
#[derive(Debug, Clone)]
pub struct ReadConfig {
    pub alias: String,
    /// Server-side cap on documents returned per query
    pub max_docs: usize,
    pub request_timeout: Duration,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            alias: "prom-metrics".to_string(),
            max_docs: 1000,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Label matcher operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOp {
    /// `=`
    Equal,
    /// `!=`
    NotEqual,
    /// `=~`
    RegexMatch,
    /// `!~`
    RegexNoMatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMatcher {
    pub name: String,
    pub op: MatchOp,
    pub value: String,
}

impl LabelMatcher {
    pub fn new(name: impl Into<String>, op: MatchOp, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op,
            value: value.into(),
        }
    }
}

/// Inclusive millisecond time range plus matchers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadQuery {
    pub start_ms: i64,
    pub end_ms: i64,
    pub matchers: Vec<LabelMatcher>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub timestamp_ms: i64,
    pub value: f64,
}

/// Points sharing one label set (including `__name__`), in timestamp order
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub labels: Labels,
    pub points: Vec<Point>,
}

/// Translates read queries to store queries and hits back to series.
#[derive(Debug, Clone)]
pub struct ReadQueryTranslator {
    alias: String,
    max_docs: usize,
}

impl ReadQueryTranslator {
    pub fn new(alias: impl Into<String>, max_docs: usize) -> Self {
        Self {
            alias: alias.into(),
            max_docs,
        }
    }

    pub fn translate(&self, query: &ReadQuery) -> Result<StoreQuery> {
        if query.start_ms > query.end_ms {
            return Err(Error::InvalidQuery(format!(
                "start {} is after end {}",
                query.start_ms, query.end_ms
            )));
        }

        let filters = query
            .matchers
            .iter()
            .map(|m| {
                if m.name.is_empty() {
                    return Err(Error::InvalidQuery("matcher with empty label name".to_string()));
                }
                Ok(LabelFilter {
                    label: m.name.clone(),
                    op: match m.op {
                        MatchOp::Equal => FilterOp::Equal,
                        MatchOp::NotEqual => FilterOp::NotEqual,
                        MatchOp::RegexMatch => FilterOp::Regex,
                        MatchOp::RegexNoMatch => FilterOp::NotRegex,
                    },
                    value: m.value.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let store_query = StoreQuery {
            index: self.alias.clone(),
            start_ms: query.start_ms,
            end_ms: query.end_ms,
            filters,
            size: self.max_docs,
        };
        // Reject bad regexes here rather than as a store error
        store_query.compile()?;
        Ok(store_query)
    }

    /// Group hits into series. Series are ordered by label set, points by
    /// timestamp.
    pub fn to_series(&self, hits: Vec<Document>) -> Vec<Series> {
        let mut grouped: BTreeMap<Labels, Vec<Point>> = BTreeMap::new();
        for hit in hits {
            match hit.into_sample() {
                Ok(sample) => grouped.entry(sample.label_set()).or_default().push(Point {
                    timestamp_ms: sample.timestamp_ms(),
                    value: sample.value(),
                }),
                Err(e) => warn!(error = %e, "Skipping malformed document"),
            }
        }

        grouped
            .into_iter()
            .map(|(labels, mut points)| {
                points.sort_by_key(|p| p.timestamp_ms);
                Series { labels, points }
            })
            .collect()
    }
}

/// Runs read queries against the store.
pub struct ReadService {
    store: Arc<dyn StoreClient>,
    translator: ReadQueryTranslator,
    request_timeout: Duration,
}

impl ReadService {
    pub fn new(store: Arc<dyn StoreClient>, config: &ReadConfig) -> Self {
        Self {
            store,
            translator: ReadQueryTranslator::new(config.alias.clone(), config.max_docs),
            request_timeout: config.request_timeout,
        }
    }

    pub async fn read(&self, query: &ReadQuery) -> Result<Vec<Series>> {
        let started = Instant::now();
        let result = self.execute(query).await;
        let elapsed = started.elapsed().as_secs_f64();
        match &result {
            Ok((docs, _)) => telemetry::record_query("success", elapsed, *docs as u64),
            Err(_) => telemetry::record_query("error", elapsed, 0),
        }
        result.map(|(_, series)| series)
    }

    async fn execute(&self, query: &ReadQuery) -> Result<(usize, Vec<Series>)> {
        let store_query = self.translator.translate(query)?;
        let hits = with_deadline(
            "search",
            self.request_timeout,
            self.store.search(&store_query),
        )
        .await?;
        let docs = hits.len();
        let series = self.translator.to_series(hits);
        debug!(
            start_ms = query.start_ms,
            end_ms = query.end_ms,
            docs,
            series = series.len(),
            "Read query served"
        );
        Ok((docs, series))
    }

    /// Run several queries, one result per query in the same order.
    pub async fn read_all(&self, queries: &[ReadQuery]) -> Result<Vec<Vec<Series>>> {
        let mut results = Vec::with_capacity(queries.len());
        for query in queries {
            results.push(self.read(query).await?);
        }
        Ok(results)
    }

    pub fn translator(&self) -> &ReadQueryTranslator {
        &self.translator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(job: &str, ts: i64, value: f64) -> Document {
        let mut label = Labels::new();
        label.insert("__name__".to_string(), "up".to_string());
        label.insert("job".to_string(), job.to_string());
        Document {
            label,
            value,
            timestamp: ts,
        }
    }

    #[test]
    fn test_translate_scopes_to_alias_with_cap() {
        let translator = ReadQueryTranslator::new("prom-metrics", 250);
        let query = ReadQuery {
            start_ms: 10,
            end_ms: 20,
            matchers: vec![
                LabelMatcher::new("__name__", MatchOp::Equal, "up"),
                LabelMatcher::new("job", MatchOp::RegexNoMatch, "batch.*"),
            ],
        };
        let store_query = translator.translate(&query).unwrap();
        assert_eq!(store_query.index, "prom-metrics");
        assert_eq!(store_query.size, 250);
        assert_eq!(store_query.filters[1].op, FilterOp::NotRegex);
    }

    #[test]
    fn test_translate_rejects_bad_input() {
        let translator = ReadQueryTranslator::new("a", 10);
        let inverted = ReadQuery {
            start_ms: 20,
            end_ms: 10,
            matchers: vec![],
        };
        assert!(matches!(translator.translate(&inverted), Err(Error::InvalidQuery(_))));

        let bad_regex = ReadQuery {
            start_ms: 0,
            end_ms: 10,
            matchers: vec![LabelMatcher::new("job", MatchOp::RegexMatch, "[")],
        };
        assert!(matches!(translator.translate(&bad_regex), Err(Error::InvalidQuery(_))));
    }

    #[test]
    fn test_hits_grouped_into_sorted_series() {
        let translator = ReadQueryTranslator::new("a", 10);
        let series = translator.to_series(vec![
            doc("web", 3, 3.0),
            doc("api", 2, 2.0),
            doc("web", 1, 1.0),
        ]);

        assert_eq!(series.len(), 2);
        assert_eq!(series[0].labels["job"], "api");
        assert_eq!(series[1].labels["job"], "web");
        let web: Vec<i64> = series[1].points.iter().map(|p| p.timestamp_ms).collect();
        assert_eq!(web, vec![1, 3]);
    }
}
