//! Component factory and option parsers
//!
//! The store backend is chosen from the environment so the adapter can run
//! against a real cluster or fully in memory for local development.

use crate::store::{HttpStoreClient, MemoryStore, StoreClient};
use crate::{Error, Result, StoreConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct ComponentFactory;

impl ComponentFactory {
    /// Create the document store client.
    ///
    /// Environment variables:
    /// - STORE_BACKEND: "elasticsearch" (default) or "memory"
    pub async fn create_store(config: &StoreConfig) -> Result<Arc<dyn StoreClient>> {
        let backend =
            std::env::var("STORE_BACKEND").unwrap_or_else(|_| "elasticsearch".to_string());

        match backend.as_str() {
            "elasticsearch" => {
                info!(url = %config.url, sniff = config.sniff, "Using Elasticsearch store");
                Ok(Arc::new(HttpStoreClient::connect(config).await?))
            }
            "memory" => {
                info!("Using in-memory store (development mode)");
                Ok(Arc::new(MemoryStore::new()))
            }
            _ => Err(Error::Config(format!(
                "Unknown STORE_BACKEND: {}. Use 'elasticsearch' or 'memory'",
                backend
            ))),
        }
    }
}

/// Parse `30s`, `15m`, `12h`, `7d` or `2w`. A bare number is seconds.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: u64 = number
        .parse()
        .map_err(|_| Error::Config(format!("invalid duration '{}'", raw)))?;

    let seconds = match unit.to_ascii_lowercase().as_str() {
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        "w" => 7 * 24 * 60 * 60,
        other => {
            return Err(Error::Config(format!(
                "invalid duration unit '{}' in '{}'",
                other, raw
            )))
        }
    };
    value
        .checked_mul(seconds)
        .map(Duration::from_secs)
        .ok_or_else(|| Error::Config(format!("duration '{}' is too large", raw)))
}

/// Parse `512b`, `64kb`, `10mb`, `5gb` or `1tb` (binary multiples). A bare
/// number is bytes.
pub fn parse_byte_size(raw: &str) -> Result<u64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: u64 = number
        .parse()
        .map_err(|_| Error::Config(format!("invalid byte size '{}'", raw)))?;

    let multiplier: u64 = match unit.to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1 << 10,
        "m" | "mb" => 1 << 20,
        "g" | "gb" => 1 << 30,
        "t" | "tb" => 1 << 40,
        other => {
            return Err(Error::Config(format!(
                "invalid byte size unit '{}' in '{}'",
                other, raw
            )))
        }
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::Config(format!("byte size '{}' is too large", raw)))
}

/// Empty input disables the limit.
pub fn parse_optional_byte_size(raw: &str) -> Result<Option<u64>> {
    if raw.trim().is_empty() {
        Ok(None)
    } else {
        parse_byte_size(raw).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(7 * 86_400));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
        assert!(parse_duration("d").is_err());
        assert!(parse_duration("3y").is_err());
    }

    #[test]
    fn test_parse_byte_size() {
        assert_eq!(parse_byte_size("5gb").unwrap(), 5 * 1024 * 1024 * 1024);
        assert_eq!(parse_byte_size("4096").unwrap(), 4096);
        assert_eq!(parse_byte_size("10MB").unwrap(), 10 * 1024 * 1024);
        assert!(parse_byte_size("5 parsecs").is_err());
        assert_eq!(parse_optional_byte_size("").unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_backend_is_config_error() {
        std::env::set_var("STORE_BACKEND", "cassandra");
        let result = ComponentFactory::create_store(&StoreConfig::default()).await;
        std::env::remove_var("STORE_BACKEND");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
