//! Prometheus remote storage adapter for Elasticsearch
//!
//! Serves remote write/read on the API port and probes plus counters on the
//! admin port.

use prometheus_es_adapter::api::ApiServerConfig;
use prometheus_es_adapter::clock::{Clock, SystemClock};
use prometheus_es_adapter::config::{parse_duration, parse_optional_byte_size, ComponentFactory};
use prometheus_es_adapter::lifecycle::{IndexConfig, RolloverPolicy};
use prometheus_es_adapter::read::ReadConfig;
use prometheus_es_adapter::store::IndexSettings;
use prometheus_es_adapter::telemetry::{log_level, Telemetry};
use prometheus_es_adapter::trigger::{Thresholds, TriggerPrecedence};
use prometheus_es_adapter::writer::{Backoff, WriterConfig};
use prometheus_es_adapter::{Adapter, Config, Error, StoreConfig};

use clap::{ArgAction, Parser};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus remote storage adapter for Elasticsearch
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Elasticsearch URL
    #[arg(long, env = "ES_URL", default_value = "http://localhost:9200")]
    es_url: String,

    /// Number of bulk flush workers
    #[arg(long, env = "ES_WORKERS", default_value_t = 1)]
    es_workers: usize,

    /// Max seconds a batch stays open before it is flushed
    #[arg(long, env = "ES_BATCH_MAX_AGE", default_value_t = 10)]
    es_batch_max_age: u64,

    /// Max samples per bulk request
    #[arg(long, env = "ES_BATCH_MAX_DOCS", default_value_t = 1000)]
    es_batch_max_docs: u64,

    /// Max estimated bytes per bulk request
    #[arg(long, env = "ES_BATCH_MAX_SIZE", default_value_t = 4096)]
    es_batch_max_size: u64,

    /// Alias pointing at the active write index
    #[arg(long, env = "ES_ALIAS", default_value = "prom-metrics")]
    es_alias: String,

    /// Use one index per UTC day instead of threshold rollover
    #[arg(long, env = "ES_INDEX_DAILY", default_value_t = false, action = ArgAction::Set)]
    es_index_daily: bool,

    #[arg(long, env = "ES_INDEX_SHARDS", default_value_t = 5)]
    es_index_shards: u32,

    #[arg(long, env = "ES_INDEX_REPLICAS", default_value_t = 1)]
    es_index_replicas: u32,

    /// Max index age before rollover, e.g. 7d
    #[arg(long, env = "ES_INDEX_MAX_AGE", default_value = "7d")]
    es_index_max_age: String,

    /// Max documents in an index before rollover
    #[arg(long, env = "ES_INDEX_MAX_DOCS", default_value_t = 1_000_000)]
    es_index_max_docs: u64,

    /// Max index size before rollover, e.g. 5gb; empty disables the limit
    #[arg(long, env = "ES_INDEX_MAX_SIZE", default_value = "")]
    es_index_max_size: String,

    /// Roll over an index that is past max age even if it holds no documents
    #[arg(long, env = "ES_INDEX_ROLL_EMPTY", default_value_t = false, action = ArgAction::Set)]
    es_index_roll_empty: bool,

    /// Max documents returned per remote read query
    #[arg(long, env = "ES_SEARCH_MAX_DOCS", default_value_t = 1000)]
    es_search_max_docs: usize,

    /// Discover cluster nodes and spread requests across them
    #[arg(long, env = "ES_SNIFF", default_value_t = false, action = ArgAction::Set)]
    es_sniff: bool,

    /// Timeout for each store request, e.g. 30s
    #[arg(long, env = "ES_TIMEOUT", default_value = "30s")]
    es_timeout: String,

    /// How often the write index is checked for rollover
    #[arg(long, env = "ES_INDEX_CHECK_INTERVAL", default_value = "60s")]
    es_index_check_interval: String,

    /// Closed batches waiting for a worker before writes block
    #[arg(long, env = "ADAPTER_QUEUE_CAPACITY", default_value_t = 16)]
    queue_capacity: usize,

    /// Bulk retries after the first attempt
    #[arg(long, env = "ADAPTER_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    #[arg(long, env = "ADAPTER_BACKOFF_INITIAL_MS", default_value_t = 100)]
    backoff_initial_ms: u64,

    #[arg(long, env = "ADAPTER_BACKOFF_MAX_MS", default_value_t = 5000)]
    backoff_max_ms: u64,

    /// Time allowed to drain pending batches at shutdown
    #[arg(long, env = "ADAPTER_DRAIN_TIMEOUT", default_value = "30s")]
    drain_timeout: String,

    /// Order in which simultaneously reached limits are reported
    #[arg(long, env = "ADAPTER_TRIGGER_PRECEDENCE", default_value = "size,count,age")]
    trigger_precedence: String,

    /// Remote read/write port
    #[arg(long, env = "ADAPTER_HTTP_PORT", default_value_t = 8000)]
    http_port: u16,

    #[arg(long, env = "ADAPTER_ADMIN_PORT", default_value_t = 9000)]
    admin_port: u16,

    /// Serve write and lifecycle counters on /stats
    #[arg(long, env = "ADAPTER_STATS", default_value_t = true, action = ArgAction::Set)]
    stats: bool,

    /// Debug logging
    #[arg(long, env = "ADAPTER_DEBUG", default_value_t = false, action = ArgAction::Set)]
    debug: bool,
}

impl Args {
    fn to_config(&self) -> Result<(Config, ApiServerConfig), Error> {
        let precedence: TriggerPrecedence = self.trigger_precedence.parse()?;
        let request_timeout = parse_duration(&self.es_timeout)?;

        let store = StoreConfig {
            url: self.es_url.clone(),
            sniff: self.es_sniff,
            request_timeout,
        };
        let writer = WriterConfig {
            workers: self.es_workers,
            batch: Thresholds {
                max_size_bytes: Some(self.es_batch_max_size),
                max_count: Some(self.es_batch_max_docs),
                max_age: Some(Duration::from_secs(self.es_batch_max_age)),
            },
            precedence,
            queue_capacity: self.queue_capacity,
            max_retries: self.max_retries,
            backoff: Backoff {
                initial: Duration::from_millis(self.backoff_initial_ms),
                max: Duration::from_millis(self.backoff_max_ms),
            },
            request_timeout,
            drain_timeout: parse_duration(&self.drain_timeout)?,
            ..WriterConfig::default()
        };
        let index = IndexConfig {
            alias: self.es_alias.clone(),
            daily: self.es_index_daily,
            settings: IndexSettings {
                number_of_shards: self.es_index_shards,
                number_of_replicas: self.es_index_replicas,
            },
            policy: RolloverPolicy {
                max_age: Some(parse_duration(&self.es_index_max_age)?),
                max_docs: Some(self.es_index_max_docs),
                max_size_bytes: parse_optional_byte_size(&self.es_index_max_size)?,
                precedence,
                roll_empty: self.es_index_roll_empty,
            },
            check_interval: parse_duration(&self.es_index_check_interval)?,
            request_timeout,
        };
        let read = ReadConfig {
            alias: self.es_alias.clone(),
            max_docs: self.es_search_max_docs,
            request_timeout,
        };
        let server = ApiServerConfig {
            http_port: self.http_port,
            admin_port: self.admin_port,
            stats_enabled: self.stats,
        };

        Ok((
            Config {
                store,
                writer,
                index,
                read,
            },
            server,
        ))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let _telemetry =
        Telemetry::init_for_component("prometheus-es-adapter", &args.es_alias, log_level(args.debug))?;
    let (config, server) = args.to_config()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        es_url = %config.store.url,
        alias = %config.index.alias,
        daily = config.index.daily,
        workers = config.writer.workers,
        "Starting adapter"
    );

    let store = ComponentFactory::create_store(&config.store).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let adapter = Adapter::start(&config, store, clock).await?;

    let api_listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], server.http_port))).await?;
    let admin_listener =
        TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], server.admin_port))).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let api_shutdown = shutdown_rx.clone();
    let admin_shutdown = shutdown_rx;
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    info!(
        http_port = server.http_port,
        admin_port = server.admin_port,
        stats = server.stats_enabled,
        "Adapter ready"
    );

    let api_server = {
        let router = adapter.api_router();
        async move {
            axum::serve(api_listener, router)
                .with_graceful_shutdown(wait_for_shutdown(api_shutdown))
                .await
                .map_err(|e| Error::Internal(format!("API server error: {e}")))
        }
    };
    let admin_server = {
        let router = adapter.admin_router(server.stats_enabled);
        async move {
            axum::serve(admin_listener, router)
                .with_graceful_shutdown(wait_for_shutdown(admin_shutdown))
                .await
                .map_err(|e| Error::Internal(format!("admin server error: {e}")))
        }
    };
    tokio::try_join!(api_server, admin_server)?;

    info!("HTTP servers stopped, draining write pipeline");
    if let Err(e) = adapter.shutdown().await {
        error!(error = %e, "Adapter shut down with data loss");
        return Err(e.into());
    }
    info!("Adapter shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    if *shutdown.borrow() {
        return;
    }
    let _ = shutdown.changed().await;
}
