//! Index lifecycle
//!
//! Writes always go to a stable alias. Exactly one physical index behind it
//! is the write index; older indices stay attached as read members so
//! queries through the alias see all of them.
//!
//! Two strategies keep the write index fresh:
//! - [`IndexLifecycleManager`] rolls over to `<alias>-NNNNNN` when the
//!   [`RolloverPolicy`] is breached
//! - [`DailyIndexScheduler`] switches to `<alias>-YYYY.MM.DD` at each UTC
//!   day boundary
//!
//! Both repoint the alias with one atomic multi-action update, so writers
//! never observe zero or two write targets.

mod daily;
mod manager;
mod telemetry;
mod template;

pub use daily::DailyIndexScheduler;
pub use manager::IndexLifecycleManager;
pub use template::{ensure_index_template, index_template, metric_mappings};

use crate::clock::Clock;
use crate::store::{
    with_deadline, AliasAction, CreateIndexOutcome, CreateIndexRequest, IndexSettings,
    IndexStats, StoreClient,
};
use crate::trigger::{Measurement, RolloverTrigger, Thresholds, TriggerPrecedence};
use crate::{Error, Result};
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Width of the zero-padded generation suffix
const GENERATION_WIDTH: usize = 6;

/// Index rollover thresholds; `None` disables a dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloverPolicy {
    pub max_age: Option<Duration>,
    pub max_docs: Option<u64>,
    pub max_size_bytes: Option<u64>,
    pub precedence: TriggerPrecedence,
    /// Let an index holding no documents roll over once it is too old
    pub roll_empty: bool,
}

impl Default for RolloverPolicy {
    fn default() -> Self {
        Self {
            max_age: Some(Duration::from_secs(7 * 24 * 60 * 60)),
            max_docs: Some(1_000_000),
            max_size_bytes: None,
            precedence: TriggerPrecedence::default(),
            roll_empty: false,
        }
    }
}

impl RolloverPolicy {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            max_size_bytes: self.max_size_bytes,
            max_count: self.max_docs,
            max_age: self.max_age,
        }
    }

    /// First breached limit for `state` at `now_ms`, in precedence order.
    pub fn evaluate(&self, state: &IndexState, now_ms: i64) -> Option<RolloverTrigger> {
        let measured = state.measurement(now_ms);
        if self.roll_empty {
            self.thresholds()
                .evaluate_including_empty(&measured, &self.precedence)
        } else {
            self.thresholds().evaluate(&measured, &self.precedence)
        }
    }
}

/// Configuration for index provisioning and lifecycle
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Alias clients write to and read from
    pub alias: String,
    /// Use one index per UTC day instead of threshold rollover
    pub daily: bool,
    pub settings: IndexSettings,
    pub policy: RolloverPolicy,
    /// How often the lifecycle task evaluates the write index
    pub check_interval: Duration,
    /// Deadline for each store operation
    pub request_timeout: Duration,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            alias: "prom-metrics".to_string(),
            daily: false,
            settings: IndexSettings::default(),
            policy: RolloverPolicy::default(),
            check_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl IndexConfig {
    pub fn validate(&self) -> Result<()> {
        if self.alias.is_empty() || self.alias != self.alias.to_lowercase() {
            return Err(Error::Config(format!(
                "alias '{}' must be non-empty and lowercase",
                self.alias
            )));
        }
        if self.settings.number_of_shards == 0 {
            return Err(Error::Config("an index needs at least one shard".to_string()));
        }
        if self.check_interval.is_zero() {
            return Err(Error::Config("lifecycle check interval must be positive".to_string()));
        }
        self.policy.thresholds().validate("index")
    }
}

/// Lifecycle phase of a physical index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexPhase {
    /// Current write index
    Active,
    /// Write index that breached its policy and awaits rollover
    Eligible,
    /// Read-only member of the alias
    Retired,
}

/// Last observed state of a physical index
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexState {
    pub alias: String,
    pub index: String,
    pub doc_count: u64,
    pub size_bytes: u64,
    pub created_at_ms: i64,
    pub phase: IndexPhase,
}

impl IndexState {
    pub fn from_stats(alias: &str, stats: IndexStats, phase: IndexPhase) -> Self {
        Self {
            alias: alias.to_string(),
            index: stats.index,
            doc_count: stats.doc_count,
            size_bytes: stats.size_bytes,
            created_at_ms: stats.created_at_ms,
            phase,
        }
    }

    pub fn age(&self, now_ms: i64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.created_at_ms).max(0) as u64)
    }

    pub fn measurement(&self, now_ms: i64) -> Measurement {
        Measurement {
            size_bytes: self.size_bytes,
            count: self.doc_count,
            age: self.age(now_ms),
        }
    }
}

/// One completed alias switch
#[derive(Debug, Clone, PartialEq)]
pub struct RolloverEvent {
    pub alias: String,
    pub from: String,
    pub to: String,
    /// `None` for a scheduled daily switch
    pub trigger: Option<RolloverTrigger>,
}

/// Lifecycle counters
#[derive(Debug, Default)]
pub struct LifecycleStats {
    cycles: AtomicU64,
    rollovers: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LifecycleStatsSnapshot {
    pub cycles: u64,
    pub rollovers: u64,
    pub failures: u64,
}

impl LifecycleStats {
    pub(crate) fn record_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rollover(&self) {
        self.rollovers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LifecycleStatsSnapshot {
        LifecycleStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            rollovers: self.rollovers.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// The lifecycle strategy selected by [`IndexConfig::daily`]
#[derive(Clone)]
pub enum LifecycleService {
    Rollover(Arc<IndexLifecycleManager>),
    Daily(Arc<DailyIndexScheduler>),
}

impl LifecycleService {
    pub fn new(store: Arc<dyn StoreClient>, config: IndexConfig, clock: Arc<dyn Clock>) -> Self {
        if config.daily {
            Self::Daily(Arc::new(DailyIndexScheduler::new(store, config, clock)))
        } else {
            Self::Rollover(Arc::new(IndexLifecycleManager::new(store, config, clock)))
        }
    }

    pub async fn run(&self) {
        match self {
            Self::Rollover(manager) => manager.run().await,
            Self::Daily(scheduler) => scheduler.run().await,
        }
    }

    pub async fn run_cycle(&self) -> Result<Option<RolloverEvent>> {
        match self {
            Self::Rollover(manager) => manager.run_cycle().await,
            Self::Daily(scheduler) => scheduler.run_cycle().await,
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        match self {
            Self::Rollover(manager) => manager.shutdown_token(),
            Self::Daily(scheduler) => scheduler.shutdown_token(),
        }
    }

    pub fn stats(&self) -> LifecycleStatsSnapshot {
        match self {
            Self::Rollover(manager) => manager.stats(),
            Self::Daily(scheduler) => scheduler.stats(),
        }
    }
}

/// `<alias>-000042`
pub fn generation_index_name(alias: &str, generation: u64) -> String {
    format!("{}-{:0width$}", alias, generation, width = GENERATION_WIDTH)
}

/// Generation number of a `<alias>-NNNNNN` index, if it is one.
pub fn parse_generation(alias: &str, index: &str) -> Option<u64> {
    let suffix = index.strip_prefix(alias)?.strip_prefix('-')?;
    if suffix.len() < GENERATION_WIDTH || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// `<alias>-YYYY.MM.DD`
pub fn daily_index_name(alias: &str, day: NaiveDate) -> String {
    format!("{}-{}", alias, day.format("%Y.%m.%d"))
}

/// Pattern matching every index the adapter creates for `alias`
pub fn index_pattern(alias: &str) -> String {
    format!("{}-*", alias)
}

/// Make sure `alias` has a write index, creating the first one if needed.
///
/// Returns the write index. Runs before any write is accepted, so every
/// failure is a [`Error::Startup`].
pub async fn bootstrap_write_index(
    store: &dyn StoreClient,
    config: &IndexConfig,
    clock: &dyn Clock,
) -> Result<String> {
    let alias = config.alias.as_str();
    let deadline = config.request_timeout;
    let startup = |e: Error| Error::Startup(format!("bootstrapping alias {}: {}", alias, e));

    if let Some(index) = with_deadline("write_index", deadline, store.write_index(alias))
        .await
        .map_err(startup)?
    {
        info!(alias, index = %index, "Using existing write index");
        return Ok(index);
    }

    let index = if config.daily {
        daily_index_name(alias, clock.now().date_naive())
    } else {
        generation_index_name(alias, 1)
    };

    let request = CreateIndexRequest {
        settings: Some(config.settings),
        write_alias: Some(alias.to_string()),
    };
    let outcome = with_deadline("create_index", deadline, store.create_index(&index, &request))
        .await
        .map_err(startup)?;

    if outcome == CreateIndexOutcome::AlreadyExists {
        // Left without its alias by an interrupted earlier start
        let attach = [AliasAction::Add {
            index: index.clone(),
            alias: alias.to_string(),
            is_write_index: true,
        }];
        with_deadline("update_aliases", deadline, store.update_aliases(&attach))
            .await
            .map_err(startup)?;
    }

    info!(alias, index = %index, "Bootstrapped write index");
    Ok(index)
}

/// Create `next` and make it the alias's sole write index in one atomic
/// alias update, keeping `current` attached for reads.
///
/// Creation is idempotent, so retrying after a failed alias update reuses
/// the index left behind by the previous attempt.
pub(crate) async fn switch_write_index(
    store: &dyn StoreClient,
    config: &IndexConfig,
    current: &str,
    next: &str,
) -> Result<()> {
    let alias = config.alias.as_str();
    let deadline = config.request_timeout;

    let request = CreateIndexRequest {
        settings: Some(config.settings),
        write_alias: None,
    };
    let created = with_deadline("create_index", deadline, store.create_index(next, &request))
        .await
        .map_err(|e| {
            telemetry::record_rollover_failure("create_index");
            Error::Lifecycle(format!("creating index {}: {}", next, e))
        })?;
    if created == CreateIndexOutcome::AlreadyExists {
        info!(alias, index = next, "Reusing index from an earlier attempt");
    }

    let actions = [
        AliasAction::Add {
            index: next.to_string(),
            alias: alias.to_string(),
            is_write_index: true,
        },
        AliasAction::Add {
            index: current.to_string(),
            alias: alias.to_string(),
            is_write_index: false,
        },
    ];
    with_deadline("update_aliases", deadline, store.update_aliases(&actions))
        .await
        .map_err(|e| {
            telemetry::record_rollover_failure("update_aliases");
            Error::Lifecycle(format!("switching alias {} to {}: {}", alias, next, e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::trigger::TriggerKind;

    #[test]
    fn test_generation_names() {
        assert_eq!(generation_index_name("prom-metrics", 1), "prom-metrics-000001");
        assert_eq!(generation_index_name("m", 1_234_567), "m-1234567");
        assert_eq!(parse_generation("prom-metrics", "prom-metrics-000042"), Some(42));
        assert_eq!(parse_generation("prom-metrics", "prom-metrics-2024.01.01"), None);
        assert_eq!(parse_generation("prom", "prom-metrics-000001"), None);
    }

    #[test]
    fn test_daily_name() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(daily_index_name("prom-metrics", day), "prom-metrics-2024.03.09");
    }

    #[test]
    fn test_policy_evaluation() {
        let policy = RolloverPolicy::default();
        let day = 24 * 60 * 60 * 1000;
        let state = IndexState {
            alias: "a".to_string(),
            index: "a-000001".to_string(),
            doc_count: 10,
            size_bytes: 1000,
            created_at_ms: 0,
            phase: IndexPhase::Active,
        };
        assert_eq!(policy.evaluate(&state, 6 * day), None);
        assert_eq!(
            policy.evaluate(&state, 8 * day).map(|t| t.kind()),
            Some(TriggerKind::Age)
        );

        let empty = IndexState {
            doc_count: 0,
            ..state
        };
        assert_eq!(policy.evaluate(&empty, 30 * day), None);
    }

    #[test]
    fn test_config_validation() {
        assert!(IndexConfig::default().validate().is_ok());
        let upper = IndexConfig {
            alias: "Prom".to_string(),
            ..IndexConfig::default()
        };
        assert!(upper.validate().is_err());
    }

    #[tokio::test]
    async fn test_bootstrap_creates_first_generation_once() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(0);
        let config = IndexConfig::default();

        let first = bootstrap_write_index(&store, &config, &clock).await.unwrap();
        assert_eq!(first, "prom-metrics-000001");

        let again = bootstrap_write_index(&store, &config, &clock).await.unwrap();
        assert_eq!(again, first);
        assert_eq!(store.index_names(), vec![first.clone()]);
        assert_eq!(store.write_targets("prom-metrics"), vec![first]);
    }

    #[tokio::test]
    async fn test_bootstrap_failure_is_fatal() {
        let store = MemoryStore::new();
        store.faults().fail_next_create_index(1);
        let err = bootstrap_write_index(&store, &IndexConfig::default(), &ManualClock::new(0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Startup(_)));
    }
}
