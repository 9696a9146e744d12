//! Threshold-driven rollover of the write index

use super::telemetry;
use super::{
    generation_index_name, parse_generation, switch_write_index, IndexConfig, IndexPhase,
    IndexState, LifecycleStats, LifecycleStatsSnapshot, RolloverEvent,
};
use crate::clock::Clock;
use crate::store::{with_deadline, StoreClient};
use crate::trigger::RolloverTrigger;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Periodically evaluates the alias's write index against the rollover
/// policy and rolls over to the next generation on breach.
///
/// The manager never coordinates with writers: they address the alias, and
/// the store's atomic alias update is the only synchronisation point.
pub struct IndexLifecycleManager {
    store: Arc<dyn StoreClient>,
    config: IndexConfig,
    clock: Arc<dyn Clock>,
    /// Last observed state per physical index
    indices: RwLock<BTreeMap<String, IndexState>>,
    stats: LifecycleStats,
    shutdown: CancellationToken,
}

impl IndexLifecycleManager {
    pub fn new(store: Arc<dyn StoreClient>, config: IndexConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
            indices: RwLock::new(BTreeMap::new()),
            stats: LifecycleStats::default(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Get a cancellation token that stops [`run`](Self::run).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the evaluation loop. Returns when the shutdown token is cancelled.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.config.check_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        warn!(alias = %self.config.alias, error = %e, "Lifecycle cycle failed, retrying next tick");
                    }
                }
                _ = self.shutdown.cancelled() => {
                    info!(alias = %self.config.alias, "Index lifecycle manager shutting down");
                    break;
                }
            }
        }
    }

    /// Evaluate the write index once and roll over if the policy is breached.
    ///
    /// A failure leaves the current write index in place; the next cycle
    /// starts over from whatever the alias points at.
    pub async fn run_cycle(&self) -> Result<Option<RolloverEvent>> {
        self.stats.record_cycle();
        match self.evaluate().await {
            Ok(Some(event)) => {
                telemetry::record_cycle("rolled_over");
                Ok(Some(event))
            }
            Ok(None) => {
                telemetry::record_cycle("within_limits");
                Ok(None)
            }
            Err(e) => {
                self.stats.record_failure();
                telemetry::record_cycle("failed");
                Err(e)
            }
        }
    }

    async fn evaluate(&self) -> Result<Option<RolloverEvent>> {
        let alias = self.config.alias.as_str();
        let deadline = self.config.request_timeout;

        let current = with_deadline("write_index", deadline, self.store.write_index(alias))
            .await?
            .ok_or_else(|| Error::AliasNotFound(alias.to_string()))?;
        let stats = with_deadline("index_stats", deadline, self.store.index_stats(&current)).await?;
        telemetry::record_write_index(stats.doc_count, stats.size_bytes);

        let now_ms = self.clock.now_millis();
        let mut state = IndexState::from_stats(alias, stats, IndexPhase::Active);
        let Some(trigger) = self.config.policy.evaluate(&state, now_ms) else {
            debug!(
                alias,
                index = %state.index,
                docs = state.doc_count,
                size_bytes = state.size_bytes,
                "Write index within limits"
            );
            self.track(state);
            return Ok(None);
        };

        state.phase = IndexPhase::Eligible;
        self.track(state.clone());
        info!(alias, index = %state.index, trigger = %trigger, "Write index eligible for rollover");

        self.rollover(&state, trigger).await.map(Some)
    }

    async fn rollover(&self, current: &IndexState, trigger: RolloverTrigger) -> Result<RolloverEvent> {
        let alias = self.config.alias.as_str();
        // An unsuffixed write index (e.g. a daily index) hands over to the
        // first generation.
        let generation = parse_generation(alias, &current.index).unwrap_or_else(|| {
            warn!(
                alias,
                index = %current.index,
                "Write index has no generation suffix, rolling over to the first generation"
            );
            0
        });
        let next = generation_index_name(alias, generation + 1);

        let started = std::time::Instant::now();
        if let Err(e) = switch_write_index(self.store.as_ref(), &self.config, &current.index, &next).await {
            error!(alias, from = %current.index, to = %next, error = %e, "Rollover failed");
            return Err(e);
        }

        {
            let mut indices = self.indices.write();
            if let Some(old) = indices.get_mut(&current.index) {
                old.phase = IndexPhase::Retired;
            }
            indices.insert(
                next.clone(),
                IndexState {
                    alias: alias.to_string(),
                    index: next.clone(),
                    doc_count: 0,
                    size_bytes: 0,
                    created_at_ms: self.clock.now_millis(),
                    phase: IndexPhase::Active,
                },
            );
        }
        self.stats.record_rollover();
        telemetry::record_rollover(trigger.reason(), started.elapsed().as_secs_f64());
        info!(
            alias,
            from = %current.index,
            to = %next,
            reason = trigger.reason(),
            trigger = %trigger,
            "Rolled over write index"
        );

        Ok(RolloverEvent {
            alias: alias.to_string(),
            from: current.index.clone(),
            to: next,
            trigger: Some(trigger),
        })
    }

    fn track(&self, state: IndexState) {
        self.indices.write().insert(state.index.clone(), state);
    }

    /// Last observed state of every index this manager has seen
    pub fn states(&self) -> Vec<IndexState> {
        self.indices.read().values().cloned().collect()
    }

    pub fn stats(&self) -> LifecycleStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::lifecycle::{bootstrap_write_index, RolloverPolicy};
    use crate::schema::Document;
    use crate::store::MemoryStore;
    use crate::trigger::TriggerKind;
    use std::time::Duration;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn doc(ts: i64) -> Document {
        let mut label = crate::schema::Labels::new();
        label.insert("__name__".to_string(), "up".to_string());
        Document {
            label,
            value: 1.0,
            timestamp: ts,
        }
    }

    async fn setup(policy: RolloverPolicy) -> (Arc<MemoryStore>, Arc<ManualClock>, IndexLifecycleManager) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let config = IndexConfig {
            policy,
            ..IndexConfig::default()
        };
        bootstrap_write_index(store.as_ref(), &config, clock.as_ref())
            .await
            .unwrap();
        let manager = IndexLifecycleManager::new(store.clone(), config, clock.clone());
        (store, clock, manager)
    }

    #[tokio::test]
    async fn test_doc_limit_rolls_over() {
        let policy = RolloverPolicy {
            max_docs: Some(2),
            ..RolloverPolicy::default()
        };
        let (store, _clock, manager) = setup(policy).await;

        store.bulk("prom-metrics", &[doc(1)]).await.unwrap();
        assert_eq!(manager.run_cycle().await.unwrap(), None);

        store.bulk("prom-metrics", &[doc(2)]).await.unwrap();
        let event = manager.run_cycle().await.unwrap().unwrap();
        assert_eq!(event.from, "prom-metrics-000001");
        assert_eq!(event.to, "prom-metrics-000002");
        assert_eq!(event.trigger.map(|t| t.kind()), Some(TriggerKind::Count));

        let phases: Vec<_> = manager.states().into_iter().map(|s| (s.index, s.phase)).collect();
        assert_eq!(
            phases,
            vec![
                ("prom-metrics-000001".to_string(), IndexPhase::Retired),
                ("prom-metrics-000002".to_string(), IndexPhase::Active),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_create_keeps_old_write_index() {
        let (store, clock, manager) = setup(RolloverPolicy::default()).await;
        store.bulk("prom-metrics", &[doc(1)]).await.unwrap();
        clock.advance(8 * DAY);

        store.faults().fail_next_create_index(1);
        let err = manager.run_cycle().await.unwrap_err();
        assert!(matches!(err, Error::Lifecycle(_)));
        assert_eq!(store.write_targets("prom-metrics"), vec!["prom-metrics-000001"]);
        assert_eq!(manager.stats().failures, 1);

        let event = manager.run_cycle().await.unwrap().unwrap();
        assert_eq!(event.to, "prom-metrics-000002");
    }

    #[tokio::test]
    async fn test_alias_failure_reuses_orphaned_index() {
        let (store, clock, manager) = setup(RolloverPolicy::default()).await;
        store.bulk("prom-metrics", &[doc(1)]).await.unwrap();
        clock.advance(8 * DAY);

        store.faults().fail_next_alias_update(1);
        assert!(manager.run_cycle().await.is_err());
        assert_eq!(store.write_targets("prom-metrics"), vec!["prom-metrics-000001"]);
        assert!(store.index_names().contains(&"prom-metrics-000002".to_string()));

        let event = manager.run_cycle().await.unwrap().unwrap();
        assert_eq!(event.to, "prom-metrics-000002");
        assert_eq!(store.write_targets("prom-metrics"), vec!["prom-metrics-000002"]);
        assert_eq!(store.index_names().len(), 2);
    }

    #[tokio::test]
    async fn test_daily_write_index_rolls_to_first_generation() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let daily = IndexConfig {
            daily: true,
            ..IndexConfig::default()
        };
        let daily_index = bootstrap_write_index(store.as_ref(), &daily, clock.as_ref())
            .await
            .unwrap();
        assert_eq!(daily_index, "prom-metrics-2023.11.14");

        let config = IndexConfig {
            policy: RolloverPolicy {
                max_docs: Some(1),
                ..RolloverPolicy::default()
            },
            ..IndexConfig::default()
        };
        let manager = IndexLifecycleManager::new(store.clone(), config, clock.clone());
        store.bulk("prom-metrics", &[doc(1)]).await.unwrap();

        let event = manager.run_cycle().await.unwrap().unwrap();
        assert_eq!(event.from, daily_index);
        assert_eq!(event.to, "prom-metrics-000001");
        assert_eq!(store.write_targets("prom-metrics"), vec!["prom-metrics-000001"]);
    }
}
