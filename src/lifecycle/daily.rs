//! One write index per UTC day

use super::telemetry;
use super::{
    daily_index_name, switch_write_index, IndexConfig, LifecycleStats, LifecycleStatsSnapshot,
    RolloverEvent,
};
use crate::clock::Clock;
use crate::store::{with_deadline, StoreClient};
use crate::{Error, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Switches the alias to `<alias>-YYYY.MM.DD` when the UTC day changes.
/// No thresholds are evaluated in this mode.
pub struct DailyIndexScheduler {
    store: Arc<dyn StoreClient>,
    config: IndexConfig,
    clock: Arc<dyn Clock>,
    stats: LifecycleStats,
    shutdown: CancellationToken,
}

impl DailyIndexScheduler {
    pub fn new(store: Arc<dyn StoreClient>, config: IndexConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
            stats: LifecycleStats::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Wake at the next day boundary (or the check interval, if sooner) and
    /// switch indices. Returns when the shutdown token is cancelled.
    pub async fn run(&self) {
        loop {
            let wait = until_next_day(self.clock.now()).min(self.config.check_interval);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    if let Err(e) = self.run_cycle().await {
                        warn!(alias = %self.config.alias, error = %e, "Daily index switch failed, retrying");
                    }
                }
                _ = self.shutdown.cancelled() => {
                    info!(alias = %self.config.alias, "Daily index scheduler shutting down");
                    break;
                }
            }
        }
    }

    /// Switch to today's index if the alias still points at an older one.
    pub async fn run_cycle(&self) -> Result<Option<RolloverEvent>> {
        self.stats.record_cycle();
        let result = self.switch_if_stale().await;
        match &result {
            Ok(Some(_)) => telemetry::record_cycle("rolled_over"),
            Ok(None) => telemetry::record_cycle("within_limits"),
            Err(_) => {
                self.stats.record_failure();
                telemetry::record_cycle("failed");
            }
        }
        result
    }

    async fn switch_if_stale(&self) -> Result<Option<RolloverEvent>> {
        let alias = self.config.alias.as_str();
        let today = daily_index_name(alias, self.clock.now().date_naive());

        let current = with_deadline(
            "write_index",
            self.config.request_timeout,
            self.store.write_index(alias),
        )
        .await?
        .ok_or_else(|| Error::AliasNotFound(alias.to_string()))?;

        // Names sort chronologically; never move the alias backwards.
        if current >= today {
            return Ok(None);
        }

        let started = std::time::Instant::now();
        switch_write_index(self.store.as_ref(), &self.config, &current, &today).await?;
        self.stats.record_rollover();
        telemetry::record_rollover("day_changed", started.elapsed().as_secs_f64());
        info!(alias, from = %current, to = %today, "Switched to daily index");

        Ok(Some(RolloverEvent {
            alias: alias.to_string(),
            from: current,
            to: today,
            trigger: None,
        }))
    }

    pub fn stats(&self) -> LifecycleStatsSnapshot {
        self.stats.snapshot()
    }
}

/// Time left until the next UTC midnight
fn until_next_day(now: DateTime<Utc>) -> Duration {
    let tomorrow = now.date_naive() + ChronoDuration::days(1);
    let midnight = tomorrow.and_hms_opt(0, 0, 0).map(|t| t.and_utc());
    midnight
        .and_then(|m| (m - now).to_std().ok())
        .unwrap_or(Duration::from_secs(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::lifecycle::bootstrap_write_index;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_until_next_day() {
        assert_eq!(
            until_next_day(at(2024, 1, 1, 23)),
            Duration::from_secs(60 * 60)
        );
    }

    #[tokio::test]
    async fn test_switches_on_day_boundary() {
        let clock = Arc::new(ManualClock::at(at(2024, 1, 1, 12)));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let config = IndexConfig {
            daily: true,
            ..IndexConfig::default()
        };
        let first = bootstrap_write_index(store.as_ref(), &config, clock.as_ref())
            .await
            .unwrap();
        assert_eq!(first, "prom-metrics-2024.01.01");

        let scheduler = DailyIndexScheduler::new(store.clone(), config, clock.clone());
        assert_eq!(scheduler.run_cycle().await.unwrap(), None);

        clock.advance(Duration::from_secs(13 * 60 * 60));
        let event = scheduler.run_cycle().await.unwrap().unwrap();
        assert_eq!(event.to, "prom-metrics-2024.01.02");
        assert_eq!(event.trigger, None);
        assert_eq!(store.write_targets("prom-metrics"), vec!["prom-metrics-2024.01.02"]);
        assert_eq!(
            store.alias_members("prom-metrics"),
            vec!["prom-metrics-2024.01.01", "prom-metrics-2024.01.02"]
        );
    }
}
