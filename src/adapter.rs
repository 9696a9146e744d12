//! Startup and shutdown of the whole adapter

use crate::api::{self, AdminState, ApiState};
use crate::clock::Clock;
use crate::lifecycle::{
    bootstrap_write_index, ensure_index_template, parse_generation, LifecycleService,
};
use crate::read::ReadService;
use crate::store::StoreClient;
use crate::writer::WriteService;
use crate::{Config, Result};
use axum::Router;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A running adapter: provisioned indices, lifecycle task and services.
pub struct Adapter {
    store: Arc<dyn StoreClient>,
    write: Arc<WriteService>,
    read: Arc<ReadService>,
    lifecycle: LifecycleService,
    lifecycle_task: Mutex<Option<JoinHandle<()>>>,
}

impl Adapter {
    /// Provision the template and write index, then start the lifecycle task
    /// and the read and write services.
    ///
    /// Template or bootstrap failure is returned before any write can be
    /// accepted.
    pub async fn start(
        config: &Config,
        store: Arc<dyn StoreClient>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        ensure_index_template(store.as_ref(), &config.index).await?;
        let write_index = bootstrap_write_index(store.as_ref(), &config.index, clock.as_ref()).await?;
        if !config.index.daily && parse_generation(&config.index.alias, &write_index).is_none() {
            warn!(
                alias = %config.index.alias,
                write_index = %write_index,
                "Write index has no generation suffix; the first rollover moves to generation 1"
            );
        }

        let lifecycle = LifecycleService::new(store.clone(), config.index.clone(), clock);
        let lifecycle_task = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.run().await })
        };

        let read = Arc::new(ReadService::new(store.clone(), &config.read));
        let write = Arc::new(WriteService::start(
            config.writer.clone(),
            store.clone(),
            config.index.alias.clone(),
        )?);

        info!(
            alias = %config.index.alias,
            write_index = %write_index,
            daily = config.index.daily,
            "Adapter started"
        );

        Ok(Self {
            store,
            write,
            read,
            lifecycle,
            lifecycle_task: Mutex::new(Some(lifecycle_task)),
        })
    }

    pub fn api_router(&self) -> Router {
        api::build_api_router(ApiState {
            write: self.write.clone(),
            read: self.read.clone(),
        })
    }

    pub fn admin_router(&self, stats_enabled: bool) -> Router {
        api::build_admin_router(
            AdminState {
                store: self.store.clone(),
                write: self.write.clone(),
                lifecycle: Some(self.lifecycle.clone()),
            },
            stats_enabled,
        )
    }

    pub fn write_service(&self) -> &Arc<WriteService> {
        &self.write
    }

    pub fn read_service(&self) -> &Arc<ReadService> {
        &self.read
    }

    pub fn lifecycle(&self) -> &LifecycleService {
        &self.lifecycle
    }

    /// Stop the lifecycle task, then drain the write pipeline.
    pub async fn shutdown(&self) -> Result<()> {
        self.lifecycle.shutdown_token().cancel();
        let task = self.lifecycle_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Lifecycle task ended abnormally");
            }
        }
        self.write.shutdown().await
    }
}
