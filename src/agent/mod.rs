use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, StoreKind};
use crate::export::health::HealthMetrics;
use crate::gauge::{GaugeCollector, ProcessGaugeSource};
use crate::interval::{AggregatorContext, AggregatorSettings, Aggregators};
use crate::migrate::{ClickHouseMigrator, Migrator};
use crate::rollup::{RollupEngine, RollupScheduler};
use crate::store::{ClickHouseStore, InMemoryStore, StoreBackend};

/// Service orchestrates the store, the per-scope aggregators, the rollup
/// scheduler and the self gauges.
pub struct Service {
    cfg: Config,
    health: Arc<HealthMetrics>,
    clock: Arc<dyn Clock>,
    aggregators: Option<Arc<Aggregators<StoreBackend>>>,
    scheduler: Option<RollupScheduler<StoreBackend>>,
    gauges: Option<Arc<GaugeCollector<StoreBackend>>>,
    cancel: CancellationToken,
}

impl Service {
    /// Creates a new Service, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            clock: Arc::new(SystemClock),
            aggregators: None,
            scheduler: None,
            gauges: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Producer-facing aggregators, available once started.
    pub fn aggregators(&self) -> Option<&Arc<Aggregators<StoreBackend>>> {
        self.aggregators.as_ref()
    }

    /// Start all components.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Health server first so probes respond during startup.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Store and migrations.
        let store = Arc::new(self.open_store().await?);
        self.health.store_connected.set(1.0);
        info!(backend = store.name(), "store ready");

        let rollup = Arc::new(self.cfg.rollup.clone());

        // 2. Aggregators.
        let ctx = AggregatorContext {
            store: Arc::clone(&store),
            rollup: Arc::clone(&rollup),
            settings: AggregatorSettings::from_config(&self.cfg.aggregation, &rollup),
            clock: Arc::clone(&self.clock),
            health: Some(Arc::clone(&self.health)),
        };
        self.aggregators = Some(Arc::new(Aggregators::new(ctx, self.cancel.clone())));

        // 3. Rollup scheduler.
        let engine = Arc::new(RollupEngine::new(
            Arc::clone(&store),
            Arc::clone(&rollup),
            Arc::clone(&self.clock),
            self.cfg.aggregation.statement_limits(),
            Some(Arc::clone(&self.health)),
        ));
        let scheduler = RollupScheduler::new(engine, rollup.pass_interval);
        scheduler.start(self.cancel.child_token()).await;
        self.scheduler = Some(scheduler);

        // 4. Self gauges.
        if self.cfg.gauges.enabled {
            let collector = Arc::new(GaugeCollector::new(
                self.cfg.scope.clone(),
                Arc::clone(&store),
                Arc::new(ProcessGaugeSource::new()),
                Arc::clone(&rollup),
                Arc::clone(&self.clock),
                self.cfg.gauges.interval,
                Some(Arc::clone(&self.health)),
            ));
            collector.start(self.cancel.child_token()).await;
            self.gauges = Some(collector);
        }

        info!(
            scope = %self.cfg.scope,
            levels = rollup.level_count(),
            "service fully started"
        );
        Ok(())
    }

    /// Gracefully stop all components, in reverse start order.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(gauges) = self.gauges.take() {
            gauges.wait_for_shutdown().await;
        }
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.wait_for_shutdown().await;
        }
        // Final interval flushes.
        if let Some(aggregators) = self.aggregators.take() {
            aggregators.shutdown().await;
        }

        self.health.stop();
        info!("service stopped");
        Ok(())
    }

    async fn open_store(&self) -> Result<StoreBackend> {
        match self.cfg.store.backend {
            StoreKind::Memory => Ok(StoreBackend::Memory(InMemoryStore::with_clock(
                Arc::clone(&self.clock),
            ))),
            StoreKind::ClickHouse => {
                let ch_cfg = &self.cfg.store.clickhouse;
                let pool = crate::export::connect_clickhouse(ch_cfg)
                    .await
                    .inspect_err(|_| self.health.store_connected.set(0.0))?;

                if ch_cfg.migrations.enabled {
                    info!("running ClickHouse migrations...");
                    let migrator = ClickHouseMigrator::new(pool.clone(), ch_cfg.database.clone());
                    let applied = migrator
                        .up()
                        .await
                        .context("applying ClickHouse migrations")?;
                    info!(applied, "ClickHouse migrations applied");
                }

                Ok(StoreBackend::ClickHouse(ClickHouseStore::new(
                    pool,
                    ch_cfg.database.clone(),
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::CompletedTransaction;

    fn memory_config() -> Config {
        let mut cfg = Config::default();
        cfg.health.addr = "127.0.0.1:0".to_string();
        cfg.gauges.enabled = false;
        cfg
    }

    #[tokio::test]
    async fn test_service_starts_and_stops_with_memory_store() {
        let mut service = Service::new(memory_config()).unwrap();
        assert!(service.aggregators().is_none());

        service.start().await.unwrap();
        let aggregators = Arc::clone(service.aggregators().unwrap());
        assert!(aggregators.enqueue("app", CompletedTransaction::new("Web", "/", 5_000_000)));
        assert_eq!(aggregators.scope_names(), vec!["app".to_string()]);

        service.stop().await.unwrap();
        assert!(service.aggregators().is_none());
        assert!(!aggregators.enqueue("app", CompletedTransaction::new("Web", "/", 5_000_000)));
    }
}
