use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::RollupEngine;
use crate::store::Store;

/// Runs rollup passes on a fixed period until cancelled.
pub struct RollupScheduler<S> {
    engine: Arc<RollupEngine<S>>,
    interval: Duration,
    run_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<S: Store> RollupScheduler<S> {
    pub fn new(engine: Arc<RollupEngine<S>>, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            run_task: tokio::sync::Mutex::new(None),
        }
    }

    /// Spawns the pass loop. A pass in progress when `cancel` fires is
    /// abandoned; its markers stay in place for the next start.
    pub async fn start(&self, cancel: CancellationToken) {
        let engine = Arc::clone(&self.engine);
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Consume the immediate first tick.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let started = Instant::now();
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        warn!("rollup pass abandoned on shutdown");
                        break;
                    }
                    result = engine.run_pass() => match result {
                        Ok(summary) => summary.log(started.elapsed().as_millis()),
                        Err(e) => error!(error = format!("{e:#}"), "rollup pass failed"),
                    },
                }

                match engine.expire().await {
                    Ok(0) => {}
                    Ok(expired) => debug!(expired, "expired rows removed"),
                    Err(e) => warn!(error = %e, "expiring rows failed"),
                }
            }

            info!("rollup scheduler stopped");
        });

        *self.run_task.lock().await = Some(handle);
        info!(interval = ?self.interval, "rollup scheduler started");
    }

    /// Waits for the pass loop to exit after cancellation.
    pub async fn wait_for_shutdown(&self) {
        if let Some(handle) = self.run_task.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "rollup scheduler task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use uuid::Uuid;

    use super::*;
    use crate::aggregate::StatementLimits;
    use crate::clock::SystemClock;
    use crate::config::{RollupConfig, RollupLevelConfig};
    use crate::store::{GaugeValue, InMemoryStore, MarkerKind};

    #[tokio::test]
    async fn test_scheduler_runs_passes_until_cancelled() {
        let store = Arc::new(InMemoryStore::new());
        store
            .store_gauge_values("s", 0, Duration::ZERO, &[GaugeValue::sample("heap", 1_000, 4.0)])
            .await
            .unwrap();
        let keys = BTreeSet::from(["heap".to_string()]);
        for end in [60_000, 120_000] {
            store
                .write_needs_rollup("s", MarkerKind::Gauge, 1, end, Uuid::new_v4(), &keys)
                .await
                .unwrap();
        }

        let config = RollupConfig::with_levels(vec![
            RollupLevelConfig::new(Duration::from_secs(1), Duration::ZERO),
            RollupLevelConfig::new(Duration::from_secs(60), Duration::ZERO),
        ]);
        let engine = Arc::new(RollupEngine::new(
            Arc::clone(&store),
            Arc::new(config),
            Arc::new(SystemClock),
            StatementLimits::default(),
            None,
        ));
        let scheduler = RollupScheduler::new(engine, Duration::from_millis(10));
        let cancel = CancellationToken::new();
        scheduler.start(cancel.clone()).await;

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = store
                .read_needs_rollup("s", MarkerKind::Gauge, 1)
                .await
                .unwrap();
            if remaining.len() == 1 || Instant::now() > deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cancel.cancel();
        scheduler.wait_for_shutdown().await;

        let rolled = store
            .read_gauge_values("s", 1, "heap", 0, 60_000)
            .await
            .unwrap();
        assert_eq!(rolled.len(), 1);
        assert_eq!(rolled[0].value, 4.0);
    }
}
