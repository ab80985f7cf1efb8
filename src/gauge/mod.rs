//! Self-observation gauges written into the same rollup hierarchy as
//! transaction aggregates.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{adjusted_ttl, bucket_end, Clock};
use crate::config::RollupConfig;
use crate::export::health::HealthMetrics;
use crate::store::{GaugeValue, MarkerKind, Store};

/// One named reading taken from a [`GaugeSource`].
#[derive(Clone, Debug, PartialEq)]
pub struct GaugeSample {
    pub name: String,
    pub value: f64,
}

impl GaugeSample {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Source of gauge readings.
pub trait GaugeSource: Send + Sync {
    /// Takes one reading of every gauge. `now_millis` is the capture time.
    fn sample_gauges(&self, now_millis: i64) -> Result<Vec<GaugeSample>>;
}

/// Kernel clock ticks per second assumed for `/proc/self/stat` CPU times.
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

/// Reads this process's memory, thread count and CPU utilization from procfs.
#[derive(Default)]
pub struct ProcessGaugeSource {
    /// Previous (capture time, CPU ticks), for utilization between samples.
    last_cpu: parking_lot::Mutex<Option<(i64, u64)>>,
}

impl ProcessGaugeSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn cpu_utilization(&self, now_millis: i64, ticks: u64) -> Option<f64> {
        let previous = self.last_cpu.lock().replace((now_millis, ticks));
        let (then, then_ticks) = previous?;
        let elapsed_secs = (now_millis - then) as f64 / 1000.0;
        if elapsed_secs <= 0.0 || ticks < then_ticks {
            return None;
        }
        Some((ticks - then_ticks) as f64 / CLOCK_TICKS_PER_SEC / elapsed_secs)
    }
}

impl GaugeSource for ProcessGaugeSource {
    #[cfg(target_os = "linux")]
    fn sample_gauges(&self, now_millis: i64) -> Result<Vec<GaugeSample>> {
        let status =
            std::fs::read_to_string("/proc/self/status").context("reading /proc/self/status")?;
        let mut samples = parse_status(&status);

        let stat = std::fs::read_to_string("/proc/self/stat").context("reading /proc/self/stat")?;
        if let Some(ticks) = parse_cpu_ticks(&stat) {
            if let Some(utilization) = self.cpu_utilization(now_millis, ticks) {
                samples.push(GaugeSample::new("process.cpu.utilization", utilization));
            }
        }
        Ok(samples)
    }

    #[cfg(not(target_os = "linux"))]
    fn sample_gauges(&self, _now_millis: i64) -> Result<Vec<GaugeSample>> {
        Ok(Vec::new())
    }
}

/// Extracts resident size, virtual size (bytes) and thread count from
/// `/proc/<pid>/status`.
fn parse_status(status: &str) -> Vec<GaugeSample> {
    let mut samples = Vec::with_capacity(3);
    for line in status.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let name = match key {
            "VmRSS" => "process.memory.rss_bytes",
            "VmSize" => "process.memory.virtual_bytes",
            "Threads" => "process.threads",
            _ => continue,
        };
        let Some(value) = rest.split_whitespace().next().and_then(|v| v.parse::<u64>().ok())
        else {
            continue;
        };
        let value = if key == "Threads" {
            value
        } else {
            value.saturating_mul(1024)
        };
        samples.push(GaugeSample::new(name, value as f64));
    }
    samples
}

/// Sum of user and system CPU ticks from `/proc/<pid>/stat`.
///
/// The command name may contain spaces, so fields are counted after the last `)`.
fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    let (_, rest) = stat.rsplit_once(')')?;
    let mut fields = rest.split_whitespace();
    // rest starts at field 3 (state); utime and stime are fields 14 and 15.
    let utime = fields.nth(11)?.parse::<u64>().ok()?;
    let stime = fields.next()?.parse::<u64>().ok()?;
    Some(utime.saturating_add(stime))
}

/// Periodically samples a [`GaugeSource`] into level-0 gauge values of one
/// scope and queues their level-1 rollup.
pub struct GaugeCollector<S> {
    scope: String,
    store: Arc<S>,
    source: Arc<dyn GaugeSource>,
    rollup: Arc<RollupConfig>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    health: Option<Arc<HealthMetrics>>,
    run_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<S: Store> GaugeCollector<S> {
    pub fn new(
        scope: impl Into<String>,
        store: Arc<S>,
        source: Arc<dyn GaugeSource>,
        rollup: Arc<RollupConfig>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            scope: scope.into(),
            store,
            source,
            rollup,
            clock,
            interval,
            health,
            run_task: tokio::sync::Mutex::new(None),
        }
    }

    /// Takes one sample and writes it. Returns the number of values written.
    pub async fn collect_once(&self) -> Result<usize> {
        let now = self.clock.now_millis();
        let samples = self.source.sample_gauges(now).context("sampling gauges")?;
        if samples.is_empty() {
            return Ok(0);
        }

        let values: Vec<GaugeValue> = samples
            .into_iter()
            .filter(|s| s.value.is_finite())
            .map(|s| GaugeValue::sample(s.name, now, s.value))
            .collect();
        let ttl = adjusted_ttl(self.rollup.ttl(0).unwrap_or_default(), now, now);
        self.store
            .store_gauge_values(&self.scope, 0, ttl, &values)
            .await
            .context("writing gauge values")?;

        if let Some(interval) = self.rollup.interval_millis(1) {
            let names: BTreeSet<String> = values.iter().map(|v| v.gauge_name.clone()).collect();
            self.store
                .write_needs_rollup(
                    &self.scope,
                    MarkerKind::Gauge,
                    1,
                    bucket_end(now, interval),
                    Uuid::new_v4(),
                    &names,
                )
                .await
                .context("writing gauge rollup marker")?;
        }

        if let Some(h) = &self.health {
            h.gauge_samples.inc_by(values.len() as f64);
        }
        Ok(values.len())
    }
}

impl<S: Store> GaugeCollector<S> {
    /// Spawns the sampling loop. Takes `self` by `Arc` so the loop owns it.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let collector = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(collector.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match collector.collect_once().await {
                    Ok(written) => debug!(scope = %collector.scope, written, "gauges sampled"),
                    Err(e) => warn!(scope = %collector.scope, error = format!("{e:#}"), "gauge sampling failed"),
                }
            }
        });

        *self.run_task.lock().await = Some(handle);
        info!(scope = %self.scope, interval = ?self.interval, "gauge collector started");
    }

    pub async fn wait_for_shutdown(&self) {
        if let Some(handle) = self.run_task.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "gauge collector task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RollupLevelConfig;
    use crate::store::InMemoryStore;

    struct FixedSource(Vec<GaugeSample>);

    impl GaugeSource for FixedSource {
        fn sample_gauges(&self, _now_millis: i64) -> Result<Vec<GaugeSample>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_parse_status() {
        let status = "Name:\trollupd\nVmSize:\t  2048 kB\nVmRSS:\t   512 kB\nThreads:\t7\n";
        let samples = parse_status(status);
        assert_eq!(
            samples,
            vec![
                GaugeSample::new("process.memory.virtual_bytes", 2_097_152.0),
                GaugeSample::new("process.memory.rss_bytes", 524_288.0),
                GaugeSample::new("process.threads", 7.0),
            ]
        );
    }

    #[test]
    fn test_parse_cpu_ticks_with_spaces_in_comm() {
        let stat = "42 (my proc) S 1 42 42 0 -1 4194304 100 0 0 0 30 12 0 0 20 0 4 0 100";
        assert_eq!(parse_cpu_ticks(stat), Some(42));
        assert_eq!(parse_cpu_ticks("garbage"), None);
    }

    #[test]
    fn test_cpu_utilization_needs_two_samples() {
        let source = ProcessGaugeSource::new();
        assert_eq!(source.cpu_utilization(1_000, 100), None);
        let util = source.cpu_utilization(3_000, 200).unwrap();
        assert!((util - 0.5).abs() < 1e-9);
        assert_eq!(source.cpu_utilization(3_000, 250), None);
    }

    #[tokio::test]
    async fn test_collect_once_writes_values_and_marker() {
        let store = Arc::new(InMemoryStore::new());
        let rollup = RollupConfig::with_levels(vec![
            RollupLevelConfig::new(Duration::from_secs(60), Duration::from_secs(3600)),
            RollupLevelConfig::new(Duration::from_secs(300), Duration::ZERO),
        ]);
        let collector = GaugeCollector::new(
            "self",
            Arc::clone(&store),
            Arc::new(FixedSource(vec![
                GaugeSample::new("heap", 10.0),
                GaugeSample::new("nan", f64::NAN),
            ])),
            Arc::new(rollup),
            Arc::new(ManualClock::new(61_000)),
            Duration::from_secs(5),
            None,
        );

        assert_eq!(collector.collect_once().await.unwrap(), 1);

        let values = store.read_gauge_values("self", 0, "heap", 0, 61_000).await.unwrap();
        assert_eq!(values, vec![GaugeValue::sample("heap", 61_000, 10.0)]);
        let markers = store
            .read_needs_rollup("self", MarkerKind::Gauge, 1)
            .await
            .unwrap();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].bucket_end, 300_000);
        assert!(markers[0].keys.contains("heap"));
    }
}
