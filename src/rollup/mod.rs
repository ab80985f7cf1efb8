//! Multi-resolution rollups driven by needs-rollup markers.
//!
//! A marker at level L for bucket B says "level L-1 data inside B changed".
//! The engine merges that data into level L, writes the L+1 marker and only
//! then deletes the consumed markers, so a failure at any step leaves the
//! bucket to be retried by a later pass.

pub mod merge;
pub mod scheduler;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregate::{AggregateBatch, AggregateRecord, StatementLimits, Subtable};
use crate::clock::{self, adjusted_ttl, Clock};
use crate::config::RollupConfig;
use crate::export::health::HealthMetrics;
use crate::store::{GaugeValue, MarkerKind, NeedsRollup, Store};

pub use merge::{MergedSubtable, RollupMerger};
pub use scheduler::RollupScheduler;

/// Outcome of one rollup pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RollupPassSummary {
    /// Buckets written and whose markers were consumed.
    pub rolled: usize,
    /// Buckets left with their markers in place for the next pass.
    pub failed: usize,
}

impl RollupPassSummary {
    fn absorb(&mut self, other: RollupPassSummary) {
        self.rolled += other.rolled;
        self.failed += other.failed;
    }
}

/// Rolls finer buckets into coarser ones for every scope and level.
pub struct RollupEngine<S> {
    store: Arc<S>,
    config: Arc<RollupConfig>,
    clock: Arc<dyn Clock>,
    merger: RollupMerger,
    health: Option<Arc<HealthMetrics>>,
}

impl<S: Store> RollupEngine<S> {
    pub fn new(
        store: Arc<S>,
        config: Arc<RollupConfig>,
        clock: Arc<dyn Clock>,
        limits: StatementLimits,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            store,
            config,
            clock,
            merger: RollupMerger::new(limits),
            health,
        }
    }

    /// Runs one pass over every scope. Fails only if scopes cannot be listed.
    pub async fn run_pass(&self) -> Result<RollupPassSummary> {
        let started = Instant::now();
        let scopes = self.store.list_scopes().await.context("listing scopes")?;

        let mut summary = RollupPassSummary::default();
        for scope in &scopes {
            summary.absorb(self.rollup_scope(scope).await);
        }

        if let Some(h) = &self.health {
            h.rollup_pass_duration
                .observe(started.elapsed().as_secs_f64());
        }
        Ok(summary)
    }

    /// Rolls up every level of `scope` in ascending order, aggregates before
    /// gauges within a level.
    pub async fn rollup_scope(&self, scope: &str) -> RollupPassSummary {
        let mut summary = RollupPassSummary::default();
        for level in 1..self.config.level_count() {
            for kind in MarkerKind::ALL {
                summary.absorb(self.rollup_level(scope, kind, level).await);
            }
        }
        summary
    }

    /// Drops rows whose TTL has passed.
    pub async fn expire(&self) -> Result<usize> {
        self.store.expire(self.clock.now_millis()).await
    }

    async fn rollup_level(&self, scope: &str, kind: MarkerKind, level: usize) -> RollupPassSummary {
        let mut summary = RollupPassSummary::default();

        let markers = match self.store.read_needs_rollup(scope, kind, level).await {
            Ok(markers) => markers,
            Err(e) => {
                self.record_error(kind, level);
                error!(scope, %kind, level, error = %e, "reading needs-rollup markers failed");
                summary.failed += 1;
                return summary;
            }
        };
        if let Some(h) = &self.health {
            h.pending_markers
                .with_label_values(&[kind.as_str(), &level.to_string()])
                .set(markers.len() as f64);
        }

        for (bucket_end, group) in ready_groups(markers) {
            match self.rollup_bucket(scope, kind, level, bucket_end, &group).await {
                Ok(()) => {
                    summary.rolled += 1;
                    if let Some(h) = &self.health {
                        h.rollup_buckets
                            .with_label_values(&[kind.as_str(), &level.to_string()])
                            .inc();
                    }
                    debug!(scope, %kind, level, bucket_end, "bucket rolled up");
                }
                Err(e) => {
                    summary.failed += 1;
                    self.record_error(kind, level);
                    error!(
                        scope,
                        %kind,
                        level,
                        bucket_end,
                        error = format!("{e:#}"),
                        "rollup failed, markers kept for retry",
                    );
                }
            }
        }
        summary
    }

    async fn rollup_bucket(
        &self,
        scope: &str,
        kind: MarkerKind,
        level: usize,
        bucket_end: i64,
        markers: &[NeedsRollup],
    ) -> Result<()> {
        let keys: BTreeSet<String> = markers.iter().flat_map(|m| m.keys.iter().cloned()).collect();
        let interval = self
            .config
            .interval_millis(level)
            .with_context(|| format!("no rollup level {level}"))?;
        let window = (bucket_end - interval, bucket_end);

        let written = match kind {
            MarkerKind::Aggregate => {
                self.rollup_aggregates(scope, level, bucket_end, window, &keys)
                    .await?
            }
            MarkerKind::Gauge => {
                self.rollup_gauges(scope, level, bucket_end, window, &keys)
                    .await?
            }
        };

        if !written.is_empty() {
            if let Some(next_interval) = self.config.interval_millis(level + 1) {
                let next_end = clock::bucket_end(bucket_end, next_interval);
                self.store
                    .write_needs_rollup(scope, kind, level + 1, next_end, Uuid::new_v4(), &written)
                    .await
                    .with_context(|| format!("writing level {} marker", level + 1))?;
            }
        }

        for marker in markers {
            self.store
                .delete_needs_rollup(scope, kind, level, bucket_end, marker.token)
                .await
                .with_context(|| format!("deleting marker {}", marker.token))?;
        }
        Ok(())
    }

    /// Writes level `level` aggregates for the types in `types`. Returns the
    /// types that produced rows.
    async fn rollup_aggregates(
        &self,
        scope: &str,
        level: usize,
        bucket_end: i64,
        (from, to): (i64, i64),
        types: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>> {
        let mut batch = AggregateBatch::default();
        for transaction_type in types {
            let names = self
                .store
                .read_transaction_names(scope, level - 1, transaction_type, from, to)
                .await
                .with_context(|| format!("reading transaction names of {transaction_type}"))?;

            if let Some(record) = self
                .rollup_record(scope, level, transaction_type, None, (from, to))
                .await?
            {
                batch.overall.push(record);
            }
            for name in &names {
                if let Some(record) = self
                    .rollup_record(scope, level, transaction_type, Some(name), (from, to))
                    .await?
                {
                    batch.transactions.push(record);
                }
            }
        }

        if batch.is_empty() {
            return Ok(BTreeSet::new());
        }

        let ttl = self.ttl(level, bucket_end);
        self.store
            .store_aggregates(scope, level, bucket_end, ttl, &batch)
            .await
            .context("writing rolled-up aggregates")?;
        Ok(batch.transaction_types())
    }

    /// Merges every sub-table of one (type, name?) key, each on its own.
    async fn rollup_record(
        &self,
        scope: &str,
        level: usize,
        transaction_type: &str,
        transaction_name: Option<&str>,
        (from, to): (i64, i64),
    ) -> Result<Option<AggregateRecord>> {
        let mut rows = Vec::new();
        for subtable in Subtable::ALL {
            let source = self
                .store
                .read_for_rollup(
                    scope,
                    subtable,
                    level - 1,
                    transaction_type,
                    transaction_name,
                    from,
                    to,
                )
                .await
                .with_context(|| format!("reading {subtable} rows"))?;

            let merged = self
                .merger
                .merge(subtable, &source)
                .with_context(|| format!("merging {subtable} rows"))?;
            if merged.decode_errors > 0 {
                if let Some(h) = &self.health {
                    h.histogram_decode_errors
                        .inc_by(merged.decode_errors as f64);
                }
                warn!(
                    scope,
                    transaction_type,
                    transaction_name,
                    skipped = merged.decode_errors,
                    "histogram rows skipped during rollup",
                );
            }
            rows.extend(merged.row);
        }

        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(AggregateRecord {
            transaction_type: transaction_type.to_string(),
            transaction_name: transaction_name.map(str::to_string),
            rows,
        }))
    }

    /// Writes weighted averages of the named gauges. Returns the gauge names
    /// that had values.
    async fn rollup_gauges(
        &self,
        scope: &str,
        level: usize,
        bucket_end: i64,
        (from, to): (i64, i64),
        gauge_names: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>> {
        let mut values = Vec::with_capacity(gauge_names.len());
        for gauge_name in gauge_names {
            let source = self
                .store
                .read_gauge_values(scope, level - 1, gauge_name, from, to)
                .await
                .with_context(|| format!("reading gauge {gauge_name}"))?;
            values.extend(weighted_average(gauge_name, bucket_end, &source));
        }

        if values.is_empty() {
            return Ok(BTreeSet::new());
        }

        let ttl = self.ttl(level, bucket_end);
        self.store
            .store_gauge_values(scope, level, ttl, &values)
            .await
            .context("writing rolled-up gauge values")?;
        Ok(values.into_iter().map(|v| v.gauge_name).collect())
    }

    fn ttl(&self, level: usize, capture_time: i64) -> std::time::Duration {
        adjusted_ttl(
            self.config.ttl(level).unwrap_or_default(),
            capture_time,
            self.clock.now_millis(),
        )
    }

    fn record_error(&self, kind: MarkerKind, level: usize) {
        if let Some(h) = &self.health {
            h.rollup_errors
                .with_label_values(&[kind.as_str(), &level.to_string()])
                .inc();
        }
    }
}

/// Groups markers by bucket end and holds back the latest bucket, which may
/// still be receiving lower-level writes.
fn ready_groups(markers: Vec<NeedsRollup>) -> BTreeMap<i64, Vec<NeedsRollup>> {
    let mut groups: BTreeMap<i64, Vec<NeedsRollup>> = BTreeMap::new();
    for marker in markers {
        groups.entry(marker.bucket_end).or_default().push(marker);
    }
    groups.pop_last();
    groups
}

/// Weighted average of `values`, weighted by their own weights.
fn weighted_average(gauge_name: &str, bucket_end: i64, values: &[GaugeValue]) -> Option<GaugeValue> {
    let mut total_weight: i64 = 0;
    let mut weighted_sum = 0.0;
    for v in values {
        if v.weight <= 0 || !v.value.is_finite() {
            continue;
        }
        total_weight = total_weight.saturating_add(v.weight);
        weighted_sum += v.value * v.weight as f64;
    }
    if total_weight == 0 {
        return None;
    }
    Some(GaugeValue {
        gauge_name: gauge_name.to_string(),
        capture_time: bucket_end,
        value: weighted_sum / total_weight as f64,
        weight: total_weight,
    })
}

impl RollupPassSummary {
    pub(crate) fn log(&self, elapsed_ms: u128) {
        if self.rolled > 0 || self.failed > 0 {
            info!(rolled = self.rolled, failed = self.failed, elapsed_ms, "rollup pass finished");
        } else {
            debug!(elapsed_ms, "rollup pass found nothing to do");
        }
    }
}
