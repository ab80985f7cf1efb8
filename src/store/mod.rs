//! Storage contract for aggregates, gauges and needs-rollup markers.

pub mod clickhouse;
pub mod memory;

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::{AggregateBatch, Subtable, SubtableRow};

pub use self::clickhouse::ClickHouseStore;
pub use self::memory::InMemoryStore;

/// What a needs-rollup marker refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerKind {
    /// Keys are transaction types.
    Aggregate,
    /// Keys are gauge names.
    Gauge,
}

impl MarkerKind {
    pub const ALL: [MarkerKind; 2] = [MarkerKind::Aggregate, MarkerKind::Gauge];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aggregate => "aggregate",
            Self::Gauge => "gauge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "aggregate" => Some(Self::Aggregate),
            "gauge" => Some(Self::Gauge),
            _ => None,
        }
    }
}

impl std::fmt::Display for MarkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending rollup of one bucket at one level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NeedsRollup {
    pub bucket_end: i64,
    pub token: Uuid,
    pub keys: BTreeSet<String>,
}

/// One gauge value at one level. Level 0 holds raw samples with weight 1.
#[derive(Clone, Debug, PartialEq)]
pub struct GaugeValue {
    pub gauge_name: String,
    pub capture_time: i64,
    pub value: f64,
    pub weight: i64,
}

impl GaugeValue {
    pub fn sample(gauge_name: impl Into<String>, capture_time: i64, value: f64) -> Self {
        Self {
            gauge_name: gauge_name.into(),
            capture_time,
            value,
            weight: 1,
        }
    }
}

/// Persistent storage used by the aggregators, the rollup engine and the
/// gauge collector.
///
/// Time windows are `(from, to]` in epoch milliseconds. A zero `ttl` keeps
/// rows forever. Writing the same bucket twice replaces it.
pub trait Store: Send + Sync + 'static {
    fn store_aggregates(
        &self,
        scope: &str,
        level: usize,
        capture_time: i64,
        ttl: Duration,
        batch: &AggregateBatch,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Rows of one sub-table for a (type, name?) key within the window.
    #[allow(clippy::too_many_arguments)]
    fn read_for_rollup(
        &self,
        scope: &str,
        subtable: Subtable,
        level: usize,
        transaction_type: &str,
        transaction_name: Option<&str>,
        from: i64,
        to: i64,
    ) -> impl Future<Output = Result<Vec<SubtableRow>>> + Send;

    /// Distinct transaction names recorded for a type within the window.
    fn read_transaction_names(
        &self,
        scope: &str,
        level: usize,
        transaction_type: &str,
        from: i64,
        to: i64,
    ) -> impl Future<Output = Result<BTreeSet<String>>> + Send;

    fn write_needs_rollup(
        &self,
        scope: &str,
        kind: MarkerKind,
        level: usize,
        bucket_end: i64,
        token: Uuid,
        keys: &BTreeSet<String>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Pending markers, sorted by bucket end.
    fn read_needs_rollup(
        &self,
        scope: &str,
        kind: MarkerKind,
        level: usize,
    ) -> impl Future<Output = Result<Vec<NeedsRollup>>> + Send;

    /// Deletes the marker only if `token` matches.
    fn delete_needs_rollup(
        &self,
        scope: &str,
        kind: MarkerKind,
        level: usize,
        bucket_end: i64,
        token: Uuid,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Scopes that have stored data, sorted.
    fn list_scopes(&self) -> impl Future<Output = Result<Vec<String>>> + Send;

    fn store_gauge_values(
        &self,
        scope: &str,
        level: usize,
        ttl: Duration,
        values: &[GaugeValue],
    ) -> impl Future<Output = Result<()>> + Send;

    fn read_gauge_values(
        &self,
        scope: &str,
        level: usize,
        gauge_name: &str,
        from: i64,
        to: i64,
    ) -> impl Future<Output = Result<Vec<GaugeValue>>> + Send;

    /// Full text of a truncated statement.
    fn read_full_text(
        &self,
        scope: &str,
        digest: &str,
    ) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Drops rows whose TTL has passed. Returns how many were removed.
    fn expire(&self, now_millis: i64) -> impl Future<Output = Result<usize>> + Send;
}

/// Store selected by configuration.
pub enum StoreBackend {
    Memory(InMemoryStore),
    ClickHouse(ClickHouseStore),
}

impl StoreBackend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::ClickHouse(_) => "clickhouse",
        }
    }
}

impl Store for StoreBackend {
    async fn store_aggregates(
        &self,
        scope: &str,
        level: usize,
        capture_time: i64,
        ttl: Duration,
        batch: &AggregateBatch,
    ) -> Result<()> {
        match self {
            Self::Memory(s) => s.store_aggregates(scope, level, capture_time, ttl, batch).await,
            Self::ClickHouse(s) => s.store_aggregates(scope, level, capture_time, ttl, batch).await,
        }
    }

    async fn read_for_rollup(
        &self,
        scope: &str,
        subtable: Subtable,
        level: usize,
        transaction_type: &str,
        transaction_name: Option<&str>,
        from: i64,
        to: i64,
    ) -> Result<Vec<SubtableRow>> {
        match self {
            Self::Memory(s) => {
                s.read_for_rollup(scope, subtable, level, transaction_type, transaction_name, from, to)
                    .await
            }
            Self::ClickHouse(s) => {
                s.read_for_rollup(scope, subtable, level, transaction_type, transaction_name, from, to)
                    .await
            }
        }
    }

    async fn read_transaction_names(
        &self,
        scope: &str,
        level: usize,
        transaction_type: &str,
        from: i64,
        to: i64,
    ) -> Result<BTreeSet<String>> {
        match self {
            Self::Memory(s) => s.read_transaction_names(scope, level, transaction_type, from, to).await,
            Self::ClickHouse(s) => {
                s.read_transaction_names(scope, level, transaction_type, from, to)
                    .await
            }
        }
    }

    async fn write_needs_rollup(
        &self,
        scope: &str,
        kind: MarkerKind,
        level: usize,
        bucket_end: i64,
        token: Uuid,
        keys: &BTreeSet<String>,
    ) -> Result<()> {
        match self {
            Self::Memory(s) => s.write_needs_rollup(scope, kind, level, bucket_end, token, keys).await,
            Self::ClickHouse(s) => {
                s.write_needs_rollup(scope, kind, level, bucket_end, token, keys)
                    .await
            }
        }
    }

    async fn read_needs_rollup(
        &self,
        scope: &str,
        kind: MarkerKind,
        level: usize,
    ) -> Result<Vec<NeedsRollup>> {
        match self {
            Self::Memory(s) => s.read_needs_rollup(scope, kind, level).await,
            Self::ClickHouse(s) => s.read_needs_rollup(scope, kind, level).await,
        }
    }

    async fn delete_needs_rollup(
        &self,
        scope: &str,
        kind: MarkerKind,
        level: usize,
        bucket_end: i64,
        token: Uuid,
    ) -> Result<()> {
        match self {
            Self::Memory(s) => s.delete_needs_rollup(scope, kind, level, bucket_end, token).await,
            Self::ClickHouse(s) => s.delete_needs_rollup(scope, kind, level, bucket_end, token).await,
        }
    }

    async fn list_scopes(&self) -> Result<Vec<String>> {
        match self {
            Self::Memory(s) => s.list_scopes().await,
            Self::ClickHouse(s) => s.list_scopes().await,
        }
    }

    async fn store_gauge_values(
        &self,
        scope: &str,
        level: usize,
        ttl: Duration,
        values: &[GaugeValue],
    ) -> Result<()> {
        match self {
            Self::Memory(s) => s.store_gauge_values(scope, level, ttl, values).await,
            Self::ClickHouse(s) => s.store_gauge_values(scope, level, ttl, values).await,
        }
    }

    async fn read_gauge_values(
        &self,
        scope: &str,
        level: usize,
        gauge_name: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<GaugeValue>> {
        match self {
            Self::Memory(s) => s.read_gauge_values(scope, level, gauge_name, from, to).await,
            Self::ClickHouse(s) => s.read_gauge_values(scope, level, gauge_name, from, to).await,
        }
    }

    async fn read_full_text(&self, scope: &str, digest: &str) -> Result<Option<String>> {
        match self {
            Self::Memory(s) => s.read_full_text(scope, digest).await,
            Self::ClickHouse(s) => s.read_full_text(scope, digest).await,
        }
    }

    async fn expire(&self, now_millis: i64) -> Result<usize> {
        match self {
            Self::Memory(s) => s.expire(now_millis).await,
            Self::ClickHouse(s) => s.expire(now_millis).await,
        }
    }
}
