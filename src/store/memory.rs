use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::aggregate::{AggregateBatch, Subtable, SubtableRow};
use crate::clock::{millis, Clock, SystemClock};

use super::{GaugeValue, MarkerKind, NeedsRollup, Store};

/// (scope, level, type, name, sub-table, capture time)
type RowKey = (String, usize, String, Option<String>, Subtable, i64);
/// (scope, level, gauge name, capture time)
type GaugeKey = (String, usize, String, i64);
/// (scope, kind, level)
type MarkerKey = (String, MarkerKind, usize);

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    /// Epoch ms after which the row is dropped by `expire`. `None` never expires.
    expires_at: Option<i64>,
}

/// Store kept in process memory.
///
/// Rows expire only when [`Store::expire`] is called.
pub struct InMemoryStore {
    clock: Arc<dyn Clock>,
    rows: RwLock<BTreeMap<RowKey, Expiring<SubtableRow>>>,
    gauges: RwLock<BTreeMap<GaugeKey, Expiring<GaugeValue>>>,
    markers: RwLock<BTreeMap<MarkerKey, BTreeMap<(i64, Uuid), BTreeSet<String>>>>,
    full_texts: RwLock<BTreeMap<(String, String), String>>,
    scopes: RwLock<BTreeSet<String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Uses `clock` to turn TTLs into expiry times.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            rows: RwLock::new(BTreeMap::new()),
            gauges: RwLock::new(BTreeMap::new()),
            markers: RwLock::new(BTreeMap::new()),
            full_texts: RwLock::new(BTreeMap::new()),
            scopes: RwLock::new(BTreeSet::new()),
        }
    }

    /// Number of stored sub-table rows across all scopes and levels.
    pub fn row_count(&self) -> usize {
        self.rows.read().len()
    }

    fn expires_at(&self, ttl: Duration) -> Option<i64> {
        if ttl.is_zero() {
            None
        } else {
            Some(self.clock.now_millis().saturating_add(millis(ttl)))
        }
    }

    fn note_scope(&self, scope: &str) {
        if !self.scopes.read().contains(scope) {
            self.scopes.write().insert(scope.to_string());
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for InMemoryStore {
    async fn store_aggregates(
        &self,
        scope: &str,
        level: usize,
        capture_time: i64,
        ttl: Duration,
        batch: &AggregateBatch,
    ) -> Result<()> {
        let expires_at = self.expires_at(ttl);
        {
            let mut rows = self.rows.write();
            for record in batch.records() {
                let key = |subtable| -> RowKey {
                    (
                        scope.to_string(),
                        level,
                        record.transaction_type.clone(),
                        record.transaction_name.clone(),
                        subtable,
                        capture_time,
                    )
                };
                for subtable in Subtable::ALL {
                    rows.remove(&key(subtable));
                }
                for row in &record.rows {
                    rows.insert(
                        key(row.subtable()),
                        Expiring {
                            value: row.clone(),
                            expires_at,
                        },
                    );
                }
            }
        }

        if !batch.full_texts.is_empty() {
            let mut texts = self.full_texts.write();
            for (digest, text) in &batch.full_texts {
                texts
                    .entry((scope.to_string(), digest.clone()))
                    .or_insert_with(|| text.clone());
            }
        }

        self.note_scope(scope);
        Ok(())
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
        if to <= from {
            return Ok(Vec::new());
        }
        let key = |capture_time| -> RowKey {
            (
                scope.to_string(),
                level,
                transaction_type.to_string(),
                transaction_name.map(str::to_string),
                subtable,
                capture_time,
            )
        };
        let rows = self.rows.read();
        Ok(rows
            .range(key(from.saturating_add(1))..=key(to))
            .map(|(_, row)| row.value.clone())
            .collect())
    }

    async fn read_transaction_names(
        &self,
        scope: &str,
        level: usize,
        transaction_type: &str,
        from: i64,
        to: i64,
    ) -> Result<BTreeSet<String>> {
        let key = |name: Option<&str>, subtable, capture_time| -> RowKey {
            (
                scope.to_string(),
                level,
                transaction_type.to_string(),
                name.map(str::to_string),
                subtable,
                capture_time,
            )
        };
        let last = Subtable::ALL[Subtable::ALL.len() - 1];

        // Visits one row per name, then probes that name's summary window.
        let rows = self.rows.read();
        let mut names = BTreeSet::new();
        let mut after = key(None, last, i64::MAX);
        while let Some(((s, l, t, name, ..), _)) = rows
            .range((Bound::Excluded(after), Bound::Unbounded))
            .next()
        {
            let Some(name) = name.as_deref() else { break };
            if s != scope || *l != level || t != transaction_type {
                break;
            }
            if to > from
                && rows
                    .range(
                        key(Some(name), Subtable::Summary, from.saturating_add(1))
                            ..=key(Some(name), Subtable::Summary, to),
                    )
                    .next()
                    .is_some()
            {
                names.insert(name.to_string());
            }
            after = key(Some(name), last, i64::MAX);
        }
        Ok(names)
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
        self.markers
            .write()
            .entry((scope.to_string(), kind, level))
            .or_default()
            .insert((bucket_end, token), keys.clone());
        self.note_scope(scope);
        Ok(())
    }

    async fn read_needs_rollup(
        &self,
        scope: &str,
        kind: MarkerKind,
        level: usize,
    ) -> Result<Vec<NeedsRollup>> {
        let markers = self.markers.read();
        let Some(pending) = markers.get(&(scope.to_string(), kind, level)) else {
            return Ok(Vec::new());
        };
        Ok(pending
            .iter()
            .map(|((bucket_end, token), keys)| NeedsRollup {
                bucket_end: *bucket_end,
                token: *token,
                keys: keys.clone(),
            })
            .collect())
    }

    async fn delete_needs_rollup(
        &self,
        scope: &str,
        kind: MarkerKind,
        level: usize,
        bucket_end: i64,
        token: Uuid,
    ) -> Result<()> {
        let mut markers = self.markers.write();
        if let Some(pending) = markers.get_mut(&(scope.to_string(), kind, level)) {
            pending.remove(&(bucket_end, token));
        }
        Ok(())
    }

    async fn list_scopes(&self) -> Result<Vec<String>> {
        Ok(self.scopes.read().iter().cloned().collect())
    }

    async fn store_gauge_values(
        &self,
        scope: &str,
        level: usize,
        ttl: Duration,
        values: &[GaugeValue],
    ) -> Result<()> {
        let expires_at = self.expires_at(ttl);
        {
            let mut gauges = self.gauges.write();
            for value in values {
                gauges.insert(
                    (
                        scope.to_string(),
                        level,
                        value.gauge_name.clone(),
                        value.capture_time,
                    ),
                    Expiring {
                        value: value.clone(),
                        expires_at,
                    },
                );
            }
        }
        self.note_scope(scope);
        Ok(())
    }

    async fn read_gauge_values(
        &self,
        scope: &str,
        level: usize,
        gauge_name: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<GaugeValue>> {
        if to <= from {
            return Ok(Vec::new());
        }
        let key = |capture_time| -> GaugeKey {
            (scope.to_string(), level, gauge_name.to_string(), capture_time)
        };
        let gauges = self.gauges.read();
        Ok(gauges
            .range(key(from.saturating_add(1))..=key(to))
            .map(|(_, v)| v.value.clone())
            .collect())
    }

    async fn read_full_text(&self, scope: &str, digest: &str) -> Result<Option<String>> {
        Ok(self
            .full_texts
            .read()
            .get(&(scope.to_string(), digest.to_string()))
            .cloned())
    }

    async fn expire(&self, now_millis: i64) -> Result<usize> {
        let live = |expires_at: Option<i64>| expires_at.map_or(true, |at| at > now_millis);

        let mut removed = 0;
        {
            let mut rows = self.rows.write();
            let before = rows.len();
            rows.retain(|_, row| live(row.expires_at));
            removed += before - rows.len();
        }
        {
            let mut gauges = self.gauges.write();
            let before = gauges.len();
            gauges.retain(|_, value| live(value.expires_at));
            removed += before - gauges.len();
        }
        Ok(removed)
    }
}
