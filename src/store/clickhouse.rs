use std::collections::BTreeSet;
use std::fmt::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use clickhouse_rs::Pool;
use uuid::Uuid;

use crate::aggregate::{AggregateBatch, Subtable, SubtableRow};
use crate::clock::{Clock, SystemClock};

use super::{GaugeValue, MarkerKind, NeedsRollup, Store};

/// `expires_at` written for rows that never expire (max `DateTime`).
const NEVER_EXPIRES: u64 = u32::MAX as u64;

/// ClickHouse-backed store.
///
/// Row tables are ReplacingMergeTree and read with `FINAL`, so re-writing a
/// bucket supersedes the earlier write. TTL is enforced by the tables.
pub struct ClickHouseStore {
    pool: Pool,
    database: String,
}

impl ClickHouseStore {
    pub fn new(pool: Pool, database: String) -> Self {
        Self { pool, database }
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{name}", self.database)
    }

    async fn execute(&self, sql: String, what: &str) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .with_context(|| format!("getting handle for {what}"))?;
        handle
            .execute(sql.as_str())
            .await
            .with_context(|| format!("executing {what}"))?;
        Ok(())
    }

    async fn query_strings(&self, sql: String, column: &str, what: &str) -> Result<Vec<String>> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .with_context(|| format!("getting handle for {what}"))?;
        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .with_context(|| format!("querying {what}"))?;

        let mut out = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            let value: String = row
                .get(column)
                .with_context(|| format!("reading {column} for {what}"))?;
            out.push(value);
        }
        Ok(out)
    }
}

impl Store for ClickHouseStore {
    async fn store_aggregates(
        &self,
        scope: &str,
        level: usize,
        capture_time: i64,
        ttl: Duration,
        batch: &AggregateBatch,
    ) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let table = self.table("aggregate_rows");
        let scope_sql = escape_sql(scope);
        let expires_at = expires_at_secs(ttl);
        let mut sql = String::with_capacity(256 + batch.overall.len() * 512);
        let _ = write!(
            sql,
            "INSERT INTO {table} (scope, level, transaction_type, transaction_name, is_overall, \
             subtable, capture_time, payload, expires_at) VALUES "
        );

        let mut first = true;
        for record in batch.records() {
            let transaction_type = escape_sql(&record.transaction_type);
            let transaction_name = escape_sql(record.transaction_name.as_deref().unwrap_or(""));
            let is_overall = u8::from(record.transaction_name.is_none());
            for row in &record.rows {
                let payload = serde_json::to_string(row).context("encoding sub-table row")?;
                if !first {
                    sql.push_str(", ");
                }
                first = false;
                let _ = write!(
                    sql,
                    "('{scope_sql}', {level}, '{transaction_type}', '{transaction_name}', {is_overall}, \
                     '{}', {capture_time}, '{}', {expires_at})",
                    row.subtable().as_str(),
                    escape_sql(&payload),
                );
            }
        }
        self.execute(sql, "aggregate rows insert").await?;

        if !batch.full_texts.is_empty() {
            let table = self.table("full_texts");
            let mut sql = String::with_capacity(128 + batch.full_texts.len() * 256);
            let _ = write!(sql, "INSERT INTO {table} (scope, digest, full_text) VALUES ");
            for (idx, (digest, text)) in batch.full_texts.iter().enumerate() {
                if idx > 0 {
                    sql.push_str(", ");
                }
                let _ = write!(
                    sql,
                    "('{scope_sql}', '{}', '{}')",
                    escape_sql(digest),
                    escape_sql(text)
                );
            }
            self.execute(sql, "full texts insert").await?;
        }

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
        let table = self.table("aggregate_rows");
        let is_overall = u8::from(transaction_name.is_none());
        let sql = format!(
            "SELECT payload FROM {table} FINAL WHERE scope = '{}' AND level = {level} \
             AND transaction_type = '{}' AND is_overall = {is_overall} AND transaction_name = '{}' \
             AND subtable = '{}' AND capture_time > {from} AND capture_time <= {to} \
             ORDER BY capture_time",
            escape_sql(scope),
            escape_sql(transaction_type),
            escape_sql(transaction_name.unwrap_or("")),
            subtable.as_str(),
        );

        let payloads = self
            .query_strings(sql, "payload", "aggregate rows for rollup")
            .await?;
        payloads
            .iter()
            .map(|p| serde_json::from_str(p).context("decoding sub-table row"))
            .collect()
    }

    async fn read_transaction_names(
        &self,
        scope: &str,
        level: usize,
        transaction_type: &str,
        from: i64,
        to: i64,
    ) -> Result<BTreeSet<String>> {
        let table = self.table("aggregate_rows");
        let sql = format!(
            "SELECT DISTINCT transaction_name FROM {table} FINAL WHERE scope = '{}' \
             AND level = {level} AND transaction_type = '{}' AND is_overall = 0 \
             AND subtable = 'summary' AND capture_time > {from} AND capture_time <= {to}",
            escape_sql(scope),
            escape_sql(transaction_type),
        );
        let names = self
            .query_strings(sql, "transaction_name", "transaction names")
            .await?;
        Ok(names.into_iter().collect())
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
        let table = self.table("needs_rollup");
        let keys = serde_json::to_string(keys).context("encoding marker keys")?;
        let sql = format!(
            "INSERT INTO {table} (scope, kind, level, bucket_end, token, keys) \
             VALUES ('{}', '{}', {level}, {bucket_end}, '{token}', '{}')",
            escape_sql(scope),
            kind.as_str(),
            escape_sql(&keys),
        );
        self.execute(sql, "needs-rollup insert").await
    }

    async fn read_needs_rollup(
        &self,
        scope: &str,
        kind: MarkerKind,
        level: usize,
    ) -> Result<Vec<NeedsRollup>> {
        let table = self.table("needs_rollup");
        let sql = format!(
            "SELECT bucket_end, toString(token) AS token, keys FROM {table} \
             WHERE scope = '{}' AND kind = '{}' AND level = {level} \
             ORDER BY bucket_end, token",
            escape_sql(scope),
            kind.as_str(),
        );

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for needs-rollup read")?;
        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("querying needs-rollup markers")?;

        let mut markers = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            let bucket_end: i64 = row.get("bucket_end").context("reading bucket_end")?;
            let token: String = row.get("token").context("reading token")?;
            let keys: String = row.get("keys").context("reading keys")?;
            markers.push(NeedsRollup {
                bucket_end,
                token: Uuid::parse_str(&token).context("parsing marker token")?,
                keys: serde_json::from_str(&keys).context("decoding marker keys")?,
            });
        }
        Ok(markers)
    }

    async fn delete_needs_rollup(
        &self,
        scope: &str,
        kind: MarkerKind,
        level: usize,
        bucket_end: i64,
        token: Uuid,
    ) -> Result<()> {
        let table = self.table("needs_rollup");
        let sql = format!(
            "DELETE FROM {table} WHERE scope = '{}' AND kind = '{}' AND level = {level} \
             AND bucket_end = {bucket_end} AND token = toUUID('{token}')",
            escape_sql(scope),
            kind.as_str(),
        );
        self.execute(sql, "needs-rollup delete").await
    }

    async fn list_scopes(&self) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT scope FROM (SELECT DISTINCT scope FROM {} UNION ALL \
             SELECT DISTINCT scope FROM {}) GROUP BY scope ORDER BY scope",
            self.table("aggregate_rows"),
            self.table("gauge_values"),
        );
        self.query_strings(sql, "scope", "scopes").await
    }

    async fn store_gauge_values(
        &self,
        scope: &str,
        level: usize,
        ttl: Duration,
        values: &[GaugeValue],
    ) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }

        let table = self.table("gauge_values");
        let scope_sql = escape_sql(scope);
        let expires_at = expires_at_secs(ttl);
        let mut sql = String::with_capacity(128 + values.len() * 96);
        let _ = write!(
            sql,
            "INSERT INTO {table} (scope, level, gauge_name, capture_time, value, weight, expires_at) VALUES "
        );
        for (idx, v) in values.iter().enumerate() {
            if idx > 0 {
                sql.push_str(", ");
            }
            let value = if v.value.is_finite() { v.value } else { 0.0 };
            let _ = write!(
                sql,
                "('{scope_sql}', {level}, '{}', {}, {value}, {}, {expires_at})",
                escape_sql(&v.gauge_name),
                v.capture_time,
                v.weight,
            );
        }
        self.execute(sql, "gauge values insert").await
    }

    async fn read_gauge_values(
        &self,
        scope: &str,
        level: usize,
        gauge_name: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<GaugeValue>> {
        let table = self.table("gauge_values");
        let sql = format!(
            "SELECT capture_time, value, weight FROM {table} FINAL WHERE scope = '{}' \
             AND level = {level} AND gauge_name = '{}' AND capture_time > {from} \
             AND capture_time <= {to} ORDER BY capture_time",
            escape_sql(scope),
            escape_sql(gauge_name),
        );

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for gauge read")?;
        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("querying gauge values")?;

        let mut values = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            values.push(GaugeValue {
                gauge_name: gauge_name.to_string(),
                capture_time: row.get("capture_time").context("reading capture_time")?,
                value: row.get("value").context("reading value")?,
                weight: row.get("weight").context("reading weight")?,
            });
        }
        Ok(values)
    }

    async fn read_full_text(&self, scope: &str, digest: &str) -> Result<Option<String>> {
        let table = self.table("full_texts");
        let sql = format!(
            "SELECT full_text FROM {table} FINAL WHERE scope = '{}' AND digest = '{}' LIMIT 1",
            escape_sql(scope),
            escape_sql(digest),
        );
        let texts = self.query_strings(sql, "full_text", "full text").await?;
        Ok(texts.into_iter().next())
    }

    async fn expire(&self, _now_millis: i64) -> Result<usize> {
        Ok(0)
    }
}

/// Unix seconds at which a row written now with `ttl` expires.
fn expires_at_secs(ttl: Duration) -> u64 {
    if ttl.is_zero() {
        return NEVER_EXPIRES;
    }
    let now = SystemClock.now_millis().max(0) as u64 / 1000;
    now.saturating_add(ttl.as_secs()).min(NEVER_EXPIRES)
}

/// Escapes a string value for SQL insertion (single-quote escaping).
fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}
