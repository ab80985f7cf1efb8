pub mod health;

use anyhow::{Context, Result};
use clickhouse_rs::Pool;

use crate::config::ClickHouseConfig;

/// Opens a ClickHouse native TCP pool and verifies it with a ping.
///
/// Uses LZ4 compression and a pool of 2 to 5 connections.
pub async fn connect_clickhouse(cfg: &ClickHouseConfig) -> Result<Pool> {
    let pool = Pool::new(build_dsn(cfg));

    let mut handle = pool
        .get_handle()
        .await
        .with_context(|| format!("opening ClickHouse connection to {}", cfg.endpoint))?;
    handle.ping().await.context("pinging ClickHouse")?;

    tracing::info!(endpoint = %cfg.endpoint, database = %cfg.database, "ClickHouse connected");
    Ok(pool)
}

/// Builds a clickhouse-rs TCP DSN.
///
/// Format: `tcp://[user[:pass]@]host:port/database?options`
fn build_dsn(cfg: &ClickHouseConfig) -> String {
    let mut dsn = "tcp://".to_string();

    if !cfg.username.is_empty() {
        dsn.push_str(&cfg.username);
        if !cfg.password.is_empty() {
            dsn.push(':');
            dsn.push_str(&cfg.password);
        }
        dsn.push('@');
    }

    dsn.push_str(&cfg.endpoint);
    dsn.push('/');
    dsn.push_str(&cfg.database);
    dsn.push_str("?compression=lz4&pool_min=2&pool_max=5");

    dsn
}
