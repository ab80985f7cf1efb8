use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::aggregate::StatementLimits;
use crate::clock::millis;

/// Top-level configuration for the rollupd service.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Scope under which this process records its own gauges.
    #[serde(default = "default_scope")]
    pub scope: String,

    /// Interval aggregation configuration.
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Rollup levels and scheduling.
    #[serde(default)]
    pub rollup: RollupConfig,

    /// Self-monitoring gauge collection.
    #[serde(default)]
    pub gauges: GaugesConfig,

    /// Storage backend configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Interval aggregation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Capacity of each scope's producer queue. Default: 65536.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Extra wait past a bucket's end before an idle bucket is closed.
    /// Default: 1s.
    #[serde(default = "default_idle_margin", with = "humantime_serde")]
    pub idle_margin: Duration,

    /// How far a producer-supplied capture time may run ahead of the
    /// service clock. Later times are stamped with the clock instead.
    /// Default: 1h.
    #[serde(default = "default_max_clock_lead", with = "humantime_serde")]
    pub max_clock_lead: Duration,

    /// Distinct transaction names tracked per type in one interval.
    /// Default: 500.
    #[serde(default = "default_max_transaction_names")]
    pub max_transaction_names_per_type: usize,

    /// Statement entries kept per statement type. Default: 500.
    #[serde(default = "default_max_statements")]
    pub max_statements_per_type: usize,

    /// Distinct statements accepted per type while building, as a multiple
    /// of `max_statements_per_type`. Default: 2.
    #[serde(default = "default_hard_limit_multiplier")]
    pub statement_hard_limit_multiplier: usize,

    /// Statement texts longer than this are truncated. Default: 120.
    #[serde(default = "default_truncate_chars")]
    pub statement_truncate_chars: usize,
}

impl AggregationConfig {
    pub fn statement_limits(&self) -> StatementLimits {
        StatementLimits {
            max_per_type: self.max_statements_per_type,
            hard_limit_multiplier: self.statement_hard_limit_multiplier,
            truncate_chars: self.statement_truncate_chars,
        }
    }
}

/// Ordered rollup levels. Level 0 is the aggregation interval.
#[derive(Debug, Clone, Deserialize)]
pub struct RollupConfig {
    /// Levels from finest to coarsest.
    #[serde(default = "default_levels")]
    pub levels: Vec<RollupLevelConfig>,

    /// How often the rollup pass runs. Default: 1m.
    #[serde(default = "default_pass_interval", with = "humantime_serde")]
    pub pass_interval: Duration,
}

/// A single rollup resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RollupLevelConfig {
    /// Bucket length.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Retention. Zero keeps data forever.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl RollupLevelConfig {
    pub fn new(interval: Duration, ttl: Duration) -> Self {
        Self { interval, ttl }
    }
}

impl RollupConfig {
    pub fn with_levels(levels: Vec<RollupLevelConfig>) -> Self {
        Self {
            levels,
            ..Default::default()
        }
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Bucket length of `level` in milliseconds.
    pub fn interval_millis(&self, level: usize) -> Option<i64> {
        self.levels.get(level).map(|l| millis(l.interval))
    }

    pub fn ttl(&self, level: usize) -> Option<Duration> {
        self.levels.get(level).map(|l| l.ttl)
    }

    /// Aggregation interval, i.e. the level-0 bucket length in ms.
    pub fn base_interval_millis(&self) -> i64 {
        self.interval_millis(0).unwrap_or(0)
    }

    pub fn validate(&self) -> Result<()> {
        if self.levels.is_empty() {
            bail!("rollup.levels must not be empty");
        }

        for (idx, level) in self.levels.iter().enumerate() {
            if level.interval.as_millis() == 0 {
                bail!("rollup.levels[{idx}].interval must be at least 1ms");
            }
            if level.interval.subsec_nanos() % 1_000_000 != 0 {
                bail!("rollup.levels[{idx}].interval must be a whole number of milliseconds");
            }
        }

        for (idx, pair) in self.levels.windows(2).enumerate() {
            let finer = millis(pair[0].interval);
            let coarser = millis(pair[1].interval);
            if coarser <= finer {
                bail!(
                    "rollup.levels[{}].interval must be longer than rollup.levels[{idx}].interval",
                    idx + 1,
                );
            }
            if coarser % finer != 0 {
                bail!(
                    "rollup.levels[{}].interval must be a multiple of rollup.levels[{idx}].interval",
                    idx + 1,
                );
            }
        }

        if self.pass_interval.is_zero() {
            bail!("rollup.pass_interval must be positive");
        }

        Ok(())
    }
}

/// Self-monitoring gauge collection.
#[derive(Debug, Clone, Deserialize)]
pub struct GaugesConfig {
    /// Enable gauge collection. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sampling interval. Default: 5s.
    #[serde(default = "default_gauge_interval", with = "humantime_serde")]
    pub interval: Duration,
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    ClickHouse,
}

/// Storage configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct StoreConfig {
    /// Backend to use. Default: memory.
    #[serde(default)]
    pub backend: StoreKind,

    /// ClickHouse connection, used when `backend` is `clickhouse`.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// ClickHouse native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Target database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// Schema migration configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema migration behavior configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Run migrations on startup. Default: false.
    #[serde(default)]
    pub enabled: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_scope() -> String {
    "rollupd".to_string()
}

fn default_queue_capacity() -> usize {
    65_536
}

fn default_idle_margin() -> Duration {
    Duration::from_secs(1)
}

fn default_max_clock_lead() -> Duration {
    Duration::from_secs(3600)
}

fn default_max_transaction_names() -> usize {
    500
}

fn default_max_statements() -> usize {
    500
}

fn default_hard_limit_multiplier() -> usize {
    2
}

fn default_truncate_chars() -> usize {
    120
}

fn default_levels() -> Vec<RollupLevelConfig> {
    const MINUTE: u64 = 60;
    const DAY: u64 = 24 * 60 * MINUTE;
    vec![
        RollupLevelConfig::new(Duration::from_secs(MINUTE), Duration::from_secs(3 * DAY)),
        RollupLevelConfig::new(Duration::from_secs(5 * MINUTE), Duration::from_secs(14 * DAY)),
        RollupLevelConfig::new(Duration::from_secs(30 * MINUTE), Duration::from_secs(60 * DAY)),
        RollupLevelConfig::new(Duration::from_secs(240 * MINUTE), Duration::from_secs(365 * DAY)),
    ]
}

fn default_pass_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_gauge_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_true() -> bool {
    true
}

fn default_database() -> String {
    "default".to_string()
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            scope: default_scope(),
            aggregation: AggregationConfig::default(),
            rollup: RollupConfig::default(),
            gauges: GaugesConfig::default(),
            store: StoreConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            idle_margin: default_idle_margin(),
            max_clock_lead: default_max_clock_lead(),
            max_transaction_names_per_type: default_max_transaction_names(),
            max_statements_per_type: default_max_statements(),
            statement_hard_limit_multiplier: default_hard_limit_multiplier(),
            statement_truncate_chars: default_truncate_chars(),
        }
    }
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            levels: default_levels(),
            pass_interval: default_pass_interval(),
        }
    }
}

impl Default for GaugesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_gauge_interval(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.scope.is_empty() {
            bail!("scope is required");
        }

        self.aggregation.validate()?;
        self.rollup.validate()?;

        if self.gauges.enabled && self.gauges.interval.as_millis() == 0 {
            bail!("gauges.interval must be at least 1ms");
        }

        if self.store.backend == StoreKind::ClickHouse && self.store.clickhouse.endpoint.is_empty()
        {
            bail!("store.clickhouse.endpoint is required when store.backend is clickhouse");
        }

        Ok(())
    }
}

impl AggregationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            bail!("aggregation.queue_capacity must be positive");
        }
        if self.max_clock_lead.is_zero() {
            bail!("aggregation.max_clock_lead must be positive");
        }
        if self.max_transaction_names_per_type == 0 {
            bail!("aggregation.max_transaction_names_per_type must be positive");
        }
        if self.max_statements_per_type == 0 {
            bail!("aggregation.max_statements_per_type must be positive");
        }
        if self.statement_hard_limit_multiplier == 0 {
            bail!("aggregation.statement_hard_limit_multiplier must be positive");
        }
        if self.statement_truncate_chars == 0 {
            bail!("aggregation.statement_truncate_chars must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(interval_secs: u64) -> RollupLevelConfig {
        RollupLevelConfig::new(
            Duration::from_secs(interval_secs),
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.health.addr, ":9090");
        assert_eq!(cfg.aggregation.queue_capacity, 65_536);
        assert_eq!(cfg.rollup.level_count(), 4);
        assert_eq!(cfg.rollup.base_interval_millis(), 60_000);
        assert_eq!(cfg.rollup.interval_millis(3), Some(4 * 60 * 60 * 1000));
        assert_eq!(cfg.store.backend, StoreKind::Memory);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
log_level: debug
scope: agent-1
aggregation:
  idle_margin: 250ms
  max_statements_per_type: 100
rollup:
  pass_interval: 30s
  levels:
    - { interval: 10s, ttl: 1h }
    - { interval: 1m, ttl: 1d }
store:
  backend: clickhouse
  clickhouse:
    endpoint: localhost:9000
    migrations:
      enabled: true
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.scope, "agent-1");
        assert_eq!(cfg.aggregation.idle_margin, Duration::from_millis(250));
        assert_eq!(cfg.aggregation.statement_limits().max_per_type, 100);
        assert_eq!(cfg.aggregation.statement_limits().truncate_chars, 120);
        assert_eq!(cfg.rollup.interval_millis(1), Some(60_000));
        assert_eq!(cfg.rollup.ttl(1), Some(Duration::from_secs(86_400)));
        assert_eq!(cfg.store.backend, StoreKind::ClickHouse);
        assert_eq!(cfg.store.clickhouse.database, "default");
        assert!(cfg.store.clickhouse.migrations.enabled);
    }

    #[test]
    fn test_validation_empty_levels() {
        let cfg = RollupConfig::with_levels(Vec::new());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("must not be empty"));
    }

    #[test]
    fn test_validation_levels_must_increase() {
        let cfg = RollupConfig::with_levels(vec![level(60), level(60)]);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("must be longer"));
    }

    #[test]
    fn test_validation_levels_must_divide() {
        let cfg = RollupConfig::with_levels(vec![level(60), level(90)]);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("multiple"));
    }

    #[test]
    fn test_validation_queue_capacity_zero() {
        let cfg = Config {
            aggregation: AggregationConfig {
                queue_capacity: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("queue_capacity"));
    }

    #[test]
    fn test_validation_max_clock_lead_zero() {
        let cfg = Config {
            aggregation: AggregationConfig {
                max_clock_lead: Duration::ZERO,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_clock_lead"));
    }

    #[test]
    fn test_validation_statement_limit_zero() {
        let cfg = Config {
            aggregation: AggregationConfig {
                max_statements_per_type: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_statements_per_type"));
    }

    #[test]
    fn test_validation_clickhouse_requires_endpoint() {
        let cfg = Config {
            store: StoreConfig {
                backend: StoreKind::ClickHouse,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("store.clickhouse.endpoint"));
    }
}
