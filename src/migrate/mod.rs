//! Embedded ClickHouse schema migrations.

use anyhow::{bail, Context, Result};
use clickhouse_rs::Pool;
use tracing::info;

struct Migration {
    version: u32,
    up_sql: &'static str,
    down_sql: &'static str,
}

static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    up_sql: include_str!("sql/001_init.up.sql"),
    down_sql: include_str!("sql/001_init.down.sql"),
}];

/// Applied schema version. Version 0 means nothing has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationStatus {
    pub version: u32,
    /// A migration started but did not finish.
    pub dirty: bool,
}

/// Applies and reverts the embedded migrations.
pub trait Migrator: Send {
    /// Applies every pending migration. Returns how many were applied.
    fn up(&self) -> impl std::future::Future<Output = Result<u32>> + Send;

    /// Reverts the most recent migration.
    fn down(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    fn status(&self) -> impl std::future::Future<Output = Result<MigrationStatus>> + Send;
}

/// Migration runner tracking versions in a golang-migrate compatible
/// `schema_migrations` table of the target database.
pub struct ClickHouseMigrator {
    pool: Pool,
    database: String,
}

impl ClickHouseMigrator {
    pub fn new(pool: Pool, database: String) -> Self {
        Self { pool, database }
    }

    fn versions_table(&self) -> String {
        format!("{}.schema_migrations", self.database)
    }

    async fn ensure_versions_table(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (version Int64, dirty UInt8, sequence UInt64) \
             ENGINE = TinyLog",
            self.versions_table()
        );
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for schema_migrations")?;
        handle
            .execute(sql.as_str())
            .await
            .context("creating schema_migrations")?;
        Ok(())
    }

    async fn read_status(&self) -> Result<MigrationStatus> {
        let sql = format!(
            "SELECT version, dirty FROM {} ORDER BY sequence DESC LIMIT 1",
            self.versions_table()
        );
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for migration status")?;
        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("querying migration status")?;

        let Some(row) = block.rows().next() else {
            return Ok(MigrationStatus {
                version: 0,
                dirty: false,
            });
        };
        let version: i64 = row.get("version").context("reading version")?;
        let dirty: u8 = row.get("dirty").context("reading dirty flag")?;
        Ok(MigrationStatus {
            version: u32::try_from(version).context("migration version out of range")?,
            dirty: dirty != 0,
        })
    }

    /// Replaces the recorded version. Version 0 clears it.
    async fn record_status(&self, status: MigrationStatus) -> Result<()> {
        let table = self.versions_table();
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for migration status update")?;

        handle
            .execute(format!("TRUNCATE TABLE {table}").as_str())
            .await
            .context("truncating schema_migrations")?;
        if status.version == 0 {
            return Ok(());
        }

        let sql = format!(
            "INSERT INTO {table} (version, dirty, sequence) VALUES ({}, {}, 1)",
            status.version,
            u8::from(status.dirty),
        );
        handle
            .execute(sql.as_str())
            .await
            .context("recording migration version")?;
        Ok(())
    }

    async fn execute_script(&self, version: u32, sql: &str) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for migration script")?;
        for statement in split_statements(sql) {
            handle.execute(statement).await.with_context(|| {
                let head: String = statement.chars().take(60).collect();
                format!("migration {version}: {head}")
            })?;
        }
        Ok(())
    }
}

impl Migrator for ClickHouseMigrator {
    async fn up(&self) -> Result<u32> {
        self.ensure_versions_table().await?;
        let status = self.read_status().await?;
        if status.dirty {
            bail!(
                "schema version {} is dirty, fix the schema and clear schema_migrations",
                status.version
            );
        }

        let mut applied = 0;
        for migration in pending(status.version) {
            info!(version = migration.version, "applying migration");
            self.record_status(MigrationStatus {
                version: migration.version,
                dirty: true,
            })
            .await?;
            self.execute_script(migration.version, migration.up_sql)
                .await?;
            self.record_status(MigrationStatus {
                version: migration.version,
                dirty: false,
            })
            .await?;
            applied += 1;
        }

        info!(from = status.version, applied, "schema up to date");
        Ok(applied)
    }

    async fn down(&self) -> Result<()> {
        self.ensure_versions_table().await?;
        let status = self.read_status().await?;
        if status.version == 0 {
            info!("no migrations to revert");
            return Ok(());
        }

        let migration = MIGRATIONS
            .iter()
            .find(|m| m.version == status.version)
            .with_context(|| format!("unknown schema version {}", status.version))?;

        self.record_status(MigrationStatus {
            version: status.version,
            dirty: true,
        })
        .await?;
        self.execute_script(migration.version, migration.down_sql)
            .await?;

        let previous = MIGRATIONS
            .iter()
            .map(|m| m.version)
            .filter(|v| *v < status.version)
            .max()
            .unwrap_or(0);
        self.record_status(MigrationStatus {
            version: previous,
            dirty: false,
        })
        .await?;

        info!(from = status.version, to = previous, "migration reverted");
        Ok(())
    }

    async fn status(&self) -> Result<MigrationStatus> {
        self.ensure_versions_table().await?;
        self.read_status().await
    }
}

/// Migrations newer than `current`, in order.
fn pending(current: u32) -> impl Iterator<Item = &'static Migration> {
    MIGRATIONS.iter().filter(move |m| m.version > current)
}

/// Splits a script on `;`, dropping blank statements.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_statements() {
        let stmts = split_statements("CREATE TABLE a (x Int8);\n\n  DROP TABLE b;;\n");
        assert_eq!(stmts, vec!["CREATE TABLE a (x Int8)", "DROP TABLE b"]);
        assert!(split_statements("  \n ").is_empty());
    }

    #[test]
    fn test_migrations_strictly_ordered() {
        assert!(MIGRATIONS.iter().all(|m| m.version > 0));
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }

    #[test]
    fn test_init_creates_every_table() {
        let up = MIGRATIONS[0].up_sql;
        let down = MIGRATIONS[0].down_sql;
        for table in ["aggregate_rows", "needs_rollup", "gauge_values", "full_texts"] {
            assert!(up.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")));
            assert!(down.contains(&format!("DROP TABLE IF EXISTS {table}")));
        }
        assert_eq!(split_statements(up).len(), 4);
    }

    #[test]
    fn test_pending_skips_applied() {
        assert_eq!(pending(0).count(), MIGRATIONS.len());
        let latest = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);
        assert_eq!(pending(latest).count(), 0);
    }
}
