//! External database collaborators: dump, restore, schema migrations and
//! entity counts.
//!
//! The engine only talks to these traits. The PostgreSQL implementations
//! shell out to `pg_dump`/`pg_restore` and use sqlx for everything else.

use async_trait::async_trait;
use sqlx::migrate::Migrator;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use crate::error::{AppError, Result};

/// Upper bound on captured tool stderr.
const MAX_STDERR_BYTES: usize = 2048;

/// Produces a database dump at `output_path`.
#[async_trait]
pub trait DumpRunner: Send + Sync {
    async fn dump(&self, output_path: &Path) -> Result<()>;
}

/// Replaces the live schema contents from a dump.
#[async_trait]
pub trait RestoreRunner: Send + Sync {
    async fn restore(&self, dump_path: &Path, clean: bool) -> Result<()>;
}

/// Schema version bookkeeping and forward migration.
#[async_trait]
pub trait SchemaMigrator: Send + Sync {
    /// Highest version known to the running code
    async fn current_version(&self) -> Result<i64>;
    /// Highest version applied to the live database
    async fn applied_version(&self) -> Result<i64>;
    /// Apply every pending migration. Idempotent.
    async fn migrate(&self) -> Result<()>;
}

/// Point-in-time row counts per data domain.
#[async_trait]
pub trait EntityCounter: Send + Sync {
    /// Counts for `scope`, or for every known domain when `scope` is empty.
    async fn count(&self, scope: &[String]) -> Result<BTreeMap<String, i64>>;
}

fn truncate_stderr(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= MAX_STDERR_BYTES {
        return text.to_string();
    }
    let mut end = MAX_STDERR_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated)", &text[..end])
}

async fn run_tool(program: &str, args: &[&str], label: &str) -> Result<()> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| AppError::DumpTool(format!("Failed to execute {}: {}", program, e)))?;

    if !output.status.success() {
        return Err(AppError::DumpTool(format!(
            "{} exited with {}: {}",
            label,
            output.status,
            truncate_stderr(&output.stderr)
        )));
    }

    Ok(())
}

/// `pg_dump`/`pg_restore` against one database.
pub struct PgDumpTool {
    db: PgPool,
    database_url: String,
    pg_dump_path: String,
    pg_restore_path: String,
}

redacted_debug!(PgDumpTool {
    redact database_url,
    show pg_dump_path,
    show pg_restore_path,
});

impl PgDumpTool {
    pub fn new(
        db: PgPool,
        database_url: impl Into<String>,
        pg_dump_path: impl Into<String>,
        pg_restore_path: impl Into<String>,
    ) -> Self {
        Self {
            db,
            database_url: database_url.into(),
            pg_dump_path: pg_dump_path.into(),
            pg_restore_path: pg_restore_path.into(),
        }
    }

    async fn recreate_public_schema(&self) -> Result<()> {
        sqlx::query("DROP SCHEMA IF EXISTS public CASCADE")
            .execute(&self.db)
            .await
            .map_err(|e| AppError::DumpTool(format!("failed to drop schema: {}", e)))?;
        sqlx::query("CREATE SCHEMA public")
            .execute(&self.db)
            .await
            .map_err(|e| AppError::DumpTool(format!("failed to recreate schema: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl DumpRunner for PgDumpTool {
    async fn dump(&self, output_path: &Path) -> Result<()> {
        let output = output_path.to_string_lossy();
        run_tool(
            &self.pg_dump_path,
            &[
                "--format=custom",
                "--no-owner",
                "--file",
                output.as_ref(),
                "--dbname",
                self.database_url.as_str(),
            ],
            "pg_dump",
        )
        .await?;

        tracing::debug!(path = %output_path.display(), "Database dump written");
        Ok(())
    }
}

#[async_trait]
impl RestoreRunner for PgDumpTool {
    async fn restore(&self, dump_path: &Path, clean: bool) -> Result<()> {
        if clean {
            self.recreate_public_schema().await?;
        }

        let input = dump_path.to_string_lossy();
        let mut args: Vec<&str> = vec![
            "--no-owner",
            "--exit-on-error",
            "--dbname",
            self.database_url.as_str(),
        ];
        if clean {
            args.extend_from_slice(&["--clean", "--if-exists"]);
        }
        args.push(input.as_ref());

        run_tool(&self.pg_restore_path, &args, "pg_restore").await?;
        tracing::debug!(path = %dump_path.display(), "Database restored from dump");
        Ok(())
    }
}

/// Migrations read from a directory and tracked in `_sqlx_migrations`.
pub struct SqlxMigrator {
    db: PgPool,
    migrator: Migrator,
    path: PathBuf,
}

impl SqlxMigrator {
    pub async fn load(db: PgPool, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let migrator = Migrator::new(path.as_path()).await?;
        Ok(Self { db, migrator, path })
    }
}

#[async_trait]
impl SchemaMigrator for SqlxMigrator {
    async fn current_version(&self) -> Result<i64> {
        Ok(self
            .migrator
            .iter()
            .filter(|m| m.migration_type.is_up_migration())
            .map(|m| m.version)
            .max()
            .unwrap_or(0))
    }

    async fn applied_version(&self) -> Result<i64> {
        let tracked: bool =
            sqlx::query_scalar("SELECT to_regclass('public._sqlx_migrations') IS NOT NULL")
                .fetch_one(&self.db)
                .await?;
        if !tracked {
            return Ok(0);
        }

        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM _sqlx_migrations WHERE success")
                .fetch_one(&self.db)
                .await?;
        Ok(version.unwrap_or(0))
    }

    async fn migrate(&self) -> Result<()> {
        self.migrator.run(&self.db).await?;
        tracing::info!(path = %self.path.display(), "Schema migrations applied");
        Ok(())
    }
}

/// Counts rows of the table mapped to each data domain.
pub struct PgEntityCounter {
    db: PgPool,
    domain_tables: BTreeMap<String, String>,
}

impl PgEntityCounter {
    pub fn new(db: PgPool, domain_tables: BTreeMap<String, String>) -> Self {
        Self { db, domain_tables }
    }
}

fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
}

#[async_trait]
impl EntityCounter for PgEntityCounter {
    async fn count(&self, scope: &[String]) -> Result<BTreeMap<String, i64>> {
        let mut counts = BTreeMap::new();
        for (domain, table) in &self.domain_tables {
            if !scope.is_empty() && !scope.iter().any(|s| s == domain) {
                continue;
            }
            if !is_safe_identifier(table) {
                tracing::warn!(domain = %domain, table = %table, "Skipping unsafe table name");
                continue;
            }

            let sql = format!("SELECT COUNT(*) FROM {}", table);
            match sqlx::query_scalar::<_, i64>(&sql).fetch_one(&self.db).await {
                Ok(n) => {
                    counts.insert(domain.clone(), n);
                }
                Err(e) => {
                    tracing::warn!(domain = %domain, table = %table, "Entity count failed: {}", e);
                }
            }
        }
        Ok(counts)
    }
}
