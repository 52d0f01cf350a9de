//! Engine configuration loaded from environment variables.

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AppError, Result};

/// Engine configuration
#[derive(Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Log level used when RUST_LOG is unset
    pub log_level: String,

    /// Root directory every container is written to and read from
    pub storage_path: PathBuf,

    /// Operator-supplied secret the container key is derived from
    pub encryption_key: Option<String>,

    /// Number of dumps allowed to run at once
    pub max_concurrent_dumps: usize,

    /// Hard timeout for the dump tool
    pub dump_timeout: Duration,

    /// Hard timeout for the restore tool
    pub restore_timeout: Duration,

    /// Scheduler tick interval
    pub scheduler_interval: Duration,

    /// Run a dry-run restore of the newest artifact on a timer
    pub self_test_enabled: bool,

    /// Minimum spacing between restore self-tests
    pub self_test_interval: Duration,

    /// pg_dump binary
    pub pg_dump_path: String,

    /// pg_restore binary
    pub pg_restore_path: String,

    /// Directory holding the schema migrations
    pub migrations_path: PathBuf,

    /// Data domain -> table used for per-domain entity counts
    pub domain_tables: BTreeMap<String, String>,
}

redacted_debug!(Config {
    redact database_url,
    show log_level,
    show storage_path,
    redact_option encryption_key,
    show max_concurrent_dumps,
    show dump_timeout,
    show restore_timeout,
    show scheduler_interval,
    show self_test_enabled,
    show self_test_interval,
    show pg_dump_path,
    show pg_restore_path,
    show migrations_path,
    show domain_tables,
});

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| AppError::Config("DATABASE_URL not set".into()))?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            storage_path: env::var("BACKUP_STORAGE_PATH")
                .unwrap_or_else(|_| "/var/lib/backup-orchestrator/backups".into())
                .into(),
            encryption_key: env::var("BACKUP_ENCRYPTION_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            max_concurrent_dumps: parse_env("BACKUP_MAX_CONCURRENT", 1usize).max(1),
            dump_timeout: Duration::from_secs(parse_env("BACKUP_DUMP_TIMEOUT_SECS", 20 * 60)),
            restore_timeout: Duration::from_secs(parse_env(
                "BACKUP_RESTORE_TIMEOUT_SECS",
                30 * 60,
            )),
            scheduler_interval: Duration::from_secs(parse_env(
                "BACKUP_SCHEDULER_INTERVAL_SECS",
                300,
            )),
            self_test_enabled: parse_env("BACKUP_SELF_TEST_ENABLED", false),
            self_test_interval: Duration::from_secs(
                parse_env("BACKUP_SELF_TEST_INTERVAL_HOURS", 24u64) * 3600,
            ),
            pg_dump_path: env::var("PG_DUMP_PATH").unwrap_or_else(|_| "pg_dump".into()),
            pg_restore_path: env::var("PG_RESTORE_PATH").unwrap_or_else(|_| "pg_restore".into()),
            migrations_path: env::var("MIGRATIONS_PATH")
                .unwrap_or_else(|_| "./migrations".into())
                .into(),
            domain_tables: parse_domain_tables(
                &env::var("BACKUP_DOMAIN_TABLES")
                    .unwrap_or_else(|_| "docs=documents,incidents=incidents".into()),
            ),
        })
    }

    /// Configuration rooted at `storage_path` with defaults for everything else.
    pub fn for_storage(storage_path: impl Into<PathBuf>, encryption_key: Option<&str>) -> Self {
        Self {
            database_url: String::new(),
            log_level: "info".into(),
            storage_path: storage_path.into(),
            encryption_key: encryption_key.map(str::to_string),
            max_concurrent_dumps: 1,
            dump_timeout: Duration::from_secs(20 * 60),
            restore_timeout: Duration::from_secs(30 * 60),
            scheduler_interval: Duration::from_secs(300),
            self_test_enabled: false,
            self_test_interval: Duration::from_secs(24 * 3600),
            pg_dump_path: "pg_dump".into(),
            pg_restore_path: "pg_restore".into(),
            migrations_path: "./migrations".into(),
            domain_tables: BTreeMap::new(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Parse `domain=table,domain=table`. Malformed pairs are skipped.
fn parse_domain_tables(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (domain, table) = pair.split_once('=')?;
            let (domain, table) = (domain.trim(), table.trim());
            if domain.is_empty() || table.is_empty() {
                return None;
            }
            Some((domain.to_lowercase(), table.to_string()))
        })
        .collect()
}
