//! Persistence for artifacts, runs, the maintenance flag and the backup plan.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::backup::{ArtifactFilter, ArtifactMetadata, BackupArtifact, BackupRun};
use crate::models::plan::BackupPlan;
use crate::models::restore::{RestoreRun, RestoreStep};

const MAINTENANCE_FLAG: &str = "maintenance_mode";

/// Persistence collaborator used by every engine operation.
///
/// `create_backup_run` and `create_restore_run` must refuse a second
/// non-terminal run with [`AppError::NotReady`]; this is what protects the
/// single-active-run invariant across process restarts.
#[async_trait]
pub trait BackupRepository: Send + Sync {
    async fn insert_artifact(&self, artifact: &BackupArtifact) -> Result<()>;
    async fn get_artifact(&self, id: Uuid) -> Result<Option<BackupArtifact>>;
    async fn find_artifact_by_path(&self, storage_path: &str) -> Result<Option<BackupArtifact>>;
    /// Newest first
    async fn list_artifacts(&self, filter: &ArtifactFilter) -> Result<Vec<BackupArtifact>>;
    async fn delete_artifact(&self, id: Uuid) -> Result<bool>;

    async fn create_backup_run(&self, run: &BackupRun) -> Result<()>;
    async fn update_backup_run(&self, run: &BackupRun) -> Result<()>;
    async fn get_backup_run(&self, id: Uuid) -> Result<Option<BackupRun>>;
    async fn has_running_backup(&self) -> Result<bool>;
    /// Fail every queued/running backup run. Returns how many were changed.
    async fn fail_unfinished_backup_runs(&self, message: &str) -> Result<u64>;

    async fn create_restore_run(&self, run: &RestoreRun) -> Result<()>;
    /// Insert or update; the row may have vanished when the database was replaced.
    async fn save_restore_run(&self, run: &RestoreRun) -> Result<()>;
    async fn get_restore_run(&self, id: Uuid) -> Result<Option<RestoreRun>>;
    /// Newest first
    async fn list_restore_runs(&self, limit: usize) -> Result<Vec<RestoreRun>>;
    async fn latest_restore_run(&self, dry_run: bool) -> Result<Option<RestoreRun>>;
    async fn has_running_restore(&self) -> Result<bool>;
    /// Fail every queued/running restore run other than `except`.
    async fn fail_unfinished_restore_runs(&self, except: Option<Uuid>, message: &str)
        -> Result<u64>;

    async fn maintenance_mode(&self) -> Result<bool>;
    async fn set_maintenance_mode(&self, enabled: bool) -> Result<()>;

    async fn backup_plan(&self) -> Result<BackupPlan>;
    async fn save_backup_plan(&self, plan: &BackupPlan) -> Result<()>;
}

fn map_unique_violation(e: sqlx::Error, what: &str) -> AppError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::NotReady(format!("another {} is already queued or running", what))
        }
        _ => AppError::Database(e.to_string()),
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ArtifactRow {
    id: Uuid,
    source: String,
    status: String,
    size_bytes: i64,
    checksum: String,
    filename: String,
    storage_path: String,
    metadata: Json<ArtifactMetadata>,
    created_by: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ArtifactRow> for BackupArtifact {
    type Error = AppError;

    fn try_from(row: ArtifactRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            source: row.source.parse()?,
            status: row.status.parse()?,
            size_bytes: row.size_bytes,
            checksum: row.checksum,
            filename: row.filename,
            storage_path: row.storage_path,
            metadata: row.metadata.0,
            created_by: row.created_by,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BackupRunRow {
    id: Uuid,
    status: String,
    artifact_id: Option<Uuid>,
    requested_by: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<BackupRunRow> for BackupRun {
    type Error = AppError;

    fn try_from(row: BackupRunRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            status: row.status.parse()?,
            artifact_id: row.artifact_id,
            requested_by: row.requested_by,
            error_code: row.error_code,
            error_message: row.error_message,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RestoreRunRow {
    id: Uuid,
    artifact_id: Uuid,
    dry_run: bool,
    status: String,
    steps: Json<Vec<RestoreStep>>,
    requested_by: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<RestoreRunRow> for RestoreRun {
    type Error = AppError;

    fn try_from(row: RestoreRunRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            artifact_id: row.artifact_id,
            dry_run: row.dry_run,
            status: row.status.parse()?,
            steps: row.steps.0,
            requested_by: row.requested_by,
            error_code: row.error_code,
            error_message: row.error_message,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

const ARTIFACT_COLUMNS: &str = "id, source, status, size_bytes, checksum, filename, \
     storage_path, metadata, created_by, created_at";
const BACKUP_RUN_COLUMNS: &str = "id, status, artifact_id, requested_by, error_code, \
     error_message, created_at, started_at, finished_at";
const RESTORE_RUN_COLUMNS: &str = "id, artifact_id, dry_run, status, steps, requested_by, \
     error_code, error_message, created_at, started_at, finished_at";

/// PostgreSQL-backed repository
pub struct PgBackupRepository {
    db: PgPool,
}

impl PgBackupRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl BackupRepository for PgBackupRepository {
    async fn insert_artifact(&self, artifact: &BackupArtifact) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backup_artifacts
                (id, source, status, size_bytes, checksum, filename, storage_path,
                 metadata, created_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(artifact.id)
        .bind(artifact.source.as_str())
        .bind(artifact.status.as_str())
        .bind(artifact.size_bytes)
        .bind(&artifact.checksum)
        .bind(&artifact.filename)
        .bind(&artifact.storage_path)
        .bind(Json(&artifact.metadata))
        .bind(&artifact.created_by)
        .bind(artifact.created_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn get_artifact(&self, id: Uuid) -> Result<Option<BackupArtifact>> {
        let row = sqlx::query_as::<_, ArtifactRow>(&format!(
            "SELECT {} FROM backup_artifacts WHERE id = $1",
            ARTIFACT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        row.map(BackupArtifact::try_from).transpose()
    }

    async fn find_artifact_by_path(&self, storage_path: &str) -> Result<Option<BackupArtifact>> {
        let row = sqlx::query_as::<_, ArtifactRow>(&format!(
            "SELECT {} FROM backup_artifacts WHERE storage_path = $1 \
             ORDER BY created_at DESC LIMIT 1",
            ARTIFACT_COLUMNS
        ))
        .bind(storage_path)
        .fetch_optional(&self.db)
        .await?;

        row.map(BackupArtifact::try_from).transpose()
    }

    async fn list_artifacts(&self, filter: &ArtifactFilter) -> Result<Vec<BackupArtifact>> {
        let rows = sqlx::query_as::<_, ArtifactRow>(&format!(
            r#"
            SELECT {}
            FROM backup_artifacts
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR source = $2)
            ORDER BY created_at DESC
            LIMIT $3
            "#,
            ARTIFACT_COLUMNS
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.source.map(|s| s.as_str()))
        .bind(filter.limit.map(|l| l as i64).unwrap_or(i64::MAX))
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(BackupArtifact::try_from).collect()
    }

    async fn delete_artifact(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM backup_artifacts WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn create_backup_run(&self, run: &BackupRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backup_runs
                (id, status, artifact_id, requested_by, error_code, error_message,
                 created_at, started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(run.id)
        .bind(run.status.as_str())
        .bind(run.artifact_id)
        .bind(&run.requested_by)
        .bind(&run.error_code)
        .bind(&run.error_message)
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.finished_at)
        .execute(&self.db)
        .await
        .map_err(|e| map_unique_violation(e, "backup"))?;

        Ok(())
    }

    async fn update_backup_run(&self, run: &BackupRun) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE backup_runs
            SET status = $2, artifact_id = $3, error_code = $4, error_message = $5,
                started_at = $6, finished_at = $7
            WHERE id = $1
            "#,
        )
        .bind(run.id)
        .bind(run.status.as_str())
        .bind(run.artifact_id)
        .bind(&run.error_code)
        .bind(&run.error_message)
        .bind(run.started_at)
        .bind(run.finished_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn get_backup_run(&self, id: Uuid) -> Result<Option<BackupRun>> {
        let row = sqlx::query_as::<_, BackupRunRow>(&format!(
            "SELECT {} FROM backup_runs WHERE id = $1",
            BACKUP_RUN_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        row.map(BackupRun::try_from).transpose()
    }

    async fn has_running_backup(&self) -> Result<bool> {
        let running: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM backup_runs WHERE status IN ('queued', 'running'))",
        )
        .fetch_one(&self.db)
        .await?;

        Ok(running)
    }

    async fn fail_unfinished_backup_runs(&self, message: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE backup_runs
            SET status = 'failed', error_code = 'INTERNAL_ERROR', error_message = $1,
                finished_at = NOW()
            WHERE status IN ('queued', 'running')
            "#,
        )
        .bind(message)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    async fn create_restore_run(&self, run: &RestoreRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO restore_runs
                (id, artifact_id, dry_run, status, steps, requested_by, error_code,
                 error_message, created_at, started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(run.id)
        .bind(run.artifact_id)
        .bind(run.dry_run)
        .bind(run.status.as_str())
        .bind(Json(&run.steps))
        .bind(&run.requested_by)
        .bind(&run.error_code)
        .bind(&run.error_message)
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.finished_at)
        .execute(&self.db)
        .await
        .map_err(|e| map_unique_violation(e, "restore"))?;

        Ok(())
    }

    async fn save_restore_run(&self, run: &RestoreRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO restore_runs
                (id, artifact_id, dry_run, status, steps, requested_by, error_code,
                 error_message, created_at, started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status, steps = EXCLUDED.steps,
                error_code = EXCLUDED.error_code, error_message = EXCLUDED.error_message,
                started_at = EXCLUDED.started_at, finished_at = EXCLUDED.finished_at
            "#,
        )
        .bind(run.id)
        .bind(run.artifact_id)
        .bind(run.dry_run)
        .bind(run.status.as_str())
        .bind(Json(&run.steps))
        .bind(&run.requested_by)
        .bind(&run.error_code)
        .bind(&run.error_message)
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.finished_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn get_restore_run(&self, id: Uuid) -> Result<Option<RestoreRun>> {
        let row = sqlx::query_as::<_, RestoreRunRow>(&format!(
            "SELECT {} FROM restore_runs WHERE id = $1",
            RESTORE_RUN_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        row.map(RestoreRun::try_from).transpose()
    }

    async fn list_restore_runs(&self, limit: usize) -> Result<Vec<RestoreRun>> {
        let rows = sqlx::query_as::<_, RestoreRunRow>(&format!(
            "SELECT {} FROM restore_runs ORDER BY created_at DESC LIMIT $1",
            RESTORE_RUN_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(RestoreRun::try_from).collect()
    }

    async fn latest_restore_run(&self, dry_run: bool) -> Result<Option<RestoreRun>> {
        let row = sqlx::query_as::<_, RestoreRunRow>(&format!(
            "SELECT {} FROM restore_runs WHERE dry_run = $1 ORDER BY created_at DESC LIMIT 1",
            RESTORE_RUN_COLUMNS
        ))
        .bind(dry_run)
        .fetch_optional(&self.db)
        .await?;

        row.map(RestoreRun::try_from).transpose()
    }

    async fn has_running_restore(&self) -> Result<bool> {
        let running: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM restore_runs WHERE status IN ('queued', 'running'))",
        )
        .fetch_one(&self.db)
        .await?;

        Ok(running)
    }

    async fn fail_unfinished_restore_runs(
        &self,
        except: Option<Uuid>,
        message: &str,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE restore_runs
            SET status = 'failed', error_code = 'INTERNAL_ERROR', error_message = $2,
                finished_at = NOW()
            WHERE status IN ('queued', 'running')
              AND ($1::uuid IS NULL OR id <> $1)
            "#,
        )
        .bind(except)
        .bind(message)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    async fn maintenance_mode(&self) -> Result<bool> {
        let enabled: Option<bool> =
            sqlx::query_scalar("SELECT enabled FROM system_flags WHERE key = $1")
                .bind(MAINTENANCE_FLAG)
                .fetch_optional(&self.db)
                .await?;

        Ok(enabled.unwrap_or(false))
    }

    async fn set_maintenance_mode(&self, enabled: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO system_flags (key, enabled, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET enabled = EXCLUDED.enabled, updated_at = NOW()
            "#,
        )
        .bind(MAINTENANCE_FLAG)
        .bind(enabled)
        .execute(&self.db)
        .await
        .map_err(|e| AppError::Maintenance(e.to_string()))?;

        Ok(())
    }

    async fn backup_plan(&self) -> Result<BackupPlan> {
        let plan: Option<Json<BackupPlan>> =
            sqlx::query_scalar("SELECT config FROM backup_plan WHERE id = 1")
                .fetch_optional(&self.db)
                .await?;

        Ok(plan.map(|p| p.0).unwrap_or_default())
    }

    async fn save_backup_plan(&self, plan: &BackupPlan) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backup_plan (id, config, updated_at)
            VALUES (1, $1, NOW())
            ON CONFLICT (id) DO UPDATE SET config = EXCLUDED.config, updated_at = NOW()
            "#,
        )
        .bind(Json(plan))
        .execute(&self.db)
        .await?;

        Ok(())
    }
}
