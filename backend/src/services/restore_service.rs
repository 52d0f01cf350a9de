//! Restore state machine.
//!
//! A restore is admitted synchronously (pipeline claim, dump slot, persisted
//! run) and then walks its steps on a detached task. Every step transition is
//! written to the run cache and persisted before the next step begins.
//! Dry runs stop after the compatibility check and never touch maintenance
//! mode or the live database.

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::backup::{ArtifactSource, BackupArtifact, RunStatus};
use crate::models::restore::{RestoreRun, StepName, StepStatus};
use crate::services::audit_service::{AuditAction, AuditEntry, ResourceType};
use crate::services::container::{self, ContainerManifest, UnpackedContainer};
use crate::services::engine::{self, EngineContext};
use crate::services::pipeline::PipelineKind;

/// Runs kept warm in the cache at startup.
const CACHE_WARM_LIMIT: usize = 50;

/// Handle to a restore running in the background.
///
/// Dropping the handle does not cancel the restore.
#[derive(Debug)]
pub struct RestoreHandle {
    /// Snapshot taken at admission
    pub run: RestoreRun,
    join: JoinHandle<RestoreRun>,
}

impl RestoreHandle {
    pub fn run_id(&self) -> Uuid {
        self.run.id
    }

    /// Wait for the restore to reach a terminal state.
    pub async fn wait(self) -> Result<RestoreRun> {
        self.join
            .await
            .map_err(|e| AppError::Internal(format!("restore task failed: {}", e)))
    }
}

/// What startup recovery had to repair.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub maintenance_cleared: bool,
    pub backup_runs_failed: u64,
    pub restore_runs_failed: u64,
    pub cached_runs: usize,
}

/// Error raised by a step, with structured detail for the trace.
struct StepFailure {
    error: AppError,
    detail: Option<Value>,
}

impl StepFailure {
    fn with_detail(error: AppError, detail: Value) -> Self {
        Self {
            error,
            detail: Some(detail),
        }
    }
}

impl From<AppError> for StepFailure {
    fn from(error: AppError) -> Self {
        Self {
            error,
            detail: None,
        }
    }
}

type StepResult<T> = std::result::Result<T, StepFailure>;

/// Working state carried between steps.
#[derive(Default)]
struct RestoreProgress {
    artifact: Option<BackupArtifact>,
    file_path: Option<PathBuf>,
    scratch: Option<tempfile::TempDir>,
    archive_path: Option<PathBuf>,
    unpacked: Option<UnpackedContainer>,
    manifest: Option<ContainerManifest>,
    migration_required: bool,
    maintenance_entered: bool,
    jobs_paused: bool,
}

/// Decide whether a backup taken at `backup_version` can be restored onto a
/// system whose code knows `current_version`.
///
/// Returns whether forward migrations must run after the restore.
pub fn check_compatibility(backup_version: i64, current_version: i64) -> Result<bool> {
    match backup_version.cmp(&current_version) {
        Ordering::Less => Ok(true),
        Ordering::Equal => Ok(false),
        Ordering::Greater => Err(AppError::IncompatibleSchema(format!(
            "backup schema {} is newer than current schema {}",
            backup_version, current_version
        ))),
    }
}

/// Restore service
#[derive(Clone)]
pub struct RestoreService {
    ctx: Arc<EngineContext>,
    cache: Arc<RwLock<HashMap<Uuid, RestoreRun>>>,
}

impl RestoreService {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start a destructive restore of `artifact_id`.
    pub async fn start_restore(
        &self,
        artifact_id: Uuid,
        requested_by: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<RestoreHandle> {
        self.start(artifact_id, false, requested_by, cancel).await
    }

    /// Start a dry-run restore: verification and compatibility only.
    pub async fn start_restore_dry_run(
        &self,
        artifact_id: Uuid,
        requested_by: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<RestoreHandle> {
        self.start(artifact_id, true, requested_by, cancel).await
    }

    async fn start(
        &self,
        artifact_id: Uuid,
        dry_run: bool,
        requested_by: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<RestoreHandle> {
        let claim = self.ctx.coordinator.begin_pipeline(PipelineKind::Restore)?;
        let permit = self.ctx.acquire_slot(cancel).await?;

        if self.ctx.repository.maintenance_mode().await? {
            return Err(AppError::NotReady("maintenance mode is active".into()));
        }
        if self.ctx.repository.has_running_backup().await? {
            return Err(AppError::NotReady("a backup is still running".into()));
        }

        let run = RestoreRun::queued(artifact_id, dry_run, requested_by);
        self.ctx.repository.create_restore_run(&run).await?;
        self.cache.write().await.insert(run.id, run.clone());

        tracing::info!(run_id = %run.id, artifact_id = %artifact_id, dry_run, "Restore queued");
        self.ctx.audit(
            AuditEntry::new(AuditAction::RestoreStarted, ResourceType::RestoreRun)
                .actor(run.requested_by.as_deref())
                .resource(run.id)
                .details(json!({ "artifact_id": artifact_id, "dry_run": dry_run })),
        );

        let service = self.clone();
        let snapshot = run.clone();
        let join = tokio::spawn(async move {
            let run = service.execute(run).await;
            drop(permit);
            claim.release();
            run
        });

        Ok(RestoreHandle {
            run: snapshot,
            join,
        })
    }

    async fn execute(&self, mut run: RestoreRun) -> RestoreRun {
        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        self.persist(&run).await;

        let mut progress = RestoreProgress::default();
        match self.walk(&mut run, &mut progress).await {
            Ok(()) => {
                run.status = RunStatus::Success;
                run.finished_at = Some(Utc::now());
            }
            Err(failure) => {
                self.fail_running_step(&mut run, &failure).await;
                run.mark_failed(&failure.error);
            }
        }

        self.cleanup(&run, &mut progress).await;
        self.persist(&run).await;

        let last_step = run.last_step().map(|s| s.name.as_str()).unwrap_or("none");
        if run.status == RunStatus::Success {
            tracing::info!(run_id = %run.id, dry_run = run.dry_run, "Restore finished");
            self.ctx.audit(
                AuditEntry::new(AuditAction::RestoreCompleted, ResourceType::RestoreRun)
                    .actor(run.requested_by.as_deref())
                    .resource(run.id)
                    .details(json!({ "dry_run": run.dry_run, "last_step": last_step })),
            );
        } else {
            tracing::error!(
                run_id = %run.id,
                step = last_step,
                code = run.error_code.as_deref().unwrap_or(""),
                "Restore failed: {}",
                run.error_message.as_deref().unwrap_or("")
            );
            self.ctx.audit(
                AuditEntry::new(AuditAction::RestoreFailed, ResourceType::RestoreRun)
                    .actor(run.requested_by.as_deref())
                    .resource(run.id)
                    .failed()
                    .details(json!({
                        "dry_run": run.dry_run,
                        "step": last_step,
                        "code": run.error_code,
                        "message": run.error_message,
                    })),
            );
        }
        run
    }

    async fn walk(&self, run: &mut RestoreRun, progress: &mut RestoreProgress) -> StepResult<()> {
        self.load_artifact(run, progress).await?;
        self.open_file(run, progress).await?;
        self.decrypt(run, progress).await?;
        self.verify_checksums(run, progress).await?;
        self.read_manifest(run, progress).await?;
        self.compatibility_check(run, progress).await?;

        if run.dry_run {
            self.begin_step(run, StepName::Finish).await;
            self.end_step(run, StepStatus::Success, Some(json!({ "dry_run": true })))
                .await;
            return Ok(());
        }

        self.begin_step(run, StepName::EnterMaintenance).await;
        self.ctx
            .repository
            .set_maintenance_mode(true)
            .await
            .map_err(|e| AppError::Maintenance(e.to_string()))?;
        progress.maintenance_entered = true;
        self.ctx.audit(
            AuditEntry::new(AuditAction::MaintenanceEntered, ResourceType::System)
                .resource(run.id),
        );
        self.end_step(run, StepStatus::Success, None).await;

        let destructive = self.replace_database(run, progress).await;
        if let Err(failure) = &destructive {
            self.fail_running_step(run, failure).await;
        }

        self.begin_step(run, StepName::ExitMaintenance).await;
        match self.ctx.repository.set_maintenance_mode(false).await {
            Ok(()) => {
                progress.maintenance_entered = false;
                self.ctx.audit(
                    AuditEntry::new(AuditAction::MaintenanceExited, ResourceType::System)
                        .resource(run.id),
                );
                self.end_step(run, StepStatus::Success, None).await;
            }
            Err(e) => {
                let failure = StepFailure::from(AppError::Maintenance(e.to_string()));
                if destructive.is_ok() {
                    return Err(failure);
                }
                self.fail_running_step(run, &failure).await;
            }
        }
        destructive?;

        self.begin_step(run, StepName::Finish).await;
        self.end_step(run, StepStatus::Success, None).await;
        Ok(())
    }

    async fn load_artifact(&self, run: &mut RestoreRun, progress: &mut RestoreProgress) -> StepResult<()> {
        self.begin_step(run, StepName::LoadArtifact).await;
        let artifact = self
            .ctx
            .repository
            .get_artifact(run.artifact_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("backup artifact {}", run.artifact_id)))?;
        if !artifact.is_restorable() {
            return Err(StepFailure::with_detail(
                AppError::NotReady(format!("artifact has status {}", artifact.status)),
                json!({ "status": artifact.status }),
            ));
        }

        let detail = json!({
            "filename": artifact.filename,
            "size_bytes": artifact.size_bytes,
            "schema_version": artifact.metadata.schema_version,
            "source": artifact.source,
        });
        progress.artifact = Some(artifact);
        self.end_step(run, StepStatus::Success, Some(detail)).await;
        Ok(())
    }

    async fn open_file(&self, run: &mut RestoreRun, progress: &mut RestoreProgress) -> StepResult<()> {
        self.begin_step(run, StepName::OpenFile).await;
        let artifact = Self::required(&progress.artifact, "artifact")?;
        let path = self.ctx.storage.existing_file(&artifact.storage_path).await?;
        let size = tokio::fs::metadata(&path).await.map_err(AppError::from)?.len();

        let detail = json!({ "storage_path": artifact.storage_path, "size_bytes": size });
        progress.file_path = Some(path);
        self.end_step(run, StepStatus::Success, Some(detail)).await;
        Ok(())
    }

    async fn decrypt(&self, run: &mut RestoreRun, progress: &mut RestoreProgress) -> StepResult<()> {
        self.begin_step(run, StepName::Decrypt).await;
        let cipher = self.ctx.cipher()?;
        let file_path = Self::required(&progress.file_path, "container path")?.clone();
        let scratch = self.ctx.scratch_dir(".restore-")?;
        let archive_path = scratch.path().join("container.tar");
        progress.scratch = Some(scratch);

        let bytes = engine::decrypt_blocking(cipher, &file_path, &archive_path).await?;
        progress.archive_path = Some(archive_path);
        self.end_step(run, StepStatus::Success, Some(json!({ "archive_bytes": bytes })))
            .await;
        Ok(())
    }

    async fn verify_checksums(&self, run: &mut RestoreRun, progress: &mut RestoreProgress) -> StepResult<()> {
        self.begin_step(run, StepName::VerifyChecksums).await;
        let archive_path = Self::required(&progress.archive_path, "archive")?.clone();
        let catalog_table = Self::required(&progress.artifact, "artifact")?
            .metadata
            .checksums
            .clone();

        let unpack_dir = archive_path.with_file_name("unpacked");
        let (unpacked, table, source, mismatches) = engine::blocking("verify", move || {
            std::fs::create_dir_all(&unpack_dir)?;
            let unpacked = container::unpack_archive(&archive_path, &unpack_dir)?;
            let (table, source) = match catalog_table {
                Some(table) => (table, "catalog"),
                None => (
                    unpacked.embedded_checksums()?.ok_or_else(|| {
                        AppError::Checksum("no checksum table recorded for this artifact".into())
                    })?,
                    "embedded",
                ),
            };
            let mismatches = container::verify_checksums(&archive_path, &unpacked, &table)?;
            Ok((unpacked, table, source, mismatches))
        })
        .await?;

        if !mismatches.is_empty() {
            let members: Vec<&str> = mismatches.iter().map(|m| m.member.as_str()).collect();
            return Err(StepFailure::with_detail(
                AppError::Checksum(format!("mismatch in {}", members.join(", "))),
                json!({ "source": source, "mismatches": mismatches }),
            ));
        }

        progress.unpacked = Some(unpacked);
        self.end_step(
            run,
            StepStatus::Success,
            Some(json!({
                "algorithm": table.algorithm,
                "source": source,
                "archive_checked": table.archive.is_some(),
            })),
        )
        .await;
        Ok(())
    }

    async fn read_manifest(&self, run: &mut RestoreRun, progress: &mut RestoreProgress) -> StepResult<()> {
        self.begin_step(run, StepName::ReadManifest).await;
        let manifest_path = Self::required(&progress.unpacked, "unpacked container")?
            .manifest_path
            .clone();
        let manifest = ContainerManifest::from_file(&manifest_path)?;

        let detail = json!({
            "format_version": manifest.format_version,
            "app_version": manifest.app_version,
            "schema_version": manifest.schema_version,
            "created_at": manifest.created_at,
            "includes_files": manifest.includes_files,
            "notes": manifest.notes,
        });
        progress.manifest = Some(manifest);
        self.end_step(run, StepStatus::Success, Some(detail)).await;
        Ok(())
    }

    async fn compatibility_check(&self, run: &mut RestoreRun, progress: &mut RestoreProgress) -> StepResult<()> {
        self.begin_step(run, StepName::CompatibilityCheck).await;
        let backup_version = Self::required(&progress.manifest, "manifest")?.schema_version;
        let current_version = self.ctx.migrator.current_version().await?;

        let migration_required = check_compatibility(backup_version, current_version).map_err(|e| {
            StepFailure::with_detail(
                e,
                json!({ "backup_version": backup_version, "current_version": current_version }),
            )
        })?;
        progress.migration_required = migration_required;

        self.end_step(
            run,
            StepStatus::Success,
            Some(json!({
                "backup_version": backup_version,
                "current_version": current_version,
                "migration_required": migration_required,
            })),
        )
        .await;
        Ok(())
    }

    /// stop-jobs, restore-database and run-migrations.
    async fn replace_database(&self, run: &mut RestoreRun, progress: &mut RestoreProgress) -> StepResult<()> {
        self.begin_step(run, StepName::StopJobs).await;
        self.ctx.coordinator.pause_jobs();
        progress.jobs_paused = true;
        self.end_step(run, StepStatus::Success, Some(json!({ "paused": true })))
            .await;

        self.begin_step(run, StepName::RestoreDatabase).await;
        let dump_path = Self::required(&progress.unpacked, "unpacked container")?
            .dump_path
            .clone();
        let timeout = self.ctx.restore_timeout;
        match tokio::time::timeout(timeout, self.ctx.restorer.restore(&dump_path, true)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(StepFailure::with_detail(
                    AppError::DumpTool(format!("restore timed out after {}s", timeout.as_secs())),
                    json!({ "timeout_secs": timeout.as_secs() }),
                ))
            }
        }
        self.end_step(run, StepStatus::Success, Some(json!({ "clean": true })))
            .await;

        self.begin_step(run, StepName::RunMigrations).await;
        if progress.migration_required {
            self.ctx.migrator.migrate().await?;
            let version = self.ctx.migrator.applied_version().await?;
            self.end_step(run, StepStatus::Success, Some(json!({ "applied_version": version })))
                .await;
        } else {
            self.end_step(
                run,
                StepStatus::Skipped,
                Some(json!({ "reason": "schema already current" })),
            )
            .await;
        }
        Ok(())
    }

    /// Runs whatever the outcome: clear maintenance, resume jobs, fail
    /// orphaned run markers and re-register the source container.
    async fn cleanup(&self, run: &RestoreRun, progress: &mut RestoreProgress) {
        let still_on = match self.ctx.repository.maintenance_mode().await {
            Ok(on) => on,
            Err(e) => {
                tracing::warn!(run_id = %run.id, "Cannot read maintenance mode: {}", e);
                progress.maintenance_entered
            }
        };
        if still_on || progress.maintenance_entered {
            match self.ctx.repository.set_maintenance_mode(false).await {
                Ok(()) => {
                    tracing::info!(run_id = %run.id, "Maintenance mode cleared by restore cleanup");
                    self.ctx.audit(
                        AuditEntry::new(AuditAction::MaintenanceExited, ResourceType::System)
                            .resource(run.id)
                            .details(json!({ "cleanup": true })),
                    );
                }
                Err(e) => tracing::warn!(run_id = %run.id, "Failed to clear maintenance mode: {}", e),
            }
        }
        if progress.jobs_paused {
            self.ctx.coordinator.resume_jobs();
        }

        let message = format!("interrupted by restore {}", run.id);
        match self.ctx.repository.fail_unfinished_backup_runs(&message).await {
            Ok(0) => {}
            Ok(n) => tracing::warn!(run_id = %run.id, count = n, "Reset orphaned backup runs"),
            Err(e) => tracing::warn!(run_id = %run.id, "Failed to reset backup runs: {}", e),
        }
        match self
            .ctx
            .repository
            .fail_unfinished_restore_runs(Some(run.id), &message)
            .await
        {
            Ok(0) => {}
            Ok(n) => tracing::warn!(run_id = %run.id, count = n, "Reset orphaned restore runs"),
            Err(e) => tracing::warn!(run_id = %run.id, "Failed to reset restore runs: {}", e),
        }

        if let Some(artifact) = &progress.artifact {
            if let Err(e) = self.reregister(artifact).await {
                tracing::warn!(run_id = %run.id, "Failed to re-register restored artifact: {}", e);
            }
        }

        progress.scratch.take();
    }

    /// Track the container again if the catalog lost it.
    async fn reregister(&self, artifact: &BackupArtifact) -> Result<()> {
        if artifact.storage_path.is_empty()
            || !self.ctx.storage.exists(&artifact.storage_path).await?
        {
            return Ok(());
        }
        if self
            .ctx
            .repository
            .find_artifact_by_path(&artifact.storage_path)
            .await?
            .is_some()
        {
            return Ok(());
        }

        let fresh = BackupArtifact {
            id: Uuid::new_v4(),
            source: ArtifactSource::Imported,
            created_at: Utc::now(),
            ..artifact.clone()
        };
        self.ctx.repository.insert_artifact(&fresh).await?;
        tracing::info!(
            artifact_id = %fresh.id,
            storage_path = %fresh.storage_path,
            "Re-registered container after restore"
        );
        Ok(())
    }

    fn required<'a, T>(slot: &'a Option<T>, what: &str) -> Result<&'a T> {
        slot.as_ref()
            .ok_or_else(|| AppError::Internal(format!("restore is missing its {}", what)))
    }

    async fn begin_step(&self, run: &mut RestoreRun, name: StepName) {
        run.begin_step(name);
        tracing::info!(run_id = %run.id, step = name.as_str(), "Restore step started");
        self.persist(run).await;
    }

    async fn end_step(&self, run: &mut RestoreRun, status: StepStatus, detail: Option<Value>) {
        run.end_step(status, detail);
        if let Some(step) = run.last_step() {
            tracing::debug!(run_id = %run.id, step = step.name.as_str(), status = ?status, "Restore step ended");
            self.ctx.audit(
                AuditEntry::new(AuditAction::RestoreStep, ResourceType::RestoreRun)
                    .actor(run.requested_by.as_deref())
                    .resource(run.id)
                    .details(json!({ "step": step.name, "status": step.status })),
            );
        }
        self.persist(run).await;
    }

    /// Close the current step as failed if it is still open.
    async fn fail_running_step(&self, run: &mut RestoreRun, failure: &StepFailure) {
        let open = run
            .last_step()
            .is_some_and(|step| step.status == StepStatus::Running);
        if !open {
            return;
        }
        let mut detail = json!({
            "code": failure.error.code(),
            "message": failure.error.to_string(),
        });
        if let (Some(extra), Some(map)) = (&failure.detail, detail.as_object_mut()) {
            map.insert("detail".into(), extra.clone());
        }
        self.end_step(run, StepStatus::Failed, Some(detail)).await;
    }

    /// Write-through: cache first, then the repository.
    ///
    /// A failed save is tolerated; the database may be mid-replacement and
    /// the final save re-creates the row.
    async fn persist(&self, run: &RestoreRun) {
        self.cache.write().await.insert(run.id, run.clone());
        if let Err(e) = self.ctx.repository.save_restore_run(run).await {
            tracing::warn!(run_id = %run.id, "Failed to persist restore run: {}", e);
        }
    }

    /// Cached run, falling back to the repository.
    pub async fn get_restore_run(&self, id: Uuid) -> Result<RestoreRun> {
        if let Some(run) = self.cache.read().await.get(&id) {
            return Ok(run.clone());
        }
        let run = self
            .ctx
            .repository
            .get_restore_run(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("restore run {}", id)))?;
        self.cache.write().await.insert(id, run.clone());
        Ok(run)
    }

    /// Newest first, with in-flight runs taken from the cache.
    pub async fn list_restore_runs(&self, limit: usize) -> Result<Vec<RestoreRun>> {
        let mut runs = self.ctx.repository.list_restore_runs(limit).await?;
        let cache = self.cache.read().await;
        for run in runs.iter_mut() {
            if let Some(cached) = cache.get(&run.id) {
                *run = cached.clone();
            }
        }
        Ok(runs)
    }

    /// Repair state left behind by a crash and warm the run cache.
    pub async fn recover_on_startup(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        if self.ctx.repository.maintenance_mode().await? {
            self.ctx
                .repository
                .set_maintenance_mode(false)
                .await
                .map_err(|e| AppError::Maintenance(e.to_string()))?;
            report.maintenance_cleared = true;
            tracing::warn!("Maintenance mode was left on; cleared during startup recovery");
        }
        self.ctx.coordinator.resume_jobs();

        let message = "interrupted by process restart";
        report.backup_runs_failed = self.ctx.repository.fail_unfinished_backup_runs(message).await?;
        report.restore_runs_failed = self
            .ctx
            .repository
            .fail_unfinished_restore_runs(None, message)
            .await?;

        let runs = self.ctx.repository.list_restore_runs(CACHE_WARM_LIMIT).await?;
        report.cached_runs = runs.len();
        let mut cache = self.cache.write().await;
        for run in runs {
            cache.insert(run.id, run);
        }
        drop(cache);

        tracing::info!(
            maintenance_cleared = report.maintenance_cleared,
            backup_runs_failed = report.backup_runs_failed,
            restore_runs_failed = report.restore_runs_failed,
            "Startup recovery complete"
        );
        Ok(report)
    }

    /// Newest dry run, used to pace restore self-tests.
    pub async fn latest_dry_run(&self) -> Result<Option<RestoreRun>> {
        self.ctx.repository.latest_restore_run(true).await
    }
}
