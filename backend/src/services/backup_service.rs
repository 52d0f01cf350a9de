//! Backup creation, deletion, download and import.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::backup::{
    ArtifactFilter, ArtifactMetadata, ArtifactSource, BackupArtifact, BackupRun, RunStatus,
};
use crate::models::plan::BackupPlan;
use crate::services::audit_service::{AuditAction, AuditEntry, ResourceType};
use crate::services::container::{
    self, container_filename, file_sha256, normalize_scope, ContainerManifest,
    CONTAINER_FORMAT_VERSION, DUMP_ENTRY,
};
use crate::services::engine::{self, EngineContext};
use crate::services::pipeline::{DownloadGuard, PipelineClaim, PipelineKind};

/// Request to create a backup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupRequest {
    pub label: Option<String>,
    /// Data domains recorded in metadata; the full database is always dumped
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub include_files: bool,
    pub requested_by: Option<String>,
}

/// An open artifact file. The download counter is held until this is dropped.
#[derive(Debug)]
pub struct ArtifactDownload {
    pub artifact: BackupArtifact,
    pub path: PathBuf,
    pub file: tokio::fs::File,
    _guard: DownloadGuard,
}

/// A backup that passed every admission check and owns its claim and slot.
struct PreparedBackup {
    run: BackupRun,
    request: BackupRequest,
    scope: Vec<String>,
    _claim: PipelineClaim,
    _permit: OwnedSemaphorePermit,
}

/// Backup service
#[derive(Clone)]
pub struct BackupService {
    ctx: Arc<EngineContext>,
}

impl BackupService {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Run the whole backup flow and return the finished run.
    ///
    /// A flow failure is recorded on the run and returned as the error.
    /// Once admitted, the flow runs on its own task: dropping the returned
    /// future stops the wait, not the dump.
    pub async fn create_backup(
        &self,
        request: BackupRequest,
        cancel: &CancellationToken,
    ) -> Result<BackupRun> {
        let prepared = self.prepare(request, cancel).await?;
        let service = self.clone();
        tokio::spawn(async move { service.execute(prepared).await })
            .await
            .map_err(|e| AppError::Internal(format!("backup task failed: {}", e)))?
    }

    /// Admit a backup and finish it on a background task.
    ///
    /// Returns the queued run; poll [`get_backup_run`](Self::get_backup_run)
    /// for the outcome.
    pub async fn start_backup(
        &self,
        request: BackupRequest,
        cancel: &CancellationToken,
    ) -> Result<BackupRun> {
        let prepared = self.prepare(request, cancel).await?;
        let run = prepared.run.clone();
        let service = self.clone();
        tokio::spawn(async move {
            if let Err(e) = service.execute(prepared).await {
                tracing::warn!(code = %e.code(), "Background backup failed: {}", e);
            }
        });
        Ok(run)
    }

    async fn prepare(
        &self,
        request: BackupRequest,
        cancel: &CancellationToken,
    ) -> Result<PreparedBackup> {
        let claim = self.ctx.coordinator.begin_pipeline(PipelineKind::Backup)?;
        let permit = self.ctx.acquire_slot(cancel).await?;

        if self.ctx.repository.maintenance_mode().await? {
            return Err(AppError::NotReady("maintenance mode is active".into()));
        }
        if self.ctx.repository.has_running_restore().await? {
            return Err(AppError::NotReady("a restore is still running".into()));
        }

        self.ctx.storage.ensure_root().await?;

        let run = BackupRun::queued(request.requested_by.clone());
        self.ctx.repository.create_backup_run(&run).await?;
        tracing::info!(run_id = %run.id, "Backup run queued");

        Ok(PreparedBackup {
            run,
            scope: normalize_scope(&request.scope),
            request,
            _claim: claim,
            _permit: permit,
        })
    }

    async fn execute(&self, prepared: PreparedBackup) -> Result<BackupRun> {
        let mut run = prepared.run.clone();
        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        let filename = self
            .free_filename(&prepared.scope, prepared.request.label.as_deref(), Utc::now())
            .await;

        let outcome = async {
            self.ctx.repository.update_backup_run(&run).await?;
            self.ctx.audit(
                AuditEntry::new(AuditAction::BackupStarted, ResourceType::BackupRun)
                    .actor(prepared.request.requested_by.as_deref())
                    .resource(run.id)
                    .details(serde_json::json!({
                        "scope": prepared.scope,
                        "label": prepared.request.label,
                    })),
            );

            let artifact = self.produce_artifact(&prepared, &filename).await?;
            if let Err(e) = self.ctx.repository.insert_artifact(&artifact).await {
                if let Err(del) = self.ctx.storage.delete(&artifact.storage_path).await {
                    tracing::warn!("Failed to remove unrecorded container: {}", del);
                }
                return Err(e);
            }
            Ok::<_, AppError>(artifact)
        }
        .await;

        match outcome {
            Ok(artifact) => {
                run.artifact_id = Some(artifact.id);
                run.status = RunStatus::Success;
                run.finished_at = Some(Utc::now());
                if let Err(e) = self.ctx.repository.update_backup_run(&run).await {
                    tracing::error!(
                        run_id = %run.id,
                        artifact_id = %artifact.id,
                        "Backup stored but the run could not be completed: {}",
                        e
                    );
                    self.fail_run(&mut run, &prepared, &e).await;
                    return Err(e);
                }

                tracing::info!(
                    run_id = %run.id,
                    artifact_id = %artifact.id,
                    filename = %artifact.filename,
                    size_bytes = artifact.size_bytes,
                    "Backup completed"
                );
                self.ctx.audit(
                    AuditEntry::new(AuditAction::BackupCompleted, ResourceType::Artifact)
                        .actor(prepared.request.requested_by.as_deref())
                        .resource(artifact.id)
                        .details(serde_json::json!({
                            "run_id": run.id,
                            "filename": artifact.filename,
                            "size_bytes": artifact.size_bytes,
                        })),
                );
                Ok(run)
            }
            Err(e) => {
                tracing::error!(run_id = %run.id, code = %e.code(), "Backup failed: {}", e);
                let failed = self.failed_artifact(&prepared, &filename);
                match self.ctx.repository.insert_artifact(&failed).await {
                    Ok(()) => run.artifact_id = Some(failed.id),
                    Err(err) => tracing::warn!("Failed to record failed artifact: {}", err),
                }
                self.fail_run(&mut run, &prepared, &e).await;
                Err(e)
            }
        }
    }

    /// Mark `run` failed with the code of `error`. Persisting is best-effort.
    async fn fail_run(&self, run: &mut BackupRun, prepared: &PreparedBackup, error: &AppError) {
        run.status = RunStatus::Failed;
        run.error_code = Some(error.code().as_str().to_string());
        run.error_message = Some(error.to_string());
        run.finished_at = Some(Utc::now());
        if let Err(err) = self.ctx.repository.update_backup_run(run).await {
            tracing::warn!(run_id = %run.id, "Failed to mark backup run failed: {}", err);
        }
        self.ctx.audit(
            AuditEntry::new(AuditAction::BackupFailed, ResourceType::BackupRun)
                .actor(prepared.request.requested_by.as_deref())
                .resource(run.id)
                .failed()
                .details(serde_json::json!({
                    "code": error.code(),
                    "message": error.to_string(),
                })),
        );
    }

    /// Dump, pack and encrypt into the storage root.
    async fn produce_artifact(
        &self,
        prepared: &PreparedBackup,
        filename: &str,
    ) -> Result<BackupArtifact> {
        let cipher = self.ctx.cipher()?;
        let schema_version = self.ctx.migrator.applied_version().await?;

        let scratch = self.ctx.scratch_dir(".backup-")?;
        let dump_path = scratch.path().join(DUMP_ENTRY);
        match tokio::time::timeout(self.ctx.dump_timeout, self.ctx.dumper.dump(&dump_path)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(AppError::DumpTool(format!(
                    "dump timed out after {}s",
                    self.ctx.dump_timeout.as_secs()
                )))
            }
        }

        let label = prepared
            .request
            .label
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string);
        let manifest = ContainerManifest::new(
            schema_version,
            prepared.request.include_files,
            prepared.scope.clone(),
            label.clone(),
        );

        let archive_path = scratch.path().join("container.tar");
        let checksums = {
            let (manifest, dump_path, archive_path) =
                (manifest.clone(), dump_path.clone(), archive_path.clone());
            engine::blocking("pack", move || {
                container::pack_archive(&manifest, &dump_path, &archive_path)
                    .map_err(|e| AppError::Encryption(format!("packing failed: {}", e)))
            })
            .await?
        };

        let final_path = self.ctx.storage.resolve(filename)?;
        let partial_path = scratch.path().join(format!("{}.partial", filename));
        engine::encrypt_blocking(cipher, &archive_path, &partial_path).await?;
        tokio::fs::rename(&partial_path, &final_path)
            .await
            .map_err(|e| AppError::StorageUnavailable(format!("cannot store {}: {}", filename, e)))?;

        let (checksum, size_bytes) = Self::fingerprint(final_path.clone()).await?;

        let entity_counts = match self.ctx.counter.count(&prepared.scope).await {
            Ok(counts) => counts,
            Err(e) => {
                tracing::warn!("Entity counts unavailable: {}", e);
                Default::default()
            }
        };

        Ok(BackupArtifact {
            id: Uuid::new_v4(),
            source: ArtifactSource::Local,
            status: RunStatus::Success,
            size_bytes,
            checksum,
            filename: filename.to_string(),
            storage_path: filename.to_string(),
            metadata: ArtifactMetadata {
                format_version: CONTAINER_FORMAT_VERSION,
                app_version: manifest.app_version,
                schema_version,
                includes_files: prepared.request.include_files,
                scope: prepared.scope.clone(),
                label,
                entity_counts,
                checksums: Some(checksums),
            },
            created_by: prepared.request.requested_by.clone(),
            created_at: Utc::now(),
        })
    }

    fn failed_artifact(&self, prepared: &PreparedBackup, filename: &str) -> BackupArtifact {
        BackupArtifact {
            id: Uuid::new_v4(),
            source: ArtifactSource::Local,
            status: RunStatus::Failed,
            size_bytes: 0,
            checksum: String::new(),
            filename: filename.to_string(),
            storage_path: String::new(),
            metadata: ArtifactMetadata {
                format_version: CONTAINER_FORMAT_VERSION,
                app_version: env!("CARGO_PKG_VERSION").to_string(),
                includes_files: prepared.request.include_files,
                scope: prepared.scope.clone(),
                label: prepared.request.label.clone(),
                ..Default::default()
            },
            created_by: prepared.request.requested_by.clone(),
            created_at: Utc::now(),
        }
    }

    /// First container name at or after `at` that is not taken yet.
    async fn free_filename(&self, scope: &[String], label: Option<&str>, at: DateTime<Utc>) -> String {
        let mut candidate = container_filename(scope, label, at);
        for offset in 1..=60 {
            if !self.ctx.storage.exists(&candidate).await.unwrap_or(false) {
                break;
            }
            candidate = container_filename(scope, label, at + ChronoDuration::seconds(offset));
        }
        candidate
    }

    async fn fingerprint(path: PathBuf) -> Result<(String, i64)> {
        engine::blocking("checksum", move || {
            let checksum = file_sha256(&path)?;
            let size = std::fs::metadata(&path)?.len() as i64;
            Ok((checksum, size))
        })
        .await
    }

    /// Delete an artifact and its container file.
    ///
    /// Refused while any pipeline is claimed, while a backup or restore run
    /// is still open, or while the artifact is being downloaded.
    pub async fn delete_backup(&self, id: Uuid, requested_by: Option<&str>) -> Result<()> {
        let _claim = self.ctx.coordinator.begin_pipeline(PipelineKind::Delete)?;

        if self.ctx.repository.has_running_backup().await? {
            return Err(AppError::ConcurrentOperation("a backup is running".into()));
        }
        if self.ctx.repository.has_running_restore().await? {
            return Err(AppError::ConcurrentOperation("a restore is running".into()));
        }

        let artifact = self
            .ctx
            .repository
            .get_artifact(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("backup artifact {}", id)))?;

        let downloads = self.ctx.coordinator.active_downloads(id);
        if downloads > 0 {
            return Err(AppError::FileBusy(format!(
                "{} is being downloaded ({} active)",
                artifact.filename, downloads
            )));
        }

        if !artifact.storage_path.is_empty() {
            self.ctx.storage.delete(&artifact.storage_path).await?;
        }
        self.ctx.repository.delete_artifact(id).await?;

        tracing::info!(artifact_id = %id, filename = %artifact.filename, "Backup deleted");
        self.ctx.audit(
            AuditEntry::new(AuditAction::BackupDeleted, ResourceType::Artifact)
                .actor(requested_by)
                .resource(id)
                .details(serde_json::json!({ "filename": artifact.filename })),
        );
        Ok(())
    }

    /// Open a successful artifact for streaming.
    pub async fn open_download(&self, id: Uuid, requested_by: Option<&str>) -> Result<ArtifactDownload> {
        let guard = self.ctx.coordinator.begin_download(id)?;

        let artifact = self
            .ctx
            .repository
            .get_artifact(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("backup artifact {}", id)))?;
        if !artifact.is_restorable() {
            return Err(AppError::NotReady(format!(
                "artifact {} has status {}",
                id, artifact.status
            )));
        }

        let path = self.ctx.storage.existing_file(&artifact.storage_path).await?;
        let file = tokio::fs::File::open(&path).await?;

        self.ctx.audit(
            AuditEntry::new(AuditAction::BackupDownloaded, ResourceType::Artifact)
                .actor(requested_by)
                .resource(id),
        );
        Ok(ArtifactDownload {
            artifact,
            path,
            file,
            _guard: guard,
        })
    }

    /// Register an existing container under the storage root.
    ///
    /// The container is decrypted and checked against its embedded checksum
    /// table. Importing a path that is already tracked returns the existing
    /// record.
    pub async fn import_artifact(&self, path: &Path, requested_by: Option<&str>) -> Result<BackupArtifact> {
        let key = self.ctx.storage.key_for(path)?;
        let file_path = self.ctx.storage.existing_file(&key).await?;
        if let Some(existing) = self.ctx.repository.find_artifact_by_path(&key).await? {
            return Ok(existing);
        }

        let cipher = self.ctx.cipher()?;
        let scratch = self.ctx.scratch_dir(".import-")?;
        let archive_path = scratch.path().join("container.tar");
        engine::decrypt_blocking(cipher, &file_path, &archive_path).await?;

        let unpack_dir = scratch.path().join("unpacked");
        let (manifest, checksums) = {
            let (archive_path, unpack_dir) = (archive_path.clone(), unpack_dir.clone());
            engine::blocking("verify", move || {
                std::fs::create_dir_all(&unpack_dir)?;
                let unpacked = container::unpack_archive(&archive_path, &unpack_dir)?;
                let table = unpacked.embedded_checksums()?.ok_or_else(|| {
                    AppError::Checksum("container carries no checksum table".into())
                })?;
                let mismatches = container::verify_checksums(&archive_path, &unpacked, &table)?;
                if let Some(first) = mismatches.first() {
                    return Err(AppError::Checksum(format!("{} does not match", first.member)));
                }
                Ok((ContainerManifest::from_file(&unpacked.manifest_path)?, table))
            })
            .await?
        };

        let (checksum, size_bytes) = Self::fingerprint(file_path.clone()).await?;
        let filename = file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| key.clone());

        let artifact = BackupArtifact {
            id: Uuid::new_v4(),
            source: ArtifactSource::Imported,
            status: RunStatus::Success,
            size_bytes,
            checksum,
            filename,
            storage_path: key,
            metadata: ArtifactMetadata {
                format_version: manifest.format_version,
                app_version: manifest.app_version,
                schema_version: manifest.schema_version,
                includes_files: manifest.includes_files,
                scope: manifest.scope,
                label: manifest.label,
                entity_counts: Default::default(),
                checksums: Some(checksums),
            },
            created_by: requested_by.map(str::to_string),
            created_at: Utc::now(),
        };
        self.ctx.repository.insert_artifact(&artifact).await?;

        tracing::info!(artifact_id = %artifact.id, path = %artifact.storage_path, "Backup imported");
        self.ctx.audit(
            AuditEntry::new(AuditAction::BackupImported, ResourceType::Artifact)
                .actor(requested_by)
                .resource(artifact.id)
                .details(serde_json::json!({ "storage_path": artifact.storage_path })),
        );
        Ok(artifact)
    }

    /// Container files under the storage root with no catalog record, with
    /// their sizes. Candidates for [`import_artifact`](Self::import_artifact).
    pub async fn untracked_containers(&self) -> Result<Vec<(String, u64)>> {
        let mut untracked = Vec::new();
        for key in self.ctx.storage.list_containers().await? {
            if self.ctx.repository.find_artifact_by_path(&key).await?.is_none() {
                let size = self.ctx.storage.size(&key).await?;
                untracked.push((key, size));
            }
        }
        Ok(untracked)
    }

    pub async fn get_artifact(&self, id: Uuid) -> Result<BackupArtifact> {
        self.ctx
            .repository
            .get_artifact(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("backup artifact {}", id)))
    }

    pub async fn list_artifacts(&self, filter: &ArtifactFilter) -> Result<Vec<BackupArtifact>> {
        self.ctx.repository.list_artifacts(filter).await
    }

    pub async fn latest_successful(&self) -> Result<Option<BackupArtifact>> {
        let mut latest = self
            .ctx
            .repository
            .list_artifacts(&ArtifactFilter {
                status: Some(RunStatus::Success),
                source: None,
                limit: Some(1),
            })
            .await?;
        Ok(latest.pop())
    }

    pub async fn get_backup_run(&self, id: Uuid) -> Result<BackupRun> {
        self.ctx
            .repository
            .get_backup_run(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("backup run {}", id)))
    }

    /// Delete locally produced artifacts beyond the plan's retention bounds.
    ///
    /// Individual delete failures are logged and skipped. Returns the ids
    /// that were removed.
    pub async fn apply_retention(&self, plan: &BackupPlan, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        if plan.keep_last.is_none() && plan.max_age_days.is_none() {
            return Ok(Vec::new());
        }

        let artifacts = self
            .ctx
            .repository
            .list_artifacts(&ArtifactFilter {
                status: Some(RunStatus::Success),
                source: Some(ArtifactSource::Local),
                limit: None,
            })
            .await?;

        let mut removed = Vec::new();
        for id in retention_candidates(&artifacts, plan, now) {
            match self.delete_backup(id, Some("retention")).await {
                Ok(()) => removed.push(id),
                Err(e) => tracing::warn!(artifact_id = %id, "Retention delete skipped: {}", e),
            }
        }
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "Retention removed old backups");
        }
        Ok(removed)
    }
}

/// Artifacts (newest first) that fall outside `keep_last` or `max_age_days`.
/// The newest artifact is always kept.
fn retention_candidates(
    artifacts: &[BackupArtifact],
    plan: &BackupPlan,
    now: DateTime<Utc>,
) -> Vec<Uuid> {
    let keep_last = plan.keep_last.map(|k| k.max(1) as usize);
    let cutoff = plan
        .max_age_days
        .map(|days| now - ChronoDuration::days(i64::from(days)));

    artifacts
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(i, artifact)| {
            keep_last.is_some_and(|k| *i >= k) || cutoff.is_some_and(|c| artifact.created_at < c)
        })
        .map(|(_, artifact)| artifact.id)
        .collect()
}
