//! In-process repository with the same uniqueness rules as the database.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppError, ErrorCode, Result};
use crate::models::backup::{ArtifactFilter, BackupArtifact, BackupRun, RunStatus};
use crate::models::plan::BackupPlan;
use crate::models::restore::RestoreRun;
use crate::services::backup_repository::BackupRepository;

#[derive(Default)]
struct MemoryState {
    artifacts: HashMap<Uuid, BackupArtifact>,
    backup_runs: HashMap<Uuid, BackupRun>,
    restore_runs: HashMap<Uuid, RestoreRun>,
    maintenance: bool,
    plan: BackupPlan,
}

/// Repository backed by process memory.
#[derive(Default)]
pub struct MemoryBackupRepository {
    state: RwLock<MemoryState>,
}

impl MemoryBackupRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every run and artifact, as replacing the database would.
    pub async fn wipe(&self) {
        let mut state = self.state.write().await;
        state.artifacts.clear();
        state.backup_runs.clear();
        state.restore_runs.clear();
    }
}

#[async_trait]
impl BackupRepository for MemoryBackupRepository {
    async fn insert_artifact(&self, artifact: &BackupArtifact) -> Result<()> {
        let mut state = self.state.write().await;
        if state.artifacts.contains_key(&artifact.id) {
            return Err(AppError::Database(format!(
                "artifact {} already exists",
                artifact.id
            )));
        }
        state.artifacts.insert(artifact.id, artifact.clone());
        Ok(())
    }

    async fn get_artifact(&self, id: Uuid) -> Result<Option<BackupArtifact>> {
        Ok(self.state.read().await.artifacts.get(&id).cloned())
    }

    async fn find_artifact_by_path(&self, storage_path: &str) -> Result<Option<BackupArtifact>> {
        let state = self.state.read().await;
        Ok(state
            .artifacts
            .values()
            .filter(|a| a.storage_path == storage_path)
            .max_by_key(|a| a.created_at)
            .cloned())
    }

    async fn list_artifacts(&self, filter: &ArtifactFilter) -> Result<Vec<BackupArtifact>> {
        let state = self.state.read().await;
        let mut artifacts: Vec<BackupArtifact> = state
            .artifacts
            .values()
            .filter(|a| filter.status.map_or(true, |s| a.status == s))
            .filter(|a| filter.source.map_or(true, |s| a.source == s))
            .cloned()
            .collect();
        artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            artifacts.truncate(limit);
        }
        Ok(artifacts)
    }

    async fn delete_artifact(&self, id: Uuid) -> Result<bool> {
        Ok(self.state.write().await.artifacts.remove(&id).is_some())
    }

    async fn create_backup_run(&self, run: &BackupRun) -> Result<()> {
        let mut state = self.state.write().await;
        if state.backup_runs.values().any(|r| !r.status.is_terminal()) {
            return Err(AppError::NotReady(
                "another backup is already queued or running".into(),
            ));
        }
        state.backup_runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn update_backup_run(&self, run: &BackupRun) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.backup_runs.get_mut(&run.id) {
            *existing = run.clone();
        }
        Ok(())
    }

    async fn get_backup_run(&self, id: Uuid) -> Result<Option<BackupRun>> {
        Ok(self.state.read().await.backup_runs.get(&id).cloned())
    }

    async fn has_running_backup(&self) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state.backup_runs.values().any(|r| !r.status.is_terminal()))
    }

    async fn fail_unfinished_backup_runs(&self, message: &str) -> Result<u64> {
        let mut state = self.state.write().await;
        let mut changed = 0;
        for run in state.backup_runs.values_mut() {
            if !run.status.is_terminal() {
                run.status = RunStatus::Failed;
                run.error_code = Some(ErrorCode::Internal.as_str().to_string());
                run.error_message = Some(message.to_string());
                run.finished_at = Some(Utc::now());
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn create_restore_run(&self, run: &RestoreRun) -> Result<()> {
        let mut state = self.state.write().await;
        if state.restore_runs.values().any(|r| !r.status.is_terminal()) {
            return Err(AppError::NotReady(
                "another restore is already queued or running".into(),
            ));
        }
        state.restore_runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn save_restore_run(&self, run: &RestoreRun) -> Result<()> {
        self.state
            .write()
            .await
            .restore_runs
            .insert(run.id, run.clone());
        Ok(())
    }

    async fn get_restore_run(&self, id: Uuid) -> Result<Option<RestoreRun>> {
        Ok(self.state.read().await.restore_runs.get(&id).cloned())
    }

    async fn list_restore_runs(&self, limit: usize) -> Result<Vec<RestoreRun>> {
        let state = self.state.read().await;
        let mut runs: Vec<RestoreRun> = state.restore_runs.values().cloned().collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn latest_restore_run(&self, dry_run: bool) -> Result<Option<RestoreRun>> {
        let state = self.state.read().await;
        Ok(state
            .restore_runs
            .values()
            .filter(|r| r.dry_run == dry_run)
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn has_running_restore(&self) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state.restore_runs.values().any(|r| !r.status.is_terminal()))
    }

    async fn fail_unfinished_restore_runs(
        &self,
        except: Option<Uuid>,
        message: &str,
    ) -> Result<u64> {
        let mut state = self.state.write().await;
        let mut changed = 0;
        for run in state.restore_runs.values_mut() {
            if !run.status.is_terminal() && Some(run.id) != except {
                run.status = RunStatus::Failed;
                run.error_code = Some(ErrorCode::Internal.as_str().to_string());
                run.error_message = Some(message.to_string());
                run.finished_at = Some(Utc::now());
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn maintenance_mode(&self) -> Result<bool> {
        Ok(self.state.read().await.maintenance)
    }

    async fn set_maintenance_mode(&self, enabled: bool) -> Result<()> {
        self.state.write().await.maintenance = enabled;
        Ok(())
    }

    async fn backup_plan(&self) -> Result<BackupPlan> {
        Ok(self.state.read().await.plan.clone())
    }

    async fn save_backup_plan(&self, plan: &BackupPlan) -> Result<()> {
        self.state.write().await.plan = plan.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_active_backup_run() {
        let repo = MemoryBackupRepository::new();
        let mut first = BackupRun::queued(None);
        repo.create_backup_run(&first).await.unwrap();

        let err = repo
            .create_backup_run(&BackupRun::queued(None))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotReady);
        assert!(repo.has_running_backup().await.unwrap());

        first.status = RunStatus::Success;
        repo.update_backup_run(&first).await.unwrap();
        assert!(!repo.has_running_backup().await.unwrap());
        assert!(repo.create_backup_run(&BackupRun::queued(None)).await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_unfinished_restore_runs_spares_current() {
        let repo = MemoryBackupRepository::new();
        let orphan = RestoreRun::queued(Uuid::new_v4(), false, None);
        repo.save_restore_run(&orphan).await.unwrap();
        let current = RestoreRun::queued(Uuid::new_v4(), false, None);
        repo.save_restore_run(&current).await.unwrap();

        let changed = repo
            .fail_unfinished_restore_runs(Some(current.id), "interrupted")
            .await
            .unwrap();
        assert_eq!(changed, 1);

        let orphan = repo.get_restore_run(orphan.id).await.unwrap().unwrap();
        assert_eq!(orphan.status, RunStatus::Failed);
        assert_eq!(orphan.error_code.as_deref(), Some("INTERNAL_ERROR"));
        let current = repo.get_restore_run(current.id).await.unwrap().unwrap();
        assert_eq!(current.status, RunStatus::Queued);
    }

    #[tokio::test]
    async fn test_maintenance_flag_defaults_off() {
        let repo = MemoryBackupRepository::new();
        assert!(!repo.maintenance_mode().await.unwrap());
        repo.set_maintenance_mode(true).await.unwrap();
        assert!(repo.maintenance_mode().await.unwrap());
    }
}
