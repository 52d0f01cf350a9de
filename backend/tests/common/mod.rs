//! Common test utilities for engine integration tests
//!
//! This module provides shared infrastructure for testing:
//! - Scriptable dump, restore, migration and count collaborators
//! - A fully wired engine over an in-memory repository and a temp storage root

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::Notify;

use backup_orchestrator::config::Config;
use backup_orchestrator::error::{AppError, Result};
use backup_orchestrator::models::backup::{ArtifactFilter, BackupArtifact, BackupRun, RunStatus};
use backup_orchestrator::models::plan::BackupPlan;
use backup_orchestrator::models::restore::RestoreRun;
use backup_orchestrator::services::audit_service::MemoryAuditSink;
use backup_orchestrator::services::backup_repository::BackupRepository;
use backup_orchestrator::services::backup_service::{BackupRequest, BackupService};
use backup_orchestrator::services::database_tools::{
    DumpRunner, EntityCounter, RestoreRunner, SchemaMigrator,
};
use backup_orchestrator::services::engine::{Collaborators, EngineContext};
use backup_orchestrator::services::memory_repository::MemoryBackupRepository;
use backup_orchestrator::services::restore_service::RestoreService;

pub const TEST_KEY: &str = "integration-test-secret-0123456789";

/// Writes a fixed payload as the dump. Can be told to fail or to block
/// until released.
#[derive(Default)]
pub struct FakeDumper {
    pub payload: Mutex<Vec<u8>>,
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
    gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

impl FakeDumper {
    pub fn new(payload: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            payload: Mutex::new(payload.to_vec()),
            ..Default::default()
        })
    }

    /// Block the next dumps until the returned `release` is notified.
    /// `started` is notified when a dump begins.
    pub fn hold(&self) -> (Arc<Notify>, Arc<Notify>) {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some((started.clone(), release.clone()));
        (started, release)
    }

    /// Let later dumps run straight through again.
    pub fn unhold(&self) {
        *self.gate.lock().unwrap() = None;
    }
}

#[async_trait]
impl DumpRunner for FakeDumper {
    async fn dump(&self, output_path: &Path) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some((started, release)) = gate {
            started.notify_one();
            release.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::DumpTool("pg_dump exited with 1: boom".into()));
        }
        let payload = self.payload.lock().unwrap().clone();
        tokio::fs::write(output_path, payload).await?;
        Ok(())
    }
}

/// One call to the fake restorer.
#[derive(Debug, Clone)]
pub struct RestoreCall {
    pub dump: Vec<u8>,
    pub clean: bool,
    pub maintenance_on: bool,
}

/// Records restore calls. Optionally replaces the repository contents the
/// way loading a dump replaces the live database.
pub struct FakeRestorer {
    repository: Arc<MemoryBackupRepository>,
    pub calls: Mutex<Vec<RestoreCall>>,
    pub fail: AtomicBool,
    pub wipe_repository: AtomicBool,
    /// Left `running` in the replaced database, as a dump taken mid-backup would be
    pub plant_running_backup: AtomicBool,
    gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

impl FakeRestorer {
    pub fn new(repository: Arc<MemoryBackupRepository>) -> Arc<Self> {
        Arc::new(Self {
            repository,
            calls: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            wipe_repository: AtomicBool::new(false),
            plant_running_backup: AtomicBool::new(false),
            gate: Mutex::new(None),
        })
    }

    pub fn calls(&self) -> Vec<RestoreCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Block restores until `release` is notified; `started` fires when one begins.
    pub fn hold(&self) -> (Arc<Notify>, Arc<Notify>) {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some((started.clone(), release.clone()));
        (started, release)
    }
}

#[async_trait]
impl RestoreRunner for FakeRestorer {
    async fn restore(&self, dump_path: &Path, clean: bool) -> Result<()> {
        let gate = self.gate.lock().unwrap().clone();
        if let Some((started, release)) = gate {
            started.notify_one();
            release.notified().await;
        }
        let dump = tokio::fs::read(dump_path).await?;
        let maintenance_on = self.repository.maintenance_mode().await?;
        self.calls.lock().unwrap().push(RestoreCall {
            dump,
            clean,
            maintenance_on,
        });

        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::DumpTool("pg_restore exited with 1: boom".into()));
        }
        if self.wipe_repository.load(Ordering::SeqCst) {
            self.repository.wipe().await;
        }
        if self.plant_running_backup.load(Ordering::SeqCst) {
            let mut run = BackupRun::queued(Some("before-restore".into()));
            run.status = RunStatus::Running;
            self.repository.create_backup_run(&run).await?;
        }
        Ok(())
    }
}

/// Schema versions under test control.
pub struct FakeMigrator {
    pub current: AtomicI64,
    pub applied: AtomicI64,
    pub migrations: AtomicUsize,
}

impl FakeMigrator {
    pub fn new(current: i64) -> Arc<Self> {
        Arc::new(Self {
            current: AtomicI64::new(current),
            applied: AtomicI64::new(current),
            migrations: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl SchemaMigrator for FakeMigrator {
    async fn current_version(&self) -> Result<i64> {
        Ok(self.current.load(Ordering::SeqCst))
    }

    async fn applied_version(&self) -> Result<i64> {
        Ok(self.applied.load(Ordering::SeqCst))
    }

    async fn migrate(&self) -> Result<()> {
        self.migrations.fetch_add(1, Ordering::SeqCst);
        self.applied
            .store(self.current.load(Ordering::SeqCst), Ordering::SeqCst);
        Ok(())
    }
}

/// Reports a fixed count for every requested domain.
pub struct FakeCounter;

#[async_trait]
impl EntityCounter for FakeCounter {
    async fn count(&self, scope: &[String]) -> Result<BTreeMap<String, i64>> {
        Ok(scope.iter().map(|domain| (domain.clone(), 7)).collect())
    }
}

/// Delegates to the memory repository, except that marking a backup run
/// successful fails while `fail_success_update` is set.
pub struct FlakyRepository {
    inner: Arc<MemoryBackupRepository>,
    pub fail_success_update: AtomicBool,
}

impl FlakyRepository {
    pub fn new(inner: Arc<MemoryBackupRepository>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_success_update: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl BackupRepository for FlakyRepository {
    async fn insert_artifact(&self, artifact: &BackupArtifact) -> Result<()> {
        self.inner.insert_artifact(artifact).await
    }
    async fn get_artifact(&self, id: uuid::Uuid) -> Result<Option<BackupArtifact>> {
        self.inner.get_artifact(id).await
    }
    async fn find_artifact_by_path(&self, storage_path: &str) -> Result<Option<BackupArtifact>> {
        self.inner.find_artifact_by_path(storage_path).await
    }
    async fn list_artifacts(&self, filter: &ArtifactFilter) -> Result<Vec<BackupArtifact>> {
        self.inner.list_artifacts(filter).await
    }
    async fn delete_artifact(&self, id: uuid::Uuid) -> Result<bool> {
        self.inner.delete_artifact(id).await
    }

    async fn create_backup_run(&self, run: &BackupRun) -> Result<()> {
        self.inner.create_backup_run(run).await
    }
    async fn update_backup_run(&self, run: &BackupRun) -> Result<()> {
        if run.status == RunStatus::Success && self.fail_success_update.load(Ordering::SeqCst) {
            return Err(AppError::Internal("connection reset while saving run".into()));
        }
        self.inner.update_backup_run(run).await
    }
    async fn get_backup_run(&self, id: uuid::Uuid) -> Result<Option<BackupRun>> {
        self.inner.get_backup_run(id).await
    }
    async fn has_running_backup(&self) -> Result<bool> {
        self.inner.has_running_backup().await
    }
    async fn fail_unfinished_backup_runs(&self, message: &str) -> Result<u64> {
        self.inner.fail_unfinished_backup_runs(message).await
    }

    async fn create_restore_run(&self, run: &RestoreRun) -> Result<()> {
        self.inner.create_restore_run(run).await
    }
    async fn save_restore_run(&self, run: &RestoreRun) -> Result<()> {
        self.inner.save_restore_run(run).await
    }
    async fn get_restore_run(&self, id: uuid::Uuid) -> Result<Option<RestoreRun>> {
        self.inner.get_restore_run(id).await
    }
    async fn list_restore_runs(&self, limit: usize) -> Result<Vec<RestoreRun>> {
        self.inner.list_restore_runs(limit).await
    }
    async fn latest_restore_run(&self, dry_run: bool) -> Result<Option<RestoreRun>> {
        self.inner.latest_restore_run(dry_run).await
    }
    async fn has_running_restore(&self) -> Result<bool> {
        self.inner.has_running_restore().await
    }
    async fn fail_unfinished_restore_runs(
        &self,
        except: Option<uuid::Uuid>,
        message: &str,
    ) -> Result<u64> {
        self.inner.fail_unfinished_restore_runs(except, message).await
    }

    async fn maintenance_mode(&self) -> Result<bool> {
        self.inner.maintenance_mode().await
    }
    async fn set_maintenance_mode(&self, enabled: bool) -> Result<()> {
        self.inner.set_maintenance_mode(enabled).await
    }

    async fn backup_plan(&self) -> Result<BackupPlan> {
        self.inner.backup_plan().await
    }
    async fn save_backup_plan(&self, plan: &BackupPlan) -> Result<()> {
        self.inner.save_backup_plan(plan).await
    }
}

/// A wired engine over fakes and a temporary storage root.
pub struct TestEngine {
    pub dir: TempDir,
    pub repository: Arc<MemoryBackupRepository>,
    pub dumper: Arc<FakeDumper>,
    pub restorer: Arc<FakeRestorer>,
    pub migrator: Arc<FakeMigrator>,
    pub audit: Arc<MemoryAuditSink>,
    pub ctx: Arc<EngineContext>,
    pub backups: BackupService,
    pub restores: RestoreService,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        Self::build(adjust, |repository| repository as Arc<dyn BackupRepository>)
    }

    /// Engine whose services see `wrap(memory repository)` as their repository.
    /// `self.repository` still points at the underlying memory repository.
    pub fn with_repository(
        wrap: impl FnOnce(Arc<MemoryBackupRepository>) -> Arc<dyn BackupRepository>,
    ) -> Self {
        Self::build(|_| {}, wrap)
    }

    fn build(
        adjust: impl FnOnce(&mut Config),
        wrap: impl FnOnce(Arc<MemoryBackupRepository>) -> Arc<dyn BackupRepository>,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::for_storage(dir.path().join("backups"), Some(TEST_KEY));
        adjust(&mut config);

        let repository = Arc::new(MemoryBackupRepository::new());
        let dumper = FakeDumper::new(b"-- dump of the live database --");
        let restorer = FakeRestorer::new(repository.clone());
        let migrator = FakeMigrator::new(3);
        let audit = MemoryAuditSink::new();

        let ctx = EngineContext::new(
            &config,
            Collaborators {
                repository: wrap(repository.clone()),
                dumper: dumper.clone(),
                restorer: restorer.clone(),
                migrator: migrator.clone(),
                counter: Arc::new(FakeCounter),
                audit: audit.clone(),
            },
        );

        Self {
            dir,
            repository,
            dumper,
            restorer,
            migrator,
            audit,
            backups: BackupService::new(ctx.clone()),
            restores: RestoreService::new(ctx.clone()),
            ctx,
        }
    }

    pub fn storage_root(&self) -> PathBuf {
        self.dir.path().join("backups")
    }

    /// Create a backup and return the run together with its artifact id.
    pub async fn backup(&self, label: Option<&str>, scope: &[&str]) -> (BackupRun, uuid::Uuid) {
        let run = self
            .backups
            .create_backup(
                BackupRequest {
                    label: label.map(str::to_string),
                    scope: scope.iter().map(|s| s.to_string()).collect(),
                    include_files: false,
                    requested_by: Some("tester".into()),
                },
                &tokio_util::sync::CancellationToken::new(),
            )
            .await
            .expect("backup should succeed");
        let artifact_id = run.artifact_id.expect("run should reference its artifact");
        (run, artifact_id)
    }
}
