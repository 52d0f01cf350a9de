//! Shared context handed to the backup, restore and scheduler services.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::services::audit_service::{AuditEntry, AuditSink};
use crate::services::backup_repository::BackupRepository;
use crate::services::database_tools::{DumpRunner, EntityCounter, RestoreRunner, SchemaMigrator};
use crate::services::encryption::{ContainerCipher, EncryptionError};
use crate::services::pipeline::PipelineCoordinator;
use crate::storage::BackupStorage;

/// External collaborators the engine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub repository: Arc<dyn BackupRepository>,
    pub dumper: Arc<dyn DumpRunner>,
    pub restorer: Arc<dyn RestoreRunner>,
    pub migrator: Arc<dyn SchemaMigrator>,
    pub counter: Arc<dyn EntityCounter>,
    pub audit: Arc<dyn AuditSink>,
}

/// State and collaborators shared by every engine operation.
pub struct EngineContext {
    pub repository: Arc<dyn BackupRepository>,
    pub dumper: Arc<dyn DumpRunner>,
    pub restorer: Arc<dyn RestoreRunner>,
    pub migrator: Arc<dyn SchemaMigrator>,
    pub counter: Arc<dyn EntityCounter>,
    pub audit: Arc<dyn AuditSink>,
    pub storage: BackupStorage,
    pub coordinator: Arc<PipelineCoordinator>,
    dump_slots: Arc<Semaphore>,
    encryption_key: Option<String>,
    pub dump_timeout: Duration,
    pub restore_timeout: Duration,
}

redacted_debug!(EngineContext {
    show storage,
    show coordinator,
    redact_option encryption_key,
    show dump_timeout,
    show restore_timeout,
});

impl EngineContext {
    pub fn new(config: &Config, collaborators: Collaborators) -> Arc<Self> {
        Arc::new(Self {
            repository: collaborators.repository,
            dumper: collaborators.dumper,
            restorer: collaborators.restorer,
            migrator: collaborators.migrator,
            counter: collaborators.counter,
            audit: collaborators.audit,
            storage: BackupStorage::new(config.storage_path.clone()),
            coordinator: PipelineCoordinator::new(),
            dump_slots: Arc::new(Semaphore::new(config.max_concurrent_dumps.max(1))),
            encryption_key: config.encryption_key.clone(),
            dump_timeout: config.dump_timeout,
            restore_timeout: config.restore_timeout,
        })
    }

    /// Cipher for the configured secret.
    pub fn cipher(&self) -> Result<ContainerCipher> {
        let key = self.encryption_key.as_deref().ok_or_else(|| {
            AppError::InvalidEncryptionKey("BACKUP_ENCRYPTION_KEY is not configured".into())
        })?;
        Ok(ContainerCipher::from_secret(key)?)
    }

    /// Wait for a dump slot, giving up when `cancel` fires.
    pub async fn acquire_slot(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit> {
        tokio::select! {
            permit = Arc::clone(&self.dump_slots).acquire_owned() => {
                permit.map_err(|_| AppError::Internal("dump slot pool is closed".into()))
            }
            _ = cancel.cancelled() => Err(AppError::NotReady(
                "request cancelled while waiting for a dump slot".into(),
            )),
        }
    }

    /// Scratch directory under the storage root, removed on drop.
    pub fn scratch_dir(&self, prefix: &str) -> Result<tempfile::TempDir> {
        tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(self.storage.base_path())
            .map_err(|e| AppError::StorageUnavailable(format!("cannot create work directory: {}", e)))
    }

    pub fn audit(&self, entry: AuditEntry) {
        self.audit.record(entry);
    }
}

/// Encrypt `src` into `dst` on the blocking pool.
pub(crate) async fn encrypt_blocking(cipher: ContainerCipher, src: &Path, dst: &Path) -> Result<u64> {
    let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
    tokio::task::spawn_blocking(move || cipher.encrypt_file(&src, &dst))
        .await
        .map_err(|e| AppError::Internal(format!("encryption task failed: {}", e)))?
        .map_err(|e| match e {
            EncryptionError::InvalidKey(msg) => AppError::InvalidEncryptionKey(msg),
            other => AppError::Encryption(other.to_string()),
        })
}

/// Decrypt `src` into `dst` on the blocking pool.
pub(crate) async fn decrypt_blocking(cipher: ContainerCipher, src: &Path, dst: &Path) -> Result<u64> {
    let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
    tokio::task::spawn_blocking(move || cipher.decrypt_file(&src, &dst))
        .await
        .map_err(|e| AppError::Internal(format!("decryption task failed: {}", e)))?
        .map_err(|e| match e {
            EncryptionError::InvalidKey(msg) => AppError::InvalidEncryptionKey(msg),
            other => AppError::Decrypt(other.to_string()),
        })
}

/// Run blocking container work off the async runtime.
pub(crate) async fn blocking<T, F>(label: &'static str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Internal(format!("{} task failed: {}", label, e)))?
}
