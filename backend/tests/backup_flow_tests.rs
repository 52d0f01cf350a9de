//! Backup creation, listing, download, deletion and import against a fully
//! wired engine with fake database tools.

mod common;

use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;

use backup_orchestrator::error::ErrorCode;
use backup_orchestrator::models::backup::{ArtifactFilter, ArtifactSource, RunStatus};
use backup_orchestrator::services::audit_service::AuditAction;
use backup_orchestrator::services::backup_repository::BackupRepository;
use backup_orchestrator::services::backup_service::BackupRequest;
use backup_orchestrator::services::container;
use backup_orchestrator::services::encryption::ContainerCipher;

use common::{FlakyRepository, TestEngine, TEST_KEY};

fn is_container_name(name: &str, scope: &str, label: &str) -> bool {
    let Some(rest) = name.strip_prefix(&format!("backup_{}_{}_", scope, label)) else {
        return false;
    };
    let Some(stamp) = rest.strip_suffix(".tar.enc") else {
        return false;
    };
    // YYYYMMDDTHHMMSSZ
    stamp.len() == 16
        && stamp[..8].chars().all(|c| c.is_ascii_digit())
        && &stamp[8..9] == "T"
        && stamp[9..15].chars().all(|c| c.is_ascii_digit())
        && stamp.ends_with('Z')
}

#[tokio::test]
async fn test_backup_produces_encrypted_container_and_metadata() {
    let engine = TestEngine::new();
    let (run, artifact_id) = engine.backup(Some("nightly"), &["docs", "incidents"]).await;

    assert_eq!(run.status, RunStatus::Success);
    assert!(run.started_at.is_some() && run.finished_at.is_some());

    let artifact = engine.backups.get_artifact(artifact_id).await.unwrap();
    assert_eq!(artifact.status, RunStatus::Success);
    assert_eq!(artifact.source, ArtifactSource::Local);
    assert!(
        is_container_name(&artifact.filename, "DOCS-INCIDENTS", "NIGHTLY"),
        "unexpected filename {}",
        artifact.filename
    );
    assert_eq!(artifact.metadata.scope, vec!["docs", "incidents"]);
    assert_eq!(artifact.metadata.label.as_deref(), Some("nightly"));
    assert_eq!(artifact.metadata.schema_version, 3);
    assert_eq!(artifact.metadata.entity_counts.get("docs"), Some(&7));
    assert_eq!(artifact.created_by.as_deref(), Some("tester"));

    let path = engine.storage_root().join(&artifact.storage_path);
    let on_disk = std::fs::read(&path).unwrap();
    assert_eq!(artifact.size_bytes as usize, on_disk.len());
    assert_eq!(artifact.checksum, container::bytes_sha256(&on_disk));
    assert!(
        !on_disk
            .windows(b"dump of the live database".len())
            .any(|w| w == b"dump of the live database"),
        "container must not contain the plaintext dump"
    );

    // Only the finished container is left behind in the root.
    let names: Vec<String> = std::fs::read_dir(engine.storage_root())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(names, vec![artifact.filename.clone()]);

    let actions = engine.audit.actions();
    assert!(actions.contains(&AuditAction::BackupStarted));
    assert!(actions.contains(&AuditAction::BackupCompleted));
}

#[tokio::test]
async fn test_container_decrypts_to_verifiable_archive() {
    let engine = TestEngine::new();
    let (_, artifact_id) = engine.backup(None, &[]).await;
    let artifact = engine.backups.get_artifact(artifact_id).await.unwrap();

    let work = tempfile::tempdir().unwrap();
    let archive = work.path().join("container.tar");
    ContainerCipher::from_secret(TEST_KEY)
        .unwrap()
        .decrypt_file(&engine.storage_root().join(&artifact.storage_path), &archive)
        .unwrap();

    let unpacked = container::unpack_archive(&archive, work.path()).unwrap();
    let table = artifact.metadata.checksums.clone().unwrap();
    assert!(container::verify_checksums(&archive, &unpacked, &table)
        .unwrap()
        .is_empty());
    assert_eq!(
        std::fs::read(&unpacked.dump_path).unwrap(),
        b"-- dump of the live database --"
    );
    assert!(artifact.filename.starts_with("backup_ALL_"));
}

#[tokio::test]
async fn test_dump_failure_records_failed_run_and_artifact() {
    let engine = TestEngine::new();
    engine.dumper.fail.store(true, Ordering::SeqCst);

    let err = engine
        .backups
        .create_backup(BackupRequest::default(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::DumpFailed);

    let failed = engine
        .backups
        .list_artifacts(&ArtifactFilter {
            status: Some(RunStatus::Failed),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert!(!failed[0].is_restorable());

    assert!(!engine.repository.has_running_backup().await.unwrap());
    assert!(engine.audit.actions().contains(&AuditAction::BackupFailed));
    assert!(engine.backups.latest_successful().await.unwrap().is_none());

    // The pipeline is free again.
    engine.dumper.fail.store(false, Ordering::SeqCst);
    engine.backup(None, &[]).await;
}

#[tokio::test]
async fn test_missing_key_fails_before_dumping() {
    let engine = TestEngine::with_config(|c| c.encryption_key = None);

    let err = engine
        .backups
        .create_backup(BackupRequest::default(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidEncryptionKey);
    assert_eq!(engine.dumper.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_backup_refused_in_maintenance_mode() {
    let engine = TestEngine::new();
    engine.repository.set_maintenance_mode(true).await.unwrap();

    let err = engine
        .backups
        .create_backup(BackupRequest::default(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotReady);
    assert!(engine
        .repository
        .list_artifacts(&ArtifactFilter::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_second_backup_is_rejected_while_first_runs() {
    let engine = TestEngine::new();
    let (started, release) = engine.dumper.hold();

    let queued = engine
        .backups
        .start_backup(BackupRequest::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(queued.status, RunStatus::Queued);
    started.notified().await;

    let err = engine
        .backups
        .create_backup(BackupRequest::default(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConcurrentOperation);

    let err = engine
        .restores
        .start_restore_dry_run(uuid::Uuid::new_v4(), None, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConcurrentOperation);

    release.notify_one();
    let finished = tokio::time::timeout(std::time::Duration::from_secs(10), async {
        loop {
            let run = engine.backups.get_backup_run(queued.id).await.unwrap();
            if run.status.is_terminal() {
                return run;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(finished.status, RunStatus::Success);
}

#[tokio::test]
async fn test_dropped_caller_does_not_orphan_backup_run() {
    let engine = TestEngine::new();
    let (started, release) = engine.dumper.hold();

    // Give up on the call as soon as the dump is underway.
    let cancel = CancellationToken::new();
    let outcome = tokio::select! {
        result = engine
            .backups
            .create_backup(BackupRequest::default(), &cancel) => Some(result),
        _ = started.notified() => None,
    };
    assert!(outcome.is_none());
    assert!(engine.repository.has_running_backup().await.unwrap());

    release.notify_one();
    tokio::time::timeout(std::time::Duration::from_secs(10), async {
        while engine.repository.has_running_backup().await.unwrap()
            || engine.ctx.coordinator.active_pipeline().is_some()
        {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let stored = engine
        .repository
        .list_artifacts(&ArtifactFilter::default())
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, RunStatus::Success);
    assert!(engine.audit.actions().contains(&AuditAction::BackupCompleted));

    engine.dumper.unhold();
    engine.backup(Some("after"), &[]).await;
}

#[tokio::test]
async fn test_unsaved_success_marks_run_failed() {
    let flaky = std::sync::Mutex::new(None);
    let engine = TestEngine::with_repository(|memory| {
        let repository = FlakyRepository::new(memory);
        *flaky.lock().unwrap() = Some(repository.clone());
        repository as std::sync::Arc<dyn BackupRepository>
    });
    let flaky = flaky.into_inner().unwrap().unwrap();
    flaky.fail_success_update.store(true, Ordering::SeqCst);

    let err = engine
        .backups
        .create_backup(BackupRequest::default(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Internal);
    assert!(!engine.repository.has_running_backup().await.unwrap());
    assert!(engine.audit.actions().contains(&AuditAction::BackupFailed));

    // The container itself was stored and stays restorable.
    let stored = engine
        .repository
        .list_artifacts(&ArtifactFilter::default())
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, RunStatus::Success);

    flaky.fail_success_update.store(false, Ordering::SeqCst);
    engine.backup(None, &[]).await;
}

#[tokio::test]
async fn test_cancelled_wait_for_slot_is_not_ready() {
    let engine = TestEngine::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    // Hold the only slot so admission has to wait.
    let _slot = engine
        .ctx
        .acquire_slot(&CancellationToken::new())
        .await
        .unwrap();
    let err = engine
        .backups
        .create_backup(BackupRequest::default(), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotReady);
    assert_eq!(engine.ctx.coordinator.active_pipeline(), None);
}

#[tokio::test]
async fn test_delete_refused_while_downloading() {
    let engine = TestEngine::new();
    let (_, artifact_id) = engine.backup(None, &["docs"]).await;

    let download = engine
        .backups
        .open_download(artifact_id, Some("auditor"))
        .await
        .unwrap();
    let err = engine
        .backups
        .delete_backup(artifact_id, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::FileBusy);
    assert!(download.path.exists());

    drop(download);
    engine.backups.delete_backup(artifact_id, None).await.unwrap();
    assert_eq!(
        engine.backups.get_artifact(artifact_id).await.unwrap_err().code(),
        ErrorCode::NotFound
    );
    assert!(std::fs::read_dir(engine.storage_root())
        .unwrap()
        .next()
        .is_none());
    assert!(engine.audit.actions().contains(&AuditAction::BackupDeleted));
}

#[tokio::test]
async fn test_delete_refused_while_backup_runs() {
    let engine = TestEngine::new();
    let (_, existing) = engine.backup(None, &[]).await;

    let (started, release) = engine.dumper.hold();
    engine
        .backups
        .start_backup(BackupRequest::default(), &CancellationToken::new())
        .await
        .unwrap();
    started.notified().await;

    let err = engine.backups.delete_backup(existing, None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConcurrentOperation);
    release.notify_one();
}

#[tokio::test]
async fn test_delete_unknown_artifact_is_not_found() {
    let engine = TestEngine::new();
    let err = engine
        .backups
        .delete_backup(uuid::Uuid::new_v4(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[tokio::test]
async fn test_download_of_failed_artifact_is_not_ready() {
    let engine = TestEngine::new();
    engine.dumper.fail.store(true, Ordering::SeqCst);
    let _ = engine
        .backups
        .create_backup(BackupRequest::default(), &CancellationToken::new())
        .await;

    let failed = engine
        .backups
        .list_artifacts(&ArtifactFilter::default())
        .await
        .unwrap();
    let err = engine
        .backups
        .open_download(failed[0].id, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotReady);
    assert_eq!(engine.ctx.coordinator.active_downloads(failed[0].id), 0);
}

#[tokio::test]
async fn test_download_of_vanished_file_is_file_missing() {
    let engine = TestEngine::new();
    let (_, artifact_id) = engine.backup(None, &[]).await;
    let artifact = engine.backups.get_artifact(artifact_id).await.unwrap();
    std::fs::remove_file(engine.storage_root().join(&artifact.storage_path)).unwrap();

    let err = engine
        .backups
        .open_download(artifact_id, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::FileMissing);
}

#[tokio::test]
async fn test_import_registers_untracked_container() {
    let engine = TestEngine::new();
    let (_, artifact_id) = engine.backup(Some("weekly"), &["docs"]).await;
    let original = engine.backups.get_artifact(artifact_id).await.unwrap();

    assert!(engine.backups.untracked_containers().await.unwrap().is_empty());

    // Forget the catalog entry but keep the file.
    engine.repository.delete_artifact(artifact_id).await.unwrap();
    let untracked = engine.backups.untracked_containers().await.unwrap();
    assert_eq!(
        untracked,
        vec![(original.storage_path.clone(), original.size_bytes as u64)]
    );

    let imported = engine
        .backups
        .import_artifact(std::path::Path::new(&original.storage_path), Some("ops"))
        .await
        .unwrap();
    assert_eq!(imported.source, ArtifactSource::Imported);
    assert_ne!(imported.id, original.id);
    assert_eq!(imported.checksum, original.checksum);
    assert_eq!(imported.metadata.scope, vec!["docs"]);
    assert_eq!(imported.metadata.label.as_deref(), Some("weekly"));
    let (embedded, recorded) = (
        imported.metadata.checksums.clone().unwrap(),
        original.metadata.checksums.clone().unwrap(),
    );
    assert_eq!(embedded.dump, recorded.dump);
    assert_eq!(embedded.manifest, recorded.manifest);

    // Importing the same path again returns the existing record.
    let again = engine
        .backups
        .import_artifact(
            &engine.storage_root().join(&original.storage_path),
            Some("ops"),
        )
        .await
        .unwrap();
    assert_eq!(again.id, imported.id);
    assert!(engine.audit.actions().contains(&AuditAction::BackupImported));
}

#[tokio::test]
async fn test_import_outside_root_is_file_missing() {
    let engine = TestEngine::new();
    let outside = tempfile::NamedTempFile::new().unwrap();

    let err = engine
        .backups
        .import_artifact(outside.path(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::FileMissing);
}

#[tokio::test]
async fn test_import_with_wrong_key_is_decrypt_failure() {
    let engine = TestEngine::new();
    let (_, artifact_id) = engine.backup(None, &[]).await;
    let artifact = engine.backups.get_artifact(artifact_id).await.unwrap();
    engine.repository.delete_artifact(artifact_id).await.unwrap();

    let other = TestEngine::with_config(|c| {
        c.storage_path = engine.storage_root();
        c.encryption_key = Some("a-completely-different-secret".into());
    });
    let err = other
        .backups
        .import_artifact(std::path::Path::new(&artifact.storage_path), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::DecryptFailed);
}

#[tokio::test]
async fn test_list_filters_and_orders_newest_first() {
    let engine = TestEngine::new();
    let (_, first) = engine.backup(Some("one"), &[]).await;
    let (_, second) = engine.backup(Some("two"), &[]).await;

    let all = engine
        .backups
        .list_artifacts(&ArtifactFilter::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id, second);
    assert_eq!(all[1].id, first);

    let latest = engine.backups.latest_successful().await.unwrap().unwrap();
    assert_eq!(latest.id, second);
}
