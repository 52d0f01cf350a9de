//! Executes parsed CLI commands against a fully wired engine.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::cli::backup::{error, output, table_row, BackupCli, BackupCommand};
use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::backup::{ArtifactFilter, BackupArtifact, RunStatus};
use crate::models::restore::RestoreRun;
use crate::services::audit_service::PgAuditSink;
use crate::services::backup_repository::PgBackupRepository;
use crate::services::backup_service::{BackupRequest, BackupService};
use crate::services::database_tools::{PgDumpTool, PgEntityCounter, SchemaMigrator, SqlxMigrator};
use crate::services::engine::{Collaborators, EngineContext};
use crate::services::restore_service::RestoreService;
use crate::services::scheduler_service::{BackupScheduler, SchedulerSettings};

/// Grace period for an in-flight scheduler tick on shutdown
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Wire the PostgreSQL collaborators into an engine context.
pub fn build_engine(config: &Config, db: PgPool, migrator: Arc<SqlxMigrator>) -> Arc<EngineContext> {
    let tools = Arc::new(PgDumpTool::new(
        db.clone(),
        config.database_url.clone(),
        config.pg_dump_path.clone(),
        config.pg_restore_path.clone(),
    ));

    EngineContext::new(
        config,
        Collaborators {
            repository: Arc::new(PgBackupRepository::new(db.clone())),
            dumper: tools.clone(),
            restorer: tools,
            migrator,
            counter: Arc::new(PgEntityCounter::new(db.clone(), config.domain_tables.clone())),
            audit: Arc::new(PgAuditSink::new(db)),
        },
    )
}

/// Run a CLI command. Failures are printed once, in the requested format,
/// and turned into a non-zero exit status.
pub async fn run(cli: BackupCli, config: Config, db: PgPool) -> ExitCode {
    let format = cli.format.clone();
    ExitCode::from(report(&format, dispatch(cli, config, db).await))
}

fn report(format: &str, result: Result<()>) -> u8 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            error(format, e.code().as_str(), &e.to_string());
            1
        }
    }
}

async fn dispatch(cli: BackupCli, config: Config, db: PgPool) -> Result<()> {
    let format = cli.format.as_str();
    let operator = cli.operator.as_deref();

    let migrator = Arc::new(SqlxMigrator::load(db.clone(), &config.migrations_path).await?);
    migrator.migrate().await?;

    if let BackupCommand::Migrate = cli.command {
        let version = migrator.applied_version().await?;
        output(
            format,
            &format!("Schema is at version {}", version),
            Some(serde_json::json!({ "schema_version": version })),
        );
        return Ok(());
    }

    let ctx = build_engine(&config, db, migrator);
    let backups = BackupService::new(ctx.clone());
    let restores = RestoreService::new(ctx);

    match cli.command {
        BackupCommand::Serve => serve(&config, backups, restores).await,
        BackupCommand::Backup {
            label,
            scope,
            include_files,
        } => {
            let cancel = cancel_on_ctrl_c();
            let run = backups
                .create_backup(
                    BackupRequest {
                        label,
                        scope,
                        include_files,
                        requested_by: operator.map(str::to_string),
                    },
                    &cancel,
                )
                .await?;

            let artifact = match run.artifact_id {
                Some(id) => Some(backups.get_artifact(id).await?),
                None => None,
            };
            let message = match &artifact {
                Some(a) => format!("Backup complete: {} ({} bytes)", a.filename, a.size_bytes),
                None => format!("Backup run {} complete", run.id),
            };
            output(
                format,
                &message,
                Some(serde_json::json!({ "run": run, "artifact": artifact })),
            );
            Ok(())
        }
        BackupCommand::Restore {
            artifact_id,
            dry_run,
        } => {
            let cancel = cancel_on_ctrl_c();
            let requested_by = operator.map(str::to_string);
            let handle = if dry_run {
                restores
                    .start_restore_dry_run(artifact_id, requested_by, &cancel)
                    .await?
            } else {
                restores.start_restore(artifact_id, requested_by, &cancel).await?
            };
            let run = handle.wait().await?;
            print_restore_run(format, &run);

            match run.status {
                RunStatus::Success => Ok(()),
                _ => Err(AppError::Internal(format!(
                    "restore run {} failed: {}",
                    run.id,
                    run.error_code.as_deref().unwrap_or("")
                ))),
            }
        }
        BackupCommand::List {
            untracked: true, ..
        } => {
            let files = backups.untracked_containers().await?;
            if format == "json" {
                let value: Vec<_> = files
                    .iter()
                    .map(|(key, size)| serde_json::json!({ "storage_path": key, "size_bytes": size }))
                    .collect();
                output(format, "", Some(serde_json::json!(value)));
            } else if files.is_empty() {
                println!("No untracked containers");
            } else {
                table_row(&["STORAGE PATH", "SIZE"]);
                for (key, size) in &files {
                    let size = size.to_string();
                    table_row(&[key.as_str(), size.as_str()]);
                }
            }
            Ok(())
        }
        BackupCommand::List { status, limit, .. } => {
            let status = status
                .map(|s| {
                    s.parse::<RunStatus>()
                        .map_err(|_| AppError::Validation(format!("unknown status '{}'", s)))
                })
                .transpose()?;
            let artifacts = backups
                .list_artifacts(&ArtifactFilter {
                    status,
                    source: None,
                    limit: Some(limit),
                })
                .await?;
            print_artifacts(format, &artifacts);
            Ok(())
        }
        BackupCommand::Status { run_id } => {
            let run = restores.get_restore_run(run_id).await?;
            print_restore_run(format, &run);
            Ok(())
        }
        BackupCommand::Delete { artifact_id } => {
            backups.delete_backup(artifact_id, operator).await?;
            output(
                format,
                &format!("Deleted artifact {}", artifact_id),
                Some(serde_json::json!({ "deleted": artifact_id })),
            );
            Ok(())
        }
        BackupCommand::Import { path } => {
            let artifact = backups.import_artifact(&path, operator).await?;
            output(
                format,
                &format!("Registered {} as {}", artifact.filename, artifact.id),
                Some(serde_json::to_value(&artifact)?),
            );
            Ok(())
        }
        BackupCommand::Migrate => Ok(()),
    }
}

async fn serve(config: &Config, backups: BackupService, restores: RestoreService) -> Result<()> {
    let report = restores.recover_on_startup().await?;
    tracing::info!(
        maintenance_cleared = report.maintenance_cleared,
        backup_runs_failed = report.backup_runs_failed,
        restore_runs_failed = report.restore_runs_failed,
        "Startup recovery complete"
    );

    let scheduler = BackupScheduler::new(backups, restores, SchedulerSettings::from(config));
    scheduler.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    if !scheduler.stop(SHUTDOWN_DEADLINE).await {
        tracing::warn!("Exiting with a scheduler tick still in flight");
    }
    Ok(())
}

/// Token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
    cancel
}

fn print_artifacts(format: &str, artifacts: &[BackupArtifact]) {
    if format == "json" {
        output(format, "", Some(serde_json::json!(artifacts)));
        return;
    }

    if artifacts.is_empty() {
        println!("No backups found");
        return;
    }

    table_row(&["ID", "STATUS", "SOURCE", "SIZE", "CREATED", "FILENAME"]);
    for artifact in artifacts {
        let size = artifact.size_bytes.to_string();
        let created = artifact.created_at.format("%Y-%m-%d %H:%M:%S").to_string();
        let id = artifact.id.to_string();
        table_row(&[
            id.as_str(),
            artifact.status.as_str(),
            artifact.source.as_str(),
            size.as_str(),
            created.as_str(),
            artifact.filename.as_str(),
        ]);
    }
}

fn print_restore_run(format: &str, run: &RestoreRun) {
    if format == "json" {
        output(format, "", Some(serde_json::json!(run)));
        return;
    }

    let kind = if run.dry_run { "Dry run" } else { "Restore" };
    println!("{} {}: {}", kind, run.id, run.status);
    if let Some(code) = &run.error_code {
        println!(
            "  error: {} {}",
            code,
            run.error_message.as_deref().unwrap_or("")
        );
    }
    for step in &run.steps {
        let status = serde_json::to_value(step.status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        match &step.detail {
            Some(detail) => println!("  {:<20} {:<8} {}", step.name.as_str(), status, detail),
            None => println!("  {:<20} {}", step.name.as_str(), status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_success_exits_zero() {
        assert_eq!(report("text", Ok(())), 0);
    }

    #[test]
    fn test_report_failure_exits_non_zero() {
        assert_eq!(report("json", Err(AppError::NotFound("artifact".into()))), 1);
        assert_eq!(
            report("text", Err(AppError::ConcurrentOperation("restore".into()))),
            1
        );
    }
}
