//! Background backup scheduler.
//!
//! Each tick runs two independent, best-effort checks: the restore
//! self-test (a dry run of the newest successful artifact) and the automatic
//! backup driven by the stored [`BackupPlan`](crate::models::plan::BackupPlan).
//! Ticks are skipped while a restore has paused recurring jobs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::error::Result;
use crate::models::backup::RunStatus;
use crate::services::backup_service::{BackupRequest, BackupService};
use crate::services::restore_service::RestoreService;

const SCHEDULER_ACTOR: &str = "scheduler";

/// Scheduler timing
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub interval: Duration,
    pub self_test_enabled: bool,
    pub self_test_interval: Duration,
}

impl From<&Config> for SchedulerSettings {
    fn from(config: &Config) -> Self {
        Self {
            interval: config.scheduler_interval,
            self_test_enabled: config.self_test_enabled,
            self_test_interval: config.self_test_interval,
        }
    }
}

/// Result of one check within a tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    Skipped { reason: String },
    Completed { run_id: Uuid, status: RunStatus },
    Failed { error: String },
}

impl TickOutcome {
    fn skipped(reason: &str) -> Self {
        TickOutcome::Skipped {
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub paused: bool,
    pub self_test: TickOutcome,
    pub auto_backup: TickOutcome,
    pub retention_removed: Vec<Uuid>,
}

struct RunningLoop {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Periodic self-test and automatic backup driver.
pub struct BackupScheduler {
    backups: BackupService,
    restores: RestoreService,
    settings: SchedulerSettings,
    running: Mutex<Option<RunningLoop>>,
    tick_lock: tokio::sync::Mutex<()>,
}

impl BackupScheduler {
    pub fn new(
        backups: BackupService,
        restores: RestoreService,
        settings: SchedulerSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            backups,
            restores,
            settings,
            running: Mutex::new(None),
            tick_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Start the timer loop. Returns `false` if it is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.as_ref().is_some_and(|r| !r.join.is_finished()) {
            return false;
        }

        let cancel = CancellationToken::new();
        let scheduler = Arc::clone(self);
        let token = cancel.clone();
        let period = self.settings.interval.max(Duration::from_secs(1));
        let join = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick fires immediately; wait one full period instead.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        scheduler.run_tick().await;
                    }
                }
            }
            tracing::debug!("Backup scheduler loop exited");
        });

        *running = Some(RunningLoop { cancel, join });
        tracing::info!(interval_secs = period.as_secs(), "Backup scheduler started");
        true
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|r| !r.join.is_finished())
    }

    /// Stop the loop, waiting for an in-flight tick up to `deadline`.
    ///
    /// Returns `true` when the loop has exited (or was not running) and
    /// `false` when the deadline expired first.
    pub async fn stop(&self, deadline: Duration) -> bool {
        let Some(running) = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return true;
        };

        running.cancel.cancel();
        match tokio::time::timeout(deadline, running.join).await {
            Ok(_) => {
                tracing::info!("Backup scheduler stopped");
                true
            }
            Err(_) => {
                tracing::warn!(
                    deadline_ms = deadline.as_millis() as u64,
                    "Backup scheduler did not stop before the deadline"
                );
                false
            }
        }
    }

    /// Run both checks once. Errors are logged and reported, never raised.
    pub async fn run_tick(&self) -> TickReport {
        let _tick = self.tick_lock.lock().await;
        let now = Utc::now();

        if self.backups.context().coordinator.jobs_paused() {
            tracing::debug!("Scheduler tick skipped: jobs are paused");
            return TickReport {
                paused: true,
                self_test: TickOutcome::skipped("jobs paused"),
                auto_backup: TickOutcome::skipped("jobs paused"),
                retention_removed: Vec::new(),
            };
        }

        let self_test = match self.self_test(now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("Restore self-test failed: {}", e);
                TickOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        let mut retention_removed = Vec::new();
        let auto_backup = match self.auto_backup(now, &mut retention_removed).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("Automatic backup failed: {}", e);
                TickOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        TickReport {
            paused: false,
            self_test,
            auto_backup,
            retention_removed,
        }
    }

    async fn self_test(&self, now: DateTime<Utc>) -> Result<TickOutcome> {
        if !self.settings.self_test_enabled {
            return Ok(TickOutcome::skipped("self-test disabled"));
        }

        if let Some(last) = self.restores.latest_dry_run().await? {
            let elapsed = (now - last.created_at).to_std().unwrap_or_default();
            if elapsed < self.settings.self_test_interval {
                return Ok(TickOutcome::skipped("self-test not due"));
            }
        }

        let Some(artifact) = self.backups.latest_successful().await? else {
            return Ok(TickOutcome::skipped("no successful backup"));
        };

        tracing::info!(artifact_id = %artifact.id, "Running restore self-test");
        let handle = self
            .restores
            .start_restore_dry_run(
                artifact.id,
                Some(SCHEDULER_ACTOR.to_string()),
                &CancellationToken::new(),
            )
            .await?;
        let run = handle.wait().await?;
        if run.status != RunStatus::Success {
            tracing::warn!(
                run_id = %run.id,
                code = run.error_code.as_deref().unwrap_or(""),
                "Restore self-test did not pass"
            );
        }

        Ok(TickOutcome::Completed {
            run_id: run.id,
            status: run.status,
        })
    }

    async fn auto_backup(&self, now: DateTime<Utc>, removed: &mut Vec<Uuid>) -> Result<TickOutcome> {
        let repository = &self.backups.context().repository;
        let mut plan = repository.backup_plan().await?;
        if !plan.enabled {
            return Ok(TickOutcome::skipped("plan disabled"));
        }

        let latest_success = self.backups.latest_successful().await?.map(|a| a.created_at);
        if !plan.is_due(latest_success, now) {
            return Ok(TickOutcome::skipped("backup not due"));
        }

        tracing::info!("Running scheduled backup");
        let run = self
            .backups
            .create_backup(
                BackupRequest {
                    label: plan.label.clone(),
                    scope: plan.scope.clone(),
                    include_files: plan.include_files,
                    requested_by: Some(SCHEDULER_ACTOR.to_string()),
                },
                &CancellationToken::new(),
            )
            .await?;

        plan.last_auto_run_at = Some(now);
        repository.save_backup_plan(&plan).await?;

        match self.backups.apply_retention(&plan, now).await {
            Ok(ids) => removed.extend(ids),
            Err(e) => tracing::warn!("Retention pass failed: {}", e),
        }

        Ok(TickOutcome::Completed {
            run_id: run.id,
            status: run.status,
        })
    }
}
