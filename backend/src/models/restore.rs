//! Restore run model and its step trace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::backup::RunStatus;
use crate::error::AppError;

/// Named steps of the restore state machine, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    LoadArtifact,
    OpenFile,
    Decrypt,
    VerifyChecksums,
    ReadManifest,
    CompatibilityCheck,
    EnterMaintenance,
    StopJobs,
    RestoreDatabase,
    RunMigrations,
    ExitMaintenance,
    Finish,
}

impl StepName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::LoadArtifact => "load_artifact",
            StepName::OpenFile => "open_file",
            StepName::Decrypt => "decrypt",
            StepName::VerifyChecksums => "verify_checksums",
            StepName::ReadManifest => "read_manifest",
            StepName::CompatibilityCheck => "compatibility_check",
            StepName::EnterMaintenance => "enter_maintenance",
            StepName::StopJobs => "stop_jobs",
            StepName::RestoreDatabase => "restore_database",
            StepName::RunMigrations => "run_migrations",
            StepName::ExitMaintenance => "exit_maintenance",
            StepName::Finish => "finish",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Success,
    Failed,
    Skipped,
}

/// One entry of the step trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreStep {
    pub name: StepName,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Execution record of one restore attempt.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreRun {
    pub id: Uuid,
    pub artifact_id: Uuid,
    pub dry_run: bool,
    pub status: RunStatus,
    pub steps: Vec<RestoreStep>,
    pub requested_by: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RestoreRun {
    pub fn queued(artifact_id: Uuid, dry_run: bool, requested_by: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            artifact_id,
            dry_run,
            status: RunStatus::Queued,
            steps: Vec::new(),
            requested_by,
            error_code: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Append a step in `running` state.
    pub fn begin_step(&mut self, name: StepName) {
        self.steps.push(RestoreStep {
            name,
            status: StepStatus::Running,
            detail: None,
            started_at: Utc::now(),
            finished_at: None,
        });
    }

    /// Close the most recent step.
    pub fn end_step(&mut self, status: StepStatus, detail: Option<serde_json::Value>) {
        if let Some(step) = self.steps.last_mut() {
            step.status = status;
            if detail.is_some() {
                step.detail = detail;
            }
            step.finished_at = Some(Utc::now());
        }
    }

    pub fn step(&self, name: StepName) -> Option<&RestoreStep> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn last_step(&self) -> Option<&RestoreStep> {
        self.steps.last()
    }

    pub fn mark_failed(&mut self, error: &AppError) {
        self.status = RunStatus::Failed;
        self.error_code = Some(error.code().as_str().to_string());
        self.error_message = Some(error.to_string());
        self.finished_at = Some(Utc::now());
    }
}
