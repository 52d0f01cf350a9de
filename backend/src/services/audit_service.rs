//! Audit logging.
//!
//! Every backup, restore and delete transition is reported to an
//! [`AuditSink`]. Sinks are fire-and-forget: a failing sink never fails the
//! operation that reported to it.

use sqlx::PgPool;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// Audit action types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    BackupStarted,
    BackupCompleted,
    BackupFailed,
    BackupDeleted,
    BackupImported,
    BackupDownloaded,
    RestoreStarted,
    RestoreStep,
    RestoreCompleted,
    RestoreFailed,
    MaintenanceEntered,
    MaintenanceExited,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::BackupStarted => "BACKUP_STARTED",
            AuditAction::BackupCompleted => "BACKUP_COMPLETED",
            AuditAction::BackupFailed => "BACKUP_FAILED",
            AuditAction::BackupDeleted => "BACKUP_DELETED",
            AuditAction::BackupImported => "BACKUP_IMPORTED",
            AuditAction::BackupDownloaded => "BACKUP_DOWNLOADED",
            AuditAction::RestoreStarted => "RESTORE_STARTED",
            AuditAction::RestoreStep => "RESTORE_STEP",
            AuditAction::RestoreCompleted => "RESTORE_COMPLETED",
            AuditAction::RestoreFailed => "RESTORE_FAILED",
            AuditAction::MaintenanceEntered => "MAINTENANCE_ENTERED",
            AuditAction::MaintenanceExited => "MAINTENANCE_EXITED",
        }
    }
}

/// Resource types for audit logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Artifact,
    BackupRun,
    RestoreRun,
    System,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Artifact => "backup_artifact",
            ResourceType::BackupRun => "backup_run",
            ResourceType::RestoreRun => "restore_run",
            ResourceType::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Success,
    Failure,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failure => "failure",
        }
    }
}

/// Audit log entry builder
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub id: Uuid,
    pub actor: Option<String>,
    pub action: AuditAction,
    pub resource_type: ResourceType,
    pub resource_id: Option<Uuid>,
    pub outcome: AuditOutcome,
    pub details: Option<serde_json::Value>,
}

impl AuditEntry {
    pub fn new(action: AuditAction, resource_type: ResourceType) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor: None,
            action,
            resource_type,
            resource_id: None,
            outcome: AuditOutcome::Success,
            details: None,
        }
    }

    pub fn actor(mut self, actor: Option<&str>) -> Self {
        self.actor = actor.map(str::to_string);
        self
    }

    pub fn resource(mut self, resource_id: Uuid) -> Self {
        self.resource_id = Some(resource_id);
        self
    }

    pub fn failed(mut self) -> Self {
        self.outcome = AuditOutcome::Failure;
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Destination for audit entries.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

/// Writes audit entries to the tracing pipeline.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: AuditEntry) {
        let details = entry
            .details
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_default();
        tracing::info!(
            target: "audit",
            action = entry.action.as_str(),
            resource_type = entry.resource_type.as_str(),
            resource_id = ?entry.resource_id,
            actor = entry.actor.as_deref().unwrap_or("system"),
            outcome = entry.outcome.as_str(),
            details = %details,
            "Audit event"
        );
    }
}

/// Inserts audit entries into `audit_log` on a background task.
pub struct PgAuditSink {
    db: PgPool,
}

impl PgAuditSink {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

impl AuditSink for PgAuditSink {
    fn record(&self, entry: AuditEntry) {
        let db = self.db.clone();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            TracingAuditSink.record(entry);
            return;
        };
        handle.spawn(async move {
            let result = sqlx::query(
                r#"
                INSERT INTO audit_log (id, actor, action, resource_type, resource_id, outcome, details)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(entry.id)
            .bind(&entry.actor)
            .bind(entry.action.as_str())
            .bind(entry.resource_type.as_str())
            .bind(entry.resource_id)
            .bind(entry.outcome.as_str())
            .bind(&entry.details)
            .execute(&db)
            .await;

            if let Err(e) = result {
                tracing::warn!(action = entry.action.as_str(), "Failed to write audit entry: {}", e);
            }
        });
    }
}

/// Keeps entries in memory; handy for inspecting what an operation reported.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn actions(&self) -> Vec<AuditAction> {
        self.entries().into_iter().map(|e| e.action).collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: AuditEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }
}
