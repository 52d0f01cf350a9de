//! Backup artifact and backup run models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::AppError;

/// Lifecycle status shared by artifacts, backup runs and restore runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            other => Err(AppError::Internal(format!("unknown run status '{}'", other))),
        }
    }
}

/// Where an artifact came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSource {
    /// Produced by this engine
    Local,
    /// Registered from an existing container file
    Imported,
}

impl ArtifactSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactSource::Local => "local",
            ArtifactSource::Imported => "imported",
        }
    }
}

impl FromStr for ArtifactSource {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(ArtifactSource::Local),
            "imported" => Ok(ArtifactSource::Imported),
            other => Err(AppError::Internal(format!("unknown artifact source '{}'", other))),
        }
    }
}

/// SHA-256 digests of the container members and of the packed archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumTable {
    pub algorithm: String,
    pub manifest: String,
    pub dump: String,
    /// Digest of the whole packed archive; absent from the embedded copy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
}

/// Structured metadata recorded with every artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub format_version: u32,
    pub app_version: String,
    pub schema_version: i64,
    pub includes_files: bool,
    /// Normalized data domains the operator asked for; empty means all
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub label: Option<String>,
    /// Point-in-time row counts per data domain
    #[serde(default)]
    pub entity_counts: BTreeMap<String, i64>,
    #[serde(default)]
    pub checksums: Option<ChecksumTable>,
}

/// One stored, encrypted container.
#[derive(Debug, Clone, Serialize)]
pub struct BackupArtifact {
    pub id: Uuid,
    pub source: ArtifactSource,
    pub status: RunStatus,
    pub size_bytes: i64,
    /// SHA-256 of the encrypted file as stored
    pub checksum: String,
    pub filename: String,
    /// Path relative to the storage root
    pub storage_path: String,
    pub metadata: ArtifactMetadata,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl BackupArtifact {
    /// A successful artifact always carries a path, checksum and size.
    pub fn is_restorable(&self) -> bool {
        self.status == RunStatus::Success
            && !self.storage_path.is_empty()
            && !self.checksum.is_empty()
            && self.size_bytes > 0
    }
}

/// Execution record of one backup attempt.
#[derive(Debug, Clone, Serialize)]
pub struct BackupRun {
    pub id: Uuid,
    pub status: RunStatus,
    pub artifact_id: Option<Uuid>,
    pub requested_by: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BackupRun {
    pub fn queued(requested_by: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: RunStatus::Queued,
            artifact_id: None,
            requested_by,
            error_code: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// Filter for artifact listings
#[derive(Debug, Clone, Default)]
pub struct ArtifactFilter {
    pub status: Option<RunStatus>,
    pub source: Option<ArtifactSource>,
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_and_terminal() {
        for status in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Success,
            RunStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!("done".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_metadata_tolerates_missing_optional_fields() {
        let meta: ArtifactMetadata = serde_json::from_value(serde_json::json!({
            "format_version": 1,
            "app_version": "0.4.0",
            "schema_version": 20240101000000i64,
            "includes_files": false
        }))
        .unwrap();
        assert!(meta.scope.is_empty());
        assert!(meta.checksums.is_none());
    }

    #[test]
    fn test_failed_artifact_is_not_restorable() {
        let artifact = BackupArtifact {
            id: Uuid::new_v4(),
            source: ArtifactSource::Local,
            status: RunStatus::Failed,
            size_bytes: 0,
            checksum: String::new(),
            filename: "backup_ALL_20260101T000000Z.tar.enc".into(),
            storage_path: String::new(),
            metadata: ArtifactMetadata::default(),
            created_by: None,
            created_at: Utc::now(),
        };
        assert!(!artifact.is_restorable());
    }
}
