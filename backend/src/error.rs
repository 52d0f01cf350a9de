//! Application error types, stable error codes and result alias.

use serde::Serialize;
use thiserror::Error;

/// Application result type alias
pub type Result<T> = std::result::Result<T, AppError>;

/// Stable error codes surfaced to callers and recorded in run traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidEncryptionKey,
    StorageUnavailable,
    DumpFailed,
    EncryptionFailed,
    NotFound,
    FileMissing,
    NotReady,
    FileBusy,
    ConcurrentOperation,
    ChecksumMismatch,
    IncompatibleSchema,
    MaintenanceModeFailed,
    DecryptFailed,
    InvalidRequest,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidEncryptionKey => "INVALID_ENCRYPTION_KEY",
            ErrorCode::StorageUnavailable => "STORAGE_UNAVAILABLE",
            ErrorCode::DumpFailed => "DUMP_FAILED",
            ErrorCode::EncryptionFailed => "ENCRYPTION_FAILED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::FileMissing => "FILE_MISSING",
            ErrorCode::NotReady => "NOT_READY",
            ErrorCode::FileBusy => "FILE_BUSY",
            ErrorCode::ConcurrentOperation => "CONCURRENT_OPERATION",
            ErrorCode::ChecksumMismatch => "CHECKSUM_MISMATCH",
            ErrorCode::IncompatibleSchema => "INCOMPATIBLE_SCHEMA",
            ErrorCode::MaintenanceModeFailed => "MAINTENANCE_MODE_FAILED",
            ErrorCode::DecryptFailed => "DECRYPT_FAILED",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::Internal => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Encryption key missing or unusable
    #[error("Invalid encryption key: {0}")]
    InvalidEncryptionKey(String),

    /// Backup storage root cannot be used
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// External dump or restore tool failed
    #[error("Database tool failed: {0}")]
    DumpTool(String),

    /// Encrypting or packing the container failed
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Not found error
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Artifact file absent or outside the storage root
    #[error("File missing: {0}")]
    FileMissing(String),

    /// Resource exists but cannot be used yet
    #[error("Not ready: {0}")]
    NotReady(String),

    /// Artifact is being downloaded
    #[error("File busy: {0}")]
    FileBusy(String),

    /// Pipeline claim conflict
    #[error("Concurrent operation: {0}")]
    ConcurrentOperation(String),

    /// Checksum table mismatch
    #[error("Checksum mismatch: {0}")]
    Checksum(String),

    /// Backup schema is newer than the running system
    #[error("Incompatible schema version: {0}")]
    IncompatibleSchema(String),

    /// Maintenance mode could not be toggled
    #[error("Maintenance mode transition failed: {0}")]
    Maintenance(String),

    /// Container could not be decrypted
    #[error("Decryption failed: {0}")]
    Decrypt(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Config(_)
            | AppError::Database(_)
            | AppError::Io(_)
            | AppError::Json(_)
            | AppError::Internal(_) => ErrorCode::Internal,
            AppError::InvalidEncryptionKey(_) => ErrorCode::InvalidEncryptionKey,
            AppError::StorageUnavailable(_) => ErrorCode::StorageUnavailable,
            AppError::DumpTool(_) => ErrorCode::DumpFailed,
            AppError::Encryption(_) => ErrorCode::EncryptionFailed,
            AppError::NotFound(_) => ErrorCode::NotFound,
            AppError::FileMissing(_) => ErrorCode::FileMissing,
            AppError::NotReady(_) => ErrorCode::NotReady,
            AppError::FileBusy(_) => ErrorCode::FileBusy,
            AppError::ConcurrentOperation(_) => ErrorCode::ConcurrentOperation,
            AppError::Checksum(_) => ErrorCode::ChecksumMismatch,
            AppError::IncompatibleSchema(_) => ErrorCode::IncompatibleSchema,
            AppError::Maintenance(_) => ErrorCode::MaintenanceModeFailed,
            AppError::Decrypt(_) => ErrorCode::DecryptFailed,
            AppError::Validation(_) => ErrorCode::InvalidRequest,
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        AppError::Database(format!("migration failed: {}", e))
    }
}
