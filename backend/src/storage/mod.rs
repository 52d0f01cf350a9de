//! On-disk storage for backup containers.

pub mod filesystem;

pub use filesystem::BackupStorage;
