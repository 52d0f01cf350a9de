//! CLI modules for the backup orchestrator.

pub mod backup;
pub mod backup_runner;

pub use backup::{BackupCli, BackupCommand};
pub use backup_runner::run;
