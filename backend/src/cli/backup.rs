//! Command-line interface for the backup engine.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "backup-orchestrator")]
#[command(about = "Encrypted database backups and verified restores", long_about = None)]
pub struct BackupCli {
    #[command(subcommand)]
    pub command: BackupCommand,

    /// Output format (text, json)
    #[arg(long, default_value = "text", global = true)]
    pub format: String,

    /// Operator recorded on runs and audit entries
    #[arg(long, env = "BACKUP_OPERATOR", global = true)]
    pub operator: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum BackupCommand {
    /// Recover from any interrupted run, then drive the scheduler until Ctrl-C
    Serve,

    /// Create a backup now
    Backup {
        /// Free-text label added to the file name
        #[arg(short, long)]
        label: Option<String>,

        /// Data domains to record in the metadata (comma separated)
        #[arg(short, long, value_delimiter = ',')]
        scope: Vec<String>,

        /// Mark the backup as including auxiliary files
        #[arg(long)]
        include_files: bool,
    },

    /// Restore the database from an artifact
    Restore {
        /// Artifact to restore
        artifact_id: Uuid,

        /// Verify the artifact without touching the database
        #[arg(long)]
        dry_run: bool,
    },

    /// List backup artifacts
    List {
        /// Filter by status (queued, running, success, failed)
        #[arg(short, long)]
        status: Option<String>,

        /// Number of artifacts to show
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Show container files on disk that are not in the catalog instead
        #[arg(long)]
        untracked: bool,
    },

    /// Show a restore run and its step trace
    Status {
        /// Restore run id
        run_id: Uuid,
    },

    /// Delete a backup artifact and its file
    Delete {
        /// Artifact to delete
        artifact_id: Uuid,
    },

    /// Register a container file already under the storage root
    Import {
        /// Path to the container, absolute or relative to the storage root
        path: PathBuf,
    },

    /// Apply pending schema migrations
    Migrate,
}

/// Print a message, or the JSON value in json mode
pub fn output(format: &str, message: &str, json_value: Option<serde_json::Value>) {
    match format {
        "json" => {
            let value = json_value.unwrap_or_else(|| serde_json::json!({ "message": message }));
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
        }
        _ => println!("{}", message),
    }
}

/// Print error message
pub fn error(format: &str, code: &str, message: &str) {
    match format {
        "json" => eprintln!("{}", serde_json::json!({ "error": code, "message": message })),
        _ => eprintln!("Error [{}]: {}", code, message),
    }
}

/// Print table row
pub fn table_row(cells: &[&str]) {
    println!("{}", cells.join("\t"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        BackupCli::command().debug_assert();
    }

    #[test]
    fn test_parse_backup_scope_list() {
        let cli = BackupCli::try_parse_from([
            "backup-orchestrator",
            "backup",
            "--label",
            "nightly",
            "--scope",
            "docs,incidents",
        ])
        .unwrap();
        match cli.command {
            BackupCommand::Backup { label, scope, include_files } => {
                assert_eq!(label.as_deref(), Some("nightly"));
                assert_eq!(scope, vec!["docs", "incidents"]);
                assert!(!include_files);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_dry_run_restore() {
        let id = Uuid::new_v4();
        let cli = BackupCli::try_parse_from([
            "backup-orchestrator",
            "--format",
            "json",
            "restore",
            &id.to_string(),
            "--dry-run",
        ])
        .unwrap();
        assert_eq!(cli.format, "json");
        assert!(matches!(
            cli.command,
            BackupCommand::Restore { artifact_id, dry_run: true } if artifact_id == id
        ));
    }

    #[test]
    fn test_output_does_not_panic() {
        output("text", "done", None);
        output("json", "done", Some(serde_json::json!({"ok": true})));
        error("json", "NOT_FOUND", "missing \"quoted\" artifact");
    }
}
