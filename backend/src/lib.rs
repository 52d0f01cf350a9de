//! Backup Orchestrator - Backend Library
//!
//! Encrypted, integrity-checked database backups with verified,
//! step-traced restores.

#[macro_use]
mod macros;

pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod storage;
pub mod telemetry;

pub use config::Config;
pub use error::{AppError, Result};
