//! Business logic services.

pub mod audit_service;
pub mod backup_repository;
pub mod backup_service;
pub mod container;
pub mod database_tools;
pub mod encryption;
pub mod engine;
pub mod memory_repository;
pub mod pipeline;
pub mod restore_service;
pub mod scheduler_service;
