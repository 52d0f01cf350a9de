//! Engine data models.

pub mod backup;
pub mod plan;
pub mod restore;
