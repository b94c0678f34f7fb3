//! Migration System
//!
//! Catalog loading and planning, the version tracker, and the executor that
//! moves a store between versions.

pub mod catalog;
pub mod definitions;
pub mod executor;
pub mod tracker;

pub use catalog::{create_migration, split_sql_statements, Catalog, MigrationPair, PlannedStep, VersionScheme};
pub use definitions::*;
pub use executor::Executor;
pub use tracker::VersionTracker;
