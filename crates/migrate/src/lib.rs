//! # playhub-migrate: Versioned Schema Migrations
//!
//! Applies an ordered catalog of SQL migrations to a database and records the applied
//! version in a single-row tracker table. Each step marks the tracker dirty before it
//! runs and clean afterwards, so a failed or interrupted step is visible and blocks
//! further runs until an operator repairs the schema and forces the version.
//!
//! ```no_run
//! use playhub_migrate::{MigrationConfig, Migrator};
//!
//! # async fn run() -> playhub_migrate::MigrateResult<()> {
//! let mut migrator = Migrator::connect("postgres://localhost/playhub", MigrationConfig::default()).await?;
//! migrator.up().await?;
//! let state = migrator.version().await?;
//! println!("Current version: {}", state);
//! migrator.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod error;
pub mod migrations;
pub mod migrator;

// Re-export the commonly used surface
pub use backends::{Driver, DriverKind, MemoryDriver, MemoryStore, PostgresDriver};
pub use error::*;
pub use migrations::*;
pub use migrator::{init_with_migrations, resolve_migrations_dir, Migrator};
