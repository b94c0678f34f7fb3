//! Migrator - Application-facing entry point
//!
//! Wraps an [`Executor`] with the conveniences a server or CLI wants: connecting from
//! a URL, locating the migrations directory, and treating "nothing to do" as success.

use std::path::{Path, PathBuf};

use crate::backends::{redact_url, Driver, DriverKind, PostgresDriver};
use crate::error::MigrateResult;
use crate::migrations::{
    Catalog, Executor, MigrationConfig, MigrationRunResult, MigrationStatus, TrackerRecord, Version,
};

/// Directory tried when the configured migrations directory does not exist
pub const FALLBACK_MIGRATIONS_DIR: &str = "backend/migrations";

/// Migration façade over one driver
pub struct Migrator<D: Driver = PostgresDriver> {
    executor: Executor<D>,
}

impl Migrator<PostgresDriver> {
    /// Connect to a PostgreSQL database and load the migration catalog
    pub async fn connect(database_url: &str, config: MigrationConfig) -> MigrateResult<Self> {
        let kind = DriverKind::from_url(database_url)?;
        tracing::debug!("Connecting to {} ({})", redact_url(database_url), kind);
        let mut driver = PostgresDriver::connect(database_url, &config).await?;
        driver.ping().await?;
        Self::with_driver(driver, config)
    }
}

impl<D: Driver> Migrator<D> {
    /// Build a migrator over an open driver, loading the catalog from disk
    pub fn with_driver(driver: D, mut config: MigrationConfig) -> MigrateResult<Self> {
        config.migrations_dir = resolve_migrations_dir(&config.migrations_dir);
        let catalog = Catalog::load(&config.migrations_dir)?;
        Ok(Self::with_catalog(driver, catalog, config))
    }

    /// Build a migrator over an already-loaded catalog
    pub fn with_catalog(driver: D, catalog: Catalog, config: MigrationConfig) -> Self {
        Self {
            executor: Executor::new(driver, catalog, config),
        }
    }

    pub fn executor(&mut self) -> &mut Executor<D> {
        &mut self.executor
    }

    pub fn catalog(&self) -> &Catalog {
        self.executor.catalog()
    }

    /// Run all pending migrations. `None` means the store was already current.
    pub async fn up(&mut self) -> MigrateResult<Option<MigrationRunResult>> {
        tracing::info!("Running database migrations...");
        let result = no_change_as_none(self.executor.up().await)?;
        log_outcome("up", result.as_ref());
        Ok(result)
    }

    /// Roll back the last applied migration
    pub async fn down(&mut self) -> MigrateResult<Option<MigrationRunResult>> {
        tracing::info!("Rolling back last migration...");
        let result = no_change_as_none(self.executor.down().await)?;
        log_outcome("down", result.as_ref());
        Ok(result)
    }

    /// Move `steps` migrations forward, or back when negative
    pub async fn steps(&mut self, steps: i64) -> MigrateResult<Option<MigrationRunResult>> {
        tracing::info!("Running {} migration steps...", steps);
        let result = no_change_as_none(self.executor.steps(steps).await)?;
        log_outcome("steps", result.as_ref());
        Ok(result)
    }

    /// Current `(version, dirty)` state
    pub async fn version(&mut self) -> MigrateResult<TrackerRecord> {
        self.executor.version().await
    }

    /// Set the tracked version without running migrations
    pub async fn force(&mut self, version: Version) -> MigrateResult<TrackerRecord> {
        tracing::info!("Forcing migration version to {}", version);
        self.executor.force(version).await
    }

    pub async fn status(&mut self) -> MigrateResult<Vec<MigrationStatus>> {
        self.executor.status().await
    }

    /// Close the underlying driver
    pub async fn close(self) -> MigrateResult<()> {
        self.executor.into_driver().close().await
    }
}

/// Connect, apply every pending migration and close the connection again.
/// Meant for server start-up.
pub async fn init_with_migrations(
    database_url: &str,
    config: MigrationConfig,
) -> MigrateResult<Option<MigrationRunResult>> {
    let mut migrator = Migrator::connect(database_url, config).await?;
    let outcome = migrator.up().await;
    let closed = migrator.close().await;

    let result = outcome?;
    closed?;
    tracing::info!("Database migrations completed successfully");
    Ok(result)
}

/// Use `configured` when it exists, otherwise fall back to `backend/migrations`
/// when that exists, otherwise keep `configured` so loading reports it
pub fn resolve_migrations_dir(configured: &Path) -> PathBuf {
    if configured.is_dir() {
        return configured.to_path_buf();
    }

    let fallback = PathBuf::from(FALLBACK_MIGRATIONS_DIR);
    if fallback.is_dir() {
        tracing::debug!(
            "Migrations directory {} not found, using {}",
            configured.display(),
            fallback.display()
        );
        return fallback;
    }
    configured.to_path_buf()
}

fn no_change_as_none(
    result: MigrateResult<MigrationRunResult>,
) -> MigrateResult<Option<MigrationRunResult>> {
    match result {
        Ok(result) => Ok(Some(result)),
        Err(e) if e.is_no_change() => Ok(None),
        Err(e) => Err(e),
    }
}

fn log_outcome(operation: &str, result: Option<&MigrationRunResult>) {
    match result {
        Some(result) => tracing::info!(
            "Migrations {} completed: {} applied, now at {} ({} ms)",
            operation,
            result.applied_count(),
            result.final_state,
            result.execution_time_ms
        ),
        None => tracing::info!("No migrations to apply ({})", operation),
    }
}
