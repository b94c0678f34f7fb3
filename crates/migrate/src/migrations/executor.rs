//! Migration Executor - Moves the tracked version through the catalog
//!
//! Every mutating run follows the same shape: take the migration lock, read the
//! tracker, refuse to continue from a dirty state, plan the steps up front, then for
//! each step write `(version, dirty)`, run the statements and record the clean target
//! version. The lock is released on every exit path, including a panic inside a step.
//!
//! When the driver has transactional DDL the statements and the clean record commit
//! together. Otherwise they are two writes, and a crash between them leaves the
//! dirty marker for an operator to resolve with `force`.

use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use super::catalog::Catalog;
use super::definitions::{
    Direction, Migration, MigrationConfig, MigrationRunResult, MigrationStatus, TrackerRecord,
    Version,
};
use super::tracker::VersionTracker;
use crate::backends::Driver;
use crate::error::{MigrateError, MigrateResult};

#[derive(Debug, Clone, Copy)]
enum Movement {
    Up,
    Down,
    Steps(i64),
}

#[derive(Debug, Clone, Copy)]
enum Request {
    Migrate(Movement),
    Force(Version),
}

/// Runs catalog migrations against one driver
pub struct Executor<D: Driver> {
    driver: D,
    catalog: Catalog,
    config: MigrationConfig,
}

impl<D: Driver> Executor<D> {
    pub fn new(driver: D, catalog: Catalog, config: MigrationConfig) -> Self {
        Self {
            driver,
            catalog,
            config,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Give back the driver, e.g. to close its connection
    pub fn into_driver(self) -> D {
        self.driver
    }

    /// Apply every pending migration
    pub async fn up(&mut self) -> MigrateResult<MigrationRunResult> {
        self.run_locked(Request::Migrate(Movement::Up)).await
    }

    /// Revert the most recently applied migration
    pub async fn down(&mut self) -> MigrateResult<MigrationRunResult> {
        self.run_locked(Request::Migrate(Movement::Down)).await
    }

    /// Apply `n` migrations forward (positive) or revert `-n` (negative)
    pub async fn steps(&mut self, n: i64) -> MigrateResult<MigrationRunResult> {
        if n == 0 {
            return Err(MigrateError::NoChange);
        }
        self.run_locked(Request::Migrate(Movement::Steps(n))).await
    }

    /// Read the tracker without taking the lock. A store with no record reads as `(0, clean)`.
    pub async fn version(&mut self) -> MigrateResult<TrackerRecord> {
        VersionTracker::new(&mut self.driver).read_or_initial().await
    }

    /// Overwrite the tracker with `(version, clean)` without running any migration.
    /// This is the recovery path after a failed step has been fixed by hand.
    pub async fn force(&mut self, version: Version) -> MigrateResult<TrackerRecord> {
        let result = self.run_locked(Request::Force(version)).await?;
        Ok(result.final_state)
    }

    /// Catalog entries annotated with whether the tracker has passed them
    pub async fn status(&mut self) -> MigrateResult<Vec<MigrationStatus>> {
        let current = self.version().await?;
        Ok(self
            .catalog
            .pairs()
            .map(|pair| {
                let version = pair.up.version;
                MigrationStatus {
                    version,
                    name: pair.name().to_string(),
                    applied: version < current.version
                        || (version == current.version && !current.dirty),
                    reversible: pair.is_reversible(),
                }
            })
            .collect())
    }

    async fn run_locked(&mut self, request: Request) -> MigrateResult<MigrationRunResult> {
        self.driver.lock(self.config.lock_mode).await?;
        tracing::debug!("Migration lock acquired on {}", self.driver.name());

        let outcome = AssertUnwindSafe(self.apply(request)).catch_unwind().await;

        if let Err(e) = self.driver.unlock().await {
            tracing::error!("Failed to release migration lock: {}", e);
        } else {
            tracing::debug!("Migration lock released on {}", self.driver.name());
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn apply(&mut self, request: Request) -> MigrateResult<MigrationRunResult> {
        let start_time = Instant::now();
        let current = VersionTracker::new(&mut self.driver).read_or_initial().await?;

        let movement = match request {
            Request::Migrate(movement) => movement,
            Request::Force(version) => {
                let record = TrackerRecord::clean(version);
                VersionTracker::new(&mut self.driver).write(record).await?;
                tracing::warn!("Forced migration version from {} to {}", current, record);
                return Ok(MigrationRunResult {
                    direction: if version < current.version {
                        Direction::Down
                    } else {
                        Direction::Up
                    },
                    applied: Vec::new(),
                    final_state: record,
                    execution_time_ms: start_time.elapsed().as_millis(),
                });
            }
        };

        if current.dirty {
            return Err(MigrateError::Dirty {
                version: current.version,
            });
        }

        let (direction, plan) = match movement {
            Movement::Up => (Direction::Up, self.catalog.plan_forward(current.version, None)?),
            Movement::Down => (Direction::Down, self.catalog.plan_backward(current.version, 1)?),
            Movement::Steps(n) if n > 0 => (
                Direction::Up,
                self.catalog.plan_forward(current.version, Some(n as u64))?,
            ),
            Movement::Steps(n) => (
                Direction::Down,
                self.catalog.plan_backward(current.version, n.unsigned_abs())?,
            ),
        };

        if plan.is_empty() {
            tracing::info!("No migrations to run {} from version {}", direction, current);
            return Err(MigrateError::NoChange);
        }

        let atomic = self.driver.supports_transactional_ddl();
        if !atomic {
            tracing::debug!(
                "{} has no transactional DDL, each step is recorded after its statements",
                self.driver.name()
            );
        }

        let mut applied = Vec::with_capacity(plan.len());
        let mut state = current;

        for step in plan {
            let migration = step.migration;
            let step_start = Instant::now();
            tracing::info!(
                "Migrating {}: {} - {}",
                direction,
                migration.version,
                migration.name
            );

            VersionTracker::new(&mut self.driver)
                .mark_dirty(migration.version)
                .await?;

            let target = TrackerRecord::clean(step.target);
            if let Err(e) = run_step(&mut self.driver, migration, target, atomic).await {
                if atomic {
                    tracing::error!(
                        "Migration {} {} failed and was rolled back, version left dirty: {}",
                        migration.version,
                        direction,
                        e
                    );
                } else {
                    tracing::error!(
                        "Migration {} {} failed, version left dirty and earlier statements may have applied: {}",
                        migration.version,
                        direction,
                        e
                    );
                }
                return Err(e);
            }

            state = target;
            applied.push(migration.version);
            tracing::info!(
                "Migrated {}: {} ({} ms)",
                direction,
                migration.version,
                step_start.elapsed().as_millis()
            );
        }

        Ok(MigrationRunResult {
            direction,
            applied,
            final_state: state,
            execution_time_ms: start_time.elapsed().as_millis(),
        })
    }
}

/// Run one planned step and record its clean target version
async fn run_step<D: Driver>(
    driver: &mut D,
    migration: &Migration,
    target: TrackerRecord,
    atomic: bool,
) -> MigrateResult<()> {
    if atomic {
        return driver.execute_and_record(migration, target).await;
    }
    driver.execute(migration).await?;
    VersionTracker::new(driver).write(target).await
}
