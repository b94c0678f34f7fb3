//! PostgreSQL Driver Implementation
//!
//! Runs migrations over one dedicated sqlx connection. The migration lock is a
//! session-level advisory lock, so closing the connection (including when the
//! process dies) releases it. The tracker table is created only while that lock is
//! held, so first-time runs racing each other never create it twice.
//! PostgreSQL supports transactional DDL, which lets a migration's statements and
//! its clean tracker write commit together.

use async_trait::async_trait;
use sqlx::{Connection, Executor, PgConnection};

use super::{poll_lock, validate_table_name, Driver};
use crate::error::{MigrateError, MigrateResult};
use crate::migrations::definitions::{LockMode, Migration, MigrationConfig, TrackerRecord, Version};

/// PostgreSQL migration driver
pub struct PostgresDriver {
    conn: PgConnection,
    table: String,
    lock_key: String,
}

impl PostgresDriver {
    /// Connect to `database_url`
    pub async fn connect(database_url: &str, config: &MigrationConfig) -> MigrateResult<Self> {
        validate_table_name(&config.migrations_table)?;
        let conn = PgConnection::connect(database_url)
            .await
            .map_err(|e| MigrateError::Database(format!("Failed to connect to database: {}", e)))?;
        Self::with_connection(conn, config).await
    }

    /// Wrap an already-open connection
    pub async fn with_connection(mut conn: PgConnection, config: &MigrationConfig) -> MigrateResult<Self> {
        validate_table_name(&config.migrations_table)?;
        let database: String = sqlx::query_scalar("SELECT current_database()")
            .fetch_one(&mut conn)
            .await?;

        let driver = Self {
            conn,
            table: config.migrations_table.clone(),
            lock_key: format!("{}:{}", database, config.migrations_table),
        };
        tracing::debug!("PostgreSQL driver ready (database: {}, table: {})", database, driver.table);
        Ok(driver)
    }

    /// Check that the connection is alive
    pub async fn ping(&mut self) -> MigrateResult<()> {
        self.conn
            .ping()
            .await
            .map_err(|e| MigrateError::Database(format!("Failed to ping database: {}", e)))
    }

    /// SQL to create the tracker table
    pub fn create_tracker_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                version BIGINT NOT NULL PRIMARY KEY,\n    \
                dirty BOOLEAN NOT NULL\n\
            )",
            self.table
        )
    }

    async fn ensure_tracker_table(&mut self) -> MigrateResult<()> {
        let sql = self.create_tracker_table_sql();
        self.conn.execute(sql.as_str()).await.map_err(|e| {
            MigrateError::Database(format!("Failed to create migrations table: {}", e))
        })?;
        Ok(())
    }

    /// Runs right after the advisory lock is taken; gives the lock back on failure
    async fn prepare_locked(&mut self) -> MigrateResult<()> {
        if let Err(e) = self.ensure_tracker_table().await {
            if let Err(unlock_err) = self.unlock().await {
                tracing::warn!("Failed to release migration lock: {}", unlock_err);
            }
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn supports_transactional_ddl(&self) -> bool {
        true
    }

    async fn try_lock(&mut self) -> MigrateResult<bool> {
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1))")
            .bind(&self.lock_key)
            .fetch_one(&mut self.conn)
            .await
            .map_err(|e| MigrateError::Database(format!("Failed to try migration lock: {}", e)))?;
        if acquired {
            self.prepare_locked().await?;
        }
        Ok(acquired)
    }

    async fn lock(&mut self, mode: LockMode) -> MigrateResult<()> {
        match mode {
            LockMode::Wait => {
                sqlx::query("SELECT pg_advisory_lock(hashtext($1))")
                    .bind(&self.lock_key)
                    .execute(&mut self.conn)
                    .await
                    .map_err(|e| MigrateError::Database(format!("Failed to acquire migration lock: {}", e)))?;
                self.prepare_locked().await
            }
            _ => poll_lock(self, mode).await,
        }
    }

    async fn unlock(&mut self) -> MigrateResult<()> {
        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock(hashtext($1))")
            .bind(&self.lock_key)
            .fetch_one(&mut self.conn)
            .await
            .map_err(|e| MigrateError::Database(format!("Failed to release migration lock: {}", e)))?;
        if !released {
            tracing::warn!("Migration lock '{}' was not held by this session", self.lock_key);
        }
        Ok(())
    }

    async fn read_tracker(&mut self) -> MigrateResult<Option<TrackerRecord>> {
        let sql = format!("SELECT version, dirty FROM {} LIMIT 1", self.table);
        let row: Option<(i64, bool)> = match sqlx::query_as(&sql).fetch_optional(&mut self.conn).await {
            Ok(row) => row,
            // Nothing has ever taken the lock on this database
            Err(e) if is_undefined_table(&e) => return Ok(None),
            Err(e) => return Err(MigrateError::Database(format!("Failed to read migration version: {}", e))),
        };

        row.map(|(version, dirty)| {
            let version = Version::try_from(version).map_err(|_| {
                MigrateError::Database(format!("Negative version {} in {}", version, self.table))
            })?;
            Ok(TrackerRecord { version, dirty })
        })
        .transpose()
    }

    async fn write_tracker(&mut self, record: TrackerRecord) -> MigrateResult<()> {
        let mut tx = self.conn.begin().await?;
        write_record(&mut tx, &self.table, record).await?;
        tx.commit()
            .await
            .map_err(|e| MigrateError::Database(format!("Failed to commit migration version: {}", e)))
    }

    async fn execute(&mut self, migration: &Migration) -> MigrateResult<()> {
        run_statements(&mut self.conn, migration).await
    }

    async fn execute_and_record(
        &mut self,
        migration: &Migration,
        record: TrackerRecord,
    ) -> MigrateResult<()> {
        let mut tx = self.conn.begin().await?;
        // Dropping `tx` on error rolls back every statement of this migration.
        run_statements(&mut tx, migration).await?;
        write_record(&mut tx, &self.table, record).await?;
        tx.commit()
            .await
            .map_err(|e| MigrateError::Database(format!("Failed to commit migration {}: {}", migration.version, e)))
    }

    async fn close(self) -> MigrateResult<()> {
        self.conn
            .close()
            .await
            .map_err(|e| MigrateError::Database(format!("Failed to close migration connection: {}", e)))
    }
}

/// SQLSTATE 42P01 (`undefined_table`)
fn is_undefined_table(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("42P01"),
        _ => false,
    }
}

async fn run_statements(conn: &mut PgConnection, migration: &Migration) -> MigrateResult<()> {
    for (index, statement) in migration.statements.iter().enumerate() {
        // Unprepared execution so a multi-statement body is accepted.
        (&mut *conn).execute(statement.as_str())
            .await
            .map_err(|e| MigrateError::Statement {
                version: migration.version,
                direction: migration.direction,
                index,
                source: Box::new(e),
            })?;
    }
    Ok(())
}

async fn write_record(conn: &mut PgConnection, table: &str, record: TrackerRecord) -> MigrateResult<()> {
    let version = i64::try_from(record.version).map_err(|_| {
        MigrateError::Configuration(format!("Version {} does not fit the tracker column", record.version))
    })?;

    (&mut *conn).execute(format!("TRUNCATE {}", table).as_str())
        .await
        .map_err(|e| MigrateError::Database(format!("Failed to clear migration version: {}", e)))?;
    sqlx::query(&format!("INSERT INTO {} (version, dirty) VALUES ($1, $2)", table))
        .bind(version)
        .bind(record.dirty)
        .execute(&mut *conn)
        .await
        .map_err(|e| MigrateError::Database(format!("Failed to record migration version: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::catalog::Catalog;
    use crate::migrations::executor::Executor;

    fn database_url() -> Option<String> {
        std::env::var("DATABASE_URL").ok().filter(|url| !url.is_empty())
    }

    // Needs a scratch PostgreSQL database; skipped when DATABASE_URL is not set.
    #[tokio::test]
    async fn test_postgres_round_trip() {
        let Some(url) = database_url() else {
            eprintln!("DATABASE_URL not set, skipping PostgreSQL driver test");
            return;
        };

        let config = MigrationConfig {
            migrations_table: "playhub_migrate_driver_test".to_string(),
            ..MigrationConfig::default()
        };
        let mut driver = PostgresDriver::connect(&url, &config).await.unwrap();
        driver.ping().await.unwrap();
        for table in ["playhub_migrate_users", "playhub_migrate_driver_test"] {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
                .execute(&mut driver.conn)
                .await
                .unwrap();
        }

        // Connecting leaves the tracker table alone; reading it still works
        assert_eq!(driver.read_tracker().await.unwrap(), None);
        driver.lock(LockMode::NoWait).await.unwrap();
        driver.unlock().await.unwrap();
        assert_eq!(driver.read_tracker().await.unwrap(), None);
        driver.write_tracker(TrackerRecord::clean(0)).await.unwrap();

        let catalog = Catalog::from_migrations(vec![
            Migration::up(1, "users", &["CREATE TABLE playhub_migrate_users (id BIGINT)"]),
            Migration::down(1, "users", &["DROP TABLE playhub_migrate_users"]),
            Migration::up(2, "broken", &["ALTER TABLE no_such_table ADD COLUMN x INT"]),
        ])
        .unwrap();
        let mut executor = Executor::new(driver, catalog, config);

        let err = executor.up().await.unwrap_err();
        assert_eq!(err.stuck_version(), Some(2));
        assert_eq!(executor.version().await.unwrap(), TrackerRecord::dirty(2));

        executor.force(1).await.unwrap();
        executor.down().await.unwrap();
        assert_eq!(executor.version().await.unwrap(), TrackerRecord::clean(0));

        let mut driver = executor.into_driver();
        sqlx::query("DROP TABLE IF EXISTS playhub_migrate_driver_test")
            .execute(&mut driver.conn)
            .await
            .unwrap();
        driver.close().await.unwrap();
    }

    #[test]
    fn test_undefined_table_detection_ignores_other_errors() {
        assert!(!is_undefined_table(&sqlx::Error::RowNotFound));
        assert!(!is_undefined_table(&sqlx::Error::PoolTimedOut));
    }
}
