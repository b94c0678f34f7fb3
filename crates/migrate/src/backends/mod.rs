//! Database Driver Abstractions
//!
//! The executor talks to the target store only through the [`Driver`] trait:
//! locking, statement execution and the version tracker row. This keeps the
//! migration state machine independent of any one database and lets it run
//! against the in-memory store in tests.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{MigrateError, MigrateResult};
use crate::migrations::definitions::{LockMode, Migration, TrackerRecord};

pub use memory::{MemoryDriver, MemoryStore};
pub use postgres::PostgresDriver;

/// Delay between lock attempts for `LockMode::NoWait` / `LockMode::Timeout` polling
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Capability interface the executor needs from a target store
#[async_trait]
pub trait Driver: Send {
    /// Short backend name used in logs
    fn name(&self) -> &'static str;

    /// Whether schema statements and the tracker write can share one transaction.
    /// The executor only calls `execute_and_record` when this is true.
    fn supports_transactional_ddl(&self) -> bool;

    /// Attempt to take the migration lock without waiting
    async fn try_lock(&mut self) -> MigrateResult<bool>;

    /// Take the migration lock according to `mode`
    async fn lock(&mut self, mode: LockMode) -> MigrateResult<()> {
        poll_lock(self, mode).await
    }

    /// Release the migration lock held by this driver
    async fn unlock(&mut self) -> MigrateResult<()>;

    /// Read the tracker row; `None` when no migration has ever been recorded
    async fn read_tracker(&mut self) -> MigrateResult<Option<TrackerRecord>>;

    /// Replace the tracker row
    async fn write_tracker(&mut self, record: TrackerRecord) -> MigrateResult<()>;

    /// Execute every statement of `migration` in order
    async fn execute(&mut self, migration: &Migration) -> MigrateResult<()>;

    /// Execute `migration` and, only if it succeeds, record `record`, both in one
    /// transaction. The default runs the two steps separately.
    async fn execute_and_record(
        &mut self,
        migration: &Migration,
        record: TrackerRecord,
    ) -> MigrateResult<()> {
        self.execute(migration).await?;
        self.write_tracker(record).await
    }

    /// Release the underlying connection. Any lock still held goes with it.
    async fn close(self) -> MigrateResult<()>
    where
        Self: Sized,
    {
        Ok(())
    }
}

/// Acquire the lock by polling `try_lock` until `mode` allows no more attempts
pub async fn poll_lock<D: Driver + ?Sized>(driver: &mut D, mode: LockMode) -> MigrateResult<()> {
    let deadline = match mode {
        LockMode::Wait => None,
        LockMode::NoWait => Some(tokio::time::Instant::now()),
        LockMode::Timeout(timeout) => Some(tokio::time::Instant::now() + timeout),
    };

    loop {
        if driver.try_lock().await? {
            return Ok(());
        }
        if let Some(deadline) = deadline {
            if tokio::time::Instant::now() >= deadline {
                return Err(MigrateError::LockBusy);
            }
        }
        tracing::debug!("Migration lock busy on {}, retrying", driver.name());
        tokio::time::sleep(LOCK_POLL_INTERVAL).await;
    }
}

/// Store technology selected by a connection URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    PostgreSQL,
}

impl DriverKind {
    /// Detect the driver from a connection URL scheme
    pub fn from_url(url: &str) -> MigrateResult<Self> {
        if url.starts_with("postgresql://") || url.starts_with("postgres://") {
            Ok(DriverKind::PostgreSQL)
        } else {
            Err(MigrateError::Configuration(format!(
                "Unable to detect database driver from URL: {}",
                redact_url(url)
            )))
        }
    }
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverKind::PostgreSQL => write!(f, "postgresql"),
        }
    }
}

/// Connection URL with any password replaced, safe to log
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("****"));
            }
            parsed.to_string()
        }
        Err(_) => "<unparseable url>".to_string(),
    }
}

/// Validate a (optionally schema-qualified) tracker table name before it is
/// interpolated into SQL
pub fn validate_table_name(name: &str) -> MigrateResult<()> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        return Err(MigrateError::Configuration(format!(
            "Table name '{}' may have at most one schema qualifier",
            name
        )));
    }

    for part in parts {
        let valid = !part.is_empty()
            && part.len() <= 63
            && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !part.starts_with(|c: char| c.is_ascii_digit());
        if !valid {
            return Err(MigrateError::Configuration(format!(
                "Invalid tracker table name '{}'",
                name
            )));
        }
    }
    Ok(())
}
